//! The main `Container` struct and its associated methods.

use crate::class::{Class, ConstructContext, Dependencies};
use crate::core::{InstanceSlot, ResolveCtx, Tracked};
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::module_ref::{ModuleBinding, ModuleRef};
use crate::provider::{Mode, NormalizedProvider, Provider};
use crate::request::RequestScope;
use crate::token::Token;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_CONTAINER_ID: AtomicU64 = AtomicU64::new(1);

/// Callback notified of failures that a best-effort operation chose to skip.
pub type SwallowedErrorListener = Arc<dyn Fn(&Token, &Error) + Send + Sync>;

/// Construction options for a [`Container`].
#[derive(Default, Clone)]
pub struct ContainerOptions {
  exports: Vec<Token>,
  global: Option<Container>,
  listener: Option<SwallowedErrorListener>,
}

impl ContainerOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Tokens this container exposes to a parent that imports it.
  pub fn exports<I, T>(mut self, tokens: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: Into<Token>,
  {
    self.exports = tokens.into_iter().map(Into::into).collect();
    self
  }

  /// The shared container consulted after own providers and children.
  pub fn global(mut self, global: Container) -> Self {
    self.global = Some(global);
    self
  }

  /// Receives every failure skipped by tag queries.
  pub fn on_swallowed_error(mut self, listener: SwallowedErrorListener) -> Self {
    self.listener = Some(listener);
    self
  }
}

impl fmt::Debug for ContainerOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ContainerOptions")
      .field("exports", &self.exports)
      .field("has_global", &self.global.is_some())
      .field("has_listener", &self.listener.is_some())
      .finish()
  }
}

struct Inner {
  id: u64,
  providers: DashMap<Token, Arc<NormalizedProvider>>,
  singletons: DashMap<Token, Arc<InstanceSlot>>,
  instances: Mutex<Vec<Tracked>>,
  tags: RwLock<HashMap<&'static str, Vec<Token>>>,
  exports: RwLock<HashSet<Token>>,
  children: RwLock<Vec<Container>>,
  global: RwLock<Option<Container>>,
  parent: Option<Weak<Inner>>,
  module: RwLock<Option<ModuleBinding>>,
  listener: Option<SwallowedErrorListener>,
}

/// The provider registry and resolver.
///
/// A container resolves a token from its own providers first, then from the
/// children that export it, then from the shared global container. Cloning a
/// `Container` yields another handle to the same registry.
#[derive(Clone)]
pub struct Container {
  inner: Arc<Inner>,
}

impl Default for Container {
  fn default() -> Self {
    Self::new()
  }
}

impl Container {
  /// Creates a new, empty `Container`.
  pub fn new() -> Self {
    Self::with_options(ContainerOptions::default())
  }

  pub fn with_options(options: ContainerOptions) -> Self {
    Self::build(options, None)
  }

  fn build(options: ContainerOptions, parent: Option<Weak<Inner>>) -> Self {
    Self {
      inner: Arc::new(Inner {
        id: NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed),
        providers: DashMap::new(),
        singletons: DashMap::new(),
        instances: Mutex::new(Vec::new()),
        tags: RwLock::new(HashMap::new()),
        exports: RwLock::new(options.exports.into_iter().collect()),
        children: RwLock::new(Vec::new()),
        global: RwLock::new(options.global),
        parent,
        module: RwLock::new(None),
        listener: options.listener,
      }),
    }
  }

  pub fn id(&self) -> u64 {
    self.inner.id
  }

  // --- PRIVATE HELPERS ---

  fn provider(&self, token: &Token) -> Option<Arc<NormalizedProvider>> {
    self.inner.providers.get(token).map(|p| p.value().clone())
  }

  fn children_snapshot(&self) -> Vec<Container> {
    self.inner.children.read().clone()
  }

  // The global container, unless this container is the global one.
  fn global_for_lookup(&self) -> Option<Container> {
    self
      .inner
      .global
      .read()
      .clone()
      .filter(|global| !Arc::ptr_eq(&global.inner, &self.inner))
  }

  fn singleton_slot(&self, token: &Token) -> Arc<InstanceSlot> {
    self
      .inner
      .singletons
      .entry(token.clone())
      .or_insert_with(|| Arc::new(InstanceSlot::new(token.clone())))
      .clone()
  }

  fn track(&self, instance: &Instance) {
    self.inner.instances.lock().push(Tracked::new(instance.clone()));
  }

  fn own_tagged(&self, tag: &str) -> Vec<Token> {
    self.inner.tags.read().get(tag).cloned().unwrap_or_default()
  }

  fn report_swallowed(&self, token: &Token, err: &Error) {
    tracing::warn!(token = %token, error = %err, "Skipping instance that failed to resolve");
    if let Some(listener) = &self.inner.listener {
      listener(token, err);
    }
  }

  // --- Registration ---

  /// Normalizes and stores each provider under its token. Re-registering a
  /// token replaces its provider and forgets any cached singleton for it.
  pub fn register<I>(&self, providers: I) -> Result<&Self>
  where
    I: IntoIterator<Item = Provider>,
  {
    for provider in providers {
      self.register_provider(&provider)?;
    }
    Ok(self)
  }

  pub fn register_provider(&self, provider: &Provider) -> Result<&Self> {
    let normalized = NormalizedProvider::normalize(provider)?;
    let token = normalized.token.clone();

    if let Some(class) = normalized.concrete_class() {
      let mut tags = self.inner.tags.write();
      for tag in class.tags() {
        let tokens = tags.entry(tag).or_default();
        if !tokens.contains(&token) {
          tokens.push(token.clone());
        }
      }
    }

    tracing::debug!(
      container = self.id(),
      token = %token,
      mode = %normalized.mode,
      "Registered provider"
    );
    self.inner.singletons.remove(&token);
    self.inner.providers.insert(token, Arc::new(normalized));
    Ok(self)
  }

  /// Returns `true` if a provider for `token` is registered in this container.
  pub fn has_provider(&self, token: &Token) -> bool {
    self.inner.providers.contains_key(token)
  }

  /// Tokens of every provider registered in this container.
  pub fn tokens(&self) -> Vec<Token> {
    self.inner.providers.iter().map(|p| p.key().clone()).collect()
  }

  // --- Wiring ---

  pub fn set_exports<I, T>(&self, tokens: I)
  where
    I: IntoIterator<Item = T>,
    T: Into<Token>,
  {
    *self.inner.exports.write() = tokens.into_iter().map(Into::into).collect();
  }

  pub fn is_exported(&self, token: &Token) -> bool {
    self.inner.exports.read().contains(token)
  }

  pub fn exports(&self) -> Vec<Token> {
    self.inner.exports.read().iter().cloned().collect()
  }

  /// Attaches an imported container. Children are searched in the order they
  /// were added.
  pub fn add_child(&self, child: Container) {
    self.inner.children.write().push(child);
  }

  pub fn children(&self) -> Vec<Container> {
    self.children_snapshot()
  }

  pub fn set_global(&self, global: Option<Container>) {
    *self.inner.global.write() = global;
  }

  pub fn global(&self) -> Option<Container> {
    self.inner.global.read().clone()
  }

  pub(crate) fn bind_module(&self, binding: ModuleBinding) {
    *self.inner.module.write() = Some(binding);
  }

  /// The handle of the module this container was built for. Containers
  /// created outside a module graph, and the global container, have none.
  pub fn module_ref(&self) -> Option<ModuleRef> {
    let binding = self.inner.module.read().clone()?;
    Some(ModuleRef::from_binding(self.clone(), binding))
  }

  pub fn parent(&self) -> Option<Container> {
    self
      .inner
      .parent
      .as_ref()
      .and_then(Weak::upgrade)
      .map(|inner| Container { inner })
  }

  /// Returns a new container parented to this one. It shares this container's
  /// global container unless `options` names another one.
  pub fn create_child(&self, options: ContainerOptions) -> Container {
    let mut options = options;
    if options.global.is_none() {
      options.global = self.global();
    }
    if options.listener.is_none() {
      options.listener = self.inner.listener.clone();
    }
    Self::build(options, Some(Arc::downgrade(&self.inner)))
  }

  /// Drops every provider, cached singleton, tracked instance and tag. No
  /// lifecycle hooks run.
  pub fn clear(&self) {
    self.inner.providers.clear();
    self.inner.singletons.clear();
    self.inner.instances.lock().clear();
    self.inner.tags.write().clear();
  }

  // --- Resolution ---

  /// Resolves `token` outside of any request scope.
  pub async fn resolve(&self, token: impl Into<Token>) -> Result<Instance> {
    self.resolve_with(&token.into(), &ResolveCtx::new()).await
  }

  /// Resolves `token` with `scope` as the active request scope.
  pub async fn resolve_in(&self, token: impl Into<Token>, scope: &RequestScope) -> Result<Instance> {
    let ctx = ResolveCtx::new().with_request(Some(scope.clone()));
    self.resolve_with(&token.into(), &ctx).await
  }

  /// Like [`Container::resolve`], but a missing provider yields `Ok(None)`.
  pub async fn try_resolve(&self, token: impl Into<Token>) -> Result<Option<Instance>> {
    not_found_as_none(self.resolve(token).await)
  }

  pub async fn try_resolve_in(
    &self,
    token: impl Into<Token>,
    scope: &RequestScope,
  ) -> Result<Option<Instance>> {
    not_found_as_none(self.resolve_in(token, scope).await)
  }

  /// Resolves `token` and downcasts the instance to `T`.
  pub async fn get<T: Any + Send + Sync>(&self, token: impl Into<Token>) -> Result<Arc<T>> {
    self.resolve(token).await?.downcast::<T>()
  }

  pub async fn try_get<T: Any + Send + Sync>(
    &self,
    token: impl Into<Token>,
  ) -> Result<Option<Arc<T>>> {
    match self.try_resolve(token).await? {
      Some(instance) => instance.downcast::<T>().map(Some),
      None => Ok(None),
    }
  }

  pub(crate) fn resolve_with<'a>(
    &'a self,
    token: &'a Token,
    ctx: &'a ResolveCtx,
  ) -> BoxFuture<'a, Result<Instance>> {
    async move {
      ctx.check(self.id(), token)?;
      tracing::trace!(container = self.id(), token = %token, "Resolving");

      if let Some(provider) = self.provider(token) {
        return self.resolve_provider(&provider, ctx).await;
      }

      for child in self.children_snapshot() {
        if !child.is_exported(token) {
          continue;
        }
        match child.resolve_with(token, ctx).await {
          Ok(instance) => return Ok(instance),
          Err(err) if err.is_token_not_found() => continue,
          Err(err) => return Err(err),
        }
      }

      if let Some(global) = self.global_for_lookup() {
        if global.has_provider(token) {
          return global.resolve_with(token, ctx).await;
        }
      }

      Err(Error::TokenNotFound(token.clone()))
    }
    .boxed()
  }

  async fn resolve_provider(
    &self,
    provider: &NormalizedProvider,
    ctx: &ResolveCtx,
  ) -> Result<Instance> {
    let token = &provider.token;
    match provider.mode {
      Mode::Singleton => {
        let slot = self.singleton_slot(token);
        if let Some(instance) = slot.get() {
          return Ok(instance);
        }
        let inner_ctx = ctx.enter(self.id(), token)?;
        slot
          .get_or_try_init(ctx, || async {
            let instance = provider.produce(self, &inner_ctx).await?;
            self.track(&instance);
            Ok::<_, Error>(instance)
          })
          .await
      }
      Mode::Request => {
        let scope = ctx
          .request()
          .ok_or_else(|| Error::MissingRequestContext(token.clone()))?;
        let slot = scope.slot(token);
        if let Some(instance) = slot.get() {
          return Ok(instance);
        }
        let inner_ctx = ctx.enter(self.id(), token)?;
        slot
          .get_or_try_init(ctx, || provider.produce(self, &inner_ctx))
          .await
      }
      Mode::Transient | Mode::Custom(_) => {
        let inner_ctx = ctx.enter(self.id(), token)?;
        let instance = provider.produce(self, &inner_ctx).await?;
        self.track(&instance);
        Ok(instance)
      }
    }
  }

  /// Structural check: would `resolve` find a provider for `token`?
  /// Nothing is instantiated.
  pub fn can_resolve(&self, token: &Token) -> bool {
    if self.has_provider(token) {
      return true;
    }
    if self
      .children_snapshot()
      .iter()
      .any(|child| child.is_exported(token) && child.can_resolve(token))
    {
      return true;
    }
    self
      .global_for_lookup()
      .is_some_and(|global| global.has_provider(token))
  }

  /// The lifetime mode `resolve` would apply to `token`, found with the same
  /// search order, without instantiating anything.
  pub fn get_provider_mode(&self, token: &Token) -> Option<Mode> {
    if let Some(provider) = self.provider(token) {
      return Some(provider.mode.clone());
    }
    for child in self.children_snapshot() {
      if child.is_exported(token) {
        if let Some(mode) = child.get_provider_mode(token) {
          return Some(mode);
        }
      }
    }
    self
      .global_for_lookup()
      .and_then(|global| global.provider(token))
      .map(|provider| provider.mode.clone())
  }

  pub fn is_request_scoped(&self, token: &Token) -> bool {
    self.get_provider_mode(token) == Some(Mode::Request)
  }

  // --- Construction ---

  /// Constructs `class` through this container, resolving its declared
  /// dependencies. The result is neither registered nor tracked. The
  /// constructor sees this container's [`Container::module_ref`].
  pub async fn instantiate_class(&self, class: &Class) -> Result<Instance> {
    self.instantiate_with(class, &ResolveCtx::new()).await
  }

  /// Resolves the declared dependencies of `class`. Optional dependencies
  /// without a provider come back unset.
  pub async fn resolve_dependencies(&self, class: &Class) -> Result<Dependencies> {
    self.resolve_dependencies_with(class, &ResolveCtx::new()).await
  }

  pub(crate) async fn instantiate_with(&self, class: &Class, ctx: &ResolveCtx) -> Result<Instance> {
    let dependencies = self.resolve_dependencies_with(class, ctx).await?;
    tracing::debug!(container = self.id(), class = class.name(), "Instantiating class");
    class
      .construct(ConstructContext::new(self.module_ref(), dependencies))
      .map_err(|err| Error::from_provider(&class.token(), err))
  }

  pub(crate) async fn resolve_dependencies_with(
    &self,
    class: &Class,
    ctx: &ResolveCtx,
  ) -> Result<Dependencies> {
    let mut dependencies = Dependencies::default();
    for dependency in class.dependencies() {
      match self.resolve_with(&dependency.token, ctx).await {
        Ok(instance) => dependencies.push(dependency, Some(instance)),
        Err(err) if dependency.optional && err.is_token_not_found() => {
          dependencies.push(dependency, None)
        }
        Err(err) => return Err(err),
      }
    }
    Ok(dependencies)
  }

  // --- Tags ---

  fn collect_tagged(&self, tag: &str, include_global: bool, out: &mut Vec<(Container, Token)>) {
    for token in self.own_tagged(tag) {
      out.push((self.clone(), token));
    }

    for child in self.children_snapshot() {
      let mut found = Vec::new();
      child.collect_tagged(tag, false, &mut found);
      out.extend(found.into_iter().filter(|(_, token)| child.is_exported(token)));
    }

    if include_global {
      if let Some(global) = self.global_for_lookup() {
        for token in global.own_tagged(tag) {
          out.push((global.clone(), token));
        }
      }
    }
  }

  /// Tokens tagged with `tag`: own tokens, exported tokens of children, then
  /// tokens of the global container.
  pub fn get_tokens_by_tag(&self, tag: &str) -> Vec<Token> {
    let mut found = Vec::new();
    self.collect_tagged(tag, true, &mut found);
    found.into_iter().map(|(_, token)| token).collect()
  }

  /// Resolves every token tagged with `tag`, in [`Container::get_tokens_by_tag`]
  /// order. Tokens that fail to resolve are skipped.
  pub async fn get_by_tag(&self, tag: &str) -> Vec<Instance> {
    self
      .tagged_instances(tag, &ResolveCtx::new())
      .await
      .into_iter()
      .map(|(_, instance)| instance)
      .collect()
  }

  pub(crate) async fn tagged_instances(
    &self,
    tag: &str,
    ctx: &ResolveCtx,
  ) -> Vec<(Token, Instance)> {
    let mut found = Vec::new();
    self.collect_tagged(tag, true, &mut found);

    let mut instances = Vec::with_capacity(found.len());
    for (owner, token) in found {
      match owner.resolve_with(&token, ctx).await {
        Ok(instance) => instances.push((token, instance)),
        Err(err) => self.report_swallowed(&token, &err),
      }
    }
    instances
  }

  // --- Instances ---

  pub(crate) fn tracked(&self, recursive: bool) -> Vec<Tracked> {
    let mut tracked = self.inner.instances.lock().clone();
    if recursive {
      for child in self.children_snapshot() {
        tracked.extend(child.tracked(true));
      }
      tracked.sort_by_key(|t| t.seq);
    }
    // An alias caches its target's instance, so the same value can be tracked
    // more than once.
    let mut seen = HashSet::new();
    tracked.retain(|t| seen.insert(t.instance.identity()));
    tracked
  }

  /// Instances produced by this container (singletons and transients, never
  /// request-scoped ones), deduplicated, in creation order. With `recursive`,
  /// every child's instances are included.
  pub fn get_instances(&self, recursive: bool) -> Vec<Instance> {
    self
      .tracked(recursive)
      .into_iter()
      .map(|t| t.instance)
      .collect()
  }
}

fn not_found_as_none(result: Result<Instance>) -> Result<Option<Instance>> {
  match result {
    Ok(instance) => Ok(Some(instance)),
    Err(err) if err.is_token_not_found() => Ok(None),
    Err(err) => Err(err),
  }
}

impl fmt::Debug for Container {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Container")
      .field("id", &self.inner.id)
      .field("providers", &self.inner.providers.len())
      .field("children", &self.inner.children.read().len())
      .field("has_global", &self.inner.global.read().is_some())
      .finish()
  }
}
