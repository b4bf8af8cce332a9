//! The application-level orchestrator: compiles a root module, builds one
//! container per module and drives the lifecycle phases.

use crate::class::Class;
use crate::container::{Container, ContainerOptions, SwallowedErrorListener};
use crate::core::ResolveCtx;
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::lifecycle::{self, LifecyclePhase};
use crate::module::{CompiledModule, ModuleCompiler, ModuleImport, ModuleKey};
use crate::module_ref::{ModuleBinding, ModuleRef};
use crate::provider::Provider;
use crate::request::{self, RequestScope};
use crate::token::Token;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Options for [`InjectorContext::create`].
#[derive(Clone)]
pub struct InjectorOptions {
  global_providers: bool,
  listener: Option<SwallowedErrorListener>,
}

impl Default for InjectorOptions {
  fn default() -> Self {
    Self {
      global_providers: true,
      listener: None,
    }
  }
}

impl InjectorOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Whether providers of global modules are registered in the shared global
  /// container. Defaults to `true`.
  pub fn global_providers(mut self, enabled: bool) -> Self {
    self.global_providers = enabled;
    self
  }

  /// Receives every resolution failure skipped during module initialization
  /// or a tag query.
  pub fn on_swallowed_error<F>(mut self, listener: F) -> Self
  where
    F: Fn(&Token, &Error) + Send + Sync + 'static,
  {
    let listener: SwallowedErrorListener = Arc::new(listener);
    self.listener = Some(listener);
    self
  }
}

impl fmt::Debug for InjectorOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InjectorOptions")
      .field("global_providers", &self.global_providers)
      .field("has_listener", &self.listener.is_some())
      .finish()
  }
}

/// A fully wired application: the compiled module graph, its containers and
/// one [`ModuleRef`] per module.
pub struct InjectorContext {
  root: Arc<CompiledModule>,
  // Init order; `module_refs` is parallel to it.
  modules: Vec<Arc<CompiledModule>>,
  module_refs: Vec<ModuleRef>,
  containers: HashMap<ModuleKey, Container>,
  global: Container,
  root_ref: ModuleRef,
  bootstrapped: AtomicBool,
  shutting_down: AtomicBool,
}

impl InjectorContext {
  /// Compiles `root`, builds the container graph and runs every
  /// `on_module_init` hook, imports before importers.
  pub async fn create(root: impl Into<ModuleImport>, options: InjectorOptions) -> Result<Self> {
    let mut compiler = ModuleCompiler::new();
    let root = compiler.compile(root).await?;
    let modules = ModuleCompiler::modules_in_init_order(&root);
    tracing::info!(
      modules = ?modules.iter().map(|m| m.name()).collect::<Vec<_>>(),
      "Resolved module initialization order"
    );

    let global = Container::with_options(container_options(&options, Vec::new(), None));
    if options.global_providers {
      global.register(compiler.global_providers().iter().cloned())?;
    }

    let mut containers = HashMap::new();
    let root_container = build_container(&root, &global, &options, &mut containers)?;

    let mut module_refs = Vec::with_capacity(modules.len());
    for module in &modules {
      let container = containers
        .get(&module.key())
        .cloned()
        .unwrap_or_else(|| root_container.clone());
      module_refs.push(ModuleRef::new(container, module));
    }
    let root_ref = ModuleRef::new(root_container, &root);

    let context = Self {
      root,
      modules,
      module_refs,
      containers,
      global,
      root_ref,
      bootstrapped: AtomicBool::new(false),
      shutting_down: AtomicBool::new(false),
    };
    context.init_modules(&options).await?;
    Ok(context)
  }

  async fn init_modules(&self, options: &InjectorOptions) -> Result<()> {
    let mut initialized = HashSet::new();

    for (module, module_ref) in self.modules.iter().zip(&self.module_refs) {
      let container = module_ref.container();
      let module_token = module.class().token();

      let tokens = module
        .own_tokens()
        .iter()
        .filter(|token| **token != module_token)
        .chain(std::iter::once(&module_token));

      for token in tokens {
        if container.is_request_scoped(token) {
          continue;
        }
        let instance = match container.resolve_with(token, &ResolveCtx::new()).await {
          Ok(instance) => instance,
          Err(err) => {
            tracing::warn!(
              module = module.name(),
              token = %token,
              error = %err,
              "Skipping provider that failed to resolve during module init"
            );
            if let Some(listener) = &options.listener {
              listener(token, &err);
            }
            continue;
          }
        };

        if initialized.insert(instance.identity()) {
          lifecycle::invoke(&instance, LifecyclePhase::ModuleInit, None)
            .await
            .map_err(|err| Error::Lifecycle {
              phase: LifecyclePhase::ModuleInit,
              errors: vec![err],
            })?;
        }
      }
      tracing::debug!(module = module.name(), "Module initialized");
    }
    Ok(())
  }

  // --- Resolution ---

  /// Resolves `token` as seen from outside the application: the root
  /// module's unexported providers are hidden.
  pub async fn resolve(&self, token: impl Into<Token>) -> Result<Instance> {
    self.resolve_exported(token.into(), None).await
  }

  /// [`InjectorContext::resolve`] inside a request scope.
  pub async fn resolve_in(&self, token: impl Into<Token>, scope: &RequestScope) -> Result<Instance> {
    self.resolve_exported(token.into(), Some(scope.clone())).await
  }

  /// Like [`InjectorContext::resolve`], but a missing provider yields `Ok(None)`.
  pub async fn try_resolve(&self, token: impl Into<Token>) -> Result<Option<Instance>> {
    match self.resolve(token).await {
      Ok(instance) => Ok(Some(instance)),
      Err(err) if err.is_token_not_found() => Ok(None),
      Err(err) => Err(err),
    }
  }

  /// Resolves `token` from the root container, ignoring the export boundary.
  pub async fn resolve_internal(&self, token: impl Into<Token>) -> Result<Instance> {
    let token = token.into();
    self
      .root_ref
      .container()
      .resolve_with(&token, &ResolveCtx::new())
      .await
  }

  /// Resolves `token` and downcasts the instance to `T`.
  pub async fn get<T: Any + Send + Sync>(&self, token: impl Into<Token>) -> Result<Arc<T>> {
    self.resolve(token).await?.downcast::<T>()
  }

  async fn resolve_exported(&self, token: Token, request: Option<RequestScope>) -> Result<Instance> {
    let visible = token == self.root.class().token() || self.root.is_exported(&token);
    if !visible && self.root.owns(&token) {
      return Err(Error::TokenNotFound(token));
    }
    self
      .root_ref
      .container()
      .resolve_with(&token, &ResolveCtx::new().with_request(request))
      .await
  }

  // --- Request scopes ---

  /// See [`run_in_request_scope`](crate::run_in_request_scope).
  pub fn run_in_request_scope<R>(
    &self,
    id: impl Into<String>,
    f: impl FnOnce(&RequestScope) -> R,
  ) -> R {
    request::run_in_request_scope(id, f)
  }

  /// See [`run_in_request_scope_async`](crate::run_in_request_scope_async).
  pub async fn run_in_request_scope_async<F, Fut, R>(&self, id: impl Into<String>, f: F) -> R
  where
    F: FnOnce(RequestScope) -> Fut,
    Fut: Future<Output = R>,
  {
    request::run_in_request_scope_async(id, f).await
  }

  // --- Lifecycle ---

  // Every tracked instance of the application, in creation order.
  fn instances(&self) -> Vec<Instance> {
    let mut tracked = self.global.tracked(false);
    tracked.extend(self.root_ref.container().tracked(true));
    tracked.sort_by_key(|t| t.seq);

    let mut seen = HashSet::new();
    tracked
      .into_iter()
      .filter(|t| seen.insert(t.instance.identity()))
      .map(|t| t.instance)
      .collect()
  }

  /// Runs `on_application_bootstrap` on every instance. Only the first call
  /// has an effect.
  pub async fn on_application_bootstrap(&self) -> Result<()> {
    if self.bootstrapped.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    let phase = LifecyclePhase::ApplicationBootstrap;
    tracing::info!(phase = %phase, "Running lifecycle phase");

    let instances = self.instances();
    let mut errors = Vec::new();
    lifecycle::sweep(phase, &instances, None, &mut errors).await;
    aggregate(phase, errors)
  }

  /// Runs `on_before_application_shutdown` on every instance, newest first.
  /// Only the first call has an effect.
  pub async fn on_before_application_shutdown(&self, signal: Option<&str>) -> Result<()> {
    if self.shutting_down.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    let phase = LifecyclePhase::BeforeApplicationShutdown;
    tracing::info!(phase = %phase, signal, "Running lifecycle phase");

    let instances = self.instances();
    let mut errors = Vec::new();
    lifecycle::sweep(phase, instances.iter().rev(), signal, &mut errors).await;
    aggregate(phase, errors)
  }

  /// Runs `on_module_destroy`, then `on_application_shutdown`, on every
  /// instance, newest first. Every container is cleared afterwards, even
  /// when hooks failed.
  pub async fn on_application_shutdown(&self, signal: Option<&str>) -> Result<()> {
    let phase = LifecyclePhase::ApplicationShutdown;
    tracing::info!(phase = %phase, signal, "Running lifecycle phase");

    let instances = self.instances();
    let mut errors = Vec::new();
    lifecycle::sweep(
      LifecyclePhase::ModuleDestroy,
      instances.iter().rev(),
      signal,
      &mut errors,
    )
    .await;
    lifecycle::sweep(phase, instances.iter().rev(), signal, &mut errors).await;

    for container in self.containers.values() {
      container.clear();
    }
    self.global.clear();
    tracing::debug!(containers = self.containers.len() + 1, "Cleared containers");

    aggregate(phase, errors)
  }

  /// `on_before_application_shutdown` followed by `on_application_shutdown`.
  pub async fn close(&self, signal: Option<&str>) -> Result<()> {
    self.on_before_application_shutdown(signal).await?;
    self.on_application_shutdown(signal).await
  }

  // --- Accessors ---

  /// The handle of the first module in init order whose class is `module`.
  pub fn module_ref(&self, module: &Class) -> Option<&ModuleRef> {
    self
      .module_refs
      .iter()
      .find(|module_ref| module_ref.module() == module)
  }

  /// One handle per module, in init order.
  pub fn module_refs(&self) -> &[ModuleRef] {
    &self.module_refs
  }

  /// The compiled modules, in init order.
  pub fn modules(&self) -> &[Arc<CompiledModule>] {
    &self.modules
  }

  pub fn global_container(&self) -> &Container {
    &self.global
  }

  pub fn root_container(&self) -> &Container {
    self.root_ref.container()
  }

  pub fn root_module(&self) -> &Arc<CompiledModule> {
    &self.root
  }
}

impl fmt::Debug for InjectorContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InjectorContext")
      .field("root", &self.root.name())
      .field("modules", &self.modules.len())
      .field("bootstrapped", &self.bootstrapped.load(Ordering::Relaxed))
      .finish()
  }
}

fn container_options(
  options: &InjectorOptions,
  exports: Vec<Token>,
  global: Option<&Container>,
) -> ContainerOptions {
  let mut container_options = ContainerOptions::new().exports(exports);
  if let Some(global) = global {
    container_options = container_options.global(global.clone());
  }
  if let Some(listener) = &options.listener {
    container_options = container_options.on_swallowed_error(listener.clone());
  }
  container_options
}

// Builds the container of `module` and, first, those of its imports. Each
// module gets exactly one container, however many modules import it.
fn build_container(
  module: &Arc<CompiledModule>,
  global: &Container,
  options: &InjectorOptions,
  containers: &mut HashMap<ModuleKey, Container>,
) -> Result<Container> {
  if let Some(container) = containers.get(&module.key()) {
    return Ok(container.clone());
  }

  let container = Container::with_options(container_options(
    options,
    module.exports().to_vec(),
    Some(global),
  ));
  container.bind_module(ModuleBinding::new(module));

  for import in module.imports() {
    let child = build_container(import, global, options, containers)?;
    container.add_child(child);
  }

  for token in module.own_tokens() {
    if let Some(provider) = module.provider(token) {
      container.register_provider(provider)?;
    } else if let Some(class) = token.as_class() {
      container.register_provider(&Provider::from(class.clone()))?;
    }
  }

  containers.insert(module.key(), container.clone());
  Ok(container)
}

fn aggregate(phase: LifecyclePhase, errors: Vec<anyhow::Error>) -> Result<()> {
  if errors.is_empty() {
    return Ok(());
  }
  tracing::warn!(phase = %phase, failures = errors.len(), "Lifecycle phase finished with errors");
  Err(Error::Lifecycle { phase, errors })
}
