//! Per-module handle over a module's container.

use crate::class::Class;
use crate::container::Container;
use crate::core::ResolveCtx;
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::module::CompiledModule;
use crate::request::RequestScope;
use crate::token::Token;
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Options for [`ModuleRef::get_with`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
  strict: bool,
  request: Option<RequestScope>,
}

impl GetOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Restricts the lookup to tokens the module owns.
  pub fn strict(mut self, strict: bool) -> Self {
    self.strict = strict;
    self
  }

  /// Resolves inside `scope`, so request-scoped tokens are reachable.
  pub fn request(mut self, scope: &RequestScope) -> Self {
    self.request = Some(scope.clone());
    self
  }
}

// What a module container remembers about its module.
#[derive(Clone)]
pub(crate) struct ModuleBinding {
  module: Class,
  own_tokens: Arc<HashSet<Token>>,
}

impl ModuleBinding {
  pub(crate) fn new(module: &CompiledModule) -> Self {
    Self {
      module: module.class().clone(),
      own_tokens: Arc::new(module.own_tokens().iter().cloned().collect()),
    }
  }
}

/// A handle bound to one module: its container and the tokens it owns.
///
/// Constructors receive the handle of the module they are instantiated for
/// through [`ConstructContext::module_ref`](crate::ConstructContext::module_ref).
#[derive(Clone)]
pub struct ModuleRef {
  container: Container,
  module: Class,
  own_tokens: Arc<HashSet<Token>>,
}

impl ModuleRef {
  pub(crate) fn new(container: Container, module: &CompiledModule) -> Self {
    Self::from_binding(container, ModuleBinding::new(module))
  }

  pub(crate) fn from_binding(container: Container, binding: ModuleBinding) -> Self {
    Self {
      container,
      module: binding.module,
      own_tokens: binding.own_tokens,
    }
  }

  /// Resolves `token` with the visibility of the module's container.
  pub async fn get(&self, token: impl Into<Token>) -> Result<Instance> {
    self.get_with(token, &GetOptions::default()).await
  }

  /// Resolves `token`. With `strict`, a token the module does not own fails
  /// with [`Error::OutsideModule`] instead of searching imports and globals.
  pub async fn get_with(&self, token: impl Into<Token>, options: &GetOptions) -> Result<Instance> {
    let token = token.into();
    if options.strict && !self.has(&token) {
      return Err(Error::OutsideModule {
        token,
        module: self.module.name(),
      });
    }
    let ctx = ResolveCtx::new().with_request(options.request.clone());
    self.container.resolve_with(&token, &ctx).await
  }

  /// Like [`ModuleRef::get`], but a missing provider yields `Ok(None)`.
  pub async fn try_get(&self, token: impl Into<Token>) -> Result<Option<Instance>> {
    match self.get(token).await {
      Ok(instance) => Ok(Some(instance)),
      Err(err) if err.is_token_not_found() => Ok(None),
      Err(err) => Err(err),
    }
  }

  /// Resolves `token` and downcasts the instance to `T`.
  pub async fn get_as<T: Any + Send + Sync>(&self, token: impl Into<Token>) -> Result<Arc<T>> {
    self.get(token).await?.downcast::<T>()
  }

  /// Whether the module itself owns `token`.
  pub fn has(&self, token: &Token) -> bool {
    self.own_tokens.contains(token)
  }

  /// Whether `token` is reachable from the module's container at all.
  pub fn has_global(&self, token: &Token) -> bool {
    self.container.can_resolve(token)
  }

  /// Instances tagged with `tag`, as [`Container::get_by_tag`] returns them.
  /// With `own_only`, instances for tokens the module does not own are
  /// dropped.
  pub async fn get_by_tag(&self, tag: &str, own_only: bool) -> Vec<Instance> {
    self
      .container
      .tagged_instances(tag, &ResolveCtx::new())
      .await
      .into_iter()
      .filter(|(token, _)| !own_only || self.has(token))
      .map(|(_, instance)| instance)
      .collect()
  }

  /// Instantiates a class that is not registered anywhere, resolving its
  /// dependencies through this module's container.
  pub async fn create(&self, class: &Class) -> Result<Instance> {
    self.container.instantiate_with(class, &ResolveCtx::new()).await
  }

  pub fn container(&self) -> &Container {
    &self.container
  }

  /// The module class this handle belongs to.
  pub fn module(&self) -> &Class {
    &self.module
  }
}

impl fmt::Debug for ModuleRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModuleRef")
      .field("module", &self.module.name())
      .field("container", &self.container.id())
      .field("own_tokens", &self.own_tokens.len())
      .finish()
  }
}
