//! Module declarations and their compiled form.

mod compiler;

pub use compiler::ModuleCompiler;

use crate::class::{Class, Injectable};
use crate::provider::Provider;
use crate::token::Token;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::TypeId;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// What a module declares: the modules it imports, the providers it owns and
/// the tokens it exposes to importers.
#[derive(Clone, Default)]
pub struct ModuleMetadata {
  pub imports: Vec<ModuleImport>,
  pub providers: Vec<Provider>,
  pub exports: Vec<Token>,
}

impl ModuleMetadata {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn import(mut self, module: impl Into<ModuleImport>) -> Self {
    self.imports.push(module.into());
    self
  }

  pub fn provider(mut self, provider: impl Into<Provider>) -> Self {
    self.providers.push(provider.into());
    self
  }

  pub fn export(mut self, token: impl Into<Token>) -> Self {
    self.exports.push(token.into());
    self
  }

  fn extend(&mut self, other: &ModuleMetadata) {
    self.imports.extend(other.imports.iter().cloned());
    self.providers.extend(other.providers.iter().cloned());
    self.exports.extend(other.exports.iter().cloned());
  }
}

impl fmt::Debug for ModuleMetadata {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModuleMetadata")
      .field("imports", &self.imports)
      .field("providers", &self.providers)
      .field("exports", &self.exports)
      .finish()
  }
}

/// A module declaration computed at runtime, e.g. a configurable module.
///
/// Its metadata is appended to whatever the underlying module class declares
/// statically. Compiled results are cached per declaration object, so keep the
/// `Arc` around to reuse a declaration.
pub struct DynamicModule {
  module: Class,
  metadata: ModuleMetadata,
  global: bool,
}

impl DynamicModule {
  pub fn new(module: Class) -> Self {
    Self {
      module,
      metadata: ModuleMetadata::default(),
      global: false,
    }
  }

  pub fn of<M: Injectable>() -> Self {
    Self::new(Class::of::<M>())
  }

  pub fn import(mut self, module: impl Into<ModuleImport>) -> Self {
    self.metadata.imports.push(module.into());
    self
  }

  pub fn provider(mut self, provider: impl Into<Provider>) -> Self {
    self.metadata.providers.push(provider.into());
    self
  }

  pub fn export(mut self, token: impl Into<Token>) -> Self {
    self.metadata.exports.push(token.into());
    self
  }

  /// Makes the module global regardless of its class declaration.
  pub fn global(mut self, global: bool) -> Self {
    self.global = global;
    self
  }

  pub fn module(&self) -> &Class {
    &self.module
  }

  pub fn metadata(&self) -> &ModuleMetadata {
    &self.metadata
  }
}

/// Produces a module declaration asynchronously.
pub type DeferredModuleFn =
  Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<ModuleImport>> + Send + Sync>;

/// A reference to a module, as found in `imports` or passed to the compiler.
#[derive(Clone)]
pub enum ModuleImport {
  /// A module class with static metadata.
  Static(Class),
  /// A runtime-computed declaration.
  Dynamic(Arc<DynamicModule>),
  /// A declaration that must be awaited first.
  Deferred(DeferredModuleFn),
}

impl ModuleImport {
  pub fn of<M: Injectable>() -> Self {
    ModuleImport::Static(Class::of::<M>())
  }

  pub fn deferred<F, Fut>(f: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ModuleImport>> + Send + 'static,
  {
    ModuleImport::Deferred(Arc::new(move || f().boxed()))
  }
}

impl From<Class> for ModuleImport {
  fn from(class: Class) -> Self {
    ModuleImport::Static(class)
  }
}

impl From<DynamicModule> for ModuleImport {
  fn from(module: DynamicModule) -> Self {
    ModuleImport::Dynamic(Arc::new(module))
  }
}

impl From<Arc<DynamicModule>> for ModuleImport {
  fn from(module: Arc<DynamicModule>) -> Self {
    ModuleImport::Dynamic(module)
  }
}

impl fmt::Debug for ModuleImport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ModuleImport::Static(class) => write!(f, "Static({})", class.name()),
      ModuleImport::Dynamic(module) => write!(f, "Dynamic({})", module.module.name()),
      ModuleImport::Deferred(_) => f.write_str("Deferred(..)"),
    }
  }
}

/// Identity under which a compiled module is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ModuleKey {
  Static(TypeId),
  Dynamic(usize),
}

/// One resolved module of the graph.
pub struct CompiledModule {
  key: ModuleKey,
  class: Class,
  providers: Vec<Provider>,
  exports: Vec<Token>,
  global: bool,
  imports: Vec<Arc<CompiledModule>>,
  own_tokens: Vec<Token>,
  own_set: HashSet<Token>,
}

impl CompiledModule {
  pub(crate) fn key(&self) -> ModuleKey {
    self.key
  }

  /// The module class.
  pub fn class(&self) -> &Class {
    &self.class
  }

  pub fn name(&self) -> &'static str {
    self.class.name()
  }

  /// Providers of every import (recursively) followed by this module's own.
  pub fn providers(&self) -> &[Provider] {
    &self.providers
  }

  /// The provider registered under `token`. Own providers, declared last, win.
  pub fn provider(&self, token: &Token) -> Option<&Provider> {
    self.providers.iter().rev().find(|p| &p.token() == token)
  }

  pub fn exports(&self) -> &[Token] {
    &self.exports
  }

  pub fn is_exported(&self, token: &Token) -> bool {
    self.exports.contains(token)
  }

  pub fn is_global(&self) -> bool {
    self.global
  }

  pub fn imports(&self) -> &[Arc<CompiledModule>] {
    &self.imports
  }

  /// Tokens owned locally: every own provider's token plus the module's type.
  pub fn own_tokens(&self) -> &[Token] {
    &self.own_tokens
  }

  pub fn owns(&self, token: &Token) -> bool {
    self.own_set.contains(token)
  }
}

impl fmt::Debug for CompiledModule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompiledModule")
      .field("class", &self.class.name())
      .field(
        "imports",
        &self.imports.iter().map(|m| m.name()).collect::<Vec<_>>(),
      )
      .field("own_tokens", &self.own_tokens)
      .field("exports", &self.exports)
      .field("global", &self.global)
      .finish()
  }
}
