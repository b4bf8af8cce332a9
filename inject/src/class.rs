//! Per-class metadata: the contract between the resolution engine and whatever
//! mechanism declares dependencies, lifetimes, tags and module membership.

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::lifecycle::Lifecycle;
use crate::module::ModuleMetadata;
use crate::module_ref::ModuleRef;
use crate::provider::Mode;
use crate::token::Token;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A type the container knows how to construct.
///
/// Every method except [`Injectable::construct`] has a default, so a plain
/// service only declares what it needs:
///
/// ```
/// use fibre_inject::{ConstructContext, Dependency, Injectable, Token};
/// use std::sync::Arc;
///
/// struct Config {
///   url: String,
/// }
///
/// struct Database {
///   config: Arc<Config>,
/// }
///
/// impl Injectable for Database {
///   fn dependencies() -> Vec<Dependency> {
///     vec![Dependency::new("config", Token::of::<Config>())]
///   }
///
///   fn construct(ctx: ConstructContext) -> anyhow::Result<Self> {
///     Ok(Database { config: ctx.get("config")? })
///   }
/// }
/// ```
pub trait Injectable: Any + Send + Sync + Sized {
  /// Declared field dependencies, resolved before `construct` runs.
  fn dependencies() -> Vec<Dependency> {
    Vec::new()
  }

  /// Declared lifetime mode. `None` means singleton.
  fn mode() -> Option<Mode> {
    None
  }

  /// Tags this class is indexed under when registered.
  fn tags() -> Vec<&'static str> {
    Vec::new()
  }

  /// Module declaration, for types that are modules.
  fn module() -> Option<ModuleMetadata> {
    None
  }

  /// Whether this module's providers are visible to every container.
  fn is_global() -> bool {
    false
  }

  /// Builds the value from its resolved dependencies.
  fn construct(ctx: ConstructContext) -> anyhow::Result<Self>;

  /// Exposes the lifecycle hooks of a constructed value.
  ///
  /// Types implementing [`Lifecycle`] return `Some(self)`.
  fn lifecycle(self: Arc<Self>) -> Option<Arc<dyn Lifecycle>> {
    None
  }
}

/// Type-erased descriptor of an [`Injectable`] type.
#[derive(Clone)]
pub struct Class {
  type_id: TypeId,
  name: &'static str,
  dependencies: fn() -> Vec<Dependency>,
  mode: fn() -> Option<Mode>,
  tags: fn() -> Vec<&'static str>,
  module: fn() -> Option<ModuleMetadata>,
  global: fn() -> bool,
  construct: fn(ConstructContext) -> anyhow::Result<Instance>,
}

fn construct_erased<T: Injectable>(ctx: ConstructContext) -> anyhow::Result<Instance> {
  let value = Arc::new(T::construct(ctx)?);
  let hooks = T::lifecycle(value.clone());
  Ok(Instance::from_parts(value, hooks))
}

impl Class {
  pub fn of<T: Injectable>() -> Self {
    Self {
      type_id: TypeId::of::<T>(),
      name: std::any::type_name::<T>(),
      dependencies: T::dependencies,
      mode: T::mode,
      tags: T::tags,
      module: T::module,
      global: T::is_global,
      construct: construct_erased::<T>,
    }
  }

  pub fn type_id(&self) -> TypeId {
    self.type_id
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  pub fn dependencies(&self) -> Vec<Dependency> {
    (self.dependencies)()
  }

  pub fn mode(&self) -> Option<Mode> {
    (self.mode)()
  }

  pub fn tags(&self) -> Vec<&'static str> {
    (self.tags)()
  }

  pub fn module_metadata(&self) -> Option<ModuleMetadata> {
    (self.module)()
  }

  pub fn is_module(&self) -> bool {
    self.module_metadata().is_some()
  }

  pub fn is_global(&self) -> bool {
    (self.global)()
  }

  pub fn token(&self) -> Token {
    Token::from(self)
  }

  pub(crate) fn construct(&self, ctx: ConstructContext) -> anyhow::Result<Instance> {
    (self.construct)(ctx)
  }
}

impl PartialEq for Class {
  fn eq(&self, other: &Self) -> bool {
    self.type_id == other.type_id
  }
}

impl Eq for Class {}

impl fmt::Debug for Class {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Class({})", self.name)
  }
}

/// One declared field dependency of a class.
#[derive(Clone, Debug)]
pub struct Dependency {
  pub field: &'static str,
  pub token: Token,
  pub optional: bool,
}

impl Dependency {
  pub fn new(field: &'static str, token: impl Into<Token>) -> Self {
    Self {
      field,
      token: token.into(),
      optional: false,
    }
  }

  /// Marks the dependency optional: a missing provider leaves the field unset
  /// instead of failing construction.
  pub fn optional(mut self) -> Self {
    self.optional = true;
    self
  }
}

/// Dependencies resolved for one construction, in declaration order.
#[derive(Default)]
pub struct Dependencies {
  fields: Vec<(Dependency, Option<Instance>)>,
}

impl Dependencies {
  pub(crate) fn push(&mut self, dependency: Dependency, instance: Option<Instance>) {
    self.fields.push((dependency, instance));
  }

  fn entry(&self, field: &str) -> Result<&(Dependency, Option<Instance>)> {
    self
      .fields
      .iter()
      .find(|(dep, _)| dep.field == field)
      .ok_or_else(|| Error::UnknownDependency {
        field: field.to_owned(),
      })
  }

  /// The resolved instance for `field`, or `None` if it was optional and missing.
  pub fn instance(&self, field: &str) -> Result<Option<&Instance>> {
    Ok(self.entry(field)?.1.as_ref())
  }

  /// Typed access to a required field.
  pub fn get<T: Any + Send + Sync>(&self, field: &str) -> Result<Arc<T>> {
    let (dep, instance) = self.entry(field)?;
    match instance {
      Some(instance) => instance.downcast::<T>(),
      None => Err(Error::TokenNotFound(dep.token.clone())),
    }
  }

  /// Typed access to an optional field.
  pub fn optional<T: Any + Send + Sync>(&self, field: &str) -> Result<Option<Arc<T>>> {
    match self.instance(field)? {
      Some(instance) => instance.downcast::<T>().map(Some),
      None => Ok(None),
    }
  }

  pub fn len(&self) -> usize {
    self.fields.len()
  }

  pub fn is_empty(&self) -> bool {
    self.fields.is_empty()
  }
}

/// Everything a class receives when it is constructed.
pub struct ConstructContext {
  module: Option<ModuleRef>,
  dependencies: Dependencies,
}

impl ConstructContext {
  pub(crate) fn new(module: Option<ModuleRef>, dependencies: Dependencies) -> Self {
    Self {
      module,
      dependencies,
    }
  }

  /// The handle of the module whose container is constructing this instance.
  /// `None` for the global container and for containers built by hand.
  pub fn module_ref(&self) -> Option<&ModuleRef> {
    self.module.as_ref()
  }

  pub fn dependencies(&self) -> &Dependencies {
    &self.dependencies
  }

  pub fn get<T: Any + Send + Sync>(&self, field: &str) -> Result<Arc<T>> {
    self.dependencies.get(field)
  }

  pub fn optional<T: Any + Send + Sync>(&self, field: &str) -> Result<Option<Arc<T>>> {
    self.dependencies.optional(field)
  }
}
