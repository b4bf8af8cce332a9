//! Type-erased instances handed out by containers.

use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A shared, type-erased value produced by a provider.
///
/// Cloning an `Instance` is cheap and keeps the same identity: two clones are
/// [`Instance::ptr_eq`].
#[derive(Clone)]
pub struct Instance {
  value: Arc<dyn Any + Send + Sync>,
  hooks: Option<Arc<dyn Lifecycle>>,
  type_name: &'static str,
}

impl Instance {
  /// Wraps a plain value with no lifecycle hooks.
  pub fn new<T: Any + Send + Sync>(value: T) -> Self {
    Self::from_arc(Arc::new(value))
  }

  /// Wraps an already shared value with no lifecycle hooks.
  pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
    Self::from_parts(value, None)
  }

  /// Wraps a value that also implements [`Lifecycle`].
  pub fn with_lifecycle<T: Lifecycle + Any>(value: Arc<T>) -> Self {
    let hooks: Arc<dyn Lifecycle> = value.clone();
    Self::from_parts(value, Some(hooks))
  }

  pub(crate) fn from_parts<T: Any + Send + Sync>(
    value: Arc<T>,
    hooks: Option<Arc<dyn Lifecycle>>,
  ) -> Self {
    Self {
      value,
      hooks,
      type_name: std::any::type_name::<T>(),
    }
  }

  /// Returns the value as `Arc<T>`, failing if it holds another type.
  pub fn downcast<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
    self
      .value
      .clone()
      .downcast::<T>()
      .map_err(|_| Error::TypeMismatch {
        expected: std::any::type_name::<T>(),
        found: self.type_name,
      })
  }

  pub fn is<T: Any>(&self) -> bool {
    self.value.is::<T>()
  }

  pub fn type_name(&self) -> &'static str {
    self.type_name
  }

  /// The lifecycle hooks this instance exposes, if any.
  pub fn lifecycle(&self) -> Option<&Arc<dyn Lifecycle>> {
    self.hooks.as_ref()
  }

  /// Reference identity of the underlying value.
  pub fn ptr_eq(&self, other: &Instance) -> bool {
    self.identity() == other.identity()
  }

  pub(crate) fn identity(&self) -> usize {
    Arc::as_ptr(&self.value) as *const () as usize
  }
}

impl fmt::Debug for Instance {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Instance")
      .field("type", &self.type_name)
      .field("has_hooks", &self.hooks.is_some())
      .finish()
  }
}
