//! Tokens: the only addressing mechanism for providers.

use crate::class::{Class, Injectable};
use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SYMBOL: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, PartialEq, Eq, Hash)]
enum Key {
  Type(TypeId),
  Name(Arc<str>),
  Symbol(u64),
}

/// Identifies a provider.
///
/// A token is either a type (identity by `TypeId`), a string (identity by value)
/// or an opaque symbol (every call to [`Token::symbol`] yields a fresh identity).
/// A type token may additionally carry the [`Class`] metadata of the type; that
/// extra information never takes part in equality or hashing.
#[derive(Clone)]
pub struct Token {
  key: Key,
  label: Arc<str>,
  class: Option<Class>,
}

impl Token {
  /// A token identified by the type `T`.
  pub fn of<T: ?Sized + Any>() -> Self {
    Self {
      key: Key::Type(TypeId::of::<T>()),
      label: Arc::from(std::any::type_name::<T>()),
      class: None,
    }
  }

  /// A type token for an injectable type, carrying its class metadata.
  pub fn class<T: Injectable>() -> Self {
    Self::from(Class::of::<T>())
  }

  /// A token identified by a string value.
  pub fn named(name: impl Into<Arc<str>>) -> Self {
    let name = name.into();
    Self {
      key: Key::Name(name.clone()),
      label: name,
      class: None,
    }
  }

  /// A fresh opaque token. Two symbols never compare equal, even with the same
  /// description.
  pub fn symbol(description: &str) -> Self {
    let id = NEXT_SYMBOL.fetch_add(1, Ordering::Relaxed);
    Self {
      key: Key::Symbol(id),
      label: Arc::from(format!("Symbol({description})")),
      class: None,
    }
  }

  /// The class metadata attached to this token, if it names an injectable type.
  pub fn as_class(&self) -> Option<&Class> {
    self.class.as_ref()
  }

  /// Returns `true` if this token is identified by a type.
  pub fn is_type(&self) -> bool {
    matches!(self.key, Key::Type(_))
  }

  /// Human readable name, used in logs and error messages.
  pub fn label(&self) -> &str {
    &self.label
  }
}

impl From<Class> for Token {
  fn from(class: Class) -> Self {
    Self {
      key: Key::Type(class.type_id()),
      label: Arc::from(class.name()),
      class: Some(class),
    }
  }
}

impl From<&Class> for Token {
  fn from(class: &Class) -> Self {
    Self::from(class.clone())
  }
}

impl From<&str> for Token {
  fn from(name: &str) -> Self {
    Self::named(name)
  }
}

impl From<String> for Token {
  fn from(name: String) -> Self {
    Self::named(name)
  }
}

impl From<&Token> for Token {
  fn from(token: &Token) -> Self {
    token.clone()
  }
}

impl PartialEq for Token {
  fn eq(&self, other: &Self) -> bool {
    self.key == other.key
  }
}

impl Eq for Token {}

impl Hash for Token {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.key.hash(state);
  }
}

impl fmt::Display for Token {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.label)
  }
}

impl fmt::Debug for Token {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.key {
      Key::Type(_) => write!(f, "Token(Type({}))", self.label),
      Key::Name(name) => write!(f, "Token(Name({name}))"),
      Key::Symbol(id) => write!(f, "Token({}#{id})", self.label),
    }
  }
}
