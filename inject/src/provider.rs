//! Provider declarations and their normalized form.

use crate::class::{Class, Injectable};
use crate::container::Container;
use crate::core::ResolveCtx;
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::token::Token;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Lifetime policy of a provider's instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Mode {
  /// One instance per container, created on first resolution.
  #[default]
  Singleton,
  /// A new instance on every resolution.
  Transient,
  /// One instance per request scope; never tracked by the container.
  Request,
  /// A mode this runtime does not know. Resolved with transient semantics.
  Custom(Arc<str>),
}

impl fmt::Display for Mode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Mode::Singleton => f.write_str("singleton"),
      Mode::Transient => f.write_str("transient"),
      Mode::Request => f.write_str("request"),
      Mode::Custom(name) => f.write_str(name),
    }
  }
}

/// A factory receiving its `inject` tokens, resolved, in listed order.
pub type FactoryFn =
  Arc<dyn Fn(Vec<Instance>) -> BoxFuture<'static, anyhow::Result<Instance>> + Send + Sync>;

#[derive(Clone)]
struct CustomProvider {
  provide: Token,
  use_class: Option<Class>,
  use_value: Option<Instance>,
  use_factory: Option<FactoryFn>,
  use_existing: Option<Token>,
  inject: Vec<Token>,
  mode: Option<Mode>,
}

#[derive(Clone)]
enum ProviderKind {
  Class(Class),
  Custom(CustomProvider),
}

/// A recipe for producing the instance behind a token.
///
/// Either the class shorthand ([`Provider::class`]) or a custom provider built
/// from [`Provider::provide`] with exactly one `use_*` recipe.
#[derive(Clone)]
pub struct Provider {
  kind: ProviderKind,
}

impl Provider {
  /// Class shorthand: the class is both the token and the recipe.
  pub fn class<T: Injectable>() -> Self {
    Self::from(Class::of::<T>())
  }

  /// Starts a custom provider for `token`. Add exactly one `use_*` recipe.
  pub fn provide(token: impl Into<Token>) -> Self {
    Self {
      kind: ProviderKind::Custom(CustomProvider {
        provide: token.into(),
        use_class: None,
        use_value: None,
        use_factory: None,
        use_existing: None,
        inject: Vec::new(),
        mode: None,
      }),
    }
  }

  /// Shorthand for `provide(token).use_value(value)`.
  pub fn value<T: Any + Send + Sync>(token: impl Into<Token>, value: T) -> Self {
    Self::provide(token).use_value(value)
  }

  /// Shorthand for `provide(token).use_factory(factory)`.
  pub fn factory<F, Fut>(token: impl Into<Token>, factory: F) -> Self
  where
    F: Fn(Vec<Instance>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Instance>> + Send + 'static,
  {
    Self::provide(token).use_factory(factory)
  }

  /// Shorthand for `provide(token).use_existing(target)`.
  pub fn alias(token: impl Into<Token>, target: impl Into<Token>) -> Self {
    Self::provide(token).use_existing(target)
  }

  fn custom(mut self, update: impl FnOnce(&mut CustomProvider)) -> Self {
    // Refining a class shorthand turns it into `provide(class).use_class(class)`.
    if let ProviderKind::Class(class) = &self.kind {
      let class = class.clone();
      self.kind = ProviderKind::Custom(CustomProvider {
        provide: Token::from(&class),
        use_class: Some(class),
        use_value: None,
        use_factory: None,
        use_existing: None,
        inject: Vec::new(),
        mode: None,
      });
    }
    if let ProviderKind::Custom(custom) = &mut self.kind {
      update(custom);
    }
    self
  }

  pub fn use_class(self, class: Class) -> Self {
    self.custom(|c| c.use_class = Some(class))
  }

  pub fn use_value<T: Any + Send + Sync>(self, value: T) -> Self {
    self.use_instance(Instance::new(value))
  }

  /// Like [`Provider::use_value`] for a prebuilt instance, e.g. one carrying
  /// lifecycle hooks.
  pub fn use_instance(self, instance: Instance) -> Self {
    self.custom(|c| c.use_value = Some(instance))
  }

  /// Produces the instance with an async `factory`.
  ///
  /// Without an explicit [`Provider::mode`], the factory takes the declared
  /// [`Injectable::mode`] of its token's class. Only tokens built with
  /// [`Token::class`] carry that class; a [`Token::of`] token for the same
  /// type falls back to [`Mode::Singleton`].
  pub fn use_factory<F, Fut>(self, factory: F) -> Self
  where
    F: Fn(Vec<Instance>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Instance>> + Send + 'static,
  {
    let factory: FactoryFn = Arc::new(move |args| factory(args).boxed());
    self.custom(|c| c.use_factory = Some(factory))
  }

  pub fn use_existing(self, target: impl Into<Token>) -> Self {
    let target = target.into();
    self.custom(|c| c.use_existing = Some(target))
  }

  /// Tokens resolved and passed to the factory, in order.
  pub fn inject<I, T>(self, tokens: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: Into<Token>,
  {
    let tokens: Vec<Token> = tokens.into_iter().map(Into::into).collect();
    self.custom(|c| c.inject = tokens)
  }

  /// Explicit lifetime mode. Honored by factory providers.
  pub fn mode(self, mode: Mode) -> Self {
    self.custom(|c| c.mode = Some(mode))
  }

  /// The token this provider is registered under.
  pub fn token(&self) -> Token {
    match &self.kind {
      ProviderKind::Class(class) => Token::from(class),
      ProviderKind::Custom(custom) => custom.provide.clone(),
    }
  }
}

impl From<Class> for Provider {
  fn from(class: Class) -> Self {
    Self {
      kind: ProviderKind::Class(class),
    }
  }
}

impl fmt::Debug for Provider {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.kind {
      ProviderKind::Class(class) => write!(f, "Provider::Class({})", class.name()),
      ProviderKind::Custom(custom) => f
        .debug_struct("Provider")
        .field("provide", &custom.provide)
        .field("use_class", &custom.use_class)
        .field("has_value", &custom.use_value.is_some())
        .field("has_factory", &custom.use_factory.is_some())
        .field("use_existing", &custom.use_existing)
        .field("mode", &custom.mode)
        .finish(),
    }
  }
}

pub(crate) enum Recipe {
  Class(Class),
  Value(Instance),
  Factory {
    inject: Vec<Token>,
    factory: FactoryFn,
  },
  Existing(Token),
}

/// The canonical form every provider is reduced to before registration.
pub(crate) struct NormalizedProvider {
  pub(crate) token: Token,
  pub(crate) mode: Mode,
  recipe: Recipe,
}

impl NormalizedProvider {
  pub(crate) fn normalize(provider: &Provider) -> Result<Self> {
    let custom = match &provider.kind {
      ProviderKind::Class(class) => {
        return Ok(Self {
          token: Token::from(class),
          mode: class.mode().unwrap_or_default(),
          recipe: Recipe::Class(class.clone()),
        })
      }
      ProviderKind::Custom(custom) => custom,
    };

    let recipes = [
      custom.use_class.is_some(),
      custom.use_value.is_some(),
      custom.use_factory.is_some(),
      custom.use_existing.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if recipes != 1 {
      return Err(Error::InvalidProvider {
        token: custom.provide.clone(),
        reason: format!(
          "expected exactly one of use_class, use_value, use_factory or use_existing, found {recipes}"
        ),
      });
    }

    let token = custom.provide.clone();
    let normalized = if let Some(class) = &custom.use_class {
      Self {
        token,
        mode: class.mode().unwrap_or_default(),
        recipe: Recipe::Class(class.clone()),
      }
    } else if let Some(value) = &custom.use_value {
      Self {
        token,
        mode: Mode::Singleton,
        recipe: Recipe::Value(value.clone()),
      }
    } else if let Some(factory) = &custom.use_factory {
      let mode = custom
        .mode
        .clone()
        .or_else(|| token.as_class().and_then(Class::mode))
        .unwrap_or_default();
      Self {
        token,
        mode,
        recipe: Recipe::Factory {
          inject: custom.inject.clone(),
          factory: factory.clone(),
        },
      }
    } else {
      let target = custom.use_existing.clone().unwrap_or_else(|| token.clone());
      Self {
        token,
        mode: Mode::Singleton,
        recipe: Recipe::Existing(target),
      }
    };
    Ok(normalized)
  }

  /// The concrete class behind this provider, used for tag indexing.
  pub(crate) fn concrete_class(&self) -> Option<&Class> {
    match &self.recipe {
      Recipe::Class(class) => Some(class),
      Recipe::Existing(target) => target.as_class(),
      _ => None,
    }
  }

  /// Produces a fresh value, without any caching.
  pub(crate) fn produce<'a>(
    &'a self,
    container: &'a Container,
    ctx: &'a ResolveCtx,
  ) -> BoxFuture<'a, Result<Instance>> {
    async move {
      match &self.recipe {
        Recipe::Class(class) => container.instantiate_with(class, ctx).await,
        Recipe::Value(value) => Ok(value.clone()),
        Recipe::Factory { inject, factory } => {
          let mut args = Vec::with_capacity(inject.len());
          for token in inject {
            args.push(container.resolve_with(token, ctx).await?);
          }
          factory(args)
            .await
            .map_err(|err| Error::from_provider(&self.token, err))
        }
        Recipe::Existing(target) => container.resolve_with(target, ctx).await,
      }
    }
    .boxed()
  }
}
