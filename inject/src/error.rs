use crate::lifecycle::LifecyclePhase;
use crate::token::Token;
use thiserror::Error;

fn join_tokens(tokens: &[Token]) -> String {
  tokens
    .iter()
    .map(Token::label)
    .collect::<Vec<_>>()
    .join(" -> ")
}

fn join_errors(errors: &[anyhow::Error]) -> String {
  errors
    .iter()
    .map(|e| format!("{e:#}"))
    .collect::<Vec<_>>()
    .join("; ")
}

/// The error type for every `fibre_inject` operation.
#[derive(Debug, Error)]
pub enum Error {
  #[error("No provider found for token '{0}'")]
  TokenNotFound(Token),

  #[error("Circular dependency detected: {}", join_tokens(chain))]
  CircularDependency { chain: Vec<Token> },

  #[error("Invalid provider for '{token}': {reason}")]
  InvalidProvider { token: Token, reason: String },

  #[error("'{0}' is not a module: it declares no module metadata")]
  ModuleCompilation(&'static str),

  #[error("Deferred module declaration failed")]
  DeferredModule(#[source] anyhow::Error),

  #[error("Cyclic module import detected: {}", path.join(" -> "))]
  ModuleCycle { path: Vec<&'static str> },

  #[error("No request context is active while resolving request-scoped token '{0}'")]
  MissingRequestContext(Token),

  #[error("Token '{token}' is not provided by module '{module}'")]
  OutsideModule { token: Token, module: &'static str },

  #[error("Type mismatch: expected '{expected}', found '{found}'")]
  TypeMismatch {
    expected: &'static str,
    found: &'static str,
  },

  #[error("Dependency field '{field}' was not declared")]
  UnknownDependency { field: String },

  #[error("Provider for '{token}' failed")]
  Provider {
    token: Token,
    #[source]
    source: anyhow::Error,
  },

  #[error("{phase} failed with {} error(s): {}", errors.len(), join_errors(errors))]
  Lifecycle {
    phase: LifecyclePhase,
    errors: Vec<anyhow::Error>,
  },
}

impl Error {
  /// Returns `true` for the one condition `try_resolve` and best-effort sweeps
  /// treat as recoverable.
  pub fn is_token_not_found(&self) -> bool {
    matches!(self, Error::TokenNotFound(_))
  }

  /// Wraps a failure raised by user code (a factory or a constructor) for `token`.
  ///
  /// Errors that already are `fibre_inject` errors pass through unchanged, so a
  /// missing nested dependency still reads as "token not found".
  pub(crate) fn from_provider(token: &Token, source: anyhow::Error) -> Self {
    match source.downcast::<Error>() {
      Ok(err) => err,
      Err(source) => Error::Provider {
        token: token.clone(),
        source,
      },
    }
  }
}

/// A specialized `Result` type for `fibre_inject` operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
