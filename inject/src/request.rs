//! Request scopes: short-lived instance caches identified by a request id.

use crate::core::InstanceSlot;
use crate::instance::Instance;
use crate::token::Token;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

// Every scope currently entered through `run_in_request_scope*`, keyed by id.
// Nested scopes reusing an id stack up; lookups see the innermost one.
static REQUEST_STORE: Lazy<DashMap<String, Vec<Weak<RequestData>>>> = Lazy::new(DashMap::new);

struct RequestData {
  id: String,
  cache: DashMap<Token, Arc<InstanceSlot>>,
}

/// Handle to one request scope and its private instance cache.
///
/// Pass it to [`Container::resolve_in`](crate::Container::resolve_in) or
/// [`InjectorContext::resolve_in`](crate::InjectorContext::resolve_in) to
/// resolve request-scoped tokens. Two scopes never share a cache.
#[derive(Clone)]
pub struct RequestScope {
  inner: Arc<RequestData>,
}

impl RequestScope {
  /// Creates a detached scope. It is not visible through [`RequestScope::find`]
  /// and its cache lives as long as the last handle.
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      inner: Arc::new(RequestData {
        id: id.into(),
        cache: DashMap::new(),
      }),
    }
  }

  /// The innermost active scope entered with `id`, if any.
  pub fn find(id: &str) -> Option<RequestScope> {
    let entry = REQUEST_STORE.get(id)?;
    entry
      .iter()
      .rev()
      .find_map(Weak::upgrade)
      .map(|inner| RequestScope { inner })
  }

  pub fn id(&self) -> &str {
    &self.inner.id
  }

  /// The cached instance for `token`, if it was already created in this scope.
  pub fn get(&self, token: &Token) -> Option<Instance> {
    self
      .inner
      .cache
      .get(token)
      .and_then(|slot| slot.get())
  }

  /// Seeds the cache, e.g. with the incoming request object.
  pub fn set(&self, token: impl Into<Token>, instance: Instance) {
    let token = token.into();
    let slot = InstanceSlot::ready(token.clone(), instance);
    self.inner.cache.insert(token, Arc::new(slot));
  }

  pub fn contains(&self, token: &Token) -> bool {
    self.get(token).is_some()
  }

  /// Number of instances cached in this scope.
  pub fn len(&self) -> usize {
    self
      .inner
      .cache
      .iter()
      .filter(|slot| slot.value().get().is_some())
      .count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub(crate) fn slot(&self, token: &Token) -> Arc<InstanceSlot> {
    self
      .inner
      .cache
      .entry(token.clone())
      .or_insert_with(|| Arc::new(InstanceSlot::new(token.clone())))
      .clone()
  }

  fn discard(&self) {
    self.inner.cache.clear();
  }
}

impl fmt::Debug for RequestScope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RequestScope")
      .field("id", &self.inner.id)
      .field("cached", &self.len())
      .finish()
  }
}

/// Registers a fresh scope on creation, discards it when dropped.
struct ScopeGuard {
  scope: RequestScope,
}

impl ScopeGuard {
  fn enter(id: String) -> Self {
    let scope = RequestScope::new(id);
    REQUEST_STORE
      .entry(scope.inner.id.clone())
      .or_default()
      .push(Arc::downgrade(&scope.inner));
    tracing::trace!(request_id = %scope.id(), "Entered request scope");
    Self { scope }
  }
}

impl Drop for ScopeGuard {
  fn drop(&mut self) {
    let id = self.scope.id();
    let current = Arc::as_ptr(&self.scope.inner);
    if let Some(mut entries) = REQUEST_STORE.get_mut(id) {
      entries.retain(|weak| weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), current));
    }
    REQUEST_STORE.remove_if(id, |_, entries| entries.is_empty());
    self.scope.discard();
    tracing::trace!(request_id = %id, "Left request scope");
  }
}

/// Runs `f` inside a fresh request scope identified by `id`.
///
/// The scope's cache is discarded when `f` returns or unwinds.
pub fn run_in_request_scope<R>(id: impl Into<String>, f: impl FnOnce(&RequestScope) -> R) -> R {
  let guard = ScopeGuard::enter(id.into());
  f(&guard.scope)
}

/// Async counterpart of [`run_in_request_scope`]: the scope stays active until
/// the future produced by `f` completes.
pub async fn run_in_request_scope_async<F, Fut, R>(id: impl Into<String>, f: F) -> R
where
  F: FnOnce(RequestScope) -> Fut,
  Fut: Future<Output = R>,
{
  let guard = ScopeGuard::enter(id.into());
  f(guard.scope.clone()).await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scope_is_discoverable_only_while_active() {
    let token = Token::named("request");
    let leaked = run_in_request_scope("req-store-1", |scope| {
      scope.set(token.clone(), Instance::new(7_u32));
      let found = RequestScope::find("req-store-1").expect("scope should be active");
      assert!(found.contains(&token));
      scope.clone()
    });

    assert!(RequestScope::find("req-store-1").is_none());
    // Even a handle that escaped the closure sees an empty cache.
    assert!(leaked.is_empty());
  }

  #[test]
  fn nested_scopes_with_the_same_id_shadow_and_restore() {
    run_in_request_scope("req-store-2", |outer| {
      outer.set("marker", Instance::new("outer"));
      run_in_request_scope("req-store-2", |_inner| {
        let found = RequestScope::find("req-store-2").unwrap();
        assert!(!found.contains(&Token::named("marker")));
      });
      let found = RequestScope::find("req-store-2").unwrap();
      assert!(found.contains(&Token::named("marker")));
    });
  }

  #[test]
  fn scope_is_discarded_when_the_closure_panics() {
    let result = std::panic::catch_unwind(|| {
      run_in_request_scope("req-store-3", |_| panic!("boom"));
    });
    assert!(result.is_err());
    assert!(RequestScope::find("req-store-3").is_none());
  }
}
