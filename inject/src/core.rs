//! Core, non-public bookkeeping shared by containers: the resolution context
//! that travels down a chain of nested resolutions, the once-initialized
//! instance slots, and tracked instances.

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::request::RequestScope;
use crate::token::Token;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

// Process-wide creation counter, so instances tracked by different containers
// can still be swept in creation order.
static CREATION_SEQ: AtomicU64 = AtomicU64::new(0);

// One link of the in-flight chain. Each nested resolution extends its parent's
// chain without mutating it, so leaving a resolution (successfully or not)
// needs no cleanup.
struct InFlight {
  container: u64,
  token: Token,
  parent: Option<Arc<InFlight>>,
}

// Shared by every context derived from one top-level resolution. Remembers
// the slot this resolution is blocked on, so a waiter can follow the
// wait-for graph across concurrent resolutions.
#[derive(Default)]
struct Chain {
  waiting_on: Mutex<Option<Arc<InstanceSlot>>>,
}

/// Explicit context of one logical resolution: the in-flight chain used for
/// cycle detection and the active request scope.
#[derive(Clone, Default)]
pub(crate) struct ResolveCtx {
  in_flight: Option<Arc<InFlight>>,
  chain: Arc<Chain>,
  request: Option<RequestScope>,
}

impl ResolveCtx {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn with_request(mut self, scope: Option<RequestScope>) -> Self {
    self.request = scope;
    self
  }

  pub(crate) fn request(&self) -> Option<&RequestScope> {
    self.request.as_ref()
  }

  fn links(&self) -> impl Iterator<Item = &InFlight> {
    std::iter::successors(self.in_flight.as_deref(), |link| link.parent.as_deref())
  }

  /// Fails with a circular dependency if `token` is already being resolved by
  /// `container` on this chain.
  pub(crate) fn check(&self, container: u64, token: &Token) -> Result<()> {
    let repeated = self
      .links()
      .any(|link| link.container == container && &link.token == token);
    if !repeated {
      return Ok(());
    }

    let mut chain: Vec<Token> = self
      .links()
      .filter(|link| link.container == container)
      .map(|link| link.token.clone())
      .collect();
    chain.reverse();
    chain.push(token.clone());
    Err(Error::CircularDependency { chain })
  }

  /// Returns the context for resolving `token` inside `container`.
  pub(crate) fn enter(&self, container: u64, token: &Token) -> Result<ResolveCtx> {
    self.check(container, token)?;
    Ok(ResolveCtx {
      in_flight: Some(Arc::new(InFlight {
        container,
        token: token.clone(),
        parent: self.in_flight.clone(),
      })),
      chain: self.chain.clone(),
      request: self.request.clone(),
    })
  }

  // Tokens in flight on this chain, across containers, root-first.
  fn in_flight_tokens(&self) -> Vec<Token> {
    let mut tokens: Vec<Token> = self.links().map(|link| link.token.clone()).collect();
    tokens.reverse();
    tokens
  }
}

enum SlotState {
  Empty,
  Initializing(Arc<Chain>),
  Ready(Instance),
}

/// A lazily produced instance: a singleton of a container, or a request-scoped
/// instance of a `RequestScope`.
///
/// Only one resolution runs the initializer; concurrent ones wait for it. A
/// resolution that would wait on an initializer which is itself waiting,
/// directly or through other resolutions, on this one fails with
/// [`Error::CircularDependency`] instead.
pub(crate) struct InstanceSlot {
  token: Token,
  state: Mutex<SlotState>,
  notify: Notify,
}

impl InstanceSlot {
  pub(crate) fn new(token: Token) -> Self {
    Self {
      token,
      state: Mutex::new(SlotState::Empty),
      notify: Notify::new(),
    }
  }

  pub(crate) fn ready(token: Token, instance: Instance) -> Self {
    Self {
      token,
      state: Mutex::new(SlotState::Ready(instance)),
      notify: Notify::new(),
    }
  }

  pub(crate) fn get(&self) -> Option<Instance> {
    match &*self.state.lock() {
      SlotState::Ready(instance) => Some(instance.clone()),
      _ => None,
    }
  }

  /// Returns the cached instance, or runs `init` once no other resolution is
  /// producing it. A failed `init` leaves the slot empty.
  pub(crate) async fn get_or_try_init<F, Fut>(
    self: &Arc<Self>,
    ctx: &ResolveCtx,
    init: F,
  ) -> Result<Instance>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Instance>>,
  {
    loop {
      // Registered before the state is read, so a completion in between is
      // not missed.
      let notified = self.notify.notified();
      {
        let mut state = self.state.lock();
        if let SlotState::Ready(instance) = &*state {
          return Ok(instance.clone());
        }
        if let SlotState::Empty = *state {
          *state = SlotState::Initializing(ctx.chain.clone());
          break;
        }
      }

      let _waiting = WaitGuard::enter(&ctx.chain, self.clone());
      if let Some(path) = self.deadlock_path(&ctx.chain) {
        let mut chain = ctx.in_flight_tokens();
        chain.extend(path);
        return Err(Error::CircularDependency { chain });
      }
      tracing::trace!(token = %self.token, "Waiting for a concurrent initialization");
      notified.await;
    }

    let mut guard = InitGuard {
      slot: self.as_ref(),
      done: false,
    };
    let result = init().await;
    guard.done = true;
    let mut state = self.state.lock();
    *state = match &result {
      Ok(instance) => SlotState::Ready(instance.clone()),
      Err(_) => SlotState::Empty,
    };
    drop(state);
    self.notify.notify_waiters();
    result
  }

  // Follows slot -> initializing chain -> slot that chain waits on, until the
  // walk reaches `me`. Returns the tokens of the slots visited.
  fn deadlock_path(self: &Arc<Self>, me: &Arc<Chain>) -> Option<Vec<Token>> {
    let mut path = vec![self.token.clone()];
    let mut visited = HashSet::new();
    let mut slot = self.clone();
    loop {
      if !visited.insert(Arc::as_ptr(&slot)) {
        return None;
      }
      let owner = match &*slot.state.lock() {
        SlotState::Initializing(owner) => owner.clone(),
        _ => return None,
      };
      if Arc::ptr_eq(&owner, me) {
        return Some(path);
      }
      let next = owner.waiting_on.lock().clone()?;
      path.push(next.token.clone());
      slot = next;
    }
  }
}

// Marks `chain` as blocked on a slot for as long as it lives.
struct WaitGuard<'a> {
  chain: &'a Chain,
}

impl<'a> WaitGuard<'a> {
  fn enter(chain: &'a Arc<Chain>, slot: Arc<InstanceSlot>) -> Self {
    *chain.waiting_on.lock() = Some(slot);
    Self { chain }
  }
}

impl Drop for WaitGuard<'_> {
  fn drop(&mut self) {
    *self.chain.waiting_on.lock() = None;
  }
}

// Resets a slot whose initializer was dropped before finishing.
struct InitGuard<'a> {
  slot: &'a InstanceSlot,
  done: bool,
}

impl Drop for InitGuard<'_> {
  fn drop(&mut self) {
    if self.done {
      return;
    }
    *self.slot.state.lock() = SlotState::Empty;
    self.slot.notify.notify_waiters();
  }
}

/// An instance remembered by a container for lifecycle sweeps.
#[derive(Clone)]
pub(crate) struct Tracked {
  pub(crate) seq: u64,
  pub(crate) instance: Instance,
}

impl Tracked {
  pub(crate) fn new(instance: Instance) -> Self {
    Self {
      seq: CREATION_SEQ.fetch_add(1, Ordering::Relaxed),
      instance,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reentering_a_token_reports_the_chain() {
    let a = Token::named("a");
    let b = Token::named("b");

    let ctx = ResolveCtx::new().enter(1, &a).unwrap().enter(1, &b).unwrap();

    match ctx.enter(1, &a) {
      Err(Error::CircularDependency { chain }) => {
        assert_eq!(chain, vec![a.clone(), b.clone(), a.clone()]);
      }
      _ => panic!("expected a circular dependency"),
    }
  }

  #[test]
  fn same_token_in_another_container_is_not_a_cycle() {
    let a = Token::named("a");
    let ctx = ResolveCtx::new().enter(1, &a).unwrap();
    assert!(ctx.enter(2, &a).is_ok());
  }

  #[test]
  fn sibling_resolutions_do_not_see_each_other() {
    let root = ResolveCtx::new().enter(1, &Token::named("root")).unwrap();
    let _left = root.enter(1, &Token::named("shared")).unwrap();
    // `_left` finished (or failed); its link is not part of `root`.
    assert!(root.enter(1, &Token::named("shared")).is_ok());
  }
}
