use fibre_inject::{
  run_in_request_scope, run_in_request_scope_async, Class, ConstructContext, Container, Dependency,
  Error, Injectable, InjectorContext, InjectorOptions, Instance, Mode, ModuleMetadata, Provider,
  RequestScope, Token,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// --- Test Fixtures ---

/// One per request: knows which request it serves.
struct RequestContext {
  request: Arc<String>,
}

impl Injectable for RequestContext {
  fn dependencies() -> Vec<Dependency> {
    vec![Dependency::new("request", "request")]
  }

  fn mode() -> Option<Mode> {
    Some(Mode::Request)
  }

  fn construct(ctx: ConstructContext) -> anyhow::Result<Self> {
    Ok(RequestContext {
      request: ctx.get("request")?,
    })
  }
}

// The incoming request object must be seeded into the scope.
fn request_provider() -> Provider {
  Provider::provide("request")
    .use_factory(|_| async { Err(anyhow::anyhow!("no request is bound to this scope")) })
    .mode(Mode::Request)
}

struct WebModule;

impl Injectable for WebModule {
  fn module() -> Option<ModuleMetadata> {
    Some(
      ModuleMetadata::new()
        .provider(request_provider())
        .provider(Provider::class::<RequestContext>())
        .export("request")
        .export(Token::of::<RequestContext>()),
    )
  }

  fn construct(_: ConstructContext) -> anyhow::Result<Self> {
    Ok(WebModule)
  }
}

async fn app() -> InjectorContext {
  InjectorContext::create(Class::of::<WebModule>(), InjectorOptions::new())
    .await
    .unwrap()
}

fn seed(scope: &RequestScope, path: &str) {
  scope.set("request", Instance::new(path.to_string()));
}

// --- Tests ---

#[tokio::test]
async fn test_request_scoped_providers_are_skipped_during_module_init() {
  // Arrange
  let skipped = Arc::new(AtomicU32::new(0));
  let skipped_in_listener = skipped.clone();
  let options = InjectorOptions::new().on_swallowed_error(move |_, _| {
    skipped_in_listener.fetch_add(1, Ordering::SeqCst);
  });

  // Act
  let app = InjectorContext::create(Class::of::<WebModule>(), options)
    .await
    .unwrap();

  // Assert
  assert_eq!(skipped.load(Ordering::SeqCst), 0);
  assert!(app.root_container().is_request_scoped(&Token::of::<RequestContext>()));
  assert!(!app
    .root_container()
    .get_instances(true)
    .iter()
    .any(|i| i.is::<RequestContext>()));
}

#[tokio::test]
async fn test_resolving_outside_a_scope_fails() {
  // Arrange
  let app = app().await;

  // Act
  let result = app.resolve(Token::of::<RequestContext>()).await;

  // Assert
  assert!(matches!(result, Err(Error::MissingRequestContext(_))));
}

#[tokio::test]
async fn test_same_instance_within_one_scope() {
  // Arrange
  let app = &app().await;

  // Act
  let (first, second) = app
    .run_in_request_scope_async("req-same", |scope| async move {
      seed(&scope, "/orders");
      let first = app.resolve_in(Token::of::<RequestContext>(), &scope).await.unwrap();
      let second = app.resolve_in(Token::of::<RequestContext>(), &scope).await.unwrap();
      (first, second)
    })
    .await;

  // Assert
  assert!(first.ptr_eq(&second));
  assert_eq!(*first.downcast::<RequestContext>().unwrap().request, "/orders");
  // Request-scoped instances are never tracked by a container.
  assert!(!app
    .root_container()
    .get_instances(true)
    .iter()
    .any(|i| i.is::<RequestContext>()));
}

#[tokio::test]
async fn test_concurrent_scopes_do_not_share_instances() {
  // Arrange
  let app = &app().await;
  let handle = |id: &'static str| {
    run_in_request_scope_async(id, move |scope| async move {
      seed(&scope, id);
      tokio::task::yield_now().await;
      app
        .resolve_in(Token::of::<RequestContext>(), &scope)
        .await
        .unwrap()
    })
  };

  // Act
  let (a, b) = tokio::join!(handle("req-a"), handle("req-b"));

  // Assert
  assert!(!a.ptr_eq(&b));
  assert_eq!(*a.downcast::<RequestContext>().unwrap().request, "req-a");
  assert_eq!(*b.downcast::<RequestContext>().unwrap().request, "req-b");
}

#[tokio::test]
async fn test_unseeded_request_object_surfaces_the_factory_error() {
  // Arrange
  let app = &app().await;

  // Act
  let result = app
    .run_in_request_scope_async("req-unseeded", |scope| async move {
      app.resolve_in(Token::of::<RequestContext>(), &scope).await
    })
    .await;

  // Assert
  match result {
    Err(Error::Provider { token, .. }) => assert_eq!(token, Token::named("request")),
    other => panic!("expected a provider error, got: {other:?}"),
  }
}

#[tokio::test]
async fn test_scope_is_discarded_after_the_future_completes() {
  // Arrange
  let app = app().await;

  // Act
  let escaped = app
    .run_in_request_scope_async("req-discard", |scope| async move {
      seed(&scope, "/health");
      assert!(RequestScope::find("req-discard").is_some());
      scope
    })
    .await;

  // Assert
  assert!(RequestScope::find("req-discard").is_none());
  assert!(escaped.is_empty());
}

#[tokio::test]
async fn test_container_resolves_request_tokens_in_a_detached_scope() {
  // Arrange
  let container = Container::new();
  container
    .register([
      request_provider(),
      Provider::class::<RequestContext>(),
    ])
    .unwrap();
  let scope = RequestScope::new("detached");
  seed(&scope, "/detached");

  // Act
  let context = container.resolve_in(Token::of::<RequestContext>(), &scope).await.unwrap();
  let other = container
    .resolve_in(Token::of::<RequestContext>(), &RequestScope::new("detached"))
    .await;

  // Assert
  assert!(scope.contains(&Token::of::<RequestContext>()));
  assert_eq!(*context.downcast::<RequestContext>().unwrap().request, "/detached");
  // Same id, different scope object: nothing is shared.
  assert!(matches!(other, Err(Error::Provider { .. })));
}

#[test]
fn test_sync_scope_helper_returns_the_closure_result() {
  let cached = run_in_request_scope("req-sync", |scope| {
    seed(scope, "/sync");
    scope.len()
  });
  assert_eq!(cached, 1);
  assert!(RequestScope::find("req-sync").is_none());
}
