use fibre_inject::{
  Class, ConstructContext, Container, DynamicModule, Error, GetOptions, Injectable,
  InjectorContext, InjectorOptions, Mode, ModuleCompiler, ModuleImport, ModuleMetadata, Provider,
  Token,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

// --- Test Fixtures ---

macro_rules! module {
  ($name:ident, $metadata:expr) => {
    struct $name;

    impl Injectable for $name {
      fn module() -> Option<ModuleMetadata> {
        Some($metadata)
      }

      fn construct(_: ConstructContext) -> anyhow::Result<Self> {
        Ok($name)
      }
    }
  };
}

struct Mailer;

impl Injectable for Mailer {
  fn tags() -> Vec<&'static str> {
    vec!["notifier"]
  }

  fn construct(_: ConstructContext) -> anyhow::Result<Self> {
    Ok(Mailer)
  }
}

struct Pager;

impl Injectable for Pager {
  fn tags() -> Vec<&'static str> {
    vec!["notifier"]
  }

  fn construct(_: ConstructContext) -> anyhow::Result<Self> {
    Ok(Pager)
  }
}

/// Remembers the module it was constructed for.
struct Audit {
  module: &'static str,
}

impl Injectable for Audit {
  fn construct(ctx: ConstructContext) -> anyhow::Result<Self> {
    let module = ctx.module_ref().map(|m| m.module().name()).unwrap_or("none");
    Ok(Audit { module })
  }
}

module!(
  PagingModule,
  ModuleMetadata::new()
    .provider(Provider::class::<Pager>())
    .export(Token::of::<Pager>())
);

module!(
  MailModule,
  ModuleMetadata::new()
    .import(Class::of::<PagingModule>())
    .provider(Provider::class::<Mailer>())
    .provider(Provider::class::<Audit>())
    .provider(Provider::value("smtp.host", "mail.local"))
);

fn short(name: &str) -> &str {
  name.rsplit("::").next().unwrap()
}

// --- ModuleRef ---

#[tokio::test]
async fn test_module_ref_strict_lookup_is_limited_to_own_tokens() {
  // Arrange
  let app = InjectorContext::create(Class::of::<MailModule>(), InjectorOptions::new())
    .await
    .unwrap();
  let mail = app.module_ref(&Class::of::<MailModule>()).unwrap();
  let strict = GetOptions::new().strict(true);

  // Act
  let own = mail.get_with("smtp.host", &strict).await;
  let foreign = mail.get_with(Token::of::<Pager>(), &strict).await;
  let relaxed = mail.get(Token::of::<Pager>()).await;

  // Assert
  assert!(own.is_ok());
  assert!(matches!(foreign, Err(Error::OutsideModule { .. })));
  assert!(relaxed.is_ok());
}

#[tokio::test]
async fn test_module_ref_membership_checks() {
  // Arrange
  let app = InjectorContext::create(Class::of::<MailModule>(), InjectorOptions::new())
    .await
    .unwrap();
  let mail = app.module_ref(&Class::of::<MailModule>()).unwrap();

  // Assert
  assert!(mail.has(&Token::of::<Mailer>()));
  assert!(mail.has(&Token::of::<MailModule>()));
  assert!(!mail.has(&Token::of::<Pager>()));
  assert!(mail.has_global(&Token::of::<Pager>()));
  assert!(!mail.has_global(&Token::named("unknown")));
  assert!(mail.try_get("unknown").await.unwrap().is_none());
}

#[tokio::test]
async fn test_module_ref_get_by_tag_can_filter_to_own_tokens() {
  // Arrange
  let app = InjectorContext::create(Class::of::<MailModule>(), InjectorOptions::new())
    .await
    .unwrap();
  let mail = app.module_ref(&Class::of::<MailModule>()).unwrap();

  // Act
  let all = mail.get_by_tag("notifier", false).await;
  let own = mail.get_by_tag("notifier", true).await;

  // Assert
  assert_eq!(all.len(), 2);
  assert_eq!(own.len(), 1);
  assert!(own[0].is::<Mailer>());
}

#[tokio::test]
async fn test_constructors_receive_the_active_module_ref() {
  // Arrange
  let app = InjectorContext::create(Class::of::<MailModule>(), InjectorOptions::new())
    .await
    .unwrap();
  let mail = app.module_ref(&Class::of::<MailModule>()).unwrap();

  // Act
  let registered = mail.get_as::<Audit>(Token::of::<Audit>()).await.unwrap();
  let created = mail.create(&Class::of::<Audit>()).await.unwrap();
  let via_container = app
    .root_container()
    .instantiate_class(&Class::of::<Audit>())
    .await
    .unwrap();
  let detached = Container::new()
    .instantiate_class(&Class::of::<Audit>())
    .await
    .unwrap();

  // Assert
  assert_eq!(short(registered.module), "MailModule");
  assert_eq!(short(created.downcast::<Audit>().unwrap().module), "MailModule");
  assert_eq!(short(via_container.downcast::<Audit>().unwrap().module), "MailModule");
  assert_eq!(detached.downcast::<Audit>().unwrap().module, "none");
  // `create` never registers the class.
  assert!(!created.ptr_eq(&mail.get(Token::of::<Audit>()).await.unwrap()));
}

/// Like `Audit`, but a new instance per resolution.
struct Gauge {
  module: &'static str,
}

impl Injectable for Gauge {
  fn mode() -> Option<Mode> {
    Some(Mode::Transient)
  }

  fn construct(ctx: ConstructContext) -> anyhow::Result<Self> {
    let module = ctx.module_ref().map(|m| m.module().name()).unwrap_or("none");
    Ok(Gauge { module })
  }
}

module!(
  InspectionModule,
  ModuleMetadata::new()
    .provider(Provider::class::<Gauge>())
    .export(Token::of::<Gauge>())
);

module!(
  PlantModule,
  ModuleMetadata::new()
    .import(Class::of::<InspectionModule>())
    .export(Token::of::<Gauge>())
);

#[tokio::test]
async fn test_instances_see_the_module_that_owns_their_provider() {
  // Arrange
  let app = InjectorContext::create(Class::of::<PlantModule>(), InjectorOptions::new())
    .await
    .unwrap();
  let plant = app.module_ref(&Class::of::<PlantModule>()).unwrap();

  // Act
  let from_app = app.get::<Gauge>(Token::of::<Gauge>()).await.unwrap();
  let from_internal = app.resolve_internal(Token::of::<Gauge>()).await.unwrap();
  let from_importer = plant.get_as::<Gauge>(Token::of::<Gauge>()).await.unwrap();

  // Assert
  assert_eq!(short(from_app.module), "InspectionModule");
  assert_eq!(short(from_internal.downcast::<Gauge>().unwrap().module), "InspectionModule");
  assert_eq!(short(from_importer.module), "InspectionModule");
}

// --- Dynamic and deferred modules ---

module!(
  StorageModule,
  ModuleMetadata::new().provider(Provider::value("storage.driver", "memory"))
);

module!(DataModule, ModuleMetadata::new());

#[tokio::test]
async fn test_dynamic_module_extends_static_metadata() {
  // Arrange
  let storage = DynamicModule::of::<StorageModule>()
    .provider(Provider::value("storage.path", "/var/data"))
    .export("storage.driver")
    .export("storage.path");
  let root = DynamicModule::of::<DataModule>()
    .import(storage)
    .export("storage.path");

  // Act
  let app = InjectorContext::create(root, InjectorOptions::new()).await.unwrap();

  // Assert
  let path = app.get::<&str>("storage.path").await.unwrap();
  assert_eq!(*path, "/var/data");
  // Exported by the import, but not re-exported by the root: still reachable
  // because the root does not own it.
  let driver = app.get::<&str>("storage.driver").await.unwrap();
  assert_eq!(*driver, "memory");
}

#[tokio::test]
async fn test_deferred_import_is_awaited_during_compilation() {
  // Arrange
  let root = DynamicModule::of::<DataModule>()
    .import(ModuleImport::deferred(|| async {
      Ok(ModuleImport::from(
        DynamicModule::of::<StorageModule>().export("storage.driver"),
      ))
    }))
    .export("storage.driver");

  // Act
  let app = InjectorContext::create(root, InjectorOptions::new()).await.unwrap();

  // Assert
  assert_eq!(*app.get::<&str>("storage.driver").await.unwrap(), "memory");
}

#[tokio::test]
async fn test_failing_deferred_import_fails_compilation() {
  // Arrange
  let mut compiler = ModuleCompiler::new();
  let root = DynamicModule::of::<DataModule>().import(ModuleImport::deferred(|| async {
    Err(anyhow::anyhow!("config server unreachable"))
  }));

  // Act
  let err = compiler.compile(root).await.unwrap_err();

  // Assert
  assert!(matches!(err, Error::DeferredModule(_)));
}

#[tokio::test]
async fn test_non_module_root_is_a_compilation_error() {
  // Act
  let result = InjectorContext::create(Class::of::<Mailer>(), InjectorOptions::new()).await;

  // Assert
  assert!(matches!(result, Err(Error::ModuleCompilation(_))));
}

#[tokio::test]
async fn test_init_and_destroy_orders_are_mirrored() {
  // Arrange
  let mut compiler = ModuleCompiler::new();
  let root = compiler.compile(Class::of::<MailModule>()).await.unwrap();

  // Act
  let init: Vec<_> = ModuleCompiler::modules_in_init_order(&root);
  let destroy: Vec<_> = ModuleCompiler::modules_in_destroy_order(&root);

  // Assert
  let init_names: Vec<&str> = init.iter().map(|m| short(m.name())).collect();
  let mut destroy_names: Vec<&str> = destroy.iter().map(|m| short(m.name())).collect();
  assert_eq!(init_names, vec!["PagingModule", "MailModule"]);
  destroy_names.reverse();
  assert_eq!(destroy_names, init_names);
  assert!(Arc::ptr_eq(init.last().unwrap(), &root));
}
