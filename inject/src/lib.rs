//! # Fibre Inject
//!
//! A module-aware, async dependency injection runtime for Rust.
//!
//! Fibre Inject resolves instances from providers registered under tokens,
//! organizes them into modules with explicit imports and exports, and drives
//! an ordered set of lifecycle hooks from initialization to shutdown.
//!
//! ## Core Concepts
//!
//! - **Token**: identifies a provider, by type, by name or as an opaque symbol.
//! - **Provider**: a recipe for a token: a class, a value, a factory or an alias.
//! - **Container**: a provider registry with singleton, transient and
//!   request-scoped lifetimes, children (imported modules) and a shared global
//!   container.
//! - **Module**: a bundle of imports, providers and exports, compiled by the
//!   [`ModuleCompiler`] into an acyclic, deduplicated graph.
//! - **InjectorContext**: builds one container per module, runs
//!   `on_module_init` imports-first and drives the application lifecycle.
//!
//! ## Quick Start
//!
//! ```
//! use fibre_inject::{
//!   ConstructContext, Injectable, InjectorContext, InjectorOptions, ModuleMetadata, Provider, Token,
//! };
//!
//! struct Greeter {
//!   message: String,
//! }
//!
//! impl Injectable for Greeter {
//!   fn dependencies() -> Vec<fibre_inject::Dependency> {
//!     vec![fibre_inject::Dependency::new("message", "greeting")]
//!   }
//!
//!   fn construct(ctx: ConstructContext) -> anyhow::Result<Self> {
//!     let message = ctx.get::<String>("message")?;
//!     Ok(Greeter { message: (*message).clone() })
//!   }
//! }
//!
//! struct GreetingModule;
//!
//! impl Injectable for GreetingModule {
//!   fn module() -> Option<ModuleMetadata> {
//!     Some(
//!       ModuleMetadata::new()
//!         .provider(Provider::value("greeting", String::from("Hello, World!")))
//!         .provider(Provider::class::<Greeter>())
//!         .export(Token::of::<Greeter>()),
//!     )
//!   }
//!
//!   fn construct(_: ConstructContext) -> anyhow::Result<Self> {
//!     Ok(GreetingModule)
//!   }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), fibre_inject::Error> {
//! let app = InjectorContext::create(fibre_inject::Class::of::<GreetingModule>(), InjectorOptions::new()).await?;
//!
//! let greeter = app.get::<Greeter>(Token::of::<Greeter>()).await?;
//! assert_eq!(greeter.message, "Hello, World!");
//!
//! // "greeting" is not exported from the root module.
//! assert!(app.try_resolve("greeting").await?.is_none());
//!
//! app.close(None).await?;
//! # Ok(())
//! # }
//! ```

mod class;
mod container;
mod core;
mod error;
mod injector;
mod instance;
mod lifecycle;
mod module;
mod module_ref;
mod provider;
mod request;
mod token;

pub use class::{Class, ConstructContext, Dependencies, Dependency, Injectable};
pub use container::{Container, ContainerOptions, SwallowedErrorListener};
pub use error::{Error, Result};
pub use injector::{InjectorContext, InjectorOptions};
pub use instance::Instance;
pub use lifecycle::{Lifecycle, LifecyclePhase};
pub use module::{
  CompiledModule, DeferredModuleFn, DynamicModule, ModuleCompiler, ModuleImport, ModuleMetadata,
};
pub use module_ref::{GetOptions, ModuleRef};
pub use provider::{FactoryFn, Mode, Provider};
pub use request::{run_in_request_scope, run_in_request_scope_async, RequestScope};
pub use token::Token;

// Implementors of `Lifecycle` need the same attribute.
pub use async_trait::async_trait;
