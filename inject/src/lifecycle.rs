//! Lifecycle hooks and the sweeps that drive them.

use crate::instance::Instance;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;

/// Hooks an instance may implement. Every hook defaults to a no-op.
///
/// Return the value from [`Injectable::lifecycle`](crate::Injectable::lifecycle)
/// or wrap it with [`Instance::with_lifecycle`] so the container can reach it.
#[async_trait]
pub trait Lifecycle: Send + Sync {
  /// Runs once, right after the owning module's providers are instantiated.
  async fn on_module_init(&self) -> anyhow::Result<()> {
    Ok(())
  }

  async fn on_application_bootstrap(&self) -> anyhow::Result<()> {
    Ok(())
  }

  async fn on_module_destroy(&self) -> anyhow::Result<()> {
    Ok(())
  }

  async fn on_before_application_shutdown(&self, _signal: Option<&str>) -> anyhow::Result<()> {
    Ok(())
  }

  async fn on_application_shutdown(&self, _signal: Option<&str>) -> anyhow::Result<()> {
    Ok(())
  }
}

/// A named lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
  ModuleInit,
  ApplicationBootstrap,
  ModuleDestroy,
  BeforeApplicationShutdown,
  ApplicationShutdown,
}

impl LifecyclePhase {
  pub fn hook_name(&self) -> &'static str {
    match self {
      LifecyclePhase::ModuleInit => "on_module_init",
      LifecyclePhase::ApplicationBootstrap => "on_application_bootstrap",
      LifecyclePhase::ModuleDestroy => "on_module_destroy",
      LifecyclePhase::BeforeApplicationShutdown => "on_before_application_shutdown",
      LifecyclePhase::ApplicationShutdown => "on_application_shutdown",
    }
  }
}

impl fmt::Display for LifecyclePhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.hook_name())
  }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_owned()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "hook panicked with a non-string payload".to_owned()
  }
}

/// Invokes one hook on one instance. A panicking hook is reported as an error.
pub(crate) async fn invoke(
  instance: &Instance,
  phase: LifecyclePhase,
  signal: Option<&str>,
) -> anyhow::Result<()> {
  let Some(hooks) = instance.lifecycle() else {
    return Ok(());
  };

  let call = async {
    match phase {
      LifecyclePhase::ModuleInit => hooks.on_module_init().await,
      LifecyclePhase::ApplicationBootstrap => hooks.on_application_bootstrap().await,
      LifecyclePhase::ModuleDestroy => hooks.on_module_destroy().await,
      LifecyclePhase::BeforeApplicationShutdown => {
        hooks.on_before_application_shutdown(signal).await
      }
      LifecyclePhase::ApplicationShutdown => hooks.on_application_shutdown(signal).await,
    }
  };

  match AssertUnwindSafe(call).catch_unwind().await {
    Ok(result) => result,
    Err(payload) => Err(anyhow::anyhow!(
      "{} panicked: {}",
      phase,
      panic_message(payload)
    )),
  }
}

/// Runs `phase` over every instance, in the given order, collecting failures
/// instead of stopping at the first one.
pub(crate) async fn sweep<'a, I>(
  phase: LifecyclePhase,
  instances: I,
  signal: Option<&str>,
  errors: &mut Vec<anyhow::Error>,
) where
  I: IntoIterator<Item = &'a Instance>,
{
  for instance in instances {
    if let Err(err) = invoke(instance, phase, signal).await {
      tracing::warn!(
        phase = %phase,
        instance = instance.type_name(),
        error = %err,
        "Lifecycle hook failed"
      );
      errors.push(err);
    }
  }
}
