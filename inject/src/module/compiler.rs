use super::{CompiledModule, DynamicModule, ModuleImport, ModuleKey, ModuleMetadata};
use crate::class::Class;
use crate::error::{Error, Result};
use crate::provider::Provider;
use crate::token::Token;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Turns module declarations into a deduplicated, acyclic graph of
/// [`CompiledModule`]s.
///
/// Compiling the same module class, or the same dynamic declaration object,
/// twice returns the identical compiled module.
#[derive(Default)]
pub struct ModuleCompiler {
  static_cache: HashMap<TypeId, Arc<CompiledModule>>,
  // Holding the declaration keeps its address, and thus its key, stable.
  dynamic_cache: HashMap<usize, (Arc<DynamicModule>, Arc<CompiledModule>)>,
  global_providers: Vec<Provider>,
  compiling: Vec<(ModuleKey, &'static str)>,
}

impl ModuleCompiler {
  pub fn new() -> Self {
    Self::default()
  }

  /// Compiles `module` and, depth-first, everything it imports.
  pub async fn compile(&mut self, module: impl Into<ModuleImport>) -> Result<Arc<CompiledModule>> {
    let module = module.into();
    self.compile_import(&module).await
  }

  fn compile_import<'a>(
    &'a mut self,
    import: &'a ModuleImport,
  ) -> BoxFuture<'a, Result<Arc<CompiledModule>>> {
    async move {
      match import {
        ModuleImport::Deferred(declare) => {
          let declared = declare().await.map_err(Error::DeferredModule)?;
          self.compile_import(&declared).await
        }
        ModuleImport::Static(class) => self.compile_static(class).await,
        ModuleImport::Dynamic(module) => self.compile_dynamic(module).await,
      }
    }
    .boxed()
  }

  async fn compile_static(&mut self, class: &Class) -> Result<Arc<CompiledModule>> {
    if let Some(compiled) = self.static_cache.get(&class.type_id()) {
      return Ok(compiled.clone());
    }

    let metadata = class
      .module_metadata()
      .ok_or(Error::ModuleCompilation(class.name()))?;
    let global = class.is_global();
    let compiled = self
      .build(
        ModuleKey::Static(class.type_id()),
        class,
        &metadata,
        global,
        &metadata.providers,
      )
      .await?;

    self.static_cache.insert(class.type_id(), compiled.clone());
    Ok(compiled)
  }

  async fn compile_dynamic(&mut self, module: &Arc<DynamicModule>) -> Result<Arc<CompiledModule>> {
    let address = Arc::as_ptr(module) as usize;
    if let Some((_, compiled)) = self.dynamic_cache.get(&address) {
      return Ok(compiled.clone());
    }

    // Static metadata first, then the dynamic additions.
    let class = module.module();
    let declared = class.module_metadata().unwrap_or_default();
    let mut metadata = declared.clone();
    metadata.extend(module.metadata());
    let global = module.global || class.is_global();

    let compiled = self
      .build(
        ModuleKey::Dynamic(address),
        class,
        &metadata,
        global,
        &declared.providers,
      )
      .await?;

    self
      .dynamic_cache
      .insert(address, (module.clone(), compiled.clone()));
    Ok(compiled)
  }

  async fn build(
    &mut self,
    key: ModuleKey,
    class: &Class,
    metadata: &ModuleMetadata,
    global: bool,
    declared_providers: &[Provider],
  ) -> Result<Arc<CompiledModule>> {
    if let Some(start) = self.compiling.iter().position(|(k, _)| *k == key) {
      let mut path: Vec<&'static str> = self.compiling[start..].iter().map(|(_, name)| *name).collect();
      path.push(class.name());
      return Err(Error::ModuleCycle { path });
    }

    self.compiling.push((key, class.name()));
    let imports = self.compile_all(&metadata.imports).await;
    self.compiling.pop();
    let imports = imports?;

    // Imported providers first, own providers appended.
    let mut providers: Vec<Provider> = imports
      .iter()
      .flat_map(|import| import.providers.iter().cloned())
      .collect();
    providers.extend(metadata.providers.iter().cloned());

    let mut own_tokens = Vec::new();
    let mut own_set = HashSet::new();
    let class_token = Token::from(class);
    for token in metadata
      .providers
      .iter()
      .map(Provider::token)
      .chain(std::iter::once(class_token))
    {
      if own_set.insert(token.clone()) {
        own_tokens.push(token);
      }
    }

    let mut exports = Vec::new();
    for token in &metadata.exports {
      if !exports.contains(token) {
        exports.push(token.clone());
      }
    }

    if global {
      self
        .global_providers
        .extend(declared_providers.iter().cloned());
    }

    tracing::debug!(
      module = class.name(),
      imports = ?imports.iter().map(|m| m.name()).collect::<Vec<_>>(),
      own_tokens = own_tokens.len(),
      global,
      "Compiled module"
    );

    Ok(Arc::new(CompiledModule {
      key,
      class: class.clone(),
      providers,
      exports,
      global,
      imports,
      own_tokens,
      own_set,
    }))
  }

  // Sequential, so declaration order is preserved.
  async fn compile_all(&mut self, imports: &[ModuleImport]) -> Result<Vec<Arc<CompiledModule>>> {
    let mut compiled = Vec::with_capacity(imports.len());
    for import in imports {
      compiled.push(self.compile_import(import).await?);
    }
    Ok(compiled)
  }

  /// Depth-first post-order over the import graph: every module appears once,
  /// after all of its imports, and `root` comes last.
  pub fn modules_in_init_order(root: &Arc<CompiledModule>) -> Vec<Arc<CompiledModule>> {
    fn visit(
      module: &Arc<CompiledModule>,
      seen: &mut HashSet<*const CompiledModule>,
      order: &mut Vec<Arc<CompiledModule>>,
    ) {
      if !seen.insert(Arc::as_ptr(module)) {
        return;
      }
      for import in &module.imports {
        visit(import, seen, order);
      }
      order.push(module.clone());
    }

    let mut order = Vec::new();
    visit(root, &mut HashSet::new(), &mut order);
    order
  }

  /// The exact reverse of [`ModuleCompiler::modules_in_init_order`].
  pub fn modules_in_destroy_order(root: &Arc<CompiledModule>) -> Vec<Arc<CompiledModule>> {
    let mut order = Self::modules_in_init_order(root);
    order.reverse();
    order
  }

  /// Static providers of every global module compiled so far.
  pub fn global_providers(&self) -> &[Provider] {
    &self.global_providers
  }

  /// Forgets every compiled module and collected global provider.
  pub fn clear(&mut self) {
    self.static_cache.clear();
    self.dynamic_cache.clear();
    self.global_providers.clear();
    self.compiling.clear();
  }
}
