//! Module manager
//!
//! Owns the engine and every loaded module: builds the host imports,
//! scans the module directory, and fans `register`, `post_scan` and
//! `close` out across the fleet.

use std::ffi::OsStr;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::host::{SharedSink, TracingSink};
use crate::module::{Analyzer, WasmModule};
use crate::runtime::WasmRuntime;
use crate::serialize::Report;
use crate::types::{ManagerConfig, ModuleError, ModuleResult};

/// Where loaded modules are announced. Injected rather than global so
/// disjoint managers can coexist under test.
pub trait AnalyzerRegistry: Send + Sync {
    fn register(&self, analyzer: Arc<dyn Analyzer>);
    fn list(&self) -> Vec<Arc<dyn Analyzer>>;
}

/// Plain in-process registry.
#[derive(Default)]
pub struct InMemoryRegistry {
    analyzers: RwLock<Vec<Arc<dyn Analyzer>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AnalyzerRegistry for InMemoryRegistry {
    fn register(&self, analyzer: Arc<dyn Analyzer>) {
        self.analyzers
            .write()
            .expect("registry poisoned")
            .push(analyzer);
    }

    fn list(&self) -> Vec<Arc<dyn Analyzer>> {
        self.analyzers.read().expect("registry poisoned").clone()
    }
}

/// Manager over every module found in the configured directory.
pub struct ModuleManager {
    runtime: WasmRuntime,
    modules: Vec<Arc<WasmModule>>,
    config: ManagerConfig,
}

impl ModuleManager {
    /// Build the engine, wire the host imports, and load every candidate
    /// from the module directory. A single failing module aborts
    /// construction.
    pub async fn new(config: ManagerConfig) -> ModuleResult<Self> {
        Self::with_sink(config, Arc::new(TracingSink)).await
    }

    pub async fn with_sink(config: ManagerConfig, sink: SharedSink) -> ModuleResult<Self> {
        let mut runtime = WasmRuntime::new(sink)?;
        runtime.build_env()?;
        runtime.install_wasi()?;

        let mut manager = Self {
            runtime,
            modules: Vec::new(),
            config,
        };
        manager.load_modules().await?;
        Ok(manager)
    }

    async fn load_modules(&mut self) -> ModuleResult<()> {
        let dir = self.config.module_dir.clone();
        if tokio::fs::metadata(&dir).await.is_err() {
            tokio::fs::create_dir_all(&dir).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755))
                    .await;
            }
        }
        debug!("module dir: {}", dir.display());

        // One level deep, regular files with the configured extension only;
        // sorted so load order is stable for a given directory state.
        let mut candidates = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(OsStr::to_str) != Some(self.config.extension.as_str()) {
                continue;
            }
            candidates.push(path);
        }
        candidates.sort();

        for path in candidates {
            let file_name = path
                .file_name()
                .and_then(OsStr::to_str)
                .unwrap_or_default()
                .to_string();
            info!("Loading {file_name}...");

            let code = tokio::fs::read(&path).await?;
            let module = WasmModule::load(&self.runtime, &code).map_err(|e| {
                ModuleError::Module {
                    name: file_name.clone(),
                    source: Box::new(e),
                }
            })?;
            self.modules.push(Arc::new(module));
        }
        Ok(())
    }

    /// Announce every loaded module to the registry.
    pub fn register(&self, registry: &dyn AnalyzerRegistry) {
        for module in &self.modules {
            info!(
                "Registering WASM module: {}@v{}",
                module.name(),
                module.version()
            );
            registry.register(module.clone());
        }
    }

    /// Run every module's `post_scan` over the report, in load order.
    /// The first failure aborts and carries the module's name.
    pub async fn post_scan(
        &self,
        cancel: &CancellationToken,
        report: &mut Report,
    ) -> ModuleResult<()> {
        for module in &self.modules {
            if cancel.is_cancelled() {
                return Err(ModuleError::Cancelled);
            }
            module.post_scan(cancel, report).await?;
        }
        Ok(())
    }

    /// Close the engine and every module. Nothing is skipped because of a
    /// prior failure; all errors come back as one aggregate.
    pub async fn close(&mut self) -> ModuleResult<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.runtime.close() {
            errors.push(e);
        }
        for module in &self.modules {
            if let Err(e) = module.close().await {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModuleError::Close(errors))
        }
    }

    pub fn modules(&self) -> &[Arc<WasmModule>] {
        &self.modules
    }
}
