//! Guest module instance
//!
//! One loaded WASM analyzer: its instance, resolved exports, metadata, and
//! the two host-driven operations. All guest state sits behind an
//! instance-local mutex; a guest instance holds mutable linear memory and
//! must never see two calls at once.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wasmtime::{Func, Instance, Memory, Store};

use crate::codec;
use crate::memory::{self, invoke};
use crate::runtime::{StoreData, WasmRuntime};
use crate::serialize::{AnalysisInput, AnalysisResult, Report, ScanResult};
use crate::types::{MetricsSnapshot, ModuleError, ModuleMetrics, ModuleResult};
use crate::vfs::{parent_dir, MemFs};

/// The capability set by which anything, native or WASM-backed, acts as an
/// analyzer.
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn kind(&self) -> String;
    fn version(&self) -> i32;
    fn required(&self, file_path: &str) -> bool;
    async fn analyze(
        &self,
        cancel: &CancellationToken,
        input: AnalysisInput,
    ) -> ModuleResult<AnalysisResult>;
}

struct ModuleCtx {
    store: Store<StoreData>,
    memory: Memory,
    fn_analyze: Func,
    fn_post_scan: Func,
    fn_malloc: Func,
    fn_free: Func,
}

/// A loaded guest module.
pub struct WasmModule {
    name: String,
    version: i32,
    required_files: Vec<Regex>,
    metrics: Arc<ModuleMetrics>,
    ctx: Mutex<Option<ModuleCtx>>,
}

impl WasmModule {
    /// Compile and instantiate a guest, resolve its mandatory exports and
    /// read its static metadata. Any missing export, bad arity, unreadable
    /// metadata, or uncompilable pattern rejects the module.
    pub fn load(runtime: &WasmRuntime, code: &[u8]) -> ModuleResult<Self> {
        let compiled = runtime.compile(code)?;
        let (mut store, instance) = runtime.instantiate(&compiled)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .or(store.data().env_mem)
            .ok_or(ModuleError::ExportNotFound("memory"))?;

        let fn_malloc = require_func(&mut store, &instance, "malloc", 1)?;
        let fn_free = require_func(&mut store, &instance, "free", 0)?;
        let fn_analyze = require_func(&mut store, &instance, "analyze", 1)?;
        let fn_post_scan = require_func(&mut store, &instance, "post_scan", 1)?;
        let fn_name = require_func(&mut store, &instance, "name", 1)?;
        let fn_version = require_func(&mut store, &instance, "version", 1)?;
        let fn_required = require_func(&mut store, &instance, "required", 1)?;

        let mut ctx = ModuleCtx {
            store,
            memory,
            fn_analyze,
            fn_post_scan,
            fn_malloc,
            fn_free,
        };

        let packed = invoke(&mut ctx.store, fn_name, "name", &[])?;
        let name = codec::read_string(&ctx.store, ctx.memory, packed)?;

        let version = invoke(&mut ctx.store, fn_version, "version", &[])? as i32;

        let packed = invoke(&mut ctx.store, fn_required, "required", &[])?;
        let patterns: Vec<String> = codec::unmarshal(&ctx.store, ctx.memory, packed)?;
        let required_files = patterns
            .iter()
            .map(|p| Regex::new(p).map_err(ModuleError::from))
            .collect::<ModuleResult<Vec<_>>>()?;

        debug!(module = %name, version, patterns = patterns.len(), "module loaded");

        Ok(Self {
            name,
            version,
            required_files,
            metrics: Arc::new(ModuleMetrics::default()),
            ctx: Mutex::new(Some(ctx)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    /// True iff any of the module's patterns matches `file_path`.
    pub fn required(&self, file_path: &str) -> bool {
        self.required_files.iter().any(|r| r.is_match(file_path))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run the guest's `analyze` over one input file.
    ///
    /// The input is presented through a filesystem built fresh for this
    /// call, holding exactly the one file under its normalized absolute
    /// path. A failing call, including a guest trap, leaves the instance
    /// loaded and usable; nothing is recycled.
    pub async fn analyze(
        &self,
        cancel: &CancellationToken,
        input: AnalysisInput,
    ) -> ModuleResult<AnalysisResult> {
        self.metrics.analyze_calls.fetch_add(1, Ordering::Relaxed);
        let result = self.analyze_locked(cancel, input).await;
        if result.is_err() {
            self.metrics.analyze_errors.fetch_add(1, Ordering::Relaxed);
        }
        result.map_err(|e| self.named(e))
    }

    async fn analyze_locked(
        &self,
        cancel: &CancellationToken,
        input: AnalysisInput,
    ) -> ModuleResult<AnalysisResult> {
        if cancel.is_cancelled() {
            return Err(ModuleError::Cancelled);
        }
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(ModuleError::Closed)?;

        let file_path = normalize_path(&input.file_path);
        debug!(module = %self.name, path = %file_path, "analyzing");

        let mut fs = MemFs::new();
        fs.mkdir_all(parent_dir(&file_path))?;
        fs.write_lazy_file(&file_path, input.content)?;

        ctx.store.data_mut().wasi.attach(fs);
        let outcome = analyze_call(ctx, &self.metrics, cancel, &file_path);
        ctx.store.data_mut().wasi.detach();
        outcome
    }

    /// Run the guest's `post_scan` over the report's results, replacing
    /// them wholesale with whatever the guest returns.
    pub async fn post_scan(
        &self,
        cancel: &CancellationToken,
        report: &mut Report,
    ) -> ModuleResult<()> {
        self.metrics.post_scan_calls.fetch_add(1, Ordering::Relaxed);
        let result = self.post_scan_locked(cancel, report).await;
        if result.is_err() {
            self.metrics.post_scan_errors.fetch_add(1, Ordering::Relaxed);
        }
        result.map_err(|e| self.named(e))
    }

    async fn post_scan_locked(
        &self,
        cancel: &CancellationToken,
        report: &mut Report,
    ) -> ModuleResult<()> {
        if cancel.is_cancelled() {
            return Err(ModuleError::Cancelled);
        }
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(ModuleError::Closed)?;

        let results: Vec<ScanResult> = report.results.clone();
        let slice = codec::marshal(
            &mut ctx.store,
            ctx.memory,
            ctx.fn_malloc,
            ctx.fn_free,
            &self.metrics,
            cancel,
            &results,
        )?;

        let invoked = invoke(
            &mut ctx.store,
            ctx.fn_post_scan,
            "post_scan",
            &[u64::from(slice.ptr), u64::from(slice.len)],
        );
        let decoded: ModuleResult<Vec<ScanResult>> = match invoked {
            Ok(packed) => codec::unmarshal(&ctx.store, ctx.memory, packed),
            Err(err) => Err(err),
        };
        memory::guest_free(&mut ctx.store, ctx.fn_free, &self.metrics, slice.ptr);

        report.results = decoded?;
        Ok(())
    }

    /// Drop the underlying instance. Later calls fail as closed.
    pub async fn close(&self) -> ModuleResult<()> {
        self.ctx.lock().await.take();
        Ok(())
    }

    fn named(&self, source: ModuleError) -> ModuleError {
        ModuleError::Module {
            name: self.name.clone(),
            source: Box::new(source),
        }
    }
}

fn analyze_call(
    ctx: &mut ModuleCtx,
    metrics: &ModuleMetrics,
    cancel: &CancellationToken,
    file_path: &str,
) -> ModuleResult<AnalysisResult> {
    let slice = codec::write_string(
        &mut ctx.store,
        ctx.memory,
        ctx.fn_malloc,
        ctx.fn_free,
        metrics,
        cancel,
        file_path,
    )?;

    let invoked = invoke(
        &mut ctx.store,
        ctx.fn_analyze,
        "analyze",
        &[u64::from(slice.ptr), u64::from(slice.len)],
    );
    let decoded = match invoked {
        Ok(packed) => codec::unmarshal(&ctx.store, ctx.memory, packed),
        Err(err) => Err(err),
    };
    memory::guest_free(&mut ctx.store, ctx.fn_free, metrics, slice.ptr);
    decoded
}

#[async_trait]
impl Analyzer for WasmModule {
    fn kind(&self) -> String {
        self.name.clone()
    }

    fn version(&self) -> i32 {
        WasmModule::version(self)
    }

    fn required(&self, file_path: &str) -> bool {
        WasmModule::required(self, file_path)
    }

    async fn analyze(
        &self,
        cancel: &CancellationToken,
        input: AnalysisInput,
    ) -> ModuleResult<AnalysisResult> {
        WasmModule::analyze(self, cancel, input).await
    }
}

fn require_func(
    store: &mut Store<StoreData>,
    instance: &Instance,
    name: &'static str,
    results: usize,
) -> ModuleResult<Func> {
    let func = instance
        .get_func(&mut *store, name)
        .ok_or(ModuleError::ExportNotFound(name))?;
    if func.ty(&*store).results().len() != results {
        return Err(ModuleError::InvalidSignature(name));
    }
    Ok(func)
}

/// Absolute POSIX-style rendering of an input path: backslashes become
/// forward slashes and the result is rooted at `/`.
pub(crate) fn normalize_path(input: &str) -> String {
    let slashed = input.replace('\\', "/");
    let trimmed = slashed.trim_start_matches('/');
    format!("/{trimmed}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_cases() {
        assert_eq!(normalize_path("a.txt"), "/a.txt");
        assert_eq!(normalize_path("/a.txt"), "/a.txt");
        assert_eq!(normalize_path("a\\b.txt"), "/a/b.txt");
        assert_eq!(normalize_path("dir\\sub\\f.txt"), "/dir/sub/f.txt");
        assert_eq!(normalize_path("//double"), "/double");
    }
}
