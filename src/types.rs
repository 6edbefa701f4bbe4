//! Shared types for the module host
//!
//! Error taxonomy, manager configuration and per-module counters.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the module host.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module compile error: {0}")]
    Compile(String),

    #[error("module init error: {0}")]
    Instantiate(String),

    #[error("wasm module build error: {0}")]
    HostModule(String),

    #[error("WASI init error: {0}")]
    WasiInit(String),

    #[error("engine is {0}")]
    EngineState(&'static str),

    #[error("{0}() must be exported")]
    ExportNotFound(&'static str),

    #[error("invalid signature: {0}")]
    InvalidSignature(&'static str),

    #[error("unable to read memory")]
    MemoryRead,

    #[error("memory write ({offset}, {len}) out of range of memory size {size}")]
    MemoryWrite { offset: u32, len: u32, size: usize },

    #[error("malloc error: {0}")]
    Malloc(String),

    #[error("marshal error: {0}")]
    Marshal(String),

    #[error("unmarshal error: {0}")]
    Unmarshal(String),

    #[error("regexp compile error: {0}")]
    Regex(#[from] regex::Error),

    #[error("invalid UTF-8 in guest string: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("wasm function {name}() invocation error: {message}")]
    GuestCall { name: &'static str, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("module is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("module {name}: {source}")]
    Module {
        name: String,
        #[source]
        source: Box<ModuleError>,
    },

    #[error("close error: {}", join_errors(.0))]
    Close(Vec<ModuleError>),
}

pub type ModuleResult<T> = Result<T, ModuleError>;

fn join_errors(errors: &[ModuleError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory scanned for module binaries.
    pub module_dir: PathBuf,
    /// Extension (without the dot) a candidate file must carry.
    pub extension: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            module_dir: default_module_dir(),
            extension: "wasm".to_string(),
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.module_dir = dir.into();
        self
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }
}

/// Default module directory: `$HOME/.trivy/modules`.
pub fn default_module_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".trivy")
        .join("modules")
}

/// Per-module call counters.
///
/// `malloc_calls` and `free_calls` track allocator traffic the host drives
/// on the guest's behalf; a completed host call leaves them equal.
#[derive(Debug, Default)]
pub struct ModuleMetrics {
    pub(crate) malloc_calls: AtomicU64,
    pub(crate) free_calls: AtomicU64,
    pub(crate) analyze_calls: AtomicU64,
    pub(crate) analyze_errors: AtomicU64,
    pub(crate) post_scan_calls: AtomicU64,
    pub(crate) post_scan_errors: AtomicU64,
}

impl ModuleMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            malloc_calls: self.malloc_calls.load(Ordering::Relaxed),
            free_calls: self.free_calls.load(Ordering::Relaxed),
            analyze_calls: self.analyze_calls.load(Ordering::Relaxed),
            analyze_errors: self.analyze_errors.load(Ordering::Relaxed),
            post_scan_calls: self.post_scan_calls.load(Ordering::Relaxed),
            post_scan_errors: self.post_scan_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ModuleMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub malloc_calls: u64,
    pub free_calls: u64,
    pub analyze_calls: u64,
    pub analyze_errors: u64,
    pub post_scan_calls: u64,
    pub post_scan_errors: u64,
}
