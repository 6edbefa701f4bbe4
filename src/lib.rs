//! Host runtime for sandboxed WASM analyzer modules
//!
//! A scanning application points the [`ModuleManager`] at a directory of
//! guest binaries; each one is instantiated in its own wasmtime sandbox
//! and driven through a small numeric ABI:
//!
//! - structured values travel as JSON in guest linear memory, addressed by
//!   a single 64-bit word packing `(pointer, size)`;
//! - allocation goes through the guest's own exported `malloc`/`free`;
//! - guests call back into the host only to log, via the `env` module;
//! - during `analyze` a guest sees exactly one file, served from an
//!   in-memory filesystem behind standard WASI imports.
//!
//! Loaded modules satisfy the [`Analyzer`] capability set and can be
//! handed to any [`AnalyzerRegistry`]. Errors from one guest never
//! destabilize the host or its siblings.

mod codec;
mod host;
mod manager;
mod memory;
mod module;
mod runtime;
mod serialize;
mod types;
mod vfs;
mod wasi;

pub use host::{CapturingSink, LogLevel, LogSink, SharedSink, TracingSink};
pub use manager::{AnalyzerRegistry, InMemoryRegistry, ModuleManager};
pub use memory::GuestSlice;
pub use module::{Analyzer, WasmModule};
pub use runtime::{EngineState, WasmRuntime};
pub use serialize::{
    file_content, AnalysisInput, AnalysisResult, OsInfo, Package, Report, ScanResult,
};
pub use types::{
    default_module_dir, ManagerConfig, MetricsSnapshot, ModuleError, ModuleMetrics, ModuleResult,
};
pub use vfs::{ContentProducer, MemFs};
