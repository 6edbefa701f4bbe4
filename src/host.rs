//! Host exports
//!
//! The `env` module linked into every guest: four log sinks reading the
//! calling module's memory, plus a one-page linear memory for guests that
//! import rather than define their own.

use std::sync::Arc;
use std::sync::Mutex;

use tracing::{debug, error, info, warn};
use wasmtime::{Caller, Extern, Linker, Memory};

use crate::runtime::StoreData;
use crate::types::{ModuleError, ModuleResult};

/// Severity of a guest log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Destination for guest log lines.
///
/// Payloads are raw bytes from guest memory; guests usually send UTF-8 but
/// the host forwards whatever it read, so sinks must tolerate anything.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &[u8]);
}

/// Default sink: forwards guest lines to `tracing` at the matching level,
/// rendering non-UTF-8 payloads lossily.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &[u8]) {
        let text = String::from_utf8_lossy(message);
        match level {
            LogLevel::Debug => debug!("{text}"),
            LogLevel::Info => info!("{text}"),
            LogLevel::Warn => warn!("{text}"),
            LogLevel::Error => error!("{text}"),
        }
    }
}

/// Sink that records every line, for asserting on guest output in tests.
#[derive(Default)]
pub struct CapturingSink {
    entries: Mutex<Vec<(LogLevel, Vec<u8>)>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(LogLevel, Vec<u8>)> {
        self.entries.lock().expect("sink poisoned").clone()
    }

    pub fn messages_at(&self, level: LogLevel) -> Vec<Vec<u8>> {
        self.entries()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m)
            .collect()
    }
}

impl LogSink for CapturingSink {
    fn log(&self, level: LogLevel, message: &[u8]) {
        self.entries
            .lock()
            .expect("sink poisoned")
            .push((level, message.to_vec()));
    }
}

/// Register the `env` log functions on the linker. The `mem` export is
/// store-bound and is defined separately at instantiation time.
pub(crate) fn install_env(linker: &mut Linker<StoreData>) -> ModuleResult<()> {
    log_export(linker, "debug", LogLevel::Debug)?;
    log_export(linker, "info", LogLevel::Info)?;
    log_export(linker, "warn", LogLevel::Warn)?;
    log_export(linker, "error", LogLevel::Error)?;
    Ok(())
}

fn log_export(
    linker: &mut Linker<StoreData>,
    name: &'static str,
    level: LogLevel,
) -> ModuleResult<()> {
    linker
        .func_wrap(
            "env",
            name,
            move |mut caller: Caller<'_, StoreData>, offset: u32, size: u32| {
                let Some(memory) = caller_memory(&mut caller) else {
                    error!("log import called by a module with no accessible memory");
                    return;
                };
                let (data, state) = memory.data_and_store_mut(&mut caller);
                let start = offset as usize;
                match data.get(start..start + size as usize) {
                    Some(bytes) => state.sink.log(level, bytes),
                    // A bad region never propagates to the guest.
                    None => error!(offset, size, "memory read out of range in log import"),
                }
            },
        )
        .map_err(|e| ModuleError::HostModule(e.to_string()))?;
    Ok(())
}

/// The calling module's linear memory: its own `memory` export when it has
/// one, else the host-provided `env.mem`.
pub(crate) fn caller_memory(caller: &mut Caller<'_, StoreData>) -> Option<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .or(caller.data().env_mem)
}

/// Shared handle used by stores and tests.
pub type SharedSink = Arc<dyn LogSink>;
