//! Engine wrapper
//!
//! Owns the wasmtime engine and the linker carrying the host-provided
//! imports, and walks the `Fresh → EnvReady → Ready → Closed` lifecycle.
//! Closing is terminal; after it only `close` itself is accepted.

use std::io;

use tracing::debug;
use wasmtime::{Config, Engine, Instance, Linker, Memory, MemoryType, Module, Store};

use crate::host::{self, SharedSink};
use crate::types::{ModuleError, ModuleResult};
use crate::wasi::{self, ProcExit, WasiState};

/// Lifecycle of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Fresh,
    EnvReady,
    Ready,
    Closed,
}

impl EngineState {
    fn name(self) -> &'static str {
        match self {
            EngineState::Fresh => "fresh",
            EngineState::EnvReady => "env-ready",
            EngineState::Ready => "ready",
            EngineState::Closed => "closed",
        }
    }
}

/// Data held by every guest store.
pub(crate) struct StoreData {
    pub(crate) sink: SharedSink,
    pub(crate) wasi: WasiState,
    /// Host-provided `env.mem`, the fallback linear memory for guests that
    /// import rather than export one.
    pub(crate) env_mem: Option<Memory>,
}

/// The engine plus the host imports every guest links against.
pub struct WasmRuntime {
    engine: Engine,
    linker: Linker<StoreData>,
    sink: SharedSink,
    state: EngineState,
}

impl WasmRuntime {
    pub fn new(sink: SharedSink) -> ModuleResult<Self> {
        let config = Config::new();
        let engine =
            Engine::new(&config).map_err(|e| ModuleError::HostModule(e.to_string()))?;
        let linker = Linker::new(&engine);
        Ok(Self {
            engine,
            linker,
            sink,
            state: EngineState::Fresh,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Register the `env` host module. Valid once, from `Fresh`.
    pub fn build_env(&mut self) -> ModuleResult<()> {
        self.ensure(EngineState::Fresh)?;
        host::install_env(&mut self.linker)?;
        self.state = EngineState::EnvReady;
        Ok(())
    }

    /// Register the WASI snapshot-preview1 imports. Valid once, from
    /// `EnvReady`.
    pub fn install_wasi(&mut self) -> ModuleResult<()> {
        self.ensure(EngineState::EnvReady)?;
        wasi::install(&mut self.linker)?;
        self.state = EngineState::Ready;
        Ok(())
    }

    /// Compile a guest binary.
    pub fn compile(&self, code: &[u8]) -> ModuleResult<Module> {
        self.ensure(EngineState::Ready)?;
        Module::new(&self.engine, code).map_err(|e| ModuleError::Compile(e.to_string()))
    }

    /// Instantiate a compiled guest: fresh store, the one-page `env.mem`
    /// defined for it, start function run. Guests compiled as commands also
    /// get their exported `_start` invoked; exiting 0 from it is normal.
    pub(crate) fn instantiate(&self, module: &Module) -> ModuleResult<(Store<StoreData>, Instance)> {
        self.ensure(EngineState::Ready)?;

        let data = StoreData {
            sink: self.sink.clone(),
            wasi: WasiState::new(Box::new(io::stdout())),
            env_mem: None,
        };
        let mut store = Store::new(&self.engine, data);

        let mem = Memory::new(&mut store, MemoryType::new(1, Some(1)))
            .map_err(|e| ModuleError::HostModule(e.to_string()))?;
        store.data_mut().env_mem = Some(mem);

        let mut linker = self.linker.clone();
        linker
            .define(&mut store, "env", "mem", mem)
            .map_err(|e| ModuleError::HostModule(e.to_string()))?;

        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| ModuleError::Instantiate(e.to_string()))?;

        if let Some(start) = instance.get_func(&mut store, "_start") {
            if let Err(err) = start.call(&mut store, &[], &mut []) {
                match err.downcast_ref::<ProcExit>() {
                    Some(exit) if exit.code == 0 => {}
                    Some(exit) => {
                        return Err(ModuleError::Instantiate(format!(
                            "start function exited with status {}",
                            exit.code
                        )))
                    }
                    None => return Err(ModuleError::Instantiate(err.to_string())),
                }
            }
            debug!("start function completed");
        }

        Ok((store, instance))
    }

    /// Terminal transition; every later operation except `close` fails.
    pub fn close(&mut self) -> ModuleResult<()> {
        self.state = EngineState::Closed;
        Ok(())
    }

    fn ensure(&self, want: EngineState) -> ModuleResult<()> {
        if self.state == want {
            Ok(())
        } else {
            Err(ModuleError::EngineState(self.state.name()))
        }
    }
}
