//! Boundary codec
//!
//! Structured values cross into guest memory as JSON; strings travel the
//! same way minus the parser. Writing always goes through the guest's own
//! allocator, and an allocation whose write fails is released before the
//! error surfaces.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use wasmtime::{AsContext, Func, Memory, Store};

use crate::memory::{self, GuestSlice};
use crate::runtime::StoreData;
use crate::types::{ModuleError, ModuleMetrics, ModuleResult};

/// Serialize `value` to JSON and place it in guest memory.
pub(crate) fn marshal<T: Serialize>(
    store: &mut Store<StoreData>,
    memory: Memory,
    malloc: Func,
    free: Func,
    metrics: &ModuleMetrics,
    cancel: &CancellationToken,
    value: &T,
) -> ModuleResult<GuestSlice> {
    let bytes = serde_json::to_vec(value).map_err(|e| ModuleError::Marshal(e.to_string()))?;
    write_payload(store, memory, malloc, free, metrics, cancel, &bytes)
}

/// Place a string's bytes in guest memory verbatim.
pub(crate) fn write_string(
    store: &mut Store<StoreData>,
    memory: Memory,
    malloc: Func,
    free: Func,
    metrics: &ModuleMetrics,
    cancel: &CancellationToken,
    value: &str,
) -> ModuleResult<GuestSlice> {
    write_payload(store, memory, malloc, free, metrics, cancel, value.as_bytes())
}

fn write_payload(
    store: &mut Store<StoreData>,
    memory: Memory,
    malloc: Func,
    free: Func,
    metrics: &ModuleMetrics,
    cancel: &CancellationToken,
    bytes: &[u8],
) -> ModuleResult<GuestSlice> {
    if cancel.is_cancelled() {
        return Err(ModuleError::Cancelled);
    }
    let ptr = memory::guest_malloc(store, malloc, metrics, bytes.len() as u64)?;
    if let Err(err) = memory::write_bytes(&mut *store, memory, ptr, bytes) {
        memory::guest_free(store, free, metrics, ptr);
        return Err(err);
    }
    Ok(GuestSlice::new(ptr, bytes.len() as u32))
}

/// Decode the JSON region described by a guest-returned packed pointer.
pub(crate) fn unmarshal<T: DeserializeOwned>(
    store: impl AsContext<Data = StoreData>,
    memory: Memory,
    packed: u64,
) -> ModuleResult<T> {
    let bytes = memory::read_bytes(store, memory, GuestSlice::unpack(packed))?;
    serde_json::from_slice(&bytes).map_err(|e| ModuleError::Unmarshal(e.to_string()))
}

/// Read the UTF-8 region described by a guest-returned packed pointer.
pub(crate) fn read_string(
    store: impl AsContext<Data = StoreData>,
    memory: Memory,
    packed: u64,
) -> ModuleResult<String> {
    let bytes = memory::read_bytes(store, memory, GuestSlice::unpack(packed))?;
    Ok(String::from_utf8(bytes)?)
}
