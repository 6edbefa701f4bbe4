//! ABI primitives
//!
//! Everything that crosses the guest boundary is a 32/64-bit integer, so
//! structured values travel as a packed `(pointer, size)` word plus bytes in
//! the guest's linear memory. This module owns the packing, the bounds-checked
//! memory accessors, and the host-driven `malloc`/`free` protocol.

use std::sync::atomic::Ordering;

use tracing::error;
use wasmtime::{AsContext, AsContextMut, Func, Memory, Store, Val, ValType};

use crate::runtime::StoreData;
use crate::types::{ModuleError, ModuleMetrics, ModuleResult};

/// A region of guest linear memory, packed into one 64-bit word on the wire:
/// high 32 bits are the offset, low 32 bits the byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestSlice {
    pub ptr: u32,
    pub len: u32,
}

impl GuestSlice {
    pub fn new(ptr: u32, len: u32) -> Self {
        Self { ptr, len }
    }

    pub fn pack(self) -> u64 {
        (u64::from(self.ptr) << 32) | u64::from(self.len)
    }

    pub fn unpack(raw: u64) -> Self {
        Self {
            ptr: (raw >> 32) as u32,
            len: raw as u32,
        }
    }

    pub fn is_empty(self) -> bool {
        self.len == 0
    }
}

/// Read exactly `slice.len` bytes from guest memory. Partial reads are not
/// a thing: out-of-range is logged and surfaces as the generic read error.
pub(crate) fn read_bytes(
    store: impl AsContext<Data = StoreData>,
    memory: Memory,
    slice: GuestSlice,
) -> ModuleResult<Vec<u8>> {
    let data = memory.data(&store);
    let start = slice.ptr as usize;
    match data.get(start..start + slice.len as usize) {
        Some(bytes) => Ok(bytes.to_vec()),
        None => {
            error!(
                offset = slice.ptr,
                size = slice.len,
                "memory read out of range"
            );
            Err(ModuleError::MemoryRead)
        }
    }
}

/// Write `bytes` at `offset` in guest memory.
pub(crate) fn write_bytes(
    mut store: impl AsContextMut<Data = StoreData>,
    memory: Memory,
    offset: u32,
    bytes: &[u8],
) -> ModuleResult<()> {
    let data = memory.data_mut(&mut store);
    let size = data.len();
    let start = offset as usize;
    match data.get_mut(start..start + bytes.len()) {
        Some(dst) => {
            dst.copy_from_slice(bytes);
            Ok(())
        }
        None => Err(ModuleError::MemoryWrite {
            offset,
            len: bytes.len() as u32,
            size,
        }),
    }
}

/// Allocate `size` bytes through the guest's exported allocator.
///
/// The returned pointer must be released with [`guest_free`]; callers must
/// not request zero bytes.
pub(crate) fn guest_malloc(
    store: &mut Store<StoreData>,
    malloc: Func,
    metrics: &ModuleMetrics,
    size: u64,
) -> ModuleResult<u32> {
    metrics.malloc_calls.fetch_add(1, Ordering::Relaxed);
    let ptr = invoke(store, malloc, "malloc", &[size])
        .map_err(|e| ModuleError::Malloc(e.to_string()))?;
    Ok(ptr as u32)
}

/// Release a guest allocation. Best-effort: this only runs on exit paths, so
/// a failing `free` is ignored.
pub(crate) fn guest_free(
    store: &mut Store<StoreData>,
    free: Func,
    metrics: &ModuleMetrics,
    ptr: u32,
) {
    metrics.free_calls.fetch_add(1, Ordering::Relaxed);
    let _ = call_raw(store, free, "free", &[u64::from(ptr)]);
}

/// Call a guest export expected to return exactly one value.
pub(crate) fn invoke(
    store: &mut Store<StoreData>,
    func: Func,
    name: &'static str,
    args: &[u64],
) -> ModuleResult<u64> {
    let results = call_raw(store, func, name, args)?;
    if results.len() != 1 {
        return Err(ModuleError::InvalidSignature(name));
    }
    Ok(results[0])
}

/// Call a guest export with raw 64-bit arguments.
///
/// Arguments are shaped to the export's declared parameter types (i32
/// parameters take the low half, as TinyGo-built allocators declare) and
/// results are zero-extended back to u64, so i32- and i64-typed guests both
/// speak the same numeric ABI.
pub(crate) fn call_raw(
    store: &mut Store<StoreData>,
    func: Func,
    name: &'static str,
    args: &[u64],
) -> ModuleResult<Vec<u64>> {
    let ty = func.ty(&*store);
    let params: Vec<ValType> = ty.params().collect();
    if params.len() != args.len() {
        return Err(ModuleError::InvalidSignature(name));
    }

    let mut vals = Vec::with_capacity(params.len());
    for (raw, param) in args.iter().zip(params.iter()) {
        let val = match param {
            ValType::I32 => Val::I32(*raw as u32 as i32),
            ValType::I64 => Val::I64(*raw as i64),
            _ => return Err(ModuleError::InvalidSignature(name)),
        };
        vals.push(val);
    }

    let mut results = vec![Val::I32(0); ty.results().len()];
    func.call(&mut *store, &vals, &mut results)
        .map_err(|e| ModuleError::GuestCall {
            name,
            message: e.to_string(),
        })?;

    results
        .iter()
        .map(|val| match val {
            Val::I32(v) => Ok(*v as u32 as u64),
            Val::I64(v) => Ok(*v as u64),
            _ => Err(ModuleError::InvalidSignature(name)),
        })
        .collect()
}
