//! WASI snapshot-preview1 shim
//!
//! The imports guests built against WASI expect, wired by hand over the
//! store state so the filesystem they see is the per-call tree attached by
//! `analyze` and nothing else. Stdout goes to the host's stdout, the
//! environment is empty, clocks and randomness are real.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use wasmtime::{Caller, Linker};

use crate::host::caller_memory;
use crate::runtime::StoreData;
use crate::types::{ModuleError, ModuleResult};
use crate::vfs::MemFs;

const WASI: &str = "wasi_snapshot_preview1";

/// File descriptor of the single preopened directory (`/`).
const PREOPEN_FD: u32 = 3;
const FIRST_DYNAMIC_FD: u32 = 4;

const FILETYPE_CHARACTER_DEVICE: u8 = 2;
const FILETYPE_DIRECTORY: u8 = 3;
const FILETYPE_REGULAR_FILE: u8 = 4;

mod errno {
    pub const SUCCESS: i32 = 0;
    pub const BADF: i32 = 8;
    pub const FAULT: i32 = 21;
    pub const INVAL: i32 = 28;
    pub const IO: i32 = 29;
    pub const NOENT: i32 = 44;
    pub const NOTSUP: i32 = 58;
}

/// Raised by the `proc_exit` import; an exit status of zero from a start
/// function is a normal return.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProcExit {
    pub code: i32,
}

impl fmt::Display for ProcExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc_exit({})", self.code)
    }
}

impl std::error::Error for ProcExit {}

struct OpenFile {
    filetype: u8,
    data: Arc<Vec<u8>>,
    pos: u64,
}

/// Per-store WASI state: the attached filesystem, open descriptors onto it,
/// and the stdout destination.
pub(crate) struct WasiState {
    fs: MemFs,
    fds: HashMap<u32, OpenFile>,
    next_fd: u32,
    stdout: Box<dyn Write + Send>,
}

impl WasiState {
    /// Starts with an empty tree, so guests probing the filesystem during
    /// their start function see a valid, vacant preopen.
    pub fn new(stdout: Box<dyn Write + Send>) -> Self {
        Self {
            fs: MemFs::new(),
            fds: HashMap::new(),
            next_fd: FIRST_DYNAMIC_FD,
            stdout,
        }
    }

    /// Attach a filesystem for the duration of one guest call.
    pub fn attach(&mut self, fs: MemFs) {
        self.fs = fs;
    }

    /// Swap the per-call filesystem back out for an empty one; descriptors
    /// opened onto it die with it.
    pub fn detach(&mut self) {
        self.fs = MemFs::new();
        self.fds.clear();
        self.next_fd = FIRST_DYNAMIC_FD;
    }
}

/// Register every `wasi_snapshot_preview1` import on the linker.
pub(crate) fn install(linker: &mut Linker<StoreData>) -> ModuleResult<()> {
    install_inner(linker).map_err(|e| ModuleError::WasiInit(e.to_string()))
}

fn install_inner(linker: &mut Linker<StoreData>) -> wasmtime::Result<()> {
    linker.func_wrap(WASI, "args_get", |_: Caller<'_, StoreData>, _argv: u32, _buf: u32| -> i32 {
        errno::SUCCESS
    })?;
    linker.func_wrap(
        WASI,
        "args_sizes_get",
        |mut caller: Caller<'_, StoreData>, argc: u32, buf_size: u32| -> i32 {
            zero_counts(&mut caller, argc, buf_size)
        },
    )?;
    linker.func_wrap(WASI, "environ_get", |_: Caller<'_, StoreData>, _env: u32, _buf: u32| -> i32 {
        errno::SUCCESS
    })?;
    linker.func_wrap(
        WASI,
        "environ_sizes_get",
        |mut caller: Caller<'_, StoreData>, count: u32, buf_size: u32| -> i32 {
            zero_counts(&mut caller, count, buf_size)
        },
    )?;

    linker.func_wrap(
        WASI,
        "clock_res_get",
        |mut caller: Caller<'_, StoreData>, _id: u32, out: u32| -> i32 {
            let Some(memory) = caller_memory(&mut caller) else {
                return errno::FAULT;
            };
            let (data, _) = memory.data_and_store_mut(&mut caller);
            match put_u64(data, out, 1) {
                Some(()) => errno::SUCCESS,
                None => errno::FAULT,
            }
        },
    )?;
    linker.func_wrap(
        WASI,
        "clock_time_get",
        |mut caller: Caller<'_, StoreData>, _id: u32, _precision: u64, out: u32| -> i32 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;
            let Some(memory) = caller_memory(&mut caller) else {
                return errno::FAULT;
            };
            let (data, _) = memory.data_and_store_mut(&mut caller);
            match put_u64(data, out, now) {
                Some(()) => errno::SUCCESS,
                None => errno::FAULT,
            }
        },
    )?;

    linker.func_wrap(
        WASI,
        "random_get",
        |mut caller: Caller<'_, StoreData>, buf: u32, len: u32| -> i32 {
            let Some(memory) = caller_memory(&mut caller) else {
                return errno::FAULT;
            };
            let (data, _) = memory.data_and_store_mut(&mut caller);
            let start = buf as usize;
            match data.get_mut(start..start + len as usize) {
                Some(dst) => {
                    rand::thread_rng().fill_bytes(dst);
                    errno::SUCCESS
                }
                None => errno::FAULT,
            }
        },
    )?;

    linker.func_wrap(WASI, "sched_yield", |_: Caller<'_, StoreData>| -> i32 {
        errno::SUCCESS
    })?;

    linker.func_wrap(
        WASI,
        "proc_exit",
        |_: Caller<'_, StoreData>, code: u32| -> Result<(), wasmtime::Error> {
            Err(wasmtime::Error::new(ProcExit { code: code as i32 }))
        },
    )?;

    linker.func_wrap(
        WASI,
        "fd_write",
        |mut caller: Caller<'_, StoreData>, fd: u32, iovs: u32, iovs_len: u32, nwritten: u32| -> i32 {
            if fd != 1 && fd != 2 {
                return errno::BADF;
            }
            let Some(memory) = caller_memory(&mut caller) else {
                return errno::FAULT;
            };
            let (data, state) = memory.data_and_store_mut(&mut caller);

            let mut written = 0u32;
            for i in 0..iovs_len {
                let base = iovs + 8 * i;
                let (Some(ptr), Some(len)) = (get_u32(data, base), get_u32(data, base + 4)) else {
                    return errno::FAULT;
                };
                let start = ptr as usize;
                let Some(bytes) = data.get(start..start + len as usize) else {
                    return errno::FAULT;
                };
                // Stdout is forwarded; stderr is accepted and discarded.
                if fd == 1 && state.wasi.stdout.write_all(bytes).is_err() {
                    return errno::IO;
                }
                written += len;
            }
            if fd == 1 {
                let _ = state.wasi.stdout.flush();
            }
            match put_u32(data, nwritten, written) {
                Some(()) => errno::SUCCESS,
                None => errno::FAULT,
            }
        },
    )?;

    linker.func_wrap(
        WASI,
        "fd_read",
        |mut caller: Caller<'_, StoreData>, fd: u32, iovs: u32, iovs_len: u32, nread: u32| -> i32 {
            let Some(memory) = caller_memory(&mut caller) else {
                return errno::FAULT;
            };
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let Some(file) = state.wasi.fds.get_mut(&fd) else {
                return errno::BADF;
            };

            let mut total = 0u32;
            for i in 0..iovs_len {
                let base = iovs + 8 * i;
                let (Some(ptr), Some(len)) = (get_u32(data, base), get_u32(data, base + 4)) else {
                    return errno::FAULT;
                };
                let remaining = (file.data.len() as u64).saturating_sub(file.pos);
                let n = u64::from(len).min(remaining) as usize;
                if n == 0 {
                    continue;
                }
                let start = ptr as usize;
                let Some(dst) = data.get_mut(start..start + n) else {
                    return errno::FAULT;
                };
                let at = file.pos as usize;
                dst.copy_from_slice(&file.data[at..at + n]);
                file.pos += n as u64;
                total += n as u32;
            }
            match put_u32(data, nread, total) {
                Some(()) => errno::SUCCESS,
                None => errno::FAULT,
            }
        },
    )?;

    linker.func_wrap(
        WASI,
        "fd_seek",
        |mut caller: Caller<'_, StoreData>, fd: u32, offset: i64, whence: u32, out: u32| -> i32 {
            let Some(memory) = caller_memory(&mut caller) else {
                return errno::FAULT;
            };
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let Some(file) = state.wasi.fds.get_mut(&fd) else {
                return errno::BADF;
            };
            let len = file.data.len() as i64;
            let pos = match whence {
                0 => offset,
                1 => file.pos as i64 + offset,
                2 => len + offset,
                _ => return errno::INVAL,
            };
            if pos < 0 {
                return errno::INVAL;
            }
            file.pos = pos as u64;
            match put_u64(data, out, file.pos) {
                Some(()) => errno::SUCCESS,
                None => errno::FAULT,
            }
        },
    )?;

    linker.func_wrap(
        WASI,
        "fd_close",
        |mut caller: Caller<'_, StoreData>, fd: u32| -> i32 {
            if fd <= 2 {
                return errno::SUCCESS;
            }
            match caller.data_mut().wasi.fds.remove(&fd) {
                Some(_) => errno::SUCCESS,
                None => errno::BADF,
            }
        },
    )?;

    linker.func_wrap(
        WASI,
        "fd_fdstat_get",
        |mut caller: Caller<'_, StoreData>, fd: u32, out: u32| -> i32 {
            let Some(memory) = caller_memory(&mut caller) else {
                return errno::FAULT;
            };
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let filetype = if fd <= 2 {
                FILETYPE_CHARACTER_DEVICE
            } else if fd == PREOPEN_FD {
                FILETYPE_DIRECTORY
            } else {
                match state.wasi.fds.get(&fd) {
                    Some(file) => file.filetype,
                    None => return errno::BADF,
                }
            };
            let start = out as usize;
            let Some(buf) = data.get_mut(start..start + 24) else {
                return errno::FAULT;
            };
            buf.fill(0);
            buf[0] = filetype;
            buf[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
            buf[16..24].copy_from_slice(&u64::MAX.to_le_bytes());
            errno::SUCCESS
        },
    )?;

    linker.func_wrap(
        WASI,
        "fd_filestat_get",
        |mut caller: Caller<'_, StoreData>, fd: u32, out: u32| -> i32 {
            let Some(memory) = caller_memory(&mut caller) else {
                return errno::FAULT;
            };
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let (filetype, size) = if fd <= 2 {
                (FILETYPE_CHARACTER_DEVICE, 0)
            } else if fd == PREOPEN_FD {
                (FILETYPE_DIRECTORY, 0)
            } else {
                match state.wasi.fds.get(&fd) {
                    Some(file) => (file.filetype, file.data.len() as u64),
                    None => return errno::BADF,
                }
            };
            match put_filestat(data, out, filetype, size) {
                Some(()) => errno::SUCCESS,
                None => errno::FAULT,
            }
        },
    )?;

    linker.func_wrap(
        WASI,
        "fd_prestat_get",
        |mut caller: Caller<'_, StoreData>, fd: u32, out: u32| -> i32 {
            if fd != PREOPEN_FD {
                return errno::BADF;
            }
            let Some(memory) = caller_memory(&mut caller) else {
                return errno::FAULT;
            };
            let (data, _) = memory.data_and_store_mut(&mut caller);
            // prestat: tag 0 (dir) + name length of "/".
            let ok = put_u32(data, out, 0).and_then(|()| put_u32(data, out + 4, 1));
            match ok {
                Some(()) => errno::SUCCESS,
                None => errno::FAULT,
            }
        },
    )?;

    linker.func_wrap(
        WASI,
        "fd_prestat_dir_name",
        |mut caller: Caller<'_, StoreData>, fd: u32, path: u32, path_len: u32| -> i32 {
            if fd != PREOPEN_FD {
                return errno::BADF;
            }
            if path_len < 1 {
                return errno::INVAL;
            }
            let Some(memory) = caller_memory(&mut caller) else {
                return errno::FAULT;
            };
            let (data, _) = memory.data_and_store_mut(&mut caller);
            match data.get_mut(path as usize) {
                Some(byte) => {
                    *byte = b'/';
                    errno::SUCCESS
                }
                None => errno::FAULT,
            }
        },
    )?;

    linker.func_wrap(
        WASI,
        "path_open",
        |mut caller: Caller<'_, StoreData>,
         dirfd: u32,
         _dirflags: u32,
         path: u32,
         path_len: u32,
         _oflags: u32,
         _rights_base: u64,
         _rights_inheriting: u64,
         _fdflags: u32,
         fd_out: u32|
         -> i32 {
            if dirfd != PREOPEN_FD {
                return errno::BADF;
            }
            let Some(memory) = caller_memory(&mut caller) else {
                return errno::FAULT;
            };
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let fs = &mut state.wasi.fs;
            let start = path as usize;
            let Some(raw) = data.get(start..start + path_len as usize) else {
                return errno::FAULT;
            };
            let Some(path) = resolve_path(raw) else {
                return errno::INVAL;
            };

            let file = if fs.is_dir(&path) {
                OpenFile {
                    filetype: FILETYPE_DIRECTORY,
                    data: Arc::new(Vec::new()),
                    pos: 0,
                }
            } else {
                match fs.open(&path) {
                    Ok(bytes) => OpenFile {
                        filetype: FILETYPE_REGULAR_FILE,
                        data: bytes,
                        pos: 0,
                    },
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return errno::NOENT,
                    Err(_) => return errno::IO,
                }
            };

            let fd = state.wasi.next_fd;
            state.wasi.next_fd += 1;
            state.wasi.fds.insert(fd, file);
            match put_u32(data, fd_out, fd) {
                Some(()) => errno::SUCCESS,
                None => errno::FAULT,
            }
        },
    )?;

    linker.func_wrap(
        WASI,
        "path_filestat_get",
        |mut caller: Caller<'_, StoreData>,
         dirfd: u32,
         _flags: u32,
         path: u32,
         path_len: u32,
         out: u32|
         -> i32 {
            if dirfd != PREOPEN_FD {
                return errno::BADF;
            }
            let Some(memory) = caller_memory(&mut caller) else {
                return errno::FAULT;
            };
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let fs = &mut state.wasi.fs;
            let start = path as usize;
            let Some(raw) = data.get(start..start + path_len as usize) else {
                return errno::FAULT;
            };
            let Some(path) = resolve_path(raw) else {
                return errno::INVAL;
            };

            let (filetype, size) = if fs.is_dir(&path) {
                (FILETYPE_DIRECTORY, 0)
            } else {
                match fs.open(&path) {
                    Ok(bytes) => (FILETYPE_REGULAR_FILE, bytes.len() as u64),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return errno::NOENT,
                    Err(_) => return errno::IO,
                }
            };
            match put_filestat(data, out, filetype, size) {
                Some(()) => errno::SUCCESS,
                None => errno::FAULT,
            }
        },
    )?;

    linker.func_wrap(
        WASI,
        "fd_readdir",
        |_: Caller<'_, StoreData>, _fd: u32, _buf: u32, _len: u32, _cookie: u64, _out: u32| -> i32 {
            errno::NOTSUP
        },
    )?;
    linker.func_wrap(
        WASI,
        "poll_oneoff",
        |_: Caller<'_, StoreData>, _in: u32, _out: u32, _n: u32, _nevents: u32| -> i32 {
            errno::NOTSUP
        },
    )?;

    Ok(())
}

/// Write two zero u32 counters, the shape of `*_sizes_get` for an empty set.
fn zero_counts(caller: &mut Caller<'_, StoreData>, count: u32, buf_size: u32) -> i32 {
    let Some(memory) = caller_memory(caller) else {
        return errno::FAULT;
    };
    let (data, _) = memory.data_and_store_mut(caller);
    let ok = put_u32(data, count, 0).and_then(|()| put_u32(data, buf_size, 0));
    match ok {
        Some(()) => errno::SUCCESS,
        None => errno::FAULT,
    }
}

fn put_u32(data: &mut [u8], at: u32, value: u32) -> Option<()> {
    let at = at as usize;
    data.get_mut(at..at + 4)?.copy_from_slice(&value.to_le_bytes());
    Some(())
}

fn put_u64(data: &mut [u8], at: u32, value: u64) -> Option<()> {
    let at = at as usize;
    data.get_mut(at..at + 8)?.copy_from_slice(&value.to_le_bytes());
    Some(())
}

fn get_u32(data: &[u8], at: u32) -> Option<u32> {
    let at = at as usize;
    let bytes = data.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn put_filestat(data: &mut [u8], at: u32, filetype: u8, size: u64) -> Option<()> {
    let at = at as usize;
    let buf = data.get_mut(at..at + 64)?;
    buf.fill(0);
    buf[16] = filetype;
    buf[24..32].copy_from_slice(&1u64.to_le_bytes());
    buf[32..40].copy_from_slice(&size.to_le_bytes());
    Some(())
}

/// Interpret guest path bytes as an absolute path under the preopen root.
fn resolve_path(raw: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(raw).ok()?;
    let trimmed = text.trim_start_matches('/').trim_start_matches("./");
    Some(format!("/{trimmed}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_roots_input() {
        assert_eq!(resolve_path(b"a.txt").as_deref(), Some("/a.txt"));
        assert_eq!(resolve_path(b"/a.txt").as_deref(), Some("/a.txt"));
        assert_eq!(resolve_path(b"./a.txt").as_deref(), Some("/a.txt"));
        assert!(resolve_path(&[0xFF, 0xFE]).is_none());
    }

    #[test]
    fn put_helpers_bounds_check() {
        let mut data = vec![0u8; 8];
        assert!(put_u32(&mut data, 4, 7).is_some());
        assert_eq!(get_u32(&data, 4), Some(7));
        assert!(put_u32(&mut data, 6, 7).is_none());
        assert!(put_u64(&mut data, 4, 7).is_none());
        assert!(get_u32(&data, 8).is_none());
    }

    #[test]
    fn filestat_layout() {
        let mut data = vec![0u8; 128];
        put_filestat(&mut data, 32, FILETYPE_REGULAR_FILE, 42).unwrap();
        assert_eq!(data[32 + 16], FILETYPE_REGULAR_FILE);
        assert_eq!(&data[32 + 32..32 + 40], &42u64.to_le_bytes());
    }

    #[test]
    fn detach_drops_descriptors_and_empties_the_tree() {
        let mut state = WasiState::new(Box::new(std::io::sink()));
        let mut fs = MemFs::new();
        fs.write_lazy_file("/a.txt", Box::new(|| Ok(Vec::new()))).unwrap();
        state.attach(fs);
        state.fds.insert(
            FIRST_DYNAMIC_FD,
            OpenFile {
                filetype: FILETYPE_REGULAR_FILE,
                data: Arc::new(vec![1, 2, 3]),
                pos: 0,
            },
        );
        state.next_fd = FIRST_DYNAMIC_FD + 1;
        assert!(state.fs.is_file("/a.txt"));

        state.detach();
        assert!(!state.fs.is_file("/a.txt"));
        assert!(state.fds.is_empty());
        assert_eq!(state.next_fd, FIRST_DYNAMIC_FD);
    }
}
