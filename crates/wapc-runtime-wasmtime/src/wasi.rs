//! Minimal WASI preview-1 stub shim.
//!
//! waPC guests compiled against WASI expect these imports to exist, but the
//! runtime intentionally provides no system interface: only `fd_write` to
//! stdout/stderr (routed to the module's configured sinks) and
//! `clock_time_get` are functional. Everything else is a sentinel stub.
//!
//! The same function table is registered under all three namespaces guests
//! have historically linked against: `wasi_unstable`,
//! `wasi_snapshot_preview1`, and `wasi`.

use std::time::{SystemTime, UNIX_EPOCH};

use wasmtime::{Caller, Linker};

use wapc_runtime_common::WapcError;

use crate::linker::{guest_memory, read_bytes, write_bytes, GuestState};

/// The namespaces the shim is registered under. All three alias one table.
pub const WASI_NAMESPACES: [&str; 3] = ["wasi_unstable", "wasi_snapshot_preview1", "wasi"];

// WASI errno values used by the stubs.
const ERRNO_SUCCESS: i32 = 0;
const ERRNO_BADF: i32 = 8;
// Returned by path_open: no file will ever open here.
const ERRNO_INVAL: i32 = 28;

/// Register the WASI shim under every namespace in [`WASI_NAMESPACES`].
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_wasi(linker: &mut Linker<GuestState>) -> Result<(), WapcError> {
    for namespace in WASI_NAMESPACES {
        register_namespace(linker, namespace)?;
    }
    Ok(())
}

fn register_namespace(linker: &mut Linker<GuestState>, ns: &str) -> Result<(), WapcError> {
    linker
        .func_wrap(
            ns,
            "fd_write",
            |mut caller: Caller<'_, GuestState>,
             fd: i32,
             iovs_ptr: i32,
             iovs_len: i32,
             written_ptr: i32|
             -> Result<i32, wasmtime::Error> {
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);

                let writer = match fd {
                    1 => state.config().stdout_writer.clone(),
                    2 => state.config().stderr_writer.clone(),
                    _ => None,
                };
                let Some(writer) = writer else {
                    return Ok(0);
                };

                // Each iovec is a little-endian (base: u32, len: u32) pair.
                let mut written: u32 = 0;
                for index in 0..iovs_len as i64 {
                    let entry = read_bytes(data, state, iovs_ptr as i64 + index * 8, 8)?;
                    let base = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
                    let len = u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);

                    let chunk = read_bytes(data, state, base as i64, len as i64)?;
                    writer(&String::from_utf8_lossy(&chunk));
                    written = written.wrapping_add(len);
                }

                write_bytes(data, state, written_ptr as i64, &written.to_le_bytes())?;
                Ok(written as i32)
            },
        )
        .map_err(|e| define_error(ns, "fd_write", &e))?;

    linker
        .func_wrap(
            ns,
            "clock_time_get",
            |mut caller: Caller<'_, GuestState>,
             _clock_id: i32,
             _precision: i64,
             timestamp_ptr: i32|
             -> Result<i32, wasmtime::Error> {
                let memory = guest_memory(&mut caller)?;
                let (data, state) = memory.data_and_store_mut(&mut caller);

                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|elapsed| elapsed.as_nanos() as u64)
                    .unwrap_or(0);
                write_bytes(data, state, timestamp_ptr as i64, &nanos.to_le_bytes())?;
                Ok(ERRNO_SUCCESS)
            },
        )
        .map_err(|e| define_error(ns, "clock_time_get", &e))?;

    linker
        .func_wrap(
            ns,
            "args_sizes_get",
            |mut caller: Caller<'_, GuestState>,
             argc_ptr: i32,
             argv_buf_size_ptr: i32|
             -> Result<i32, wasmtime::Error> {
                write_zero_counts(&mut caller, argc_ptr, argv_buf_size_ptr)
            },
        )
        .map_err(|e| define_error(ns, "args_sizes_get", &e))?;

    linker
        .func_wrap(ns, "args_get", |_argv_ptr: i32, _argv_buf_ptr: i32| -> i32 {
            ERRNO_SUCCESS
        })
        .map_err(|e| define_error(ns, "args_get", &e))?;

    linker
        .func_wrap(
            ns,
            "environ_sizes_get",
            |mut caller: Caller<'_, GuestState>,
             environc_ptr: i32,
             environ_buf_size_ptr: i32|
             -> Result<i32, wasmtime::Error> {
                write_zero_counts(&mut caller, environc_ptr, environ_buf_size_ptr)
            },
        )
        .map_err(|e| define_error(ns, "environ_sizes_get", &e))?;

    linker
        .func_wrap(
            ns,
            "environ_get",
            |_environ_ptr: i32, _environ_buf_ptr: i32| -> i32 { ERRNO_SUCCESS },
        )
        .map_err(|e| define_error(ns, "environ_get", &e))?;

    linker
        .func_wrap(ns, "fd_close", |_fd: i32| -> i32 { ERRNO_BADF })
        .map_err(|e| define_error(ns, "fd_close", &e))?;

    linker
        .func_wrap(ns, "fd_fdstat_get", |_fd: i32, _stat_ptr: i32| -> i32 {
            ERRNO_BADF
        })
        .map_err(|e| define_error(ns, "fd_fdstat_get", &e))?;

    linker
        .func_wrap(ns, "fd_prestat_get", |_fd: i32, _prestat_ptr: i32| -> i32 {
            ERRNO_BADF
        })
        .map_err(|e| define_error(ns, "fd_prestat_get", &e))?;

    linker
        .func_wrap(
            ns,
            "fd_prestat_dir_name",
            |_fd: i32, _path_ptr: i32, _path_len: i32| -> i32 { ERRNO_BADF },
        )
        .map_err(|e| define_error(ns, "fd_prestat_dir_name", &e))?;

    linker
        .func_wrap(
            ns,
            "fd_read",
            |_fd: i32, _iovs_ptr: i32, _iovs_len: i32, _nread_ptr: i32| -> i32 { ERRNO_BADF },
        )
        .map_err(|e| define_error(ns, "fd_read", &e))?;

    linker
        .func_wrap(
            ns,
            "fd_seek",
            |_fd: i32, _offset: i64, _whence: i32, _newoffset_ptr: i32| -> i32 { ERRNO_BADF },
        )
        .map_err(|e| define_error(ns, "fd_seek", &e))?;

    linker
        .func_wrap(
            ns,
            "path_open",
            |_fd: i32,
             _dirflags: i32,
             _path_ptr: i32,
             _path_len: i32,
             _oflags: i32,
             _rights_base: i64,
             _rights_inheriting: i64,
             _fdflags: i32,
             _opened_fd_ptr: i32|
             -> i32 { ERRNO_INVAL },
        )
        .map_err(|e| define_error(ns, "path_open", &e))?;

    // The guest's lifetime is bounded by the host; exiting is a no-op.
    linker
        .func_wrap(ns, "proc_exit", |_code: i32| {})
        .map_err(|e| define_error(ns, "proc_exit", &e))?;

    Ok(())
}

/// Write zero u32s to both out-parameters: no arguments, no environment.
fn write_zero_counts(
    caller: &mut Caller<'_, GuestState>,
    count_ptr: i32,
    buf_size_ptr: i32,
) -> Result<i32, wasmtime::Error> {
    let memory = guest_memory(caller)?;
    let (data, state) = memory.data_and_store_mut(caller);
    write_bytes(data, state, count_ptr as i64, &0_u32.to_le_bytes())?;
    write_bytes(data, state, buf_size_ptr as i64, &0_u32.to_le_bytes())?;
    Ok(ERRNO_SUCCESS)
}

fn define_error(ns: &str, name: &str, err: &wasmtime::Error) -> WapcError {
    WapcError::engine(format!("cannot define function {ns}.{name}: {err}"))
}
