//! flint: a tracing just-in-time compiler for 1-D array programs.
//!
//! Client code appends typed statements over large arrays instead of
//! executing them eagerly. The engine records them in a dataflow table,
//! folds structurally equivalent pending operations, and materializes
//! results lazily: at evaluation time the pending closure is fused into
//! kernels, compiled per backend (NVRTC on the accelerator, a register
//! program on the CPU worker pool), cached by generated source, and
//! launched against buffers from a pooled allocator whose reuse is gated
//! on stream progress.
//!
//! ```no_run
//! use flint::VarType;
//!
//! flint::init(true, false).unwrap();
//! flint::device_set(-1, 0).unwrap();
//!
//! let x = flint::index(VarType::U32, 10).unwrap();
//! let one = flint::literal(VarType::U32, "1").unwrap();
//! let y = flint::trace_append(VarType::U32, "$r0 = $r1 + $r2", &[x, one]).unwrap();
//!
//! let mut value = [0u8; 4];
//! flint::read(y, 9, &mut value).unwrap();
//! assert_eq!(u32::from_le_bytes(value), 10);
//!
//! for id in [x, one, y] {
//!     flint::dec_ref_ext(id).unwrap();
//! }
//! flint::shutdown(false);
//! ```

use tracing::{info, warn};

mod cpu;
mod cuda;
mod error;
mod eval;
pub mod malloc;
pub mod registry;
mod state;
mod stmt;
mod types;
mod util;
mod var;

pub use error::{Error, Result};
pub use eval::eval;
pub use malloc::AllocType;
pub use types::{Backend, ReduceOp, VarType};
pub use util::{
    VCallBucket, all, any, memcpy, memcpy_async, memset, mkperm, reduce, scan_u32, transpose_u32,
    vcall,
};
pub use var::{
    copy_to_backend, dec_ref_ext, dec_ref_int, inc_ref_ext, inc_ref_int, index, literal,
    mark_dirty, mark_side_effect, migrate, placeholder, read, register_external, register_ptr,
    schedule, set_label, set_size, trace_append, trace_append_unique, var_eval, var_label,
    var_ptr, var_refs, var_size, var_ty, whos, write,
};

/// Initialize the engine. Calls are additive and idempotent: enabling a
/// backend that is already up does nothing; a later call may enable the
/// other backend.
pub fn init(enable_cpu: bool, enable_cuda: bool) -> Result<()> {
    let mut st = state::lock();
    if enable_cpu && !st.has_cpu {
        // The worker pool itself is created lazily on first use.
        st.has_cpu = true;
        info!("init: cpu backend enabled");
    }
    if enable_cuda && !st.has_cuda {
        cuda::init(&mut st);
    }
    if !st.has_cpu && !st.has_cuda {
        return Err(Error::Usage("no backend could be enabled".to_string()));
    }
    st.variables.reserve(512);
    st.cse_cache.reserve(512);
    st.kernel_cache.reserve(128);
    Ok(())
}

/// Tear the engine down: drain streams, release caches and pools, report
/// reference leaks. With `light` the probed driver library stays loaded
/// for a cheap re-initialization.
pub fn shutdown(light: bool) {
    info!("shutdown: starting");
    let mut st = state::lock();

    // Drain every stream and recycle the release chains behind them.
    for stream in st.streams.values() {
        if let Some(cuda) = &stream.cuda {
            let _ = cuda.stream.synchronize();
        }
    }
    let _ = st.malloc_flush_all(true);

    // Engine-held references: cached vcall layouts and unevaluated side
    // effects would otherwise show up as leaks below.
    let cached: Vec<(u32, Vec<util::VCallBucket>)> = st.vcall_cache.drain().collect();
    for (index, buckets) in cached {
        if let Ok(v) = st.var_mut(index) {
            v.vcall_cached = false;
        }
        for bucket in buckets {
            let _ = st.var_dec_ref_ext(bucket.index);
        }
    }
    let pending: Vec<u32> = st
        .streams
        .values_mut()
        .flat_map(|s| s.side_effects.drain(..))
        .collect();
    for id in pending {
        let held = match st.var_mut(id) {
            Ok(v) if v.side_effect => {
                v.side_effect = false;
                true
            }
            _ => false,
        };
        if held {
            let _ = st.var_dec_ref_ext(id);
        }
    }

    let n_leaked = st.variables.len();
    if n_leaked > 0 {
        warn!("shutdown: detected variable leaks:");
        let mut ids: Vec<u32> = st.variables.keys().copied().collect();
        ids.sort_unstable();
        for (n, id) in ids.iter().enumerate() {
            if n == 10 {
                warn!(" - (skipping remainder)");
                break;
            }
            let v = &st.variables[id];
            warn!(
                " - variable {id} is still referenced (internal={}, external={})",
                v.ref_count_int, v.ref_count_ext
            );
        }
        warn!("shutdown: {n_leaked} variables are still referenced");
    }

    // With an empty table, surviving cache entries mean the engine's own
    // bookkeeping went wrong. That is not recoverable.
    if n_leaked == 0 && !st.cse_cache.is_empty() {
        panic!("shutdown: common-subexpression cache leak");
    }
    if n_leaked == 0 && !st.var_from_ptr.is_empty() {
        panic!("shutdown: pointer-literal cache leak");
    }

    // Best-effort reclamation of leaked buffers.
    let leaked: Vec<usize> = st
        .variables
        .values()
        .filter(|v| v.is_data() && !v.retain_data)
        .map(|v| v.data)
        .collect();
    st.variables.clear();
    st.cse_cache.clear();
    st.var_from_ptr.clear();
    for data in leaked {
        let _ = st.free_ptr(data);
    }

    st.kernel_cache.clear();
    st.builtin_modules.clear();
    st.registry.clear();
    st.malloc_shutdown();
    st.streams.clear();
    state::set_active_stream(None);
    st.devices.clear();
    st.has_cpu = false;
    st.has_cuda = false;
    if !light {
        st.cuda_lib = None;
    }
    info!("shutdown: done");
}

/// Select the calling thread's target: device `-1` is the CPU task
/// runtime, ids `>= 0` name accelerator devices. Streams are created on
/// first use per (device, index) pair.
pub fn device_set(device: i32, stream: u32) -> Result<()> {
    let mut st = state::lock();
    if device < 0 {
        if !st.has_cpu {
            return Err(Error::Usage("the cpu backend is not initialized".to_string()));
        }
    } else {
        if !st.has_cuda {
            return Err(Error::Usage(
                "the accelerator backend is not initialized".to_string(),
            ));
        }
        st.device(device)?;
    }
    let key = (device, stream);
    if !st.streams.contains_key(&key) {
        let cuda = if device >= 0 {
            let ctx = std::sync::Arc::clone(&st.device(device)?.ctx);
            Some(cuda::create_stream(&ctx)?)
        } else {
            None
        };
        st.streams.insert(
            key,
            state::Stream {
                device,
                index: stream,
                cuda,
                scheduled: Vec::new(),
                side_effects: Vec::new(),
                release_chain: Vec::new(),
                pending_release: std::collections::VecDeque::new(),
            },
        );
        tracing::trace!(device, stream, "device_set: creating stream");
    }
    state::set_active_stream(Some(key));
    Ok(())
}

/// Clear the calling thread's active stream.
pub fn device_unset() {
    state::set_active_stream(None);
}

/// Wait until the active stream has drained, then recycle its release
/// chain. The engine lock is released for the wait.
pub fn sync_stream() -> Result<()> {
    let st = state::lock();
    let Ok(stream) = st.active_ref() else {
        return Ok(());
    };
    let handle = stream.cuda.as_ref().map(|c| std::sync::Arc::clone(&c.stream));
    drop(st);
    if let Some(handle) = handle {
        handle.synchronize()?;
    }
    let mut st = state::lock();
    st.free_flush()
}

/// Wait until every stream of the active device has drained.
pub fn sync_device() -> Result<()> {
    let st = state::lock();
    let Ok(active) = st.active_ref() else {
        return Ok(());
    };
    let device = active.device;
    let handles: Vec<_> = st
        .streams
        .values()
        .filter(|s| s.device == device)
        .filter_map(|s| s.cuda.as_ref().map(|c| std::sync::Arc::clone(&c.stream)))
        .collect();
    drop(st);
    for handle in handles {
        handle.synchronize()?;
    }
    let mut st = state::lock();
    st.malloc_flush_all(false)
}

/// Allocate from the pool.
pub fn alloc(ty: AllocType, size: usize) -> Result<usize> {
    state::lock().malloc(ty, size)
}

/// Return a pool allocation; reuse is gated on the active stream.
pub fn free(ptr: usize) -> Result<()> {
    state::lock().free_ptr(ptr)
}

/// Copy an allocation into a different class. No-op for the same class.
pub fn migrate_alloc(ptr: usize, ty: AllocType) -> Result<usize> {
    state::lock().migrate_ptr(ptr, ty)
}

/// Fence and recycle the active stream's release chain.
pub fn malloc_flush() -> Result<()> {
    state::lock().free_flush()
}

/// Release all pooled memory back to the provider.
pub fn malloc_trim() {
    state::lock().malloc_trim()
}
