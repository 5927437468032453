//! Parallel primitives and indirect-call dispatch.
//!
//! Every function here dispatches on the active stream's backend. Work is
//! submitted with the engine lock held; blocking waits (event syncs, CPU
//! parallel sections) run with it released.

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::malloc::AllocType;
use crate::state;
use crate::types::{Backend, ReduceOp, VarType};

/// One callee bucket produced by [`vcall`]: the registered instance
/// pointer, the id of the derived index-view variable, and its length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VCallBucket {
    pub ptr: usize,
    pub index: u32,
    pub size: u32,
}

/// Fill a buffer with `count` copies of an element of `elem_size` bytes.
pub fn memset(ptr: usize, elem_size: usize, count: usize, value: u64) -> Result<()> {
    if !matches!(elem_size, 1 | 2 | 4 | 8) {
        return Err(Error::usage("memset element size must be 1, 2, 4 or 8"));
    }
    trace!(ptr, elem_size, count, "memset");
    if count == 0 {
        return Ok(());
    }
    let mut st = state::lock();
    match st.active_backend()? {
        Backend::Cuda => {
            let stream = st.active_cuda()?.unwrap();
            crate::cuda::memset_async(&mut st, &stream, ptr, elem_size, count, value)
        }
        Backend::Cpu => {
            drop(st);
            unsafe {
                match elem_size {
                    1 => std::slice::from_raw_parts_mut(ptr as *mut u8, count)
                        .fill(value as u8),
                    2 => std::slice::from_raw_parts_mut(ptr as *mut u16, count)
                        .fill(value as u16),
                    4 => std::slice::from_raw_parts_mut(ptr as *mut u32, count)
                        .fill(value as u32),
                    _ => std::slice::from_raw_parts_mut(ptr as *mut u64, count).fill(value),
                }
            }
            Ok(())
        }
    }
}

/// Synchronous copy between two buffers of the active backend.
pub fn memcpy(dst: usize, src: usize, bytes: usize) -> Result<()> {
    let st = state::lock();
    match st.active_backend()? {
        Backend::Cuda => {
            let stream = st.active_cuda()?.unwrap();
            drop(st);
            stream.synchronize()?;
            crate::cuda::memcpy_async(&stream, dst, src, bytes)?;
            stream.synchronize()?;
        }
        Backend::Cpu => {
            drop(st);
            unsafe {
                std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, bytes)
            };
        }
    }
    Ok(())
}

/// Stream-ordered copy between two buffers of the active backend.
pub fn memcpy_async(dst: usize, src: usize, bytes: usize) -> Result<()> {
    let st = state::lock();
    match st.active_backend()? {
        Backend::Cuda => {
            let stream = st.active_cuda()?.unwrap();
            crate::cuda::memcpy_async(&stream, dst, src, bytes)
        }
        Backend::Cpu => {
            drop(st);
            unsafe {
                std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, bytes)
            };
            Ok(())
        }
    }
}

/// Reduce `size` elements at `ptr` into the single element at `out`.
/// `out` must be host-visible on the CPU and device-visible on the
/// accelerator (device or pinned memory).
pub fn reduce(ty: VarType, op: ReduceOp, ptr: usize, size: u32, out: usize) -> Result<()> {
    debug!(ty = %ty, op = %op, size, "reduce");
    let mut st = state::lock();
    match st.active_backend()? {
        Backend::Cuda => crate::cuda::reduce(&mut st, ty, op, ptr, size, out),
        Backend::Cpu => {
            drop(st);
            crate::cpu::reduce(ty, op, ptr, size, out)
        }
    }
}

/// Boolean reduction over a `Bool` array: four bytes are folded per `u32`
/// lane, the tail padded with the identity, and the four lanes combined on
/// the host after the stream drains.
fn bool_reduce(op: ReduceOp, filler: u8, ptr: usize, size: u32) -> Result<bool> {
    if size == 0 {
        return Ok(filler != 0);
    }
    let reduced = size.div_ceil(4);
    let trailing = reduced * 4 - size;
    let mut st = state::lock();
    let lanes: [u8; 4] = match st.active_backend()? {
        Backend::Cpu => {
            drop(st);
            // u32-aligned scratch, tail lanes pre-filled with the identity.
            let mut scratch = vec![u32::from_ne_bytes([filler; 4]); reduced as usize];
            unsafe {
                std::ptr::copy_nonoverlapping(
                    ptr as *const u8,
                    scratch.as_mut_ptr() as *mut u8,
                    size as usize,
                );
            }
            let mut word = 0u32;
            crate::cpu::reduce(
                VarType::U32,
                op,
                scratch.as_ptr() as usize,
                reduced,
                &mut word as *mut u32 as usize,
            )?;
            word.to_ne_bytes()
        }
        Backend::Cuda => {
            let stream = st.active_cuda()?.unwrap();
            let scratch = st.malloc(AllocType::Device, reduced as usize * 4)?;
            let out = st.malloc(AllocType::HostPinned, 4)?;
            crate::cuda::memcpy_async(&stream, scratch, ptr, size as usize)?;
            if trailing > 0 {
                crate::cuda::memset_async(
                    &mut st,
                    &stream,
                    scratch + size as usize,
                    1,
                    trailing as usize,
                    filler as u64,
                )?;
            }
            crate::cuda::reduce(&mut st, VarType::U32, op, scratch, reduced, out)?;
            drop(st);
            stream.synchronize()?;
            let lanes = unsafe { *(out as *const [u8; 4]) };
            let mut st = state::lock();
            st.free_ptr(scratch)?;
            st.free_ptr(out)?;
            lanes
        }
    };
    Ok(match op {
        ReduceOp::And => lanes.iter().all(|b| *b != 0),
        _ => lanes.iter().any(|b| *b != 0),
    })
}

/// Do all elements of a `Bool` array hold true?
pub fn all(ptr: usize, size: u32) -> Result<bool> {
    bool_reduce(ReduceOp::And, 1, ptr, size)
}

/// Does any element of a `Bool` array hold true?
pub fn any(ptr: usize, size: u32) -> Result<bool> {
    bool_reduce(ReduceOp::Or, 0, ptr, size)
}

/// Exclusive prefix sum over `u32`; safe to run in place.
pub fn scan_u32(input: usize, output: usize, size: u32) -> Result<()> {
    debug!(size, "scan");
    let mut st = state::lock();
    match st.active_backend()? {
        Backend::Cuda => crate::cuda::scan_u32(&mut st, input, output, size),
        Backend::Cpu => {
            drop(st);
            crate::cpu::scan_u32(input, output, size);
            Ok(())
        }
    }
}

/// Stably partition indices by key. `keys[i]` must lie in
/// `[0, bucket_count)`; `perm` receives `size` indices. When `offsets` is
/// given it receives `{key, start, count, 0}` per non-empty bucket plus the
/// unique-bucket total at slot `4 * bucket_count`, and must be
/// host-visible (pinned on the accelerator). Returns the unique count.
pub fn mkperm(
    keys: usize,
    size: u32,
    bucket_count: u32,
    perm: usize,
    offsets: Option<usize>,
) -> Result<u32> {
    if bucket_count == 0 {
        return Err(Error::usage("mkperm(): bucket_count cannot be zero"));
    }
    if size == 0 {
        return Ok(0);
    }
    let mut st = state::lock();
    match st.active_backend()? {
        Backend::Cpu => {
            drop(st);
            Ok(crate::cpu::mkperm(keys, size, bucket_count, perm, offsets))
        }
        Backend::Cuda => {
            let fence = crate::cuda::mkperm(&mut st, keys, size, bucket_count, perm, offsets)?;
            drop(st);
            match (fence, offsets) {
                (Some(event), Some(offsets)) => {
                    event.synchronize()?;
                    let unique =
                        unsafe { *(offsets as *const u32).add(bucket_count as usize * 4) };
                    Ok(unique)
                }
                _ => Ok(0),
            }
        }
    }
}

/// Tiled matrix transpose over `u32` cells.
pub fn transpose_u32(input: usize, output: usize, rows: u32, cols: u32) -> Result<()> {
    let mut st = state::lock();
    match st.active_backend()? {
        Backend::Cuda => crate::cuda::transpose_u32(&mut st, input, output, rows, cols),
        Backend::Cpu => {
            drop(st);
            crate::cpu::transpose_u32(input, output, rows, cols);
            Ok(())
        }
    }
}

/// Group an array of callee ids into contiguous buckets.
///
/// Evaluates `index`, partitions its elements with [`mkperm`] over the
/// domain's id space, and returns one bucket per callee that occurs (id 0,
/// "no callee", is dropped). Each bucket carries a derived variable whose
/// data is the matching slice of the permutation. The result is cached on
/// the index variable, so repeated calls are free until it is destroyed.
pub fn vcall(domain: &str, index: u32) -> Result<Vec<VCallBucket>> {
    {
        let st = state::lock();
        if let Some(buckets) = st.vcall_cache.get(&index) {
            return Ok(buckets.clone());
        }
    }
    crate::var::var_eval(index)?;

    let mut st = state::lock();
    let backend = st.active_backend()?;
    let (keys, size) = {
        let v = st.var(index)?;
        if v.ty != VarType::U32 {
            return Err(Error::usage("vcall(): callee ids must have type u32"));
        }
        (v.data, v.size)
    };
    let bucket_count = st.registry.get(domain).map(|r| r.max_id()).unwrap_or(0) + 1;
    debug!(index, domain, bucket_count, "vcall");

    let (offsets_class, perm_class) = match backend {
        Backend::Cuda => (AllocType::HostPinned, AllocType::Device),
        Backend::Cpu => (AllocType::Host, AllocType::Host),
    };
    let offsets = st.malloc(offsets_class, (bucket_count as usize * 4 + 1) * 4)?;
    let perm = st.malloc(perm_class, size as usize * 4)?;

    let unique = match backend {
        Backend::Cpu => {
            drop(st);
            let unique = crate::cpu::mkperm(keys, size, bucket_count, perm, Some(offsets));
            st = state::lock();
            unique
        }
        Backend::Cuda => {
            let fence =
                crate::cuda::mkperm(&mut st, keys, size, bucket_count, perm, Some(offsets))?;
            drop(st);
            if let Some(event) = fence {
                event.synchronize()?;
            }
            st = state::lock();
            unsafe { *(offsets as *const u32).add(bucket_count as usize * 4) }
        }
    };

    // The permutation buffer is owned by its own variable; bucket views
    // borrow slices of it and keep it alive through operand edges.
    let perm_var = st.register_external(VarType::U32, perm, size, true)?;

    let mut buckets = Vec::new();
    for i in 0..unique as usize {
        let quad = unsafe { std::slice::from_raw_parts((offsets as *const u32).add(i * 4), 4) };
        let (key, start, count) = (quad[0], quad[1], quad[2]);
        if key == 0 {
            continue;
        }
        let view = st.register_perm_view(perm_var, perm + start as usize * 4, count)?;
        let ptr = crate::registry::get_ptr_locked(&st, domain, key);
        trace!(view, key, count, "vcall: bucket");
        buckets.push(VCallBucket { ptr, index: view, size: count });
    }

    st.free_ptr(offsets)?;
    // Ownership of the permutation now rests with the views (if any).
    st.var_dec_ref_ext(perm_var)?;

    st.var_mut(index)?.vcall_cached = true;
    st.vcall_cache.insert(index, buckets.clone());
    Ok(buckets)
}
