//! Accelerator backend.
//!
//! Devices are only touched after the driver library has been probed on
//! disk, so engines on machines without one quietly fall back to the CPU.
//! Kernel source is compiled with NVRTC and loaded as a per-context module;
//! the builtin suite (scan, mkperm, transpose) compiles once per device,
//! typed reductions are generated on demand and live in the regular kernel
//! cache keyed by their source.

use std::path::PathBuf;
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaFunction, CudaModule, CudaStream, LaunchConfig, PushKernelArg, sys};
use cudarc::nvrtc::{CompileOptions, compile_ptx_with_opts};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::state::State;
use crate::types::{ReduceOp, VarType};

pub(crate) const KERNELS_CU: &str = include_str!("kernels.cu");

/// Ordering primitive recorded on a stream.
pub(crate) struct Event {
    raw: sys::CUevent,
    ctx: Arc<CudaContext>,
}

// CUDA handles may be used from any thread with the owning context bound.
unsafe impl Send for Event {}

impl Event {
    pub fn new(stream: &Arc<CudaStream>) -> Result<Self> {
        let ctx = stream.context();
        ctx.bind_to_thread()?;
        let mut raw: sys::CUevent = std::ptr::null_mut();
        unsafe {
            sys::cuEventCreate(&mut raw, sys::CUevent_flags::CU_EVENT_DISABLE_TIMING as u32)
                .result()?
        };
        Ok(Event { raw, ctx: Arc::clone(ctx) })
    }

    pub fn record(&self, stream: &Arc<CudaStream>) -> Result<()> {
        self.ctx.bind_to_thread()?;
        unsafe { sys::cuEventRecord(self.raw, stream.cu_stream()).result()? };
        Ok(())
    }

    /// Has the stream passed the recorded point?
    pub fn query(&self) -> Result<bool> {
        self.ctx.bind_to_thread()?;
        match unsafe { sys::cuEventQuery(self.raw) } {
            sys::CUresult::CUDA_SUCCESS => Ok(true),
            sys::CUresult::CUDA_ERROR_NOT_READY => Ok(false),
            err => Err(err.result().unwrap_err().into()),
        }
    }

    pub fn synchronize(&self) -> Result<()> {
        self.ctx.bind_to_thread()?;
        unsafe { sys::cuEventSynchronize(self.raw).result()? };
        Ok(())
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        let _ = self.ctx.bind_to_thread();
        unsafe {
            let _ = sys::cuEventDestroy_v2(self.raw);
        }
    }
}

// ---------------------------------------------------------------------------
// Driver discovery & device enumeration
// ---------------------------------------------------------------------------

/// Locate and load the driver library without letting the driver bindings
/// abort on machines that lack one. An environment override wins; otherwise
/// standard directories are scanned, preferring non-symlinks and picking
/// the lexicographically greatest candidate.
pub(crate) fn probe_driver() -> Option<libloading::Library> {
    if let Ok(path) = std::env::var("FLINT_LIBCUDA_PATH")
        && !path.is_empty()
    {
        return match unsafe { libloading::Library::new(&path) } {
            Ok(lib) => Some(lib),
            Err(e) => {
                warn!("FLINT_LIBCUDA_PATH={path} could not be loaded: {e}");
                None
            }
        };
    }

    let dirs = [
        "/usr/lib/x86_64-linux-gnu",
        "/usr/lib/aarch64-linux-gnu",
        "/usr/lib64",
        "/usr/lib",
        "/usr/local/cuda/lib64",
        "/opt/cuda/lib64",
    ];
    let mut candidates: Vec<(bool, PathBuf)> = Vec::new();
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else { continue };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("libcuda.so") {
                let symlink = entry
                    .file_type()
                    .map(|t| t.is_symlink())
                    .unwrap_or(true);
                candidates.push((symlink, entry.path()));
            }
        }
    }
    // Non-symlinks first, then lexicographically greatest.
    candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
    for (_, path) in candidates {
        if let Ok(lib) = unsafe { libloading::Library::new(&path) } {
            debug!("probe_driver: using {}", path.display());
            return Some(lib);
        }
    }
    unsafe { libloading::Library::new("libcuda.so.1") }.ok()
}

/// Enumerate usable devices. Quietly does nothing when no driver is found.
pub(crate) fn init(st: &mut State) {
    if st.cuda_lib.is_none() {
        match probe_driver() {
            Some(lib) => st.cuda_lib = Some(lib),
            None => {
                info!("init: no accelerator driver found");
                return;
            }
        }
    }
    for i in 0..64usize {
        let Ok(ctx) = CudaContext::new(i) else { break };
        let sm_count = ctx
            .attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)
            .unwrap_or(1) as u32;
        let shared_mem_bytes = ctx
            .attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK)
            .unwrap_or(48 * 1024) as u32;
        info!(
            "init: found device {i} ({sm_count} SMs, {} KiB shared)",
            shared_mem_bytes / 1024
        );
        st.devices.push(crate::state::Device {
            id: i as i32,
            ctx,
            sm_count,
            shared_mem_bytes,
        });
    }
    st.has_cuda = !st.devices.is_empty();
}

pub(crate) fn create_stream(ctx: &Arc<CudaContext>) -> Result<crate::state::CudaStreamState> {
    ctx.bind_to_thread()?;
    let stream = ctx.new_stream()?;
    Ok(crate::state::CudaStreamState { stream })
}

// ---------------------------------------------------------------------------
// Compilation & launch
// ---------------------------------------------------------------------------

pub(crate) fn compile_module(stream: &Arc<CudaStream>, source: &str) -> Result<Arc<CudaModule>> {
    let ptx = compile_ptx_with_opts(
        source,
        CompileOptions { arch: Some("sm_70"), ..Default::default() },
    )
    .map_err(|e| Error::backend(format!("nvrtc: {e:?}")))?;
    Ok(stream.context().load_module(ptx)?)
}

pub(crate) fn compile(
    stream: &Arc<CudaStream>,
    source: &str,
    entry: &str,
) -> Result<(Arc<CudaModule>, CudaFunction)> {
    let module = compile_module(stream, source)?;
    let func = module.load_function(entry)?;
    Ok((module, func))
}

/// Launch a fused kernel: element count followed by uniform 64-bit params.
pub(crate) fn launch_fused(
    stream: &Arc<CudaStream>,
    func: &CudaFunction,
    blocks: u32,
    threads: u32,
    size: u32,
    params: &[u64],
) -> Result<()> {
    stream.context().bind_to_thread()?;
    let mut builder = stream.launch_builder(func);
    builder.arg(&size);
    for p in params {
        builder.arg(p);
    }
    unsafe {
        builder.launch(LaunchConfig {
            grid_dim: (blocks, 1, 1),
            block_dim: (threads, 1, 1),
            shared_mem_bytes: 0,
        })?
    };
    Ok(())
}

fn cfg(blocks: u32, threads: u32, shared: u32) -> LaunchConfig {
    LaunchConfig {
        grid_dim: (blocks, 1, 1),
        block_dim: (threads, 1, 1),
        shared_mem_bytes: shared,
    }
}

fn builtin(st: &mut State, name: &str) -> Result<CudaFunction> {
    let device = st.active_ref()?.device;
    if !st.builtin_modules.contains_key(&device) {
        let stream = st
            .active_cuda()?
            .ok_or_else(|| Error::usage("builtin kernels require an accelerator stream"))?;
        let module = compile_module(&stream, KERNELS_CU)?;
        st.builtin_modules.insert(device, module);
    }
    Ok(st.builtin_modules[&device].load_function(name)?)
}

// ---------------------------------------------------------------------------
// Raw copies & fills (through the driver, so interior pointers are fine)
// ---------------------------------------------------------------------------

/// Blocking device-to-host transfer.
pub(crate) fn copy_from_device(stream: &Arc<CudaStream>, src: usize, dst: &mut [u8]) -> Result<()> {
    stream.context().bind_to_thread()?;
    stream.synchronize()?;
    unsafe {
        sys::cuMemcpyDtoH_v2(
            dst.as_mut_ptr() as *mut std::ffi::c_void,
            src as sys::CUdeviceptr,
            dst.len(),
        )
        .result()?
    };
    Ok(())
}

/// Blocking host-to-device transfer.
pub(crate) fn copy_to_device(stream: &Arc<CudaStream>, dst: usize, src: &[u8]) -> Result<()> {
    stream.context().bind_to_thread()?;
    stream.synchronize()?;
    unsafe {
        sys::cuMemcpyHtoD_v2(
            dst as sys::CUdeviceptr,
            src.as_ptr() as *const std::ffi::c_void,
            src.len(),
        )
        .result()?
    };
    Ok(())
}

/// Stream-ordered copy between any two unified addresses.
pub(crate) fn memcpy_async(
    stream: &Arc<CudaStream>,
    dst: usize,
    src: usize,
    bytes: usize,
) -> Result<()> {
    stream.context().bind_to_thread()?;
    unsafe {
        sys::cuMemcpyAsync(
            dst as sys::CUdeviceptr,
            src as sys::CUdeviceptr,
            bytes,
            stream.cu_stream(),
        )
        .result()?
    };
    Ok(())
}

pub(crate) fn memset_async(
    st: &mut State,
    stream: &Arc<CudaStream>,
    ptr: usize,
    elem_size: usize,
    count: usize,
    value: u64,
) -> Result<()> {
    stream.context().bind_to_thread()?;
    unsafe {
        match elem_size {
            1 => sys::cuMemsetD8Async(ptr as sys::CUdeviceptr, value as u8, count, stream.cu_stream())
                .result()?,
            2 => sys::cuMemsetD16Async(ptr as sys::CUdeviceptr, value as u16, count, stream.cu_stream())
                .result()?,
            4 => sys::cuMemsetD32Async(ptr as sys::CUdeviceptr, value as u32, count, stream.cu_stream())
                .result()?,
            8 => {
                let func = builtin(st, "fill_64")?;
                let device = st.active_ref()?.device;
                let (blocks, threads) =
                    st.device(device)?.launch_config(count as u32, None, None);
                let p = ptr as u64;
                let n = count as u32;
                let mut b = stream.launch_builder(&func);
                b.arg(&p);
                b.arg(&n);
                b.arg(&value);
                b.launch(cfg(blocks, threads, 0))?;
            }
            _ => return Err(Error::usage("memset element size must be 1, 2, 4 or 8")),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reductions
// ---------------------------------------------------------------------------

fn reduce_accum_ty(ty: VarType) -> &'static str {
    match ty {
        VarType::F16 => "float",
        other => other.cuda_name(),
    }
}

fn reduce_identity(ty: VarType, op: ReduceOp) -> Result<String> {
    if ty.is_float() && matches!(op, ReduceOp::And | ReduceOp::Or) {
        return Err(Error::usage("bitwise reduction over float elements"));
    }
    let all_ones = || match ty.size() {
        1 => "0xffu".to_string(),
        2 => "0xffffu".to_string(),
        4 => "0xffffffffu".to_string(),
        _ => "0xffffffffffffffffULL".to_string(),
    };
    Ok(match op {
        ReduceOp::Add => "0".to_string(),
        ReduceOp::Mul => "1".to_string(),
        ReduceOp::Or => "0".to_string(),
        ReduceOp::And => all_ones(),
        ReduceOp::Min => {
            if ty.is_float() {
                if ty == VarType::F64 { "(1.0 / 0.0)".into() } else { "(1.0f / 0.0f)".into() }
            } else if ty.is_signed() {
                match ty.size() {
                    1 => "127".into(),
                    2 => "32767".into(),
                    4 => "2147483647".into(),
                    _ => "9223372036854775807LL".into(),
                }
            } else {
                all_ones()
            }
        }
        ReduceOp::Max => {
            if ty.is_float() {
                if ty == VarType::F64 { "(-1.0 / 0.0)".into() } else { "(-1.0f / 0.0f)".into() }
            } else if ty.is_signed() {
                match ty.size() {
                    1 => "(-128)".into(),
                    2 => "(-32768)".into(),
                    4 => "(-2147483647 - 1)".into(),
                    _ => "(-9223372036854775807LL - 1LL)".into(),
                }
            } else {
                "0".into()
            }
        }
    })
}

fn reduce_combine(op: ReduceOp, a: &str, b: &str) -> String {
    match op {
        ReduceOp::Add => format!("{a} + {b}"),
        ReduceOp::Mul => format!("{a} * {b}"),
        ReduceOp::Min => format!("{a} < {b} ? {a} : {b}"),
        ReduceOp::Max => format!("{a} > {b} ? {a} : {b}"),
        ReduceOp::And => format!("{a} & {b}"),
        ReduceOp::Or => format!("{a} | {b}"),
    }
}

fn reduce_source(ty: VarType, op: ReduceOp) -> Result<String> {
    let t = ty.cuda_name();
    let a = reduce_accum_ty(ty);
    let ident = reduce_identity(ty, op)?;
    let combine_load = reduce_combine(op, "value", &format!("({a}) in[i]"));
    let combine_shared = reduce_combine(op, "shared[tid]", "shared[tid + offset]");
    let header = if ty == VarType::F16 { "#include <cuda_fp16.h>\n" } else { "" };
    Ok(format!(
        r#"{header}extern "C" __global__ void reduce_kernel(const {t} *in, unsigned int n, {t} *out) {{
    extern __shared__ {a} shared[];
    unsigned int tid = threadIdx.x;
    {a} value = {ident};
    for (unsigned int i = blockIdx.x * blockDim.x + tid; i < n; i += blockDim.x * gridDim.x)
        value = {combine_load};
    shared[tid] = value;
    __syncthreads();
    for (unsigned int offset = blockDim.x / 2; offset > 0; offset >>= 1) {{
        if (tid < offset)
            shared[tid] = {combine_shared};
        __syncthreads();
    }}
    if (tid == 0)
        out[blockIdx.x] = ({t}) shared[0];
}}
"#
    ))
}

fn cached_kernel(st: &mut State, source: String) -> Result<CudaFunction> {
    use crate::state::{Kernel, KernelKey};
    let device = st.active_ref()?.device;
    let key = KernelKey { backend: crate::types::Backend::Cuda, device, source };
    if let Some(Kernel::Cuda { func, .. }) = st.kernel_cache.get(&key) {
        st.kernel_hits += 1;
        return Ok(func.clone());
    }
    let stream = st
        .active_cuda()?
        .ok_or_else(|| Error::usage("kernel compilation requires an accelerator stream"))?;
    let (module, func) = compile(&stream, &key.source, "reduce_kernel")?;
    st.kernel_misses += 1;
    st.kernel_cache.insert(key, Kernel::Cuda { module, func: func.clone() });
    Ok(func)
}

/// Two-phase tree reduction: per-block partials, then a single-block pass.
pub(crate) fn reduce(
    st: &mut State,
    ty: VarType,
    op: ReduceOp,
    ptr: usize,
    size: u32,
    out: usize,
) -> Result<()> {
    let stream = st.active_cuda()?.unwrap();
    let func = cached_kernel(st, reduce_source(ty, op)?)?;
    let device = st.active_ref()?.device;
    let thread_count = 1024u32;
    let acc_size = if ty == VarType::F16 { 4 } else { ty.size() as u32 };
    let shared = thread_count * acc_size;
    let (block_count, _) = st.device(device)?.launch_config(size, Some(thread_count), None);
    stream.context().bind_to_thread()?;
    if size <= thread_count {
        let (p, o) = (ptr as u64, out as u64);
        let mut b = stream.launch_builder(&func);
        b.arg(&p);
        b.arg(&size);
        b.arg(&o);
        unsafe { b.launch(cfg(1, thread_count, shared))? };
    } else {
        let temp = st.malloc(crate::malloc::AllocType::Device, (block_count * acc_size) as usize)?;
        {
            let (p, t) = (ptr as u64, temp as u64);
            let mut b = stream.launch_builder(&func);
            b.arg(&p);
            b.arg(&size);
            b.arg(&t);
            unsafe { b.launch(cfg(block_count, thread_count, shared))? };
        }
        {
            let (t, o) = (temp as u64, out as u64);
            let mut b = stream.launch_builder(&func);
            b.arg(&t);
            b.arg(&block_count);
            b.arg(&o);
            unsafe { b.launch(cfg(1, thread_count, shared))? };
        }
        st.free_ptr(temp)?;
    }
    st.kernel_launches += 1;
    Ok(())
}

// ---------------------------------------------------------------------------
// Exclusive scan
// ---------------------------------------------------------------------------

/// Exclusive prefix sum: 4096 elements per block, recursing on the block
/// sums beyond one block.
pub(crate) fn scan_u32(st: &mut State, input: usize, output: usize, size: u32) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let stream = st.active_cuda()?.unwrap();
    stream.context().bind_to_thread()?;
    if size == 1 {
        unsafe {
            sys::cuMemsetD8Async(output as sys::CUdeviceptr, 0, 4, stream.cu_stream()).result()?
        };
        return Ok(());
    }
    let (i64p, o64) = (input as u64, output as u64);
    if size <= 4096 {
        let thread_count = size.div_ceil(4).next_power_of_two().clamp(32, 1024);
        let func = builtin(st, "scan_small_u32")?;
        let mut b = stream.launch_builder(&func);
        b.arg(&i64p);
        b.arg(&o64);
        b.arg(&size);
        unsafe { b.launch(cfg(1, thread_count, thread_count * 4))? };
        return Ok(());
    }
    let block_count = size.div_ceil(4096);
    let block_sums = st.malloc(crate::malloc::AllocType::Device, (block_count * 4) as usize)?;
    {
        let func = builtin(st, "scan_large_u32")?;
        let s64 = block_sums as u64;
        let mut b = stream.launch_builder(&func);
        b.arg(&i64p);
        b.arg(&o64);
        b.arg(&size);
        b.arg(&s64);
        unsafe { b.launch(cfg(block_count, 1024, 1024 * 4))? };
    }
    scan_u32(st, block_sums, block_sums, block_count)?;
    {
        let func = builtin(st, "scan_offset_u32")?;
        let s64 = block_sums as u64;
        let mut b = stream.launch_builder(&func);
        b.arg(&o64);
        b.arg(&s64);
        b.arg(&size);
        unsafe { b.launch(cfg(block_count, 1024, 0))? };
    }
    st.free_ptr(block_sums)?;
    Ok(())
}

pub(crate) fn transpose_u32(
    st: &mut State,
    input: usize,
    output: usize,
    rows: u32,
    cols: u32,
) -> Result<()> {
    let stream = st.active_cuda()?.unwrap();
    let func = builtin(st, "transpose_u32")?;
    stream.context().bind_to_thread()?;
    let (i64p, o64) = (input as u64, output as u64);
    let mut b = stream.launch_builder(&func);
    b.arg(&i64p);
    b.arg(&o64);
    b.arg(&rows);
    b.arg(&cols);
    unsafe {
        b.launch(LaunchConfig {
            grid_dim: (cols.div_ceil(16), rows.div_ceil(16), 1),
            block_dim: (16, 16, 1),
            shared_mem_bytes: 0,
        })?
    };
    Ok(())
}

// ---------------------------------------------------------------------------
// mkperm
// ---------------------------------------------------------------------------

/// Bucket permutation on the device. Returns the event fencing the bucket
/// descriptor copy when `offsets` was requested; the caller waits on it
/// with the engine lock released before reading the descriptors.
pub(crate) fn mkperm(
    st: &mut State,
    keys: usize,
    size: u32,
    bucket_count: u32,
    perm: usize,
    offsets: Option<usize>,
) -> Result<Option<Event>> {
    use crate::malloc::AllocType;

    let stream = st.active_cuda()?.unwrap();
    let device_id = st.active_ref()?.device;
    let (sm_shared, launch) = {
        let d = st.device(device_id)?;
        (d.shared_mem_bytes, d.launch_config(size, Some(1024), Some(1)))
    };
    let (block_count, thread_count) = launch;
    // Full warps only; the kernels assume it.
    let warp_count = thread_count.div_ceil(32);
    let thread_count = warp_count * 32;

    let bucket_size_1 = bucket_count * 4;
    let mut bucket_size_all = bucket_size_1 * block_count;

    let (variant, shared_size, initialize_buckets) = if bucket_size_1 * warp_count <= sm_shared {
        bucket_size_all *= warp_count;
        ("tiny", bucket_size_1 * warp_count, false)
    } else if bucket_size_1 <= sm_shared {
        ("small", bucket_size_1, false)
    } else {
        ("large", 0, true)
    };
    let needs_transpose = bucket_size_1 != bucket_size_all;

    let buckets_1 = st.malloc(AllocType::Device, bucket_size_all as usize)?;
    let buckets_2 = if needs_transpose {
        st.malloc(AllocType::Device, bucket_size_all as usize)?
    } else {
        buckets_1
    };
    let counter = if offsets.is_some() {
        let c = st.malloc(AllocType::Device, 4)?;
        stream.context().bind_to_thread()?;
        unsafe { sys::cuMemsetD8Async(c as sys::CUdeviceptr, 0, 4, stream.cu_stream()).result()? };
        Some(c)
    } else {
        None
    };
    if initialize_buckets {
        stream.context().bind_to_thread()?;
        unsafe {
            sys::cuMemsetD8Async(
                buckets_1 as sys::CUdeviceptr,
                0,
                bucket_size_all as usize,
                stream.cu_stream(),
            )
            .result()?
        };
    }

    let size_per_block = size.div_ceil(block_count).next_multiple_of(32);
    debug!(
        size,
        bucket_count, block_count, thread_count, size_per_block, variant, "mkperm"
    );

    let (k64, b1, p64) = (keys as u64, buckets_1 as u64, perm as u64);

    // Phase 1: per-row histograms.
    {
        let func = builtin(st, &format!("mkperm_phase_1_{variant}"))?;
        let mut b = stream.launch_builder(&func);
        b.arg(&k64);
        b.arg(&b1);
        b.arg(&size);
        b.arg(&size_per_block);
        b.arg(&bucket_count);
        unsafe { b.launch(cfg(block_count, thread_count, shared_size))? };
    }

    // Phase 2: exclusive scan over bucket-major cells.
    let rows = bucket_size_all / bucket_size_1;
    if needs_transpose {
        transpose_u32(st, buckets_1, buckets_2, rows, bucket_count)?;
    }
    scan_u32(st, buckets_2, buckets_2, bucket_size_all / 4)?;
    if needs_transpose {
        transpose_u32(st, buckets_2, buckets_1, bucket_count, rows)?;
    }

    // Phase 3: compact non-empty buckets into descriptors (optional).
    let mut fence = None;
    if let (Some(offsets), Some(counter)) = (offsets, counter) {
        let func = builtin(st, "mkperm_phase_3")?;
        let (blocks_3, threads_3) = st.device(device_id)?.launch_config(bucket_count, None, None);
        let (b1c, c64, o64) = (buckets_1 as u64, counter as u64, offsets as u64);
        let mut b = stream.launch_builder(&func);
        b.arg(&b1c);
        b.arg(&bucket_count);
        b.arg(&size);
        b.arg(&c64);
        b.arg(&o64);
        unsafe { b.launch(cfg(blocks_3, threads_3, 0))? };
        memcpy_async(&stream, offsets + bucket_count as usize * 16, counter, 4)?;
        let event = Event::new(&stream)?;
        event.record(&stream)?;
        fence = Some(event);
    }

    // Phase 4: replay keys against the scanned bases.
    {
        let func = builtin(st, &format!("mkperm_phase_4_{variant}"))?;
        let mut b = stream.launch_builder(&func);
        b.arg(&k64);
        b.arg(&b1);
        b.arg(&p64);
        b.arg(&size);
        b.arg(&size_per_block);
        b.arg(&bucket_count);
        unsafe { b.launch(cfg(block_count, thread_count, shared_size))? };
    }

    st.free_ptr(buckets_1)?;
    if needs_transpose {
        st.free_ptr(buckets_2)?;
    }
    if let Some(counter) = counter {
        st.free_ptr(counter)?;
    }
    Ok(fence)
}
