//! Process-wide engine state.
//!
//! The engine is a singleton: one variable table, one set of caches, one
//! allocator. All mutable state lives behind a single coarse mutex; blocking
//! operations (device sync, kernel compilation, CPU parallel execution)
//! release it for the duration of the wait and re-acquire afterwards.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use cudarc::driver::{CudaContext, CudaFunction, CudaModule, CudaStream};
use rustc_hash::FxHashMap;

use crate::cpu::program::CpuProgram;
use crate::cuda::Event;
use crate::error::{Error, Result};
use crate::malloc::{Block, MallocState};
use crate::registry::DomainRegistry;
use crate::types::{Backend, VarType};
use crate::util::VCallBucket;
use crate::var::Variable;

/// One usable accelerator device.
pub(crate) struct Device {
    pub id: i32,
    pub ctx: Arc<CudaContext>,
    pub sm_count: u32,
    pub shared_mem_bytes: u32,
}

impl Device {
    /// Pick a (block count, thread count) pair for a kernel over `size`
    /// elements. `hint_threads` caps the block size; `max_blocks_per_sm`
    /// bounds oversubscription once every SM has work.
    pub fn launch_config(
        &self,
        size: u32,
        hint_threads: Option<u32>,
        max_blocks_per_sm: Option<u32>,
    ) -> (u32, u32) {
        let max_threads = hint_threads.unwrap_or(1024).max(32);
        let max_blocks_per_sm = max_blocks_per_sm.unwrap_or(4);
        let blocks_avail = size.div_ceil(max_threads);
        if blocks_avail < self.sm_count {
            // Not enough work to fill the device; shrink blocks to full warps.
            let threads = size.div_ceil(blocks_avail.max(1)).next_multiple_of(32);
            (blocks_avail.max(1), threads.min(max_threads))
        } else {
            (self.sm_count * max_blocks_per_sm, max_threads)
        }
    }
}

pub(crate) struct CudaStreamState {
    pub stream: Arc<CudaStream>,
}

/// Logical serial work queue on one backend, keyed by (device, index).
/// Device -1 is the CPU task runtime.
pub(crate) struct Stream {
    pub device: i32,
    pub index: u32,
    pub cuda: Option<CudaStreamState>,
    /// Variables marked for evaluation on this stream.
    pub scheduled: Vec<u32>,
    /// Side-effect variables pending evaluation on this stream.
    pub side_effects: Vec<u32>,
    /// Blocks freed since the last fence; reuse is gated on the stream.
    pub release_chain: Vec<Block>,
    /// Fenced segments of the release chain awaiting their event.
    pub pending_release: VecDeque<(Event, Vec<Block>)>,
}

impl Stream {
    pub fn backend(&self) -> Backend {
        if self.cuda.is_some() { Backend::Cuda } else { Backend::Cpu }
    }
}

/// Key of the common-subexpression cache: everything that makes two
/// unevaluated variables interchangeable.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct VariableKey {
    pub stmt: String,
    pub size: u32,
    pub dep: [u32; 3],
    pub ty: VarType,
    pub backend: Backend,
}

/// Kernel cache key: exact generated source plus where it runs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct KernelKey {
    pub backend: Backend,
    pub device: i32,
    pub source: String,
}

/// Compiled kernel artifact.
#[derive(Clone)]
pub(crate) enum Kernel {
    Cuda {
        #[allow(dead_code)]
        module: Arc<CudaModule>,
        func: CudaFunction,
    },
    Cpu {
        program: Arc<CpuProgram>,
    },
}

pub(crate) struct State {
    pub has_cpu: bool,
    pub has_cuda: bool,
    /// Keeps the probed driver library loaded across light shutdowns.
    pub cuda_lib: Option<libloading::Library>,
    pub devices: Vec<Device>,
    pub streams: FxHashMap<(i32, u32), Stream>,
    pub variables: FxHashMap<u32, Variable>,
    /// Next variable id; ids are never reused within a process.
    pub variable_index: u32,
    pub cse_cache: FxHashMap<VariableKey, u32>,
    /// Pointer-literal interning: one canonical variable per pointer value.
    pub var_from_ptr: FxHashMap<usize, u32>,
    pub kernel_cache: FxHashMap<KernelKey, Kernel>,
    /// Builtin kernel suite (scan, mkperm, transpose), one module per device.
    pub builtin_modules: FxHashMap<i32, Arc<CudaModule>>,
    pub kernel_hits: u64,
    pub kernel_misses: u64,
    pub kernel_launches: u64,
    /// Precomputed vcall dispatch layouts, keyed by index variable id.
    pub vcall_cache: FxHashMap<u32, Vec<VCallBucket>>,
    pub registry: FxHashMap<String, DomainRegistry>,
    pub malloc: MallocState,
}

impl Default for State {
    fn default() -> Self {
        Self {
            has_cpu: false,
            has_cuda: false,
            cuda_lib: None,
            devices: Vec::new(),
            streams: FxHashMap::default(),
            variables: FxHashMap::default(),
            variable_index: 1,
            cse_cache: FxHashMap::default(),
            var_from_ptr: FxHashMap::default(),
            kernel_cache: FxHashMap::default(),
            builtin_modules: FxHashMap::default(),
            kernel_hits: 0,
            kernel_misses: 0,
            kernel_launches: 0,
            vcall_cache: FxHashMap::default(),
            registry: FxHashMap::default(),
            malloc: MallocState::default(),
        }
    }
}

static STATE: LazyLock<Mutex<State>> = LazyLock::new(|| Mutex::new(State::default()));

/// Guards the evaluation pipeline while the main lock is temporarily
/// released (compilation, blocking waits). Prevents a second thread from
/// entering `eval` and observing half-written schedule bookkeeping.
pub(crate) static EVAL_LOCK: Mutex<()> = Mutex::new(());

thread_local! {
    static ACTIVE_STREAM: Cell<Option<(i32, u32)>> = const { Cell::new(None) };
}

pub(crate) fn lock() -> MutexGuard<'static, State> {
    STATE.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn active_stream_key() -> Option<(i32, u32)> {
    ACTIVE_STREAM.with(|c| c.get())
}

pub(crate) fn set_active_stream(key: Option<(i32, u32)>) {
    ACTIVE_STREAM.with(|c| c.set(key));
}

impl State {
    /// The calling thread's active stream, or a usage error if none is set.
    pub fn active(&mut self) -> Result<&mut Stream> {
        let key = active_stream_key().ok_or_else(no_stream)?;
        self.streams.get_mut(&key).ok_or_else(no_stream)
    }

    pub fn active_ref(&self) -> Result<&Stream> {
        let key = active_stream_key().ok_or_else(no_stream)?;
        self.streams.get(&key).ok_or_else(no_stream)
    }

    pub fn active_backend(&self) -> Result<Backend> {
        self.active_ref().map(Stream::backend)
    }

    /// Clone of the active CUDA stream handle, if the active stream is one.
    pub fn active_cuda(&self) -> Result<Option<Arc<CudaStream>>> {
        Ok(self.active_ref()?.cuda.as_ref().map(|c| Arc::clone(&c.stream)))
    }

    pub fn device(&self, id: i32) -> Result<&Device> {
        self.devices
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::usage(format!("invalid device id {id}")))
    }
}

fn no_stream() -> Error {
    Error::usage(
        "you must invoke device_set() to choose a target device before calling this function",
    )
}
