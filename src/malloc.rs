//! Asynchronous memory pool.
//!
//! Blocks are recycled through per-(class, device, size) freelists. Freeing a
//! block whose class belongs to an asynchronous backend does not make it
//! reusable immediately: it joins the active stream's release chain and only
//! migrates to the freelist once the stream has passed an ordering point
//! recorded after the free. CPU streams execute synchronously, so their
//! frees recycle directly.

use std::alloc::Layout;
use std::collections::BTreeMap;
use std::sync::Arc;

use cudarc::driver::DevicePtr;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::cuda::Event;
use crate::error::{Error, Result};
use crate::state::{State, Stream};

/// Allocation class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocType {
    /// Accelerator global memory.
    Device,
    /// Ordinary host memory.
    Host,
    /// Page-locked host memory, device-accessible via unified addressing.
    HostPinned,
    /// Host memory whose lifetime is tied to the CPU stream.
    HostAsync,
    /// Memory accessible from both host and device. Backed by pinned
    /// allocations; the engine requires unified addressing anyway.
    Managed,
}

pub(crate) enum Backing {
    Host { layout: Layout },
    Device(cudarc::driver::CudaSlice<u8>),
    Pinned(cudarc::driver::PinnedHostSlice<u8>),
}

pub(crate) struct Block {
    pub ptr: usize,
    /// Rounded byte size (the freelist bucket).
    pub size: usize,
    pub ty: AllocType,
    pub device: i32,
    pub backing: Backing,
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Backing::Host { layout } = &self.backing {
            unsafe { std::alloc::dealloc(self.ptr as *mut u8, *layout) };
        }
    }
}

#[derive(Default)]
pub(crate) struct MallocState {
    /// Live blocks by base pointer. A BTreeMap so interior pointers can be
    /// resolved to their containing block.
    pub used: BTreeMap<usize, Block>,
    pub free: FxHashMap<(AllocType, i32, usize), Vec<Block>>,
    pub bytes_used: usize,
    pub bytes_free: usize,
    pub bytes_inflight: usize,
    pub bytes_provider: usize,
}

impl MallocState {
    fn push_free(&mut self, block: Block) {
        self.bytes_free += block.size;
        self.free
            .entry((block.ty, block.device, block.size))
            .or_default()
            .push(block);
    }

    /// Resolve a (possibly interior) pointer to its containing live block.
    pub fn find(&self, ptr: usize) -> Option<&Block> {
        let (_, block) = self.used.range(..=ptr).next_back()?;
        (ptr < block.ptr + block.size).then_some(block)
    }
}

/// Round a request up to its freelist bucket: a power of two below the page
/// threshold, page multiples above it.
fn round_size(size: usize) -> usize {
    if size <= 64 {
        64
    } else if size < 4096 {
        size.next_power_of_two()
    } else {
        size.next_multiple_of(4096)
    }
}

fn host_block(ty: AllocType, rounded: usize) -> Result<Block> {
    let layout = Layout::from_size_align(rounded, 64).map_err(|_| Error::Alloc(rounded))?;
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        return Err(Error::Alloc(rounded));
    }
    Ok(Block {
        ptr: ptr as usize,
        size: rounded,
        ty,
        device: -1,
        backing: Backing::Host { layout },
    })
}

impl State {
    /// Allocate `size` bytes of the given class. Returns the base pointer,
    /// or 0 for empty requests.
    pub(crate) fn malloc(&mut self, ty: AllocType, size: usize) -> Result<usize> {
        if size == 0 {
            return Ok(0);
        }
        let rounded = round_size(size);

        // Device-affine classes bind to the active stream's device; pinned
        // and managed degrade to plain host memory on CPU-only engines.
        let device = match ty {
            AllocType::Host | AllocType::HostAsync => -1,
            AllocType::Device => {
                let stream = self.active_ref()?;
                if stream.cuda.is_none() {
                    return Err(Error::usage(
                        "device allocations require an active accelerator stream",
                    ));
                }
                stream.device
            }
            AllocType::HostPinned | AllocType::Managed => {
                self.active_ref().ok().map(|s| s.device).filter(|d| *d >= 0).unwrap_or(-1)
            }
        };

        if let Some(list) = self.malloc.free.get_mut(&(ty, device, rounded))
            && let Some(block) = list.pop()
        {
            let ptr = block.ptr;
            self.malloc.bytes_free -= rounded;
            self.malloc.bytes_used += rounded;
            self.malloc.used.insert(ptr, block);
            trace!(ptr, size, "malloc: reused {ty:?} block");
            return Ok(ptr);
        }

        let block = match self.provider_alloc(ty, device, rounded) {
            Ok(block) => block,
            Err(_) => {
                // Out of memory: drain every release chain, dump the
                // freelists back to the provider, and retry once.
                self.malloc_flush_all(true)?;
                self.malloc_trim();
                self.provider_alloc(ty, device, rounded)
                    .map_err(|_| Error::Alloc(size))?
            }
        };
        let ptr = block.ptr;
        self.malloc.bytes_provider += rounded;
        self.malloc.bytes_used += rounded;
        self.malloc.used.insert(ptr, block);
        trace!(ptr, size, "malloc: new {ty:?} block");
        Ok(ptr)
    }

    fn provider_alloc(&mut self, ty: AllocType, device: i32, rounded: usize) -> Result<Block> {
        if device < 0 {
            return host_block(ty, rounded);
        }
        if ty == AllocType::Device {
            let stream = self
                .active_ref()?
                .cuda
                .as_ref()
                .map(|c| Arc::clone(&c.stream))
                .ok_or_else(|| Error::usage("device allocation without accelerator stream"))?;
            let slice = stream.alloc_zeros::<u8>(rounded)?;
            let ptr = slice.device_ptr(&stream).0 as usize;
            return Ok(Block { ptr, size: rounded, ty, device, backing: Backing::Device(slice) });
        }
        let ctx = Arc::clone(&self.device(device)?.ctx);
        let mut slab = unsafe { ctx.alloc_pinned::<u8>(rounded)? };
        let ptr = slab.as_mut_slice()?.as_mut_ptr() as usize;
        Ok(Block { ptr, size: rounded, ty, device, backing: Backing::Pinned(slab) })
    }

    /// Return a block to the pool. Device-affine blocks join the active
    /// stream's release chain; host blocks recycle immediately.
    pub(crate) fn free_ptr(&mut self, ptr: usize) -> Result<()> {
        if ptr == 0 {
            return Ok(());
        }
        let block = self
            .malloc
            .used
            .remove(&ptr)
            .ok_or_else(|| Error::usage(format!("free(): unknown pointer {ptr:#x}")))?;
        self.malloc.bytes_used -= block.size;
        let deferred = block.device >= 0
            && self
                .active_ref()
                .is_ok_and(|s| s.cuda.is_some() && s.device == block.device);
        if deferred {
            self.malloc.bytes_inflight += block.size;
            self.active()?.release_chain.push(block);
        } else {
            self.malloc.push_free(block);
        }
        Ok(())
    }

    /// Fence the active stream's release chain behind an ordering point and
    /// recycle every previously fenced segment the stream has passed.
    pub(crate) fn free_flush(&mut self) -> Result<()> {
        let Some(key) = crate::state::active_stream_key() else {
            return Ok(());
        };
        let Some(stream) = self.streams.get_mut(&key) else {
            return Ok(());
        };
        Self::fence_and_drain(stream, &mut self.malloc, false)
    }

    fn fence_and_drain(stream: &mut Stream, malloc: &mut MallocState, blocking: bool) -> Result<()> {
        if let Some(cuda) = &stream.cuda {
            if !stream.release_chain.is_empty() {
                let event = Event::new(&cuda.stream)?;
                event.record(&cuda.stream)?;
                let chain = std::mem::take(&mut stream.release_chain);
                stream.pending_release.push_back((event, chain));
            }
            while let Some((event, _)) = stream.pending_release.front() {
                if blocking {
                    event.synchronize()?;
                } else if !event.query()? {
                    break;
                }
                let (_, blocks) = stream.pending_release.pop_front().unwrap();
                trace!(
                    device = stream.device,
                    index = stream.index,
                    blocks = blocks.len(),
                    "release chain: recycling fenced segment"
                );
                for block in blocks {
                    malloc.bytes_inflight -= block.size;
                    malloc.push_free(block);
                }
            }
        } else {
            for block in stream.release_chain.drain(..) {
                malloc.push_free(block);
            }
        }
        Ok(())
    }

    /// Drain the release chains of every stream; `blocking` waits for the
    /// ordering points instead of polling them.
    pub(crate) fn malloc_flush_all(&mut self, blocking: bool) -> Result<()> {
        for stream in self.streams.values_mut() {
            Self::fence_and_drain(stream, &mut self.malloc, blocking)?;
        }
        Ok(())
    }

    /// Release every freelist block back to the underlying provider.
    pub(crate) fn malloc_trim(&mut self) {
        let mut released = 0usize;
        for (_, list) in self.malloc.free.drain() {
            for block in list {
                released += block.size;
                drop(block);
            }
        }
        self.malloc.bytes_free -= released;
        self.malloc.bytes_provider -= released;
        if released > 0 {
            trace!(released, "malloc_trim: released freelist memory");
        }
    }

    /// Copy a block into a different allocation class. Same class is a no-op
    /// returning the original pointer.
    pub(crate) fn migrate_ptr(&mut self, ptr: usize, new_ty: AllocType) -> Result<usize> {
        if ptr == 0 {
            return Ok(0);
        }
        let (old_ty, size) = {
            let block = self
                .malloc
                .used
                .get(&ptr)
                .ok_or_else(|| Error::usage(format!("migrate(): unknown pointer {ptr:#x}")))?;
            (block.ty, block.size)
        };
        if old_ty == new_ty {
            return Ok(ptr);
        }
        let new_ptr = self.malloc(new_ty, size)?;
        let src_host = {
            let block = &self.malloc.used[&ptr];
            !matches!(block.backing, Backing::Device(_))
        };
        let dst_host = {
            let block = &self.malloc.used[&new_ptr];
            !matches!(block.backing, Backing::Device(_))
        };
        match (src_host, dst_host) {
            (true, true) => unsafe {
                std::ptr::copy_nonoverlapping(ptr as *const u8, new_ptr as *mut u8, size);
            },
            (true, false) => {
                let stream = self.active_cuda()?.ok_or_else(|| {
                    Error::usage("migrating to device memory requires an accelerator stream")
                })?;
                let src = unsafe { std::slice::from_raw_parts(ptr as *const u8, size) };
                let block = self.malloc.used.get_mut(&new_ptr).unwrap();
                let Backing::Device(slice) = &mut block.backing else { unreachable!() };
                stream.memcpy_htod(src, slice)?;
            }
            (false, true) => {
                let stream = self.active_cuda()?.ok_or_else(|| {
                    Error::usage("migrating device memory requires an accelerator stream")
                })?;
                let dst = unsafe { std::slice::from_raw_parts_mut(new_ptr as *mut u8, size) };
                let block = &self.malloc.used[&ptr];
                let Backing::Device(slice) = &block.backing else { unreachable!() };
                stream.memcpy_dtoh(slice, dst)?;
                stream.synchronize()?;
            }
            (false, false) => unreachable!("same-class migration is a no-op"),
        }
        self.free_ptr(ptr)?;
        Ok(new_ptr)
    }

    /// Copy host bytes into a freshly allocated block (either backend).
    pub(crate) fn upload(&mut self, ptr: usize, data: &[u8]) -> Result<()> {
        let block = self
            .malloc
            .find(ptr)
            .ok_or_else(|| Error::usage("upload(): unknown pointer"))?;
        if matches!(block.backing, Backing::Device(_)) {
            let stream = self.active_cuda()?.ok_or_else(|| {
                Error::usage("uploading to device memory requires an accelerator stream")
            })?;
            crate::cuda::copy_to_device(&stream, ptr, data)?;
        } else {
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len()) };
        }
        Ok(())
    }

    pub(crate) fn malloc_shutdown(&mut self) {
        let _ = self.malloc_flush_all(true);
        self.malloc_trim();
        if !self.malloc.used.is_empty() {
            tracing::warn!(
                blocks = self.malloc.used.len(),
                bytes = self.malloc.bytes_used,
                "shutdown: allocations are still in use"
            );
        }
    }
}

/// (used, freelist, in-flight, provider) byte counts, for diagnostics and
/// the alloc/free parity invariant.
pub fn stats() -> (usize, usize, usize, usize) {
    let st = crate::state::lock();
    (
        st.malloc.bytes_used,
        st.malloc.bytes_free,
        st.malloc.bytes_inflight,
        st.malloc.bytes_provider,
    )
}
