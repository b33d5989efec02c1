//! Host-emulated backend: pitched "device" blocks and "pinned" blocks both
//! come from the system heap.
//!
//! Used by CPU-only builds and by the test suite.  It reproduces the driver
//! contracts the core relies on:
//!
//! - pitch is rounded up to [`MemoryConfig::host_pitch_alignment`], so
//!   `pitch > width_bytes` for most widths, exactly like `cuMemAllocPitch`;
//! - every allocate/free/copy requires a context pushed on the calling
//!   thread
//!   (`CUDA_ERROR_INVALID_CONTEXT` otherwise);
//! - an optional capacity cap turns oversize requests into
//!   [`MemoryError::AllocationFailure`].
//!
//! Device pointers handed out here are plain host addresses.

use std::alloc::{Layout, alloc, dealloc};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use tracing::debug;

use crate::config::MemoryConfig;
use crate::context::{Copy2d, DeviceContext, DevicePtr, MemRef, MemoryBackend, PitchedAllocation};
use crate::error::{AllocKind, MemoryError, Result};
use crate::ffi_types::ContextHandle;

const CUDA_ERROR_INVALID_VALUE: i32 = 1;
const CUDA_ERROR_INVALID_CONTEXT: i32 = 201;

/// Alignment of emulated pinned blocks.
const PINNED_ALIGNMENT: usize = 64;

/// Handle given to contexts created through [`SystemBackend::context`].
pub const SYSTEM_CONTEXT: ContextHandle = ContextHandle(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockKind {
    Pitched,
    Pinned,
}

struct Block {
    layout: Layout,
    kind: BlockKind,
}

/// Snapshot of backend counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SystemStats {
    pub live_pitched: usize,
    pub live_pinned: usize,
    pub live_bytes: usize,
    pub total_allocs: u64,
    pub total_frees: u64,
    pub total_copies: u64,
}

pub struct SystemBackend {
    config: MemoryConfig,
    blocks: Mutex<HashMap<usize, Block>>,
    /// Context stacks keyed by thread, like the driver's per-thread current context.
    ctx_stacks: Mutex<HashMap<ThreadId, Vec<ContextHandle>>>,
    live_bytes: AtomicUsize,
    total_allocs: AtomicU64,
    total_frees: AtomicU64,
    total_copies: AtomicU64,
}

impl SystemBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(MemoryConfig::default()))
    }

    pub fn with_config(config: MemoryConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self::build(config)))
    }

    fn build(config: MemoryConfig) -> Self {
        Self {
            config,
            blocks: Mutex::new(HashMap::new()),
            ctx_stacks: Mutex::new(HashMap::new()),
            live_bytes: AtomicUsize::new(0),
            total_allocs: AtomicU64::new(0),
            total_frees: AtomicU64::new(0),
            total_copies: AtomicU64::new(0),
        }
    }

    /// A [`DeviceContext`] bound to this backend with [`SYSTEM_CONTEXT`].
    pub fn context(self: &Arc<Self>) -> DeviceContext {
        self.context_with_handle(SYSTEM_CONTEXT)
    }

    pub fn context_with_handle(self: &Arc<Self>, handle: ContextHandle) -> DeviceContext {
        // Config was validated when the backend was built.
        DeviceContext::from_validated(handle, self.clone(), self.config.clone())
    }

    /// Top of the calling thread's context stack.
    pub fn current_context(&self) -> Option<ContextHandle> {
        self.stacks()
            .get(&thread::current().id())
            .and_then(|stack| stack.last().copied())
    }

    pub fn context_depth(&self) -> usize {
        self.stacks()
            .get(&thread::current().id())
            .map_or(0, Vec::len)
    }

    pub fn stats(&self) -> SystemStats {
        let blocks = self.blocks();
        SystemStats {
            live_pitched: blocks
                .values()
                .filter(|b| b.kind == BlockKind::Pitched)
                .count(),
            live_pinned: blocks
                .values()
                .filter(|b| b.kind == BlockKind::Pinned)
                .count(),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            total_allocs: self.total_allocs.load(Ordering::Relaxed),
            total_frees: self.total_frees.load(Ordering::Relaxed),
            total_copies: self.total_copies.load(Ordering::Relaxed),
        }
    }

    fn stacks(&self) -> MutexGuard<'_, HashMap<ThreadId, Vec<ContextHandle>>> {
        self.ctx_stacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn blocks(&self) -> MutexGuard<'_, HashMap<usize, Block>> {
        self.blocks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn require_context(&self, call: &'static str) -> Result<()> {
        if self.current_context().is_some() {
            Ok(())
        } else {
            Err(MemoryError::Cuda {
                call,
                code: CUDA_ERROR_INVALID_CONTEXT,
                name: "CUDA_ERROR_INVALID_CONTEXT".into(),
            })
        }
    }

    fn reserve(&self, kind: AllocKind, bytes: usize) -> Result<()> {
        let Some(cap) = self.config.host_capacity_bytes else {
            self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
            return Ok(());
        };
        self.live_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |live| {
                live.checked_add(bytes).filter(|next| *next <= cap)
            })
            .map(|_| ())
            .map_err(|live| MemoryError::AllocationFailure {
                kind,
                bytes,
                reason: format!("host capacity exceeded ({live} of {cap} bytes in use)"),
            })
    }

    fn allocate(&self, kind: AllocKind, layout: Layout) -> Result<*mut u8> {
        self.reserve(kind, layout.size())?;
        // SAFETY: callers never request zero-size layouts.
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            self.live_bytes.fetch_sub(layout.size(), Ordering::Relaxed);
            return Err(MemoryError::AllocationFailure {
                kind,
                bytes: layout.size(),
                reason: "system allocator returned null".into(),
            });
        }
        let block_kind = match kind {
            AllocKind::PitchedDevice => BlockKind::Pitched,
            AllocKind::PinnedHost => BlockKind::Pinned,
        };
        self.blocks().insert(
            ptr as usize,
            Block {
                layout,
                kind: block_kind,
            },
        );
        self.total_allocs.fetch_add(1, Ordering::Relaxed);
        Ok(ptr)
    }

    fn release(&self, call: &'static str, addr: usize, kind: BlockKind) -> Result<()> {
        let block = {
            let mut blocks = self.blocks();
            match blocks.get(&addr) {
                Some(block) if block.kind == kind => blocks.remove(&addr),
                _ => None,
            }
        };
        let Some(block) = block else {
            return Err(MemoryError::Cuda {
                call,
                code: CUDA_ERROR_INVALID_VALUE,
                name: "CUDA_ERROR_INVALID_VALUE".into(),
            });
        };
        // SAFETY: addr was returned by `alloc` with exactly this layout and
        // has just been removed from the live table.
        unsafe { dealloc(addr as *mut u8, block.layout) };
        self.live_bytes
            .fetch_sub(block.layout.size(), Ordering::Relaxed);
        self.total_frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn invalid_value(call: &'static str) -> MemoryError {
    MemoryError::Cuda {
        call,
        code: CUDA_ERROR_INVALID_VALUE,
        name: "CUDA_ERROR_INVALID_VALUE".into(),
    }
}

fn host_address(mem: MemRef) -> *mut u8 {
    match mem {
        MemRef::Host(ptr) => ptr,
        MemRef::Device(ptr) => ptr as usize as *mut u8,
    }
}

impl MemoryBackend for SystemBackend {
    fn name(&self) -> &'static str {
        "system"
    }

    fn push_context(&self, ctx: ContextHandle) -> Result<()> {
        if ctx.is_null() {
            return Err(MemoryError::Cuda {
                call: "push_context",
                code: CUDA_ERROR_INVALID_CONTEXT,
                name: "CUDA_ERROR_INVALID_CONTEXT".into(),
            });
        }
        self.stacks()
            .entry(thread::current().id())
            .or_default()
            .push(ctx);
        Ok(())
    }

    fn pop_context(&self) -> Result<ContextHandle> {
        let mut stacks = self.stacks();
        let id = thread::current().id();
        let popped = stacks.get_mut(&id).and_then(Vec::pop);
        if stacks.get(&id).is_some_and(Vec::is_empty) {
            stacks.remove(&id);
        }
        popped.ok_or(MemoryError::Cuda {
            call: "pop_context",
            code: CUDA_ERROR_INVALID_CONTEXT,
            name: "CUDA_ERROR_INVALID_CONTEXT".into(),
        })
    }

    fn alloc_pitched(
        &self,
        width_bytes: usize,
        height: usize,
        element_bytes: u32,
    ) -> Result<PitchedAllocation> {
        self.require_context("alloc_pitched")?;
        if width_bytes == 0 || height == 0 {
            return Err(invalid_value("alloc_pitched"));
        }
        let align = self
            .config
            .host_pitch_alignment
            .max(element_bytes as usize);
        let pitch = width_bytes
            .checked_next_multiple_of(align)
            .ok_or_else(|| invalid_value("alloc_pitched"))?;
        let layout = pitch
            .checked_mul(height)
            .and_then(|size| Layout::from_size_align(size, align).ok())
            .ok_or_else(|| invalid_value("alloc_pitched"))?;
        let ptr = self.allocate(AllocKind::PitchedDevice, layout)?;
        debug!(width_bytes, height, pitch, bytes = layout.size(), "system pitched alloc");
        Ok(PitchedAllocation {
            ptr: ptr as usize as DevicePtr,
            pitch,
        })
    }

    unsafe fn free_pitched(&self, ptr: DevicePtr) -> Result<()> {
        self.require_context("free_pitched")?;
        self.release("free_pitched", ptr as usize, BlockKind::Pitched)
    }

    fn alloc_pinned(&self, size: usize, _portable: bool) -> Result<NonNull<u8>> {
        self.require_context("alloc_pinned")?;
        if size == 0 {
            return Err(invalid_value("alloc_pinned"));
        }
        let layout = Layout::from_size_align(size, PINNED_ALIGNMENT)
            .map_err(|_| invalid_value("alloc_pinned"))?;
        let ptr = self.allocate(AllocKind::PinnedHost, layout)?;
        debug!(bytes = size, "system pinned alloc");
        NonNull::new(ptr).ok_or_else(|| invalid_value("alloc_pinned"))
    }

    unsafe fn free_pinned(&self, ptr: NonNull<u8>) -> Result<()> {
        self.require_context("free_pinned")?;
        self.release("free_pinned", ptr.as_ptr() as usize, BlockKind::Pinned)
    }

    unsafe fn copy_2d(&self, copy: &Copy2d) -> Result<()> {
        self.require_context("copy_2d")?;
        if copy.width_bytes > copy.src_pitch || copy.width_bytes > copy.dst_pitch {
            return Err(invalid_value("copy_2d"));
        }
        let src = host_address(copy.src);
        let dst = host_address(copy.dst);
        for row in 0..copy.height {
            // SAFETY: the caller guarantees both endpoints cover `height`
            // rows of `width_bytes` at their pitches and do not overlap.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.add(row * copy.src_pitch),
                    dst.add(row * copy.dst_pitch),
                    copy.width_bytes,
                );
            }
        }
        self.total_copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn context_stacks_are_per_thread() {
        let backend = SystemBackend::new();
        let pushed = Barrier::new(2);
        let checked = Barrier::new(2);
        thread::scope(|s| {
            s.spawn(|| {
                backend.push_context(ContextHandle(0xB)).expect("push B");
                pushed.wait();
                checked.wait();
                assert_eq!(backend.current_context(), Some(ContextHandle(0xB)));
                assert_eq!(backend.pop_context().expect("pop B"), ContextHandle(0xB));
            });

            pushed.wait();
            assert_eq!(backend.current_context(), None);
            let err = backend
                .alloc_pitched(64, 1, 16)
                .expect_err("no context on this thread");
            assert!(matches!(err, MemoryError::Cuda { code, .. } if code == CUDA_ERROR_INVALID_CONTEXT));

            backend.push_context(ContextHandle(0xA)).expect("push A");
            assert_eq!(backend.current_context(), Some(ContextHandle(0xA)));
            assert_eq!(backend.context_depth(), 1);
            checked.wait();
            assert_eq!(backend.pop_context().expect("pop A"), ContextHandle(0xA));
        });
        assert_eq!(backend.context_depth(), 0);
    }

    #[test]
    fn pitch_is_rounded_to_alignment() {
        let backend = SystemBackend::new();
        let ctx = backend.context();
        let _guard = ctx.make_current().expect("push");
        let alloc = backend.alloc_pitched(100, 4, 16).expect("alloc");
        assert_eq!(alloc.pitch, 256);
        assert_eq!(backend.stats().live_bytes, 256 * 4);
        // SAFETY: ptr came from alloc_pitched above.
        unsafe { backend.free_pitched(alloc.ptr).expect("free") };
        assert_eq!(backend.stats().live_bytes, 0);
    }

    #[test]
    fn allocation_without_context_is_rejected() {
        let backend = SystemBackend::new();
        let err = backend
            .alloc_pitched(64, 64, 16)
            .expect_err("no context pushed");
        assert!(matches!(
            err,
            MemoryError::Cuda {
                code: CUDA_ERROR_INVALID_CONTEXT,
                ..
            }
        ));
    }

    #[test]
    fn capacity_cap_fails_allocation() {
        let backend = SystemBackend::with_config(MemoryConfig {
            host_capacity_bytes: Some(1024),
            ..MemoryConfig::default()
        })
        .expect("valid config");
        let ctx = backend.context();
        let _guard = ctx.make_current().expect("push");
        let err = backend.alloc_pinned(2048, true).expect_err("over cap");
        assert!(err.is_allocation_failure());
        assert_eq!(backend.stats().live_bytes, 0);
    }

    #[test]
    fn double_free_is_reported() {
        let backend = SystemBackend::new();
        let ctx = backend.context();
        let _guard = ctx.make_current().expect("push");
        let ptr = backend.alloc_pinned(32, true).expect("alloc");
        // SAFETY: ptr came from alloc_pinned; the second free must be rejected
        // before touching memory.
        unsafe {
            backend.free_pinned(ptr).expect("first free");
            backend.free_pinned(ptr).expect_err("second free");
        }
    }

    #[test]
    fn copy_2d_strides_over_padding() {
        let backend = SystemBackend::new();
        let ctx = backend.context();
        let _guard = ctx.make_current().expect("push");
        let dev = backend.alloc_pitched(4, 2, 4).expect("alloc");
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut out = [0u8; 8];
        // SAFETY: both host arrays hold 2 rows of 4 bytes; dev has 2 rows at dev.pitch.
        unsafe {
            backend
                .copy_2d(&Copy2d {
                    src: MemRef::Host(src.as_ptr() as *mut u8),
                    src_pitch: 4,
                    dst: MemRef::Device(dev.ptr),
                    dst_pitch: dev.pitch,
                    width_bytes: 4,
                    height: 2,
                })
                .expect("upload");
            backend
                .copy_2d(&Copy2d {
                    src: MemRef::Device(dev.ptr),
                    src_pitch: dev.pitch,
                    dst: MemRef::Host(out.as_mut_ptr()),
                    dst_pitch: 4,
                    width_bytes: 4,
                    height: 2,
                })
                .expect("download");
            backend.free_pitched(dev.ptr).expect("free");
        }
        assert_eq!(out, src);
        assert_eq!(backend.stats().total_copies, 2);
    }
}
