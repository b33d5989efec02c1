//! Device context token and the allocator seam every backend implements.
//!
//! # Scoped context
//!
//! Every device allocate/free/copy runs inside a [`ScopedContext`]: the
//! caller's context is pushed when the guard is created and popped when it
//! drops, so the previously current context is restored on every exit path,
//! including `?` early returns.
//!
//! ```text
//! DeviceContext::make_current() ──▸ push_context(handle)
//!            │
//!   alloc_pitched / free_pitched / copy_2d
//!            │
//! ScopedContext::drop() ──────────▸ pop_context()
//! ```

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::warn;

use crate::config::MemoryConfig;
use crate::error::Result;
use crate::ffi_types::{CUdeviceptr, ContextHandle};

/// Raw device address.  `0` is the null device pointer.
pub type DevicePtr = CUdeviceptr;

/// Result of a pitched 2D allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PitchedAllocation {
    pub ptr: DevicePtr,
    /// Allocator-chosen row stride in bytes, `>=` the requested row width.
    pub pitch: usize,
}

/// One endpoint of a 2D copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemRef {
    Host(*mut u8),
    Device(DevicePtr),
}

/// 2D copy descriptor (mirrors `CUDA_MEMCPY2D`, minus array endpoints).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Copy2d {
    pub src: MemRef,
    pub src_pitch: usize,
    pub dst: MemRef,
    pub dst_pitch: usize,
    pub width_bytes: usize,
    pub height: usize,
}

/// Allocator + context provider for one device API.
///
/// Implementations are synchronous relative to the calling thread.  The core
/// brackets every call with [`ScopedContext`], so backends may assume the
/// target context is current inside `alloc_*`, `free_*` and `copy_2d`.
pub trait MemoryBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Make `ctx` current for the calling thread, remembering the previous one.
    fn push_context(&self, ctx: ContextHandle) -> Result<()>;

    /// Restore the context that was current before the matching push.
    fn pop_context(&self) -> Result<ContextHandle>;

    /// Allocate `height` rows of at least `width_bytes` bytes each.
    fn alloc_pitched(
        &self,
        width_bytes: usize,
        height: usize,
        element_bytes: u32,
    ) -> Result<PitchedAllocation>;

    /// Release a block returned by [`alloc_pitched`](Self::alloc_pitched).
    ///
    /// # Safety
    /// `ptr` must come from `alloc_pitched` on this backend and must not be
    /// used again afterwards.
    unsafe fn free_pitched(&self, ptr: DevicePtr) -> Result<()>;

    /// Allocate `size > 0` bytes of page-locked host memory.
    fn alloc_pinned(&self, size: usize, portable: bool) -> Result<NonNull<u8>>;

    /// Release a block returned by [`alloc_pinned`](Self::alloc_pinned).
    ///
    /// # Safety
    /// `ptr` must come from `alloc_pinned` on this backend and must not be
    /// used again afterwards.
    unsafe fn free_pinned(&self, ptr: NonNull<u8>) -> Result<()>;

    /// Synchronous 2D copy between host and/or device memory.
    ///
    /// # Safety
    /// Both endpoints must be valid for `height` rows of `width_bytes`
    /// bytes at their respective pitches, and must not overlap.
    unsafe fn copy_2d(&self, copy: &Copy2d) -> Result<()>;
}

/// Caller-supplied "allocate against this device" token.
///
/// Cheap to clone: the backend and config are shared.
#[derive(Clone)]
pub struct DeviceContext {
    handle: ContextHandle,
    backend: Arc<dyn MemoryBackend>,
    config: Arc<MemoryConfig>,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("handle", &self.handle)
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl DeviceContext {
    pub fn new(handle: ContextHandle, backend: Arc<dyn MemoryBackend>) -> Self {
        Self {
            handle,
            backend,
            config: Arc::new(MemoryConfig::default()),
        }
    }

    pub fn with_config(
        handle: ContextHandle,
        backend: Arc<dyn MemoryBackend>,
        config: MemoryConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            handle,
            backend,
            config: Arc::new(config),
        })
    }

    pub(crate) fn from_validated(
        handle: ContextHandle,
        backend: Arc<dyn MemoryBackend>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            handle,
            backend,
            config: Arc::new(config),
        }
    }

    #[inline]
    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    #[inline]
    pub fn backend(&self) -> &dyn MemoryBackend {
        self.backend.as_ref()
    }

    #[inline]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Push this context; it is popped again when the guard drops.
    pub fn make_current(&self) -> Result<ScopedContext<'_>> {
        ScopedContext::push(self.backend.as_ref(), self.handle)
    }
}

/// Restores the previously current context when dropped.
#[must_use = "the context is popped as soon as the guard is dropped"]
pub struct ScopedContext<'a> {
    backend: &'a dyn MemoryBackend,
    handle: ContextHandle,
}

impl<'a> ScopedContext<'a> {
    pub fn push(backend: &'a dyn MemoryBackend, handle: ContextHandle) -> Result<Self> {
        backend.push_context(handle)?;
        Ok(Self { backend, handle })
    }
}

impl Drop for ScopedContext<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.backend.pop_context() {
            warn!(
                backend = self.backend.name(),
                ctx = self.handle.0,
                error = %err,
                "context restore failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use crate::system::SystemBackend;

    fn failing_push() -> Result<()> {
        Err(MemoryError::GeometryMismatch("forced".into()))
    }

    #[test]
    fn guard_restores_previous_context() {
        let backend = SystemBackend::new();
        let ctx = backend.context();
        assert_eq!(backend.current_context(), None);
        {
            let _guard = ctx.make_current().expect("push");
            assert_eq!(backend.current_context(), Some(ctx.handle()));
        }
        assert_eq!(backend.current_context(), None);
    }

    #[test]
    fn guard_restores_on_early_error_return() {
        let backend = SystemBackend::new();
        let ctx = backend.context();
        let run = || -> Result<()> {
            let _guard = ctx.make_current()?;
            failing_push()?;
            Ok(())
        };
        run().expect_err("inner step fails");
        assert_eq!(backend.current_context(), None);
        assert_eq!(backend.context_depth(), 0);
    }

    #[test]
    fn nested_guards_unwind_in_order() {
        let backend = SystemBackend::new();
        let outer = backend.context();
        let inner = backend.context_with_handle(ContextHandle(0xbeef));
        let _a = outer.make_current().expect("outer push");
        {
            let _b = inner.make_current().expect("inner push");
            assert_eq!(backend.current_context(), Some(ContextHandle(0xbeef)));
        }
        assert_eq!(backend.current_context(), Some(outer.handle()));
    }

    #[test]
    fn with_config_validates() {
        let backend = SystemBackend::new();
        let cfg = MemoryConfig {
            pitch_element_bytes: 5,
            ..MemoryConfig::default()
        };
        let err = DeviceContext::with_config(backend.context().handle(), backend, cfg)
            .expect_err("invalid config must be rejected");
        assert!(matches!(err, MemoryError::Config(_)));
    }
}
