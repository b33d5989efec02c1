//! Pinned host staging buffer.
//!
//! A [`Buffer`] either owns a page-locked host block allocated through its
//! [`DeviceContext`], or is a non-owning view over caller memory.
//!
//! # Invariants
//!
//! 1. Owning: the pointer is null iff `size == 0`; otherwise it addresses a
//!    pinned block of exactly `size` bytes, freed on drop.
//! 2. View: the pointer and size are caller-supplied and never freed here.

use std::ptr::NonNull;

use tracing::{debug, warn};

use crate::context::DeviceContext;
use crate::error::{MemoryError, Result};

enum BufferMemory {
    Owned {
        ptr: Option<NonNull<u8>>,
        ctx: DeviceContext,
    },
    View(*mut u8),
}

pub struct Buffer {
    size: usize,
    memory: BufferMemory,
    #[cfg(feature = "debug-alloc")]
    note: Option<u64>,
}

// SAFETY: an owning buffer is the sole owner of its pinned block, and a view
// is created through `unsafe` constructors whose contract makes the caller
// responsible for the memory it points at.  No interior mutability.
unsafe impl Send for Buffer {}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size)
            .field("owns_memory", &self.owns_memory())
            .field("ptr", &self.as_ptr())
            .finish()
    }
}

fn alloc_pinned(ctx: &DeviceContext, size: usize) -> Result<Option<NonNull<u8>>> {
    if size == 0 {
        return Ok(None);
    }
    let _guard = ctx.make_current()?;
    let ptr = ctx
        .backend()
        .alloc_pinned(size, ctx.config().pinned_portable)?;
    debug!(bytes = size, ptr = ?ptr, "pinned host alloc");
    Ok(Some(ptr))
}

impl Buffer {
    /// Owning buffer of `size` bytes.  Contents are unspecified.
    pub fn make(size: usize, ctx: &DeviceContext) -> Result<Self> {
        Self::make_own_mem(size, ctx)
    }

    /// Owning buffer holding a byte-for-byte copy of `source`.
    pub fn make_from(source: &[u8], ctx: &DeviceContext) -> Result<Self> {
        let mut buf = Self::make_own_mem(source.len(), ctx)?;
        buf.as_mut_slice().copy_from_slice(source);
        Ok(buf)
    }

    /// Owning, uninitialized buffer.  `size == 0` allocates nothing and
    /// leaves the pointer null.
    pub fn make_own_mem(size: usize, ctx: &DeviceContext) -> Result<Self> {
        let ptr = alloc_pinned(ctx, size)?;
        Ok(Self {
            size,
            memory: BufferMemory::Owned {
                ptr,
                ctx: ctx.clone(),
            },
            #[cfg(feature = "debug-alloc")]
            note: Some(crate::debug_alloc::buffers().register(size as u64)),
        })
    }

    /// Non-owning view over `size` bytes at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `size` bytes (or null with
    /// `size == 0`) for as long as the view is used, and must not be mutated
    /// elsewhere while borrowed through [`as_slice`](Self::as_slice).
    pub unsafe fn view(ptr: *mut u8, size: usize) -> Self {
        Self {
            size,
            memory: BufferMemory::View(ptr),
            #[cfg(feature = "debug-alloc")]
            note: None,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn owns_memory(&self) -> bool {
        matches!(self.memory, BufferMemory::Owned { .. })
    }

    /// Raw address; null for a zero-size owning buffer.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.as_mut_ptr_inner()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.as_mut_ptr_inner()
    }

    fn as_mut_ptr_inner(&self) -> *mut u8 {
        match &self.memory {
            BufferMemory::Owned { ptr, .. } => {
                ptr.map_or(std::ptr::null_mut(), |p| p.as_ptr())
            }
            BufferMemory::View(ptr) => *ptr,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        let ptr = self.as_ptr();
        if ptr.is_null() || self.size == 0 {
            return &[];
        }
        // SAFETY: invariant 1 for owned memory; the `view` contract otherwise.
        unsafe { std::slice::from_raw_parts(ptr, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let ptr = self.as_mut_ptr();
        if ptr.is_null() || self.size == 0 {
            return &mut [];
        }
        // SAFETY: invariant 1 for owned memory; the `view` contract otherwise.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.size) }
    }

    /// Release the current block, then reallocate `new_size` bytes and copy
    /// `new_size` bytes from `source` when given.
    ///
    /// If reallocation fails the buffer is left empty (size 0, null pointer).
    /// Views must use [`rebind`](Self::rebind) instead.
    pub fn update(&mut self, new_size: usize, source: Option<&[u8]>) -> Result<()> {
        if !self.owns_memory() {
            return Err(MemoryError::NotOwning("Buffer::update on a view"));
        }
        if let Some(src) = source
            && src.len() < new_size
        {
            return Err(MemoryError::BufferTooSmall {
                need: new_size,
                have: src.len(),
            });
        }

        self.deallocate();
        self.set_size(0);
        let BufferMemory::Owned { ptr, ctx } = &mut self.memory else {
            return Err(MemoryError::NotOwning("Buffer::update on a view"));
        };
        *ptr = alloc_pinned(ctx, new_size)?;
        self.set_size(new_size);
        if let Some(src) = source {
            self.as_mut_slice().copy_from_slice(&src[..new_size]);
        }
        Ok(())
    }

    /// Point a view at new caller memory.  Nothing is allocated or copied.
    ///
    /// # Safety
    /// Same contract as [`view`](Self::view) for `(new_ptr, new_size)`.
    pub unsafe fn rebind(&mut self, new_size: usize, new_ptr: *mut u8) -> Result<()> {
        match &mut self.memory {
            BufferMemory::View(ptr) => {
                *ptr = new_ptr;
                self.size = new_size;
                Ok(())
            }
            BufferMemory::Owned { .. } => {
                Err(MemoryError::NotOwning("Buffer::rebind requires a view"))
            }
        }
    }

    /// Keeps the registry note in step with the reported size.
    fn set_size(&mut self, size: usize) {
        self.size = size;
        #[cfg(feature = "debug-alloc")]
        if let Some(id) = self.note {
            crate::debug_alloc::buffers().resize(id, size as u64);
        }
    }

    /// Free the owned block, if any.  Returns `false` only when a block
    /// was present and could not be freed.
    fn deallocate(&mut self) -> bool {
        let BufferMemory::Owned { ptr, ctx } = &mut self.memory else {
            return true;
        };
        let Some(block) = ptr.take() else {
            return true;
        };
        let _guard = match ctx.make_current() {
            Ok(guard) => guard,
            Err(err) => {
                warn!(error = %err, bytes = self.size, "pinned free skipped: context push failed");
                return false;
            }
        };
        // SAFETY: block came from alloc_pinned on this context's backend and
        // has been taken out of `self`, so it cannot be freed twice.
        match unsafe { ctx.backend().free_pinned(block) } {
            Ok(()) => {
                debug!(bytes = self.size, "pinned host free");
                true
            }
            Err(err) => {
                warn!(error = %err, bytes = self.size, "pinned host free failed");
                false
            }
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let freed = self.deallocate();
        #[cfg(feature = "debug-alloc")]
        if freed && let Some(id) = self.note.take() {
            crate::debug_alloc::buffers().release(id);
        }
        #[cfg(not(feature = "debug-alloc"))]
        let _ = freed;
    }
}
