//! Single pitched 2D device allocation.
//!
//! # Ownership model
//!
//! A [`SurfacePlane`] is in exactly one of four states:
//!
//! | state        | frees on drop | created by                         |
//! |--------------|---------------|------------------------------------|
//! | unallocated  | no            | [`SurfacePlane::empty`]            |
//! | owned        | yes           | [`SurfacePlane::new`]              |
//! | alias        | no            | [`SurfacePlane::alias`]            |
//! | external     | no            | [`SurfacePlane::from_raw`]         |
//!
//! `SurfacePlane` does not implement `Clone`: duplicating a
//! plane is either an explicit [`alias`](SurfacePlane::alias) (shares the
//! device pointer, never owns it) or an explicit
//! [`deep_copy`](SurfacePlane::deep_copy) (fresh allocation + D2D copy).
//!
//! An alias holds a weak link to the owner's block.  It keeps reporting the
//! raw address after the owner is gone, but every copy through it fails
//! with [`MemoryError::DanglingAlias`] instead of touching freed memory.
//!
//! # Pitch
//!
//! Row `r` starts at `device_ptr() + r * pitch()`.  `pitch()` is chosen by
//! the allocator and is `>= width_in_bytes()`; never substitute
//! `width * elem_size` for it when addressing device rows.

use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::context::{Copy2d, DeviceContext, DevicePtr, MemRef};
use crate::error::{MemoryError, Result};

/// Owned pitched block; freed under its context when the last strong
/// reference (the owning plane) goes away.
struct DeviceBlock {
    ptr: DevicePtr,
    bytes: usize,
    ctx: DeviceContext,
    #[cfg(feature = "debug-alloc")]
    note: u64,
}

impl DeviceBlock {
    /// Free under the owning context.  Returns `false` if the block leaked.
    fn free(&self) -> bool {
        let _guard = match self.ctx.make_current() {
            Ok(guard) => guard,
            Err(err) => {
                warn!(ptr = self.ptr, error = %err, "device free skipped: context push failed");
                return false;
            }
        };
        // SAFETY: ptr came from alloc_pitched on this backend; the block is
        // only dropped once.
        match unsafe { self.ctx.backend().free_pitched(self.ptr) } {
            Ok(()) => {
                debug!(ptr = self.ptr, bytes = self.bytes, "pitched device free");
                true
            }
            Err(err) => {
                warn!(ptr = self.ptr, error = %err, "pitched device free failed");
                false
            }
        }
    }
}

impl Drop for DeviceBlock {
    fn drop(&mut self) {
        let freed = self.free();
        // A block that could not be freed stays in the leak report.
        #[cfg(feature = "debug-alloc")]
        if freed {
            crate::debug_alloc::surfaces().release(self.note);
        }
        #[cfg(not(feature = "debug-alloc"))]
        let _ = freed;
    }
}

enum PlaneMemory {
    Unallocated,
    Owned(Arc<DeviceBlock>),
    Alias {
        ptr: DevicePtr,
        owner: Weak<DeviceBlock>,
    },
    External(DevicePtr),
}

/// Keeps an owner's block alive for the duration of one copy.
struct LivePtr {
    ptr: DevicePtr,
    _hold: Option<Arc<DeviceBlock>>,
}

pub struct SurfacePlane {
    memory: PlaneMemory,
    width: u32,
    height: u32,
    pitch: usize,
    elem_size: u32,
}

impl Default for SurfacePlane {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for SurfacePlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfacePlane")
            .field("ptr", &format_args!("{:#x}", self.device_ptr()))
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pitch", &self.pitch)
            .field("elem_size", &self.elem_size)
            .field("owns_memory", &self.owns_memory())
            .finish()
    }
}

impl SurfacePlane {
    /// Unallocated plane with all-zero geometry.
    pub const fn empty() -> Self {
        Self {
            memory: PlaneMemory::Unallocated,
            width: 0,
            height: 0,
            pitch: 0,
            elem_size: 0,
        }
    }

    /// Allocate a pitched block of `height` rows, each fitting
    /// `width * elem_size` bytes, under `ctx`.
    pub fn new(width: u32, height: u32, elem_size: u32, ctx: &DeviceContext) -> Result<Self> {
        let width_bytes = (width as usize)
            .checked_mul(elem_size as usize)
            .filter(|bytes| *bytes > 0 && height > 0)
            .ok_or(MemoryError::InvalidDimensions {
                width,
                height,
                elem_size,
            })?;

        let alloc = {
            let _guard = ctx.make_current()?;
            ctx.backend().alloc_pitched(
                width_bytes,
                height as usize,
                ctx.config().pitch_element_bytes,
            )?
        };
        let bytes = alloc.pitch.saturating_mul(height as usize);
        let block = Arc::new(DeviceBlock {
            ptr: alloc.ptr,
            bytes,
            ctx: ctx.clone(),
            #[cfg(feature = "debug-alloc")]
            note: crate::debug_alloc::surfaces().register(bytes as u64),
        });
        if alloc.pitch < width_bytes {
            // Dropping the block frees it again.
            return Err(MemoryError::GeometryMismatch(format!(
                "{} returned pitch {} for {width_bytes}-byte rows",
                ctx.backend().name(),
                alloc.pitch
            )));
        }
        debug!(
            width,
            height,
            elem_size,
            pitch = alloc.pitch,
            ptr = alloc.ptr,
            "pitched device alloc"
        );

        Ok(Self {
            memory: PlaneMemory::Owned(block),
            width,
            height,
            pitch: alloc.pitch,
            elem_size,
        })
    }

    /// Non-owning plane over externally owned device memory.
    ///
    /// # Safety
    /// `ptr` must address `height` rows of `pitch` bytes on the device that
    /// later copies run against, and must stay allocated for as long as this
    /// plane (or any alias of it) is used for copies.
    pub unsafe fn from_raw(
        width: u32,
        height: u32,
        pitch: usize,
        elem_size: u32,
        ptr: DevicePtr,
    ) -> Self {
        Self {
            memory: PlaneMemory::External(ptr),
            width,
            height,
            pitch,
            elem_size,
        }
    }

    /// Non-owning view of the same device memory and geometry.
    pub fn alias(&self) -> Self {
        let memory = match &self.memory {
            PlaneMemory::Unallocated => PlaneMemory::Unallocated,
            PlaneMemory::Owned(block) => PlaneMemory::Alias {
                ptr: block.ptr,
                owner: Arc::downgrade(block),
            },
            PlaneMemory::Alias { ptr, owner } => PlaneMemory::Alias {
                ptr: *ptr,
                owner: owner.clone(),
            },
            PlaneMemory::External(ptr) => PlaneMemory::External(*ptr),
        };
        Self {
            memory,
            width: self.width,
            height: self.height,
            pitch: self.pitch,
            elem_size: self.elem_size,
        }
    }

    /// Independent plane: fresh allocation under `ctx` plus a D2D copy.
    /// An unallocated plane copies to another unallocated plane.
    pub fn deep_copy(&self, ctx: &DeviceContext) -> Result<Self> {
        if !self.is_allocated() {
            return Ok(Self::empty());
        }
        let mut copy = Self::new(self.width, self.height, self.elem_size, ctx)?;
        copy.copy_from(ctx, self)?;
        Ok(copy)
    }

    #[inline]
    pub fn owns_memory(&self) -> bool {
        matches!(self.memory, PlaneMemory::Owned(_))
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        !matches!(self.memory, PlaneMemory::Unallocated)
    }

    /// `true` for an alias whose owning plane has been dropped.
    pub fn is_dangling(&self) -> bool {
        match &self.memory {
            PlaneMemory::Alias { owner, .. } => owner.strong_count() == 0,
            _ => false,
        }
    }

    /// Base device address (`0` when unallocated).
    #[inline]
    pub fn device_ptr(&self) -> DevicePtr {
        match &self.memory {
            PlaneMemory::Unallocated => 0,
            PlaneMemory::Owned(block) => block.ptr,
            PlaneMemory::Alias { ptr, .. } | PlaneMemory::External(ptr) => *ptr,
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    #[inline]
    pub fn elem_size(&self) -> u32 {
        self.elem_size
    }

    #[inline]
    pub fn width_in_bytes(&self) -> usize {
        self.width as usize * self.elem_size as usize
    }

    /// Logical, pitch-independent byte count needed to stage this plane to
    /// or from host memory.
    #[inline]
    pub fn host_mem_size(&self) -> usize {
        self.height as usize * self.elem_size as usize * self.width as usize
    }

    /// Context the block was allocated under (owned planes only).
    pub fn context(&self) -> Option<&DeviceContext> {
        match &self.memory {
            PlaneMemory::Owned(block) => Some(&block.ctx),
            _ => None,
        }
    }

    fn live_ptr(&self) -> Result<LivePtr> {
        match &self.memory {
            PlaneMemory::Unallocated => Err(MemoryError::GeometryMismatch(
                "plane is not allocated".into(),
            )),
            PlaneMemory::Owned(block) => Ok(LivePtr {
                ptr: block.ptr,
                _hold: Some(block.clone()),
            }),
            PlaneMemory::Alias { ptr, owner } => {
                let hold = owner.upgrade().ok_or(MemoryError::DanglingAlias)?;
                Ok(LivePtr {
                    ptr: *ptr,
                    _hold: Some(hold),
                })
            }
            PlaneMemory::External(ptr) => Ok(LivePtr {
                ptr: *ptr,
                _hold: None,
            }),
        }
    }

    /// Pack the plane row by row into `dst[..host_mem_size()]`, striding
    /// over device pitch padding.
    pub fn download(&self, ctx: &DeviceContext, dst: &mut [u8]) -> Result<()> {
        let need = self.host_mem_size();
        if dst.len() < need {
            return Err(MemoryError::BufferTooSmall {
                need,
                have: dst.len(),
            });
        }
        let src = self.live_ptr()?;
        let _guard = ctx.make_current()?;
        // SAFETY: `src` is live for `height` rows at `pitch`; `dst` holds at
        // least `height * width_in_bytes` bytes.
        unsafe {
            ctx.backend().copy_2d(&Copy2d {
                src: MemRef::Device(src.ptr),
                src_pitch: self.pitch,
                dst: MemRef::Host(dst.as_mut_ptr()),
                dst_pitch: self.width_in_bytes(),
                width_bytes: self.width_in_bytes(),
                height: self.height as usize,
            })
        }
    }

    /// Unpack `src[..host_mem_size()]` (tightly packed rows) into the plane.
    pub fn upload(&mut self, ctx: &DeviceContext, src: &[u8]) -> Result<()> {
        let need = self.host_mem_size();
        if src.len() < need {
            return Err(MemoryError::BufferTooSmall {
                need,
                have: src.len(),
            });
        }
        let dst = self.live_ptr()?;
        let _guard = ctx.make_current()?;
        // SAFETY: `dst` is live for `height` rows at `pitch`; `src` holds at
        // least `height * width_in_bytes` bytes and is only read.
        unsafe {
            ctx.backend().copy_2d(&Copy2d {
                src: MemRef::Host(src.as_ptr() as *mut u8),
                src_pitch: self.width_in_bytes(),
                dst: MemRef::Device(dst.ptr),
                dst_pitch: self.pitch,
                width_bytes: self.width_in_bytes(),
                height: self.height as usize,
            })
        }
    }

    /// Device-to-device copy of `src` into this plane.  Logical geometry
    /// must match; pitches may differ.
    pub fn copy_from(&mut self, ctx: &DeviceContext, src: &SurfacePlane) -> Result<()> {
        if (self.width, self.height, self.elem_size) != (src.width, src.height, src.elem_size) {
            return Err(MemoryError::GeometryMismatch(format!(
                "copy {}x{}x{} into {}x{}x{}",
                src.width, src.height, src.elem_size, self.width, self.height, self.elem_size
            )));
        }
        let from = src.live_ptr()?;
        let to = self.live_ptr()?;
        if from.ptr == to.ptr {
            return Ok(());
        }
        let _guard = ctx.make_current()?;
        // SAFETY: both planes are live with identical logical geometry and
        // distinct base pointers.
        unsafe {
            ctx.backend().copy_2d(&Copy2d {
                src: MemRef::Device(from.ptr),
                src_pitch: src.pitch,
                dst: MemRef::Device(to.ptr),
                dst_pitch: self.pitch,
                width_bytes: self.width_in_bytes(),
                height: self.height as usize,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::system::SystemBackend;

    #[test]
    fn owning_plane_uses_allocator_pitch() {
        let backend = SystemBackend::new();
        let plane = SurfacePlane::new(100, 10, 1, &backend.context()).expect("alloc");
        assert!(plane.owns_memory());
        assert_eq!(plane.pitch(), 256);
        assert!(plane.pitch() >= plane.width_in_bytes());
        assert_eq!(plane.host_mem_size(), 1000);
        assert_ne!(plane.device_ptr(), 0);
        assert_eq!(backend.context_depth(), 0);
        drop(plane);
        assert_eq!(backend.stats().live_pitched, 0);
    }

    #[test]
    fn allocation_failure_is_surfaced() {
        let backend = SystemBackend::with_config(MemoryConfig {
            host_capacity_bytes: Some(4096),
            ..MemoryConfig::default()
        })
        .expect("valid config");
        let err = SurfacePlane::new(1920, 1080, 1, &backend.context())
            .expect_err("request exceeds backend capacity");
        assert!(err.is_allocation_failure());
        assert_eq!(backend.context_depth(), 0);
    }

    #[test]
    fn zero_area_is_rejected() {
        let backend = SystemBackend::new();
        let err = SurfacePlane::new(0, 16, 1, &backend.context()).expect_err("zero width");
        assert!(matches!(err, MemoryError::InvalidDimensions { width: 0, .. }));
        assert_eq!(backend.stats().total_allocs, 0);
    }

    #[test]
    fn alias_shares_pointer_without_owning() {
        let backend = SystemBackend::new();
        let owner = SurfacePlane::new(64, 8, 1, &backend.context()).expect("alloc");
        let alias = owner.alias();
        assert!(!alias.owns_memory());
        assert_eq!(alias.device_ptr(), owner.device_ptr());
        assert_eq!(alias.pitch(), owner.pitch());
        drop(alias);
        assert_eq!(backend.stats().live_pitched, 1);
        drop(owner);
        assert_eq!(backend.stats().live_pitched, 0);
    }

    #[test]
    fn dangling_alias_refuses_copies() {
        let backend = SystemBackend::new();
        let ctx = backend.context();
        let owner = SurfacePlane::new(16, 4, 1, &ctx).expect("alloc");
        let alias = owner.alias();
        let ptr = owner.device_ptr();
        drop(owner);
        assert!(alias.is_dangling());
        assert_eq!(alias.device_ptr(), ptr);
        let mut out = vec![0u8; alias.host_mem_size()];
        let err = alias.download(&ctx, &mut out).expect_err("owner is gone");
        assert!(matches!(err, MemoryError::DanglingAlias));
    }

    #[test]
    fn upload_download_strides_over_pitch() {
        let backend = SystemBackend::new();
        let ctx = backend.context();
        let mut plane = SurfacePlane::new(5, 3, 2, &ctx).expect("alloc");
        let src: Vec<u8> = (0..30).collect();
        plane.upload(&ctx, &src).expect("upload");
        let mut out = vec![0u8; 30];
        plane.download(&ctx, &mut out).expect("download");
        assert_eq!(out, src);
    }

    #[test]
    fn deep_copy_is_independent() {
        let backend = SystemBackend::new();
        let ctx = backend.context();
        let mut plane = SurfacePlane::new(8, 2, 1, &ctx).expect("alloc");
        plane.upload(&ctx, &[3u8; 16]).expect("upload");
        let copy = plane.deep_copy(&ctx).expect("deep copy");
        assert!(copy.owns_memory());
        assert_ne!(copy.device_ptr(), plane.device_ptr());
        drop(plane);
        let mut out = [0u8; 16];
        copy.download(&ctx, &mut out).expect("download");
        assert_eq!(out, [3u8; 16]);
    }

    #[test]
    fn external_plane_is_never_freed() {
        let backend = SystemBackend::new();
        let ctx = backend.context();
        let owner = SurfacePlane::new(32, 2, 1, &ctx).expect("alloc");
        // SAFETY: `owner` outlives `external`.
        let external = unsafe {
            SurfacePlane::from_raw(32, 2, owner.pitch(), 1, owner.device_ptr())
        };
        assert!(!external.owns_memory());
        drop(external);
        assert_eq!(backend.stats().live_pitched, 1);
    }

    #[test]
    fn empty_plane_reports_zero_geometry() {
        let plane = SurfacePlane::empty();
        assert_eq!(
            (plane.width(), plane.height(), plane.pitch(), plane.device_ptr()),
            (0, 0, 0, 0)
        );
        assert_eq!(plane.host_mem_size(), 0);
        assert!(!plane.is_allocated());
    }
}
