//! [`MemoryBackend`] over the CUDA driver API.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use vframe_core::config::MemoryConfig;
use vframe_core::context::{Copy2d, DeviceContext, DevicePtr, MemRef, MemoryBackend, PitchedAllocation};
use vframe_core::error::{AllocKind, MemoryError, Result};
use vframe_core::ffi_types::ContextHandle;

use crate::sys::{self, CUDA_MEMCPY2D, CUDA_SUCCESS, CUcontext, CUdevice, check_cu};

/// CUDA driver allocator.
///
/// Primary contexts handed out by [`primary_context`](Self::primary_context)
/// are retained for the backend's lifetime and released when it drops.
/// Every [`DeviceContext`] holds an `Arc` to the backend, so that happens
/// only after the last context token is gone.
pub struct CudaBackend {
    retained: Mutex<Vec<CUdevice>>,
}

impl CudaBackend {
    /// Load the driver and run `cuInit(0)`.
    pub fn new() -> Result<Arc<Self>> {
        // SAFETY: plain driver initialization.
        check_cu(unsafe { sys::cu_init(0)? }, "cuInit")?;
        Ok(Arc::new(Self {
            retained: Mutex::new(Vec::new()),
        }))
    }

    /// Retain the primary context of device `ordinal` and wrap it in a
    /// [`DeviceContext`] with the default [`MemoryConfig`].
    pub fn primary_context(self: &Arc<Self>, ordinal: i32) -> Result<DeviceContext> {
        self.primary_context_with_config(ordinal, MemoryConfig::default())
    }

    pub fn primary_context_with_config(
        self: &Arc<Self>,
        ordinal: i32,
        config: MemoryConfig,
    ) -> Result<DeviceContext> {
        config.validate()?;
        let mut device: CUdevice = 0;
        // SAFETY: `device` is a valid out-pointer.
        check_cu(unsafe { sys::cu_device_get(&mut device, ordinal)? }, "cuDeviceGet")?;
        let mut ctx: CUcontext = std::ptr::null_mut();
        // SAFETY: `ctx` is a valid out-pointer; released in Drop.
        check_cu(
            unsafe { sys::cu_device_primary_ctx_retain(&mut ctx, device)? },
            "cuDevicePrimaryCtxRetain",
        )?;
        self.retained_devices().push(device);
        info!(ordinal, device, ctx = ?ctx, "CUDA primary context retained");
        DeviceContext::with_config(ContextHandle::from_raw(ctx), self.clone(), config)
    }

    fn retained_devices(&self) -> std::sync::MutexGuard<'_, Vec<CUdevice>> {
        self.retained
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for CudaBackend {
    fn drop(&mut self) {
        for device in self.retained_devices().drain(..) {
            // SAFETY: each entry records one successful primary-context retain.
            match unsafe { sys::cu_device_primary_ctx_release(device) } {
                Ok(CUDA_SUCCESS) => debug!(device, "CUDA primary context released"),
                Ok(rc) => warn!(device, rc, "cuDevicePrimaryCtxRelease failed"),
                Err(err) => warn!(device, error = %err, "cuDevicePrimaryCtxRelease skipped"),
            }
        }
    }
}

fn alloc_failure(kind: AllocKind, bytes: usize, call: &'static str, rc: i32) -> MemoryError {
    MemoryError::AllocationFailure {
        kind,
        bytes,
        reason: format!("{call} returned {} ({rc})", sys::error_name(rc)),
    }
}

impl MemoryBackend for CudaBackend {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn push_context(&self, ctx: ContextHandle) -> Result<()> {
        // SAFETY: handles come from `primary_context`, retained while `self` lives.
        check_cu(unsafe { sys::cu_ctx_push_current(ctx.as_raw())? }, "cuCtxPushCurrent_v2")
    }

    fn pop_context(&self) -> Result<ContextHandle> {
        let mut ctx: CUcontext = std::ptr::null_mut();
        // SAFETY: `ctx` is a valid out-pointer.
        check_cu(unsafe { sys::cu_ctx_pop_current(&mut ctx)? }, "cuCtxPopCurrent_v2")?;
        Ok(ContextHandle::from_raw(ctx))
    }

    fn alloc_pitched(
        &self,
        width_bytes: usize,
        height: usize,
        element_bytes: u32,
    ) -> Result<PitchedAllocation> {
        let mut ptr: DevicePtr = 0;
        let mut pitch: usize = 0;
        // SAFETY: out-pointers are valid; the caller holds a ScopedContext.
        let rc = unsafe {
            sys::cu_mem_alloc_pitch(&mut ptr, &mut pitch, width_bytes, height, element_bytes)?
        };
        if rc != CUDA_SUCCESS {
            return Err(alloc_failure(
                AllocKind::PitchedDevice,
                width_bytes.saturating_mul(height),
                "cuMemAllocPitch_v2",
                rc,
            ));
        }
        Ok(PitchedAllocation { ptr, pitch })
    }

    unsafe fn free_pitched(&self, ptr: DevicePtr) -> Result<()> {
        // SAFETY: caller guarantees `ptr` came from `alloc_pitched`.
        check_cu(unsafe { sys::cu_mem_free(ptr)? }, "cuMemFree_v2")
    }

    fn alloc_pinned(&self, size: usize, portable: bool) -> Result<NonNull<u8>> {
        let flags = if portable {
            sys::CU_MEMHOSTALLOC_PORTABLE
        } else {
            0
        };
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // SAFETY: `ptr` is a valid out-pointer; the caller holds a ScopedContext.
        let rc = unsafe { sys::cu_mem_host_alloc(&mut ptr, size, flags)? };
        if rc != CUDA_SUCCESS {
            return Err(alloc_failure(AllocKind::PinnedHost, size, "cuMemHostAlloc", rc));
        }
        NonNull::new(ptr.cast::<u8>()).ok_or(MemoryError::AllocationFailure {
            kind: AllocKind::PinnedHost,
            bytes: size,
            reason: "cuMemHostAlloc returned a null pointer".into(),
        })
    }

    unsafe fn free_pinned(&self, ptr: NonNull<u8>) -> Result<()> {
        // SAFETY: caller guarantees `ptr` came from `alloc_pinned`.
        check_cu(
            unsafe { sys::cu_mem_free_host(ptr.as_ptr().cast())? },
            "cuMemFreeHost",
        )
    }

    unsafe fn copy_2d(&self, copy: &Copy2d) -> Result<()> {
        let params = memcpy2d_params(copy);
        // SAFETY: caller guarantees both regions are valid and disjoint.
        check_cu(unsafe { sys::cu_memcpy_2d(&params)? }, "cuMemcpy2D_v2")
    }
}

fn memcpy2d_params(copy: &Copy2d) -> CUDA_MEMCPY2D {
    let mut params = CUDA_MEMCPY2D {
        srcPitch: copy.src_pitch,
        dstPitch: copy.dst_pitch,
        WidthInBytes: copy.width_bytes,
        Height: copy.height,
        ..CUDA_MEMCPY2D::default()
    };
    match copy.src {
        MemRef::Host(ptr) => {
            params.srcMemoryType = sys::CU_MEMORYTYPE_HOST;
            params.srcHost = ptr.cast_const().cast();
        }
        MemRef::Device(ptr) => {
            params.srcMemoryType = sys::CU_MEMORYTYPE_DEVICE;
            params.srcDevice = ptr;
        }
    }
    match copy.dst {
        MemRef::Host(ptr) => {
            params.dstMemoryType = sys::CU_MEMORYTYPE_HOST;
            params.dstHost = ptr.cast();
        }
        MemRef::Device(ptr) => {
            params.dstMemoryType = sys::CU_MEMORYTYPE_DEVICE;
            params.dstDevice = ptr;
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memcpy2d_params_tag_each_endpoint() {
        let mut host = [0u8; 64];
        let params = memcpy2d_params(&Copy2d {
            src: MemRef::Device(0x1000),
            src_pitch: 512,
            dst: MemRef::Host(host.as_mut_ptr()),
            dst_pitch: 64,
            width_bytes: 64,
            height: 1,
        });
        assert_eq!(params.srcMemoryType, sys::CU_MEMORYTYPE_DEVICE);
        assert_eq!(params.srcDevice, 0x1000);
        assert!(params.srcHost.is_null());
        assert_eq!(params.dstMemoryType, sys::CU_MEMORYTYPE_HOST);
        assert_eq!(params.dstHost, host.as_mut_ptr().cast::<c_void>());
        assert_eq!(params.srcPitch, 512);
        assert_eq!(params.WidthInBytes, 64);
    }
}
