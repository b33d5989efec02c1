//! Driver-shaped handle types shared by the core and every backend.
//!
//! The core never calls into the CUDA driver itself; these aliases only keep
//! the raw representations identical across the backend seam.

#![allow(non_camel_case_types)]

use std::ffi::c_void;
use std::os::raw::{c_int, c_ulonglong};

/// CUDA result code.
pub type CUresult = c_int;
pub const CUDA_SUCCESS: CUresult = 0;

/// CUDA device pointer (64-bit).
pub type CUdeviceptr = c_ulonglong;

/// CUDA context handle.
pub type CUcontext = *mut c_void;

/// Opaque device context handle carried by a [`DeviceContext`](crate::context::DeviceContext).
///
/// Stored as an integer so the token stays `Send + Sync`; backends convert
/// back to their native handle type at the FFI boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub usize);

impl ContextHandle {
    /// The "no context" handle.
    pub const NULL: Self = Self(0);

    #[inline]
    pub fn from_raw(ctx: CUcontext) -> Self {
        Self(ctx as usize)
    }

    #[inline]
    pub fn as_raw(self) -> CUcontext {
        self.0 as CUcontext
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}
