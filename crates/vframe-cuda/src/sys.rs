//! CUDA driver entry points used by the memory backend.
//!
//! On Linux every symbol is resolved once from `libcuda.so.1` via `dlopen`,
//! so building never requires the driver.  Other targets link `cuda`
//! directly (see `build.rs`).

#![allow(non_camel_case_types, non_snake_case)]

#[cfg(target_os = "linux")]
use std::ffi::{CString, c_char};
use std::ffi::{CStr, c_void};
use std::os::raw::{c_int, c_uint};
#[cfg(target_os = "linux")]
use std::sync::OnceLock;

pub use vframe_core::ffi_types::{CUDA_SUCCESS, CUcontext, CUdeviceptr, CUresult};
use vframe_core::error::{MemoryError, Result};

pub type CUdevice = c_int;
pub type CUmemorytype = c_uint;

pub const CU_MEMORYTYPE_HOST: CUmemorytype = 1;
pub const CU_MEMORYTYPE_DEVICE: CUmemorytype = 2;
pub const CU_MEMHOSTALLOC_PORTABLE: c_uint = 0x01;

/// `CUDA_MEMCPY2D` (driver API layout).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CUDA_MEMCPY2D {
    pub srcXInBytes: usize,
    pub srcY: usize,
    pub srcMemoryType: CUmemorytype,
    pub srcHost: *const c_void,
    pub srcDevice: CUdeviceptr,
    pub srcArray: *mut c_void,
    pub srcPitch: usize,

    pub dstXInBytes: usize,
    pub dstY: usize,
    pub dstMemoryType: CUmemorytype,
    pub dstHost: *mut c_void,
    pub dstDevice: CUdeviceptr,
    pub dstArray: *mut c_void,
    pub dstPitch: usize,

    pub WidthInBytes: usize,
    pub Height: usize,
}

impl Default for CUDA_MEMCPY2D {
    fn default() -> Self {
        Self {
            srcXInBytes: 0,
            srcY: 0,
            srcMemoryType: 0,
            srcHost: std::ptr::null(),
            srcDevice: 0,
            srcArray: std::ptr::null_mut(),
            srcPitch: 0,
            dstXInBytes: 0,
            dstY: 0,
            dstMemoryType: 0,
            dstHost: std::ptr::null_mut(),
            dstDevice: 0,
            dstArray: std::ptr::null_mut(),
            dstPitch: 0,
            WidthInBytes: 0,
            Height: 0,
        }
    }
}

#[cfg(target_os = "linux")]
unsafe extern "C" {
    fn dlopen(filename: *const c_char, flags: i32) -> *mut c_void;
    fn dlerror() -> *const c_char;
    fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;
}

#[cfg(target_os = "linux")]
const RTLD_NOW: i32 = 2;
#[cfg(target_os = "linux")]
const RTLD_GLOBAL: i32 = 0x100;

/// Declares every driver symbol once: the `extern "C"` block for linked
/// targets, the function-pointer table for dlopen targets, and one
/// `unsafe` wrapper per symbol returning the raw `CUresult`.
macro_rules! driver_api {
    ($(
        $(#[$doc:meta])*
        fn $sym:ident => $wrapper:ident($($arg:ident: $ty:ty),* $(,)?);
    )+) => {
        #[cfg(not(target_os = "linux"))]
        unsafe extern "C" {
            $( fn $sym($($arg: $ty),*) -> CUresult; )+
        }

        #[cfg(target_os = "linux")]
        struct CudaDriverApi {
            $( $sym: unsafe extern "C" fn($($ty),*) -> CUresult, )+
        }

        #[cfg(target_os = "linux")]
        fn resolve_symbols(handle: *mut c_void) -> std::result::Result<CudaDriverApi, String> {
            Ok(CudaDriverApi {
                $( $sym: load_cuda_symbol(handle, stringify!($sym))?, )+
            })
        }

        $(
            $(#[$doc])*
            pub unsafe fn $wrapper($($arg: $ty),*) -> Result<CUresult> {
                #[cfg(target_os = "linux")]
                {
                    let api = cuda_driver_api()?;
                    // SAFETY: function pointer was resolved from the driver with a matching signature.
                    Ok(unsafe { (api.$sym)($($arg),*) })
                }
                #[cfg(not(target_os = "linux"))]
                {
                    // SAFETY: FFI call into the CUDA driver API.
                    Ok(unsafe { $sym($($arg),*) })
                }
            }
        )+
    };
}

driver_api! {
    /// Call `cuInit`.
    ///
    /// # Safety
    /// Plain driver call; safe to repeat.
    fn cuInit => cu_init(flags: c_uint);

    /// Call `cuDeviceGet`.
    ///
    /// # Safety
    /// `device` must be valid for writes.
    fn cuDeviceGet => cu_device_get(device: *mut CUdevice, ordinal: c_int);

    /// Call `cuDevicePrimaryCtxRetain`.
    ///
    /// # Safety
    /// `pctx` must be valid for writes; every retain needs a matching release.
    fn cuDevicePrimaryCtxRetain => cu_device_primary_ctx_retain(pctx: *mut CUcontext, dev: CUdevice);

    /// Call `cuDevicePrimaryCtxRelease_v2`.
    ///
    /// # Safety
    /// `dev` must hold a primary-context reference taken by this process.
    fn cuDevicePrimaryCtxRelease_v2 => cu_device_primary_ctx_release(dev: CUdevice);

    /// Call `cuCtxPushCurrent_v2`.
    ///
    /// # Safety
    /// `ctx` must be a live context handle.
    fn cuCtxPushCurrent_v2 => cu_ctx_push_current(ctx: CUcontext);

    /// Call `cuCtxPopCurrent_v2`.
    ///
    /// # Safety
    /// `pctx` must be valid for writes.
    fn cuCtxPopCurrent_v2 => cu_ctx_pop_current(pctx: *mut CUcontext);

    /// Call `cuMemAllocPitch_v2`.
    ///
    /// # Safety
    /// Output pointers must be valid for writes; a context must be current.
    fn cuMemAllocPitch_v2 => cu_mem_alloc_pitch(
        dptr: *mut CUdeviceptr,
        pitch: *mut usize,
        width_in_bytes: usize,
        height: usize,
        element_size_bytes: c_uint,
    );

    /// Call `cuMemFree_v2`.
    ///
    /// # Safety
    /// `dptr` must come from a driver allocation that has not been freed.
    fn cuMemFree_v2 => cu_mem_free(dptr: CUdeviceptr);

    /// Call `cuMemHostAlloc`.
    ///
    /// # Safety
    /// `pp` must be valid for writes; a context must be current.
    fn cuMemHostAlloc => cu_mem_host_alloc(pp: *mut *mut c_void, bytesize: usize, flags: c_uint);

    /// Call `cuMemFreeHost`.
    ///
    /// # Safety
    /// `p` must come from `cuMemHostAlloc` and must not be freed twice.
    fn cuMemFreeHost => cu_mem_free_host(p: *mut c_void);

    /// Call `cuMemcpy2D_v2`.
    ///
    /// # Safety
    /// `copy` must describe valid, non-overlapping source and destination regions.
    fn cuMemcpy2D_v2 => cu_memcpy_2d(copy: *const CUDA_MEMCPY2D);

    /// Call `cuGetErrorName`.
    ///
    /// # Safety
    /// `pstr` must be valid for writes.
    fn cuGetErrorName => cu_get_error_name(error: CUresult, pstr: *mut *const std::ffi::c_char);
}

#[cfg(target_os = "linux")]
static CUDA_DRIVER_API: OnceLock<std::result::Result<CudaDriverApi, String>> = OnceLock::new();

#[cfg(target_os = "linux")]
fn last_dl_error(fallback: &str) -> String {
    // SAFETY: dlerror returns thread-local C string or null.
    unsafe {
        let p = dlerror();
        if p.is_null() {
            fallback.to_string()
        } else {
            CStr::from_ptr(p).to_string_lossy().to_string()
        }
    }
}

#[cfg(target_os = "linux")]
fn load_cuda_symbol<T>(handle: *mut c_void, name: &'static str) -> std::result::Result<T, String> {
    let cname = CString::new(name).map_err(|_| format!("invalid CUDA symbol name: {name}"))?;
    // SAFETY: handle is a valid dlopen handle and cname is a valid C symbol name.
    let ptr = unsafe { dlsym(handle, cname.as_ptr()) };
    if ptr.is_null() {
        Err(format!(
            "dlsym({name}) failed: {}",
            last_dl_error("unknown dlsym error")
        ))
    } else {
        // SAFETY: ptr points to a function with signature T.
        Ok(unsafe { std::mem::transmute_copy(&ptr) })
    }
}

#[cfg(target_os = "linux")]
fn init_cuda_driver_api() -> std::result::Result<CudaDriverApi, String> {
    let mut handle = std::ptr::null_mut();
    let mut last_err = "unknown dlopen error".to_string();
    for candidate in ["libcuda.so.1", "libcuda.so"] {
        let soname =
            CString::new(candidate).map_err(|_| format!("invalid CUDA soname: {candidate}"))?;
        // SAFETY: static soname and valid dlopen flags.
        handle = unsafe { dlopen(soname.as_ptr(), RTLD_NOW | RTLD_GLOBAL) };
        if !handle.is_null() {
            break;
        }
        last_err = last_dl_error("unknown dlopen error");
    }

    if handle.is_null() {
        return Err(format!(
            "dlopen(libcuda.so.1|libcuda.so) failed: {last_err}"
        ));
    }
    resolve_symbols(handle)
}

#[cfg(target_os = "linux")]
fn cuda_driver_api() -> Result<&'static CudaDriverApi> {
    let api = CUDA_DRIVER_API.get_or_init(init_cuda_driver_api);
    api.as_ref().map_err(|err| {
        MemoryError::DriverUnavailable(format!(
            "failed to load CUDA driver API: {err}. \
Ensure NVIDIA driver libraries are installed and visible via LD_LIBRARY_PATH \
(on WSL, prepend /usr/lib/wsl/lib)."
        ))
    })
}

pub fn error_name(result: CUresult) -> String {
    let mut name: *const std::ffi::c_char = std::ptr::null();
    // SAFETY: `name` is a valid out-pointer; the driver returns a static string.
    let rc = unsafe { cu_get_error_name(result, &mut name) };
    match rc {
        Ok(CUDA_SUCCESS) if !name.is_null() => {
            // SAFETY: non-null pointer to a static NUL-terminated driver string.
            unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
        }
        _ => format!("CUDA_ERROR_{result}"),
    }
}

#[inline]
pub fn check_cu(result: CUresult, call: &'static str) -> Result<()> {
    if result == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(MemoryError::Cuda {
            call,
            code: result,
            name: error_name(result),
        })
    }
}
