#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod config;
pub mod context;
pub mod debug_alloc;
pub mod error;
pub mod ffi_types;
pub mod format;
pub mod plane;
pub mod surface;
pub mod system;

pub use buffer::Buffer;
pub use config::MemoryConfig;
pub use context::{DeviceContext, DevicePtr, MemoryBackend, ScopedContext};
pub use error::{MemoryError, Result};
pub use format::PixelFormat;
pub use plane::SurfacePlane;
pub use surface::{Surface, SurfaceLayout};
pub use system::SystemBackend;
