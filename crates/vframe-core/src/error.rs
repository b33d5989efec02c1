//! Typed error hierarchy for device surfaces and host buffers.
//!
//! Uses `thiserror` for library-grade errors; every fallible operation in
//! the crate returns [`Result`].
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`MemoryError::error_code`]
//! for structured telemetry without string parsing.

use crate::format::PixelFormat;

/// Which allocator could not satisfy a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocKind {
    /// Page-locked host memory (`cuMemAllocHost`).
    PinnedHost,
    /// Pitched 2D device memory (`cuMemAllocPitch`).
    PitchedDevice,
}

impl std::fmt::Display for AllocKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PinnedHost => f.write_str("pinned host"),
            Self::PitchedDevice => f.write_str("pitched device"),
        }
    }
}

/// All errors originating from the frame memory layer.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    // ── Allocation / driver ──────────────────────────────────────────
    #[error("{kind} allocation of {bytes} bytes failed: {reason}")]
    AllocationFailure {
        kind: AllocKind,
        bytes: usize,
        reason: String,
    },

    #[error("{call} failed with CUDA error {code} ({name})")]
    Cuda {
        call: &'static str,
        code: i32,
        name: String,
    },

    #[error("CUDA driver unavailable: {0}")]
    DriverUnavailable(String),

    // ── Plane / format contracts ─────────────────────────────────────
    #[error("Invalid plane number {plane} for {format:?} surface with {num_planes} plane(s)")]
    InvalidPlaneIndex {
        format: PixelFormat,
        plane: u32,
        num_planes: u32,
    },

    #[error("Unsupported pixel format value {0}")]
    UnsupportedFormat(u32),

    #[error("Invalid plane dimensions: {width}x{height} with {elem_size}-byte elements")]
    InvalidDimensions {
        width: u32,
        height: u32,
        elem_size: u32,
    },

    #[error("Geometry mismatch: {0}")]
    GeometryMismatch(String),

    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    // ── Ownership ────────────────────────────────────────────────────
    #[error("Operation requires an owning object: {0}")]
    NotOwning(&'static str),

    #[error("Plane alias outlived the plane that owns its device memory")]
    DanglingAlias,

    // ── Configuration ────────────────────────────────────────────────
    #[error("Invalid memory configuration: {0}")]
    Config(String),
}

impl MemoryError {
    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: allocation/driver
    /// - 2xx: plane and format contracts
    /// - 3xx: ownership
    /// - 4xx: configuration
    pub fn error_code(&self) -> u32 {
        match self {
            Self::AllocationFailure { .. } => 100,
            Self::Cuda { .. } => 101,
            Self::DriverUnavailable(_) => 102,
            Self::InvalidPlaneIndex { .. } => 200,
            Self::UnsupportedFormat(_) => 201,
            Self::InvalidDimensions { .. } => 202,
            Self::GeometryMismatch(_) => 203,
            Self::BufferTooSmall { .. } => 204,
            Self::NotOwning(_) => 300,
            Self::DanglingAlias => 301,
            Self::Config(_) => 400,
        }
    }

    /// Whether the caller may reasonably retry with different parameters
    /// (e.g. a smaller surface).  The core itself never retries.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, Self::AllocationFailure { .. })
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MemoryError>;
