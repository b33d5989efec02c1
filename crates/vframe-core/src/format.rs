//! Pixel formats with a surface layout.
//!
//! Every variant documents its physical allocation and the logical planes it
//! exposes, so surface geometry is deterministic and auditable.

use crate::error::{MemoryError, Result};

/// Raw format values as used across the codec boundary.
pub mod raw {
    pub const UNDEFINED: u32 = 0;
    pub const Y: u32 = 1;
    pub const RGB: u32 = 2;
    pub const NV12: u32 = 3;
    pub const YUV420: u32 = 4;
    pub const RGB_PLANAR: u32 = 5;
    pub const BGR: u32 = 6;
    pub const YCBCR: u32 = 7;
    pub const YUV444: u32 = 8;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// **Monochrome.**
    /// One `width × height` plane, 1 byte per pixel.
    Y,

    /// **NVDEC native output.**
    /// One physical `width × (height × 3 / 2)` plane: luma rows on top,
    /// interleaved Cb Cr rows (sub-sampled 2×2) directly below at the same pitch.
    Nv12,

    /// **Planar 4:2:0.**
    /// Three independent allocations: luma `width × height`, then U and V
    /// at `width / 2 × height / 2`.
    Yuv420,

    /// **Interleaved uint8 RGB.**
    /// One `(width × 3) × height` plane: `[R G B R G B ...]` per row.
    Rgb,

    /// **Planar uint8 RGB.**
    /// One physical `width × (height × 3)` plane: R, G and B planes stacked
    /// vertically at a shared pitch.
    RgbPlanar,
}

impl PixelFormat {
    pub const ALL: [Self; 5] = [Self::Y, Self::Nv12, Self::Yuv420, Self::Rgb, Self::RgbPlanar];

    /// Number of addressable plane indices.
    #[inline]
    pub const fn num_planes(self) -> u32 {
        match self {
            Self::Y | Self::Rgb | Self::RgbPlanar => 1,
            Self::Nv12 => 2,
            Self::Yuv420 => 3,
        }
    }

    /// Number of separately allocated device blocks.
    #[inline]
    pub const fn num_allocations(self) -> usize {
        match self {
            Self::Yuv420 => 3,
            Self::Y | Self::Nv12 | Self::Rgb | Self::RgbPlanar => 1,
        }
    }

    /// Bytes per plane element.  Every supported layout is 8-bit.
    #[inline]
    pub const fn elem_size(self) -> u32 {
        1
    }

    #[inline]
    pub const fn to_raw(self) -> u32 {
        match self {
            Self::Y => raw::Y,
            Self::Rgb => raw::RGB,
            Self::Nv12 => raw::NV12,
            Self::Yuv420 => raw::YUV420,
            Self::RgbPlanar => raw::RGB_PLANAR,
        }
    }

    /// `None` for values without a surface layout (including known formats
    /// such as BGR or YUV444).
    #[inline]
    pub const fn from_raw(value: u32) -> Option<Self> {
        match value {
            raw::Y => Some(Self::Y),
            raw::RGB => Some(Self::Rgb),
            raw::NV12 => Some(Self::Nv12),
            raw::YUV420 => Some(Self::Yuv420),
            raw::RGB_PLANAR => Some(Self::RgbPlanar),
            _ => None,
        }
    }

    /// Logical bytes needed to stage a `width × height` frame to host memory.
    pub const fn host_mem_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            Self::Y => w * h,
            Self::Nv12 => w * (h * 3 / 2),
            Self::Yuv420 => w * h + 2 * ((w / 2) * (h / 2)),
            Self::Rgb => w * 3 * h,
            Self::RgbPlanar => w * h * 3,
        }
    }

    /// Fail with [`MemoryError::InvalidPlaneIndex`] unless `plane < num_planes()`.
    #[inline]
    pub fn check_plane(self, plane: u32) -> Result<()> {
        if plane < self.num_planes() {
            Ok(())
        } else {
            Err(MemoryError::InvalidPlaneIndex {
                format: self,
                plane,
                num_planes: self.num_planes(),
            })
        }
    }
}

impl TryFrom<u32> for PixelFormat {
    type Error = MemoryError;

    fn try_from(value: u32) -> Result<Self> {
        Self::from_raw(value).ok_or(MemoryError::UnsupportedFormat(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_values_round_trip_for_supported_formats() {
        for format in PixelFormat::ALL {
            assert_eq!(PixelFormat::from_raw(format.to_raw()), Some(format));
        }
    }

    #[test]
    fn formats_without_layout_are_unsupported() {
        for value in [raw::UNDEFINED, raw::BGR, raw::YCBCR, raw::YUV444, 99] {
            let err = PixelFormat::try_from(value).expect_err("no surface layout");
            assert!(matches!(err, MemoryError::UnsupportedFormat(v) if v == value));
        }
    }

    #[test]
    fn nv12_exposes_two_planes_in_one_allocation() {
        assert_eq!(PixelFormat::Nv12.num_planes(), 2);
        assert_eq!(PixelFormat::Nv12.num_allocations(), 1);
        assert!(PixelFormat::Nv12.check_plane(1).is_ok());
        assert!(PixelFormat::Nv12.check_plane(2).is_err());
    }

    #[test]
    fn host_mem_size_matches_layouts() {
        assert_eq!(PixelFormat::Y.host_mem_size(64, 32), 2048);
        assert_eq!(PixelFormat::Nv12.host_mem_size(1920, 1080), 1920 * 1620);
        assert_eq!(PixelFormat::Yuv420.host_mem_size(8, 4), 32 + 2 * 8);
        assert_eq!(PixelFormat::Rgb.host_mem_size(10, 2), 60);
        assert_eq!(PixelFormat::RgbPlanar.host_mem_size(10, 2), 60);
    }
}
