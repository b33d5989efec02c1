//! Pixel-format-aware surfaces composed of pitched device planes.
//!
//! [`Surface`] is a closed enum over the five supported layouts.  Each
//! layout struct owns exactly the [`SurfacePlane`]s it needs and implements
//! [`SurfaceLayout`], which maps a logical plane index onto physical plane
//! geometry exactly once.
//!
//! # Geometry for a `W × H` frame
//!
//! ```text
//! Y          1 alloc  W       × H        plane 0 = whole block
//! NV12       1 alloc  W       × H*3/2    plane 0 = top 2/3 rows (luma)
//!                                        plane 1 = bottom 1/3 (interleaved UV),
//!                                                  ptr = base + Height(0)*Pitch
//! YUV420     3 allocs W × H, W/2 × H/2, W/2 × H/2   planes 0/1/2 = Y/U/V
//! RGB        1 alloc  (W*3)   × H        Width(0) = physical width / 3
//! RGB_PLANAR 1 alloc  W       × H*3      Height(0) = physical height / 3
//! ```
//!
//! # Aliasing
//!
//! [`Surface::alias`] is the cheap polymorphic duplicate: every plane of
//! the result is a non-owning alias of the source surface's planes, so
//! `plane_ptr` values are identical.  It never transfers ownership; use
//! [`Surface::deep_copy`] for an independent surface.

use tracing::debug;

use crate::buffer::Buffer;
use crate::context::{DeviceContext, DevicePtr};
use crate::error::{MemoryError, Result};
use crate::format::PixelFormat;
use crate::plane::SurfacePlane;

/// Per-format plane geometry.
///
/// The default accessor bodies map logical plane `n` straight onto
/// physical plane `n`; layouts that pack several logical planes into one
/// allocation override them.
pub trait SurfaceLayout: Sized {
    const FORMAT: PixelFormat;

    /// Unallocated instance.
    fn empty() -> Self;

    /// Allocate every physical plane for a `width × height` frame.
    fn allocate(width: u32, height: u32, ctx: &DeviceContext) -> Result<Self>;

    /// Rebuild from physical planes in allocation order.
    fn from_planes(planes: Vec<SurfacePlane>) -> Result<Self>;

    fn physical_plane(&self, index: usize) -> Option<&SurfacePlane>;

    fn physical_plane_mut(&mut self, index: usize) -> Option<&mut SurfacePlane>;

    fn checked_plane(&self, plane: u32) -> Result<&SurfacePlane> {
        Self::FORMAT.check_plane(plane)?;
        self.physical_plane(plane as usize)
            .ok_or(MemoryError::InvalidPlaneIndex {
                format: Self::FORMAT,
                plane,
                num_planes: Self::FORMAT.num_planes(),
            })
    }

    fn width(&self, plane: u32) -> Result<u32> {
        Ok(self.checked_plane(plane)?.width())
    }

    fn height(&self, plane: u32) -> Result<u32> {
        Ok(self.checked_plane(plane)?.height())
    }

    fn pitch(&self, plane: u32) -> Result<usize> {
        Ok(self.checked_plane(plane)?.pitch())
    }

    fn width_in_bytes(&self, plane: u32) -> Result<usize> {
        Ok(self.checked_plane(plane)?.width_in_bytes())
    }

    fn plane_ptr(&self, plane: u32) -> Result<DevicePtr> {
        Ok(self.checked_plane(plane)?.device_ptr())
    }

    /// Sum of every physical plane's logical host size.
    fn host_mem_size(&self) -> usize {
        (0..Self::FORMAT.num_allocations())
            .filter_map(|i| self.physical_plane(i))
            .map(SurfacePlane::host_mem_size)
            .sum()
    }
}

fn single_plane(format: PixelFormat, planes: Vec<SurfacePlane>) -> Result<SurfacePlane> {
    let count = planes.len();
    let mut iter = planes.into_iter();
    match (iter.next(), count) {
        (Some(plane), 1) => Ok(plane),
        _ => Err(MemoryError::GeometryMismatch(format!(
            "{format:?} surface takes 1 plane, got {count}"
        ))),
    }
}

fn scaled(value: u32, factor: u32, width: u32, height: u32) -> Result<u32> {
    value
        .checked_mul(factor)
        .ok_or(MemoryError::InvalidDimensions {
            width,
            height,
            elem_size: 1,
        })
}

// ─── Y ───────────────────────────────────────────────────────────────────────

pub struct SurfaceY {
    plane: SurfacePlane,
}

impl SurfaceLayout for SurfaceY {
    const FORMAT: PixelFormat = PixelFormat::Y;

    fn empty() -> Self {
        Self {
            plane: SurfacePlane::empty(),
        }
    }

    fn allocate(width: u32, height: u32, ctx: &DeviceContext) -> Result<Self> {
        Ok(Self {
            plane: SurfacePlane::new(width, height, Self::FORMAT.elem_size(), ctx)?,
        })
    }

    fn from_planes(planes: Vec<SurfacePlane>) -> Result<Self> {
        Ok(Self {
            plane: single_plane(Self::FORMAT, planes)?,
        })
    }

    fn physical_plane(&self, index: usize) -> Option<&SurfacePlane> {
        (index == 0).then_some(&self.plane)
    }

    fn physical_plane_mut(&mut self, index: usize) -> Option<&mut SurfacePlane> {
        (index == 0).then_some(&mut self.plane)
    }
}

// ─── NV12 ────────────────────────────────────────────────────────────────────

pub struct SurfaceNv12 {
    plane: SurfacePlane,
}

impl SurfaceNv12 {
    fn check(&self, plane: u32) -> Result<&SurfacePlane> {
        Self::FORMAT.check_plane(plane)?;
        Ok(&self.plane)
    }
}

impl SurfaceLayout for SurfaceNv12 {
    const FORMAT: PixelFormat = PixelFormat::Nv12;

    fn empty() -> Self {
        Self {
            plane: SurfacePlane::empty(),
        }
    }

    fn allocate(width: u32, height: u32, ctx: &DeviceContext) -> Result<Self> {
        let physical_height = scaled(height, 3, width, height)? / 2;
        Ok(Self {
            plane: SurfacePlane::new(width, physical_height, Self::FORMAT.elem_size(), ctx)?,
        })
    }

    fn from_planes(planes: Vec<SurfacePlane>) -> Result<Self> {
        Ok(Self {
            plane: single_plane(Self::FORMAT, planes)?,
        })
    }

    fn physical_plane(&self, index: usize) -> Option<&SurfacePlane> {
        (index == 0).then_some(&self.plane)
    }

    fn physical_plane_mut(&mut self, index: usize) -> Option<&mut SurfacePlane> {
        (index == 0).then_some(&mut self.plane)
    }

    fn width(&self, plane: u32) -> Result<u32> {
        Ok(self.check(plane)?.width())
    }

    fn height(&self, plane: u32) -> Result<u32> {
        let physical = self.check(plane)?.height();
        Ok(if plane == 0 {
            physical * 2 / 3
        } else {
            physical / 3
        })
    }

    fn pitch(&self, plane: u32) -> Result<usize> {
        Ok(self.check(plane)?.pitch())
    }

    fn width_in_bytes(&self, plane: u32) -> Result<usize> {
        Ok(self.check(plane)?.width_in_bytes())
    }

    fn plane_ptr(&self, plane: u32) -> Result<DevicePtr> {
        let base = self.check(plane)?.device_ptr();
        if plane == 0 {
            return Ok(base);
        }
        let luma_bytes = self.height(0)? as usize * self.pitch(0)?;
        Ok(base + luma_bytes as DevicePtr)
    }
}

// ─── YUV420 ──────────────────────────────────────────────────────────────────

pub struct SurfaceYuv420 {
    plane_y: SurfacePlane,
    plane_u: SurfacePlane,
    plane_v: SurfacePlane,
}

impl SurfaceLayout for SurfaceYuv420 {
    const FORMAT: PixelFormat = PixelFormat::Yuv420;

    fn empty() -> Self {
        Self {
            plane_y: SurfacePlane::empty(),
            plane_u: SurfacePlane::empty(),
            plane_v: SurfacePlane::empty(),
        }
    }

    fn allocate(width: u32, height: u32, ctx: &DeviceContext) -> Result<Self> {
        let elem = Self::FORMAT.elem_size();
        Ok(Self {
            plane_y: SurfacePlane::new(width, height, elem, ctx)?,
            plane_u: SurfacePlane::new(width / 2, height / 2, elem, ctx)?,
            plane_v: SurfacePlane::new(width / 2, height / 2, elem, ctx)?,
        })
    }

    fn from_planes(planes: Vec<SurfacePlane>) -> Result<Self> {
        let count = planes.len();
        match <[SurfacePlane; 3]>::try_from(planes) {
            Ok([plane_y, plane_u, plane_v]) => Ok(Self {
                plane_y,
                plane_u,
                plane_v,
            }),
            Err(_) => Err(MemoryError::GeometryMismatch(format!(
                "YUV420 surface takes 3 planes, got {count}"
            ))),
        }
    }

    fn physical_plane(&self, index: usize) -> Option<&SurfacePlane> {
        match index {
            0 => Some(&self.plane_y),
            1 => Some(&self.plane_u),
            2 => Some(&self.plane_v),
            _ => None,
        }
    }

    fn physical_plane_mut(&mut self, index: usize) -> Option<&mut SurfacePlane> {
        match index {
            0 => Some(&mut self.plane_y),
            1 => Some(&mut self.plane_u),
            2 => Some(&mut self.plane_v),
            _ => None,
        }
    }
}

// ─── RGB (interleaved) ───────────────────────────────────────────────────────

pub struct SurfaceRgb {
    plane: SurfacePlane,
}

impl SurfaceLayout for SurfaceRgb {
    const FORMAT: PixelFormat = PixelFormat::Rgb;

    fn empty() -> Self {
        Self {
            plane: SurfacePlane::empty(),
        }
    }

    fn allocate(width: u32, height: u32, ctx: &DeviceContext) -> Result<Self> {
        let physical_width = scaled(width, 3, width, height)?;
        Ok(Self {
            plane: SurfacePlane::new(physical_width, height, Self::FORMAT.elem_size(), ctx)?,
        })
    }

    fn from_planes(planes: Vec<SurfacePlane>) -> Result<Self> {
        Ok(Self {
            plane: single_plane(Self::FORMAT, planes)?,
        })
    }

    fn physical_plane(&self, index: usize) -> Option<&SurfacePlane> {
        (index == 0).then_some(&self.plane)
    }

    fn physical_plane_mut(&mut self, index: usize) -> Option<&mut SurfacePlane> {
        (index == 0).then_some(&mut self.plane)
    }

    /// De-interleaved pixel width.
    fn width(&self, plane: u32) -> Result<u32> {
        Ok(self.checked_plane(plane)?.width() / 3)
    }
}

// ─── RGB planar ──────────────────────────────────────────────────────────────

pub struct SurfaceRgbPlanar {
    plane: SurfacePlane,
}

impl SurfaceLayout for SurfaceRgbPlanar {
    const FORMAT: PixelFormat = PixelFormat::RgbPlanar;

    fn empty() -> Self {
        Self {
            plane: SurfacePlane::empty(),
        }
    }

    fn allocate(width: u32, height: u32, ctx: &DeviceContext) -> Result<Self> {
        let physical_height = scaled(height, 3, width, height)?;
        Ok(Self {
            plane: SurfacePlane::new(width, physical_height, Self::FORMAT.elem_size(), ctx)?,
        })
    }

    fn from_planes(planes: Vec<SurfacePlane>) -> Result<Self> {
        Ok(Self {
            plane: single_plane(Self::FORMAT, planes)?,
        })
    }

    fn physical_plane(&self, index: usize) -> Option<&SurfacePlane> {
        (index == 0).then_some(&self.plane)
    }

    fn physical_plane_mut(&mut self, index: usize) -> Option<&mut SurfacePlane> {
        (index == 0).then_some(&mut self.plane)
    }

    /// Height of one color plane.
    fn height(&self, plane: u32) -> Result<u32> {
        Ok(self.checked_plane(plane)?.height() / 3)
    }
}

// ─── Surface ─────────────────────────────────────────────────────────────────

pub enum Surface {
    Y(SurfaceY),
    Nv12(SurfaceNv12),
    Yuv420(SurfaceYuv420),
    Rgb(SurfaceRgb),
    RgbPlanar(SurfaceRgbPlanar),
}

macro_rules! dispatch {
    ($surface:expr, $layout:ident => $body:expr) => {
        match $surface {
            Surface::Y($layout) => $body,
            Surface::Nv12($layout) => $body,
            Surface::Yuv420($layout) => $body,
            Surface::Rgb($layout) => $body,
            Surface::RgbPlanar($layout) => $body,
        }
    };
}

/// Apply a generic function over the concrete layout type for `format`.
macro_rules! per_format {
    ($format:expr, $ty:ident => $body:expr) => {
        match $format {
            PixelFormat::Y => {
                type $ty = SurfaceY;
                Surface::Y($body)
            }
            PixelFormat::Nv12 => {
                type $ty = SurfaceNv12;
                Surface::Nv12($body)
            }
            PixelFormat::Yuv420 => {
                type $ty = SurfaceYuv420;
                Surface::Yuv420($body)
            }
            PixelFormat::Rgb => {
                type $ty = SurfaceRgb;
                Surface::Rgb($body)
            }
            PixelFormat::RgbPlanar => {
                type $ty = SurfaceRgbPlanar;
                Surface::RgbPlanar($body)
            }
        }
    };
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let planes: Vec<&SurfacePlane> = self.physical_planes().collect();
        f.debug_struct("Surface")
            .field("format", &self.format())
            .field("planes", &planes)
            .finish()
    }
}

impl Surface {
    /// Empty (unallocated) surface of `format`.
    pub fn make(format: PixelFormat) -> Self {
        per_format!(format, L => L::empty())
    }

    /// Surface of `format` with every plane allocated for a
    /// `width × height` frame under `ctx`.
    pub fn new(format: PixelFormat, width: u32, height: u32, ctx: &DeviceContext) -> Result<Self> {
        let surface = per_format!(format, L => L::allocate(width, height, ctx)?);
        debug!(?format, width, height, "surface allocated");
        Ok(surface)
    }

    /// Empty surface for a raw format value; `None` if it has no layout.
    pub fn make_raw(format: u32) -> Option<Self> {
        PixelFormat::from_raw(format).map(Self::make)
    }

    /// Allocated surface for a raw format value; `Ok(None)` if it has no
    /// layout, `Err` if allocation fails.
    pub fn new_raw(
        format: u32,
        width: u32,
        height: u32,
        ctx: &DeviceContext,
    ) -> Result<Option<Self>> {
        PixelFormat::from_raw(format)
            .map(|format| Self::new(format, width, height, ctx))
            .transpose()
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        match self {
            Self::Y(_) => PixelFormat::Y,
            Self::Nv12(_) => PixelFormat::Nv12,
            Self::Yuv420(_) => PixelFormat::Yuv420,
            Self::Rgb(_) => PixelFormat::Rgb,
            Self::RgbPlanar(_) => PixelFormat::RgbPlanar,
        }
    }

    #[inline]
    pub fn num_planes(&self) -> u32 {
        self.format().num_planes()
    }

    #[inline]
    pub fn elem_size(&self) -> u32 {
        self.format().elem_size()
    }

    /// `true` when no physical plane is allocated.
    pub fn is_empty(&self) -> bool {
        self.physical_planes().all(|plane| !plane.is_allocated())
    }

    pub fn width(&self, plane: u32) -> Result<u32> {
        dispatch!(self, s => s.width(plane))
    }

    pub fn height(&self, plane: u32) -> Result<u32> {
        dispatch!(self, s => s.height(plane))
    }

    pub fn pitch(&self, plane: u32) -> Result<usize> {
        dispatch!(self, s => s.pitch(plane))
    }

    /// `width(plane) * elem_size` for the physical row holding `plane`.
    pub fn width_in_bytes(&self, plane: u32) -> Result<usize> {
        dispatch!(self, s => s.width_in_bytes(plane))
    }

    pub fn plane_ptr(&self, plane: u32) -> Result<DevicePtr> {
        dispatch!(self, s => s.plane_ptr(plane))
    }

    /// Total logical bytes needed to stage the surface to host memory.
    pub fn host_mem_size(&self) -> usize {
        dispatch!(self, s => s.host_mem_size())
    }

    /// Physical plane `index` in allocation order (`None` past the last).
    pub fn plane(&self, index: usize) -> Option<&SurfacePlane> {
        dispatch!(self, s => s.physical_plane(index))
    }

    pub fn physical_planes(&self) -> impl Iterator<Item = &SurfacePlane> + '_ {
        (0..self.format().num_allocations()).filter_map(move |i| self.plane(i))
    }

    /// Same-format surface whose planes alias this one's device memory.
    pub fn alias(&self) -> Self {
        let planes: Vec<SurfacePlane> = self.physical_planes().map(SurfacePlane::alias).collect();
        self.rebuild(planes)
    }

    /// Empty surface of the same format.
    pub fn create(&self) -> Self {
        Self::make(self.format())
    }

    /// Independent surface: fresh allocations under `ctx` and D2D copies of
    /// every physical plane.
    pub fn deep_copy(&self, ctx: &DeviceContext) -> Result<Self> {
        let planes = self
            .physical_planes()
            .map(|plane| plane.deep_copy(ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.rebuild(planes))
    }

    fn rebuild(&self, planes: Vec<SurfacePlane>) -> Self {
        let format = self.format();
        let count = planes.len();
        let rebuilt = match format {
            PixelFormat::Y => SurfaceY::from_planes(planes).map(Self::Y),
            PixelFormat::Nv12 => SurfaceNv12::from_planes(planes).map(Self::Nv12),
            PixelFormat::Yuv420 => SurfaceYuv420::from_planes(planes).map(Self::Yuv420),
            PixelFormat::Rgb => SurfaceRgb::from_planes(planes).map(Self::Rgb),
            PixelFormat::RgbPlanar => SurfaceRgbPlanar::from_planes(planes).map(Self::RgbPlanar),
        };
        // Plane count always comes from this surface's own format.
        rebuilt.unwrap_or_else(|err| {
            debug_assert!(false, "rebuild {format:?} from {count} planes: {err}");
            Self::make(format)
        })
    }

    /// Rebind every physical plane to an alias of the matching plane in
    /// `planes` (one per allocation, in allocation order).
    pub fn update(&mut self, planes: &[&SurfacePlane]) -> Result<()> {
        let expected = self.format().num_allocations();
        if planes.len() != expected {
            return Err(MemoryError::GeometryMismatch(format!(
                "{:?} surface takes {expected} plane(s), got {}",
                self.format(),
                planes.len()
            )));
        }
        for (index, source) in planes.iter().enumerate() {
            if let Some(slot) = dispatch!(self, s => s.physical_plane_mut(index)) {
                *slot = source.alias();
            }
        }
        Ok(())
    }

    /// Pack every physical plane, in allocation order, into `dst`.
    pub fn download(&self, ctx: &DeviceContext, dst: &mut Buffer) -> Result<()> {
        let need = self.host_mem_size();
        if dst.size() < need {
            return Err(MemoryError::BufferTooSmall {
                need,
                have: dst.size(),
            });
        }
        let host = dst.as_mut_slice();
        let mut offset = 0;
        for plane in self.physical_planes() {
            let len = plane.host_mem_size();
            plane.download(ctx, &mut host[offset..offset + len])?;
            offset += len;
        }
        Ok(())
    }

    /// Inverse of [`download`](Self::download).
    pub fn upload(&mut self, ctx: &DeviceContext, src: &Buffer) -> Result<()> {
        let need = self.host_mem_size();
        if src.size() < need {
            return Err(MemoryError::BufferTooSmall {
                need,
                have: src.size(),
            });
        }
        let host = src.as_slice();
        let mut offset = 0;
        for index in 0..self.format().num_allocations() {
            let Some(plane) = dispatch!(self, s => s.physical_plane_mut(index)) else {
                continue;
            };
            let len = plane.host_mem_size();
            plane.upload(ctx, &host[offset..offset + len])?;
            offset += len;
        }
        Ok(())
    }
}
