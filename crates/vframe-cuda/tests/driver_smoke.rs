//! Exercises the driver backend end to end.  Needs a GPU:
//! `cargo test -p vframe-cuda -- --ignored`.

use vframe_core::{Buffer, DeviceContext, PixelFormat, Surface, SurfacePlane};
use vframe_cuda::CudaBackend;

fn device() -> DeviceContext {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let backend = CudaBackend::new().expect("CUDA driver");
    backend.primary_context(0).expect("device 0")
}

#[test]
#[ignore = "requires an NVIDIA driver"]
fn pitched_plane_pitch_covers_row() {
    let ctx = device();
    let plane = SurfacePlane::new(1921, 3, 1, &ctx).expect("cuMemAllocPitch");
    assert!(plane.pitch() >= 1921);
    assert_ne!(plane.device_ptr(), 0);
}

#[test]
#[ignore = "requires an NVIDIA driver"]
fn nv12_round_trip_through_pinned_memory() {
    let ctx = device();
    let mut surface = Surface::new(PixelFormat::Nv12, 1280, 720, &ctx).expect("alloc");
    let size = surface.host_mem_size();
    let pattern: Vec<u8> = (0..size).map(|i| (i % 241) as u8).collect();
    let staged = Buffer::make_from(&pattern, &ctx).expect("pinned");
    surface.upload(&ctx, &staged).expect("H2D");

    let copy = surface.deep_copy(&ctx).expect("D2D");
    let mut back = Buffer::make(size, &ctx).expect("pinned");
    copy.download(&ctx, &mut back).expect("D2H");
    assert_eq!(back.as_slice(), pattern.as_slice());
}

#[test]
#[ignore = "requires an NVIDIA driver"]
fn oversized_allocation_is_an_error() {
    let ctx = device();
    let err = SurfacePlane::new(u32::MAX / 2, 1 << 20, 1, &ctx).expect_err("out of memory");
    assert!(err.is_allocation_failure(), "unexpected error: {err}");
}
