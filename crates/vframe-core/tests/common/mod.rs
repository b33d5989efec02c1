use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use vframe_core::{DeviceContext, SystemBackend};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn system() -> (Arc<SystemBackend>, DeviceContext) {
    init_tracing();
    let backend = SystemBackend::new();
    let ctx = backend.context();
    (backend, ctx)
}
