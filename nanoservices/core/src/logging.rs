use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Reads `RUST_LOG` (default `info`). Safe to call
/// more than once; later calls are ignored.
pub fn init() {
    init_with_default("info");
}

/// Like [`init`] but with a caller-chosen default directive, used by the demo
/// and tests to quiet or raise the pipeline's own logs.
pub fn init_with_default(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
