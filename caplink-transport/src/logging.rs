use tracing_subscriber::EnvFilter;

/// Initialize console logging for an embedder. Verbosity is gated by the
/// standard `RUST_LOG` environment variable; the default keeps caplink
/// quiet unless something is wrong.
pub fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("caplink_core=warn,caplink_transport=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize logging: {}", err))
}

/// Console-only logging for tests; safe to call repeatedly.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("caplink_core=trace,caplink_transport=trace")),
        )
        .try_init();
}
