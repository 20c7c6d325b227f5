//! Tracing subscriber setup shared by the node daemon and tests.

/// Initialize the tracing subscriber with uptime timestamps.
///
/// The filter defaults to `plinth=info` and can be overridden through
/// `RUST_LOG` (e.g. `RUST_LOG=plinth=trace`). Call once at process start;
/// a second call panics because the global subscriber is already set.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("plinth=info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .init();
}
