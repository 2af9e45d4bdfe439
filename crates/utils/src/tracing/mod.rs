use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, instrument, span, trace, warn, Level, Span};

/// Initialize the tracing system with an `info` default filter
///
/// `RUST_LOG` overrides the default. Diagnostics always go to stderr so they
/// never mix with task output captured from stdout.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    init_with_default("info")
}

/// Initialize the tracing system with the given default directive
pub fn init_with_default(
    directive: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(directive))?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .compact()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// Create a span for one task launch
pub fn task_span(task_id: &str, launcher: &str) -> Span {
    span!(Level::INFO, "task", task_id = %task_id, launcher = %launcher)
}

/// Emit a structured event for task completion
pub fn task_completed(task_id: &str, duration_ms: u64, success: bool) {
    if success {
        info!(
            task_id = %task_id,
            duration_ms = %duration_ms,
            "task_completed"
        );
    } else {
        warn!(
            task_id = %task_id,
            duration_ms = %duration_ms,
            "task_failed"
        );
    }
}
