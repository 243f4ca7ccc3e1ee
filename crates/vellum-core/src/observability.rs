//! Observability infrastructure.
//!
//! Structured logging with consistent spans: newline-delimited JSON in
//! production, pretty output for development. Error-level events route to
//! standard error; everything else goes to standard out.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at startup. Safe to call multiple times; subsequent calls are
/// no-ops. The filter defaults to `level` and can be overridden per-target
/// with `RUST_LOG`.
pub fn init_logging(format: LogFormat, level: &str) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

        let errors_to_stderr = |metadata: &tracing::Metadata<'_>| {
            *metadata.level() == tracing::Level::ERROR
        };

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        fmt::layer()
                            .json()
                            .with_writer(std::io::stderr)
                            .with_filter(tracing_subscriber::filter::filter_fn(errors_to_stderr)),
                    )
                    .with(fmt::layer().json().with_filter(
                        tracing_subscriber::filter::filter_fn(move |m| !errors_to_stderr(m)),
                    ))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for pipeline operations with the standard correlation
/// fields.
#[must_use]
pub fn pipeline_span(operation: &str, project_id: &str, trace_id: &str) -> Span {
    tracing::info_span!(
        "pipeline",
        op = operation,
        project_id = project_id,
        trace_id = trace_id,
    )
}

/// Creates a span for ingress operations.
#[must_use]
pub fn ingress_span(operation: &str, path: &str) -> Span {
    tracing::info_span!("ingress", op = operation, path = path)
}
