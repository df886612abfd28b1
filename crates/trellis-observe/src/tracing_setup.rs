//! Subscriber installation for processes that embed the workflow engine.
//!
//! The engine emits `workflow.run` and `workflow.node` spans under the
//! [`ENGINE_TARGET`] target. [`TracingOptions`] picks how verbose that target
//! is, whether lines are human-readable or JSON, and whether spans are also
//! bridged to OpenTelemetry.
//!
//! ```no_run
//! use trellis_observe::tracing_setup::{init_tracing, LogFormat, TracingOptions};
//!
//! let options = TracingOptions {
//!     format: LogFormat::Json,
//!     ..TracingOptions::default()
//! };
//! init_tracing(&options).unwrap();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Instrumentation scope name reported to OpenTelemetry.
pub const TRACER_NAME: &str = "trellis";

/// Log target of the engine's spans and events.
pub const ENGINE_TARGET: &str = "trellis_core";

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One JSON object per line, span fields included.
    Json,
}

#[derive(Debug, Clone)]
pub struct TracingOptions {
    /// Level for [`ENGINE_TARGET`]. Everything else logs at `warn`.
    pub engine_level: Level,
    pub format: LogFormat,
    /// Bridge spans to OpenTelemetry with a stdout exporter.
    pub otel: bool,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            engine_level: Level::INFO,
            format: LogFormat::Pretty,
            otel: false,
        }
    }
}

impl TracingOptions {
    /// Filter directives used when `RUST_LOG` is unset.
    pub fn default_directives(&self) -> String {
        let level = self.engine_level.as_str().to_ascii_lowercase();
        format!("warn,{ENGINE_TARGET}={level},trellis_observe={level}")
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.default_directives()))
    }
}

/// Install the global subscriber.
///
/// Node spans log their duration when they close, so a run's timing shows up
/// in plain logs without an exporter. `RUST_LOG` overrides the directives
/// from [`TracingOptions::default_directives`].
///
/// # Errors
///
/// Returns an error if a global subscriber is already set.
pub fn init_tracing(options: &TracingOptions) -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match options.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
    };

    let otel_layer = options.otel.then(|| {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer(TRACER_NAME);
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        tracing_opentelemetry::layer().with_tracer(tracer)
    });

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .with(options.env_filter())
        .try_init()?;
    Ok(())
}

/// Flush pending spans and shut down the OpenTelemetry provider, if one was
/// installed.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
