//! Observability bootstrap for Trellis.
//!
//! - `tracing_setup` -- global subscriber installation with optional
//!   OpenTelemetry export
//! - `attrs` -- attribute keys shared by `tracing` spans and engine trace spans

pub mod attrs;
pub mod tracing_setup;
