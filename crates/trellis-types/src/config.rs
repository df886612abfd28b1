//! Engine configuration types for Trellis.
//!
//! `EngineConfig` is loaded from an optional `trellis.toml`. All fields have
//! sensible defaults, so an empty file (or no file) is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on node dispatches within a single walk.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Maximum sub-workflow nesting depth.
    #[serde(default = "default_max_sub_workflow_depth")]
    pub max_sub_workflow_depth: u32,

    /// Buffered events per execution channel before slow subscribers lag.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Node outputs above this serialized size are replaced by a marker.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_max_steps() -> u32 {
    10_000
}

fn default_max_sub_workflow_depth() -> u32 {
    5
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_output_bytes() -> usize {
    1_048_576
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_sub_workflow_depth: default_max_sub_workflow_depth(),
            event_capacity: default_event_capacity(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry Configuration
// ---------------------------------------------------------------------------

/// Retry policy for a single operation, applied before registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
        }
    }
}

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed { delay_ms: 100 }
    }
}

impl Backoff {
    /// Delay before the given retry. `attempt` is 1-based (the attempt that
    /// just failed).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { initial_ms, max_ms } => {
                let factor = 1u64 << attempt.saturating_sub(1).min(32);
                Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}
