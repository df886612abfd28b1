//! Lifecycle event distribution.
//!
//! Provides an `EventHub` that routes `WorkflowEvent` messages to the
//! subscribers of one execution (and to firehose subscribers) via
//! `tokio::sync::broadcast` channels.

pub mod bus;

pub use bus::{EventEmitter, EventHub, EventSubscription};
