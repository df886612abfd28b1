//! In-memory span collection for a single `execute`/`resume` call.
//!
//! Every workflow run opens a root span, every node dispatch opens a child
//! span under it, and sub-workflow runs nest under the invoking node's span.
//! All spans from one call share a trace id. The collected list is returned
//! on the `WorkflowExecutionResult`; nothing is exported from here.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use trellis_types::trace::{AttributeValue, SpanEvent, SpanStatus, TraceSpan};
use uuid::Uuid;

/// Shared, append-only span sink. Cloning shares the same buffer.
#[derive(Debug, Clone)]
pub struct SpanCollector {
    trace_id: String,
    spans: Arc<Mutex<Vec<TraceSpan>>>,
}

impl SpanCollector {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::now_v7().simple().to_string(),
            spans: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Open a span and return its id.
    pub fn start(
        &self,
        name: impl Into<String>,
        parent_span_id: Option<&str>,
        attributes: BTreeMap<String, AttributeValue>,
    ) -> String {
        let span_id = new_span_id();
        self.lock().push(TraceSpan {
            span_id: span_id.clone(),
            trace_id: self.trace_id.clone(),
            parent_span_id: parent_span_id.map(str::to_string),
            name: name.into(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            status: SpanStatus::default(),
            attributes,
            events: Vec::new(),
        });
        span_id
    }

    pub fn set_attribute(&self, span_id: &str, key: &str, value: impl Into<AttributeValue>) {
        let value = value.into();
        self.with_span(span_id, |span| {
            span.attributes.insert(key.to_string(), value);
        });
    }

    pub fn add_event(
        &self,
        span_id: &str,
        name: &str,
        attributes: BTreeMap<String, AttributeValue>,
    ) {
        self.with_span(span_id, |span| {
            span.events.push(SpanEvent {
                name: name.to_string(),
                timestamp: Utc::now(),
                attributes,
            });
        });
    }

    /// Close a span with the given status. Closing twice keeps the first end.
    pub fn finish(&self, span_id: &str, status: SpanStatus) {
        self.with_span(span_id, |span| {
            if span.end_time.is_some() {
                return;
            }
            let end = Utc::now();
            span.duration_ms = Some((end - span.start_time).num_milliseconds().max(0) as u64);
            span.end_time = Some(end);
            span.status = status;
        });
    }

    /// Close a span without setting a status (used when the node paused).
    pub fn end(&self, span_id: &str) {
        self.finish(span_id, SpanStatus::default());
    }

    /// Copy of every span recorded so far, in start order.
    pub fn snapshot(&self) -> Vec<TraceSpan> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn with_span(&self, span_id: &str, f: impl FnOnce(&mut TraceSpan)) {
        let mut spans = self.lock();
        if let Some(span) = spans.iter_mut().rev().find(|s| s.span_id == span_id) {
            f(span);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TraceSpan>> {
        self.spans.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SpanCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// 16 hex chars taken from the random tail of a v7 UUID.
fn new_span_id() -> String {
    let bytes = Uuid::now_v7().into_bytes();
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&bytes[8..]);
    format!("{:016x}", u64::from_be_bytes(tail))
}
