//! Broadcast event hub keyed by execution id.
//!
//! Each execution gets its own `tokio::sync::broadcast` channel, created on
//! first use by either a subscriber or the run itself. Publishing with no
//! active subscribers is a no-op. When the run ends its channel is removed
//! from the hub, and subscribers see the stream close once they have drained
//! the buffered events.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::debug;
use trellis_types::event::WorkflowEvent;
use uuid::Uuid;

struct Channel {
    sender: broadcast::Sender<WorkflowEvent>,
    running: bool,
}

/// Multi-consumer event hub for workflow executions.
///
/// Cloning the hub shares the underlying channel map.
#[derive(Clone)]
pub struct EventHub {
    channels: Arc<DashMap<Uuid, Channel>>,
    all: broadcast::Sender<WorkflowEvent>,
    capacity: usize,
}

impl EventHub {
    /// Create a hub whose channels buffer `capacity` events each.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            channels: Arc::new(DashMap::new()),
            all,
            capacity,
        }
    }

    /// Subscribe to one execution's events.
    ///
    /// May be called before the execution starts (pass the id to
    /// `WorkflowEngine::execute_with_id`) so no event is missed.
    ///
    /// Sub-workflow runs publish on this same channel, but their events carry
    /// the nested run's own `execution_id` and `workflow_id`. Filtering the
    /// stream on the subscribed id drops them.
    pub fn subscribe(&self, execution_id: Uuid) -> EventSubscription {
        let receiver = self
            .channels
            .entry(execution_id)
            .or_insert_with(|| Channel {
                sender: broadcast::channel(self.capacity).0,
                running: false,
            })
            .sender
            .subscribe();

        EventSubscription {
            hub: self.clone(),
            execution_id,
            receiver: Some(receiver),
        }
    }

    /// Receive every event from every execution.
    pub fn subscribe_all(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.all.subscribe()
    }

    /// Mark an execution as running and return an emitter for its channel.
    pub fn open(&self, execution_id: Uuid) -> EventEmitter {
        let mut channel = self.channels.entry(execution_id).or_insert_with(|| Channel {
            sender: broadcast::channel(self.capacity).0,
            running: true,
        });
        channel.running = true;

        EventEmitter {
            sender: channel.sender.clone(),
            all: self.all.clone(),
        }
    }

    /// Remove an execution's channel. Receivers still drain what was sent.
    pub fn close(&self, execution_id: Uuid) {
        if self.channels.remove(&execution_id).is_some() {
            debug!(%execution_id, "event channel closed");
        }
    }

    /// Number of executions that currently have a channel.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn release(&self, execution_id: Uuid) {
        self.channels
            .remove_if(&execution_id, |_, ch| !ch.running && ch.sender.receiver_count() == 0);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("channels", &self.channels.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Publishing half for one execution (and every execution nested under it).
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<WorkflowEvent>,
    all: broadcast::Sender<WorkflowEvent>,
}

impl EventEmitter {
    /// Publish an event to the execution's subscribers and the firehose.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn emit(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event.clone());
        let _ = self.all.send(event);
    }
}

/// Receiving half for one execution.
///
/// Dropping the subscription unsubscribes it.
pub struct EventSubscription {
    hub: EventHub,
    execution_id: Uuid,
    receiver: Option<broadcast::Receiver<WorkflowEvent>>,
}

impl EventSubscription {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn is_active(&self) -> bool {
        self.receiver.is_some()
    }

    /// Wait for the next event. Returns `None` once the stream has ended or
    /// the subscription was cancelled. Lagged events are skipped.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(execution_id = %self.execution_id, skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive. Returns `None` when nothing is buffered.
    pub fn try_recv(&mut self) -> Option<WorkflowEvent> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Stop receiving. Idempotent, and safe after the run has finished.
    pub fn unsubscribe(&mut self) {
        if self.receiver.take().is_some() {
            self.hub.release(self.execution_id);
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("execution_id", &self.execution_id)
            .field("active", &self.is_active())
            .finish()
    }
}
