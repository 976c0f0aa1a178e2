//! Broadcast fabric: fan-out of typed events to connected observers.
//!
//! Built on `tokio::sync::broadcast`. Each observer sees events in enqueue
//! order; a slow observer loses its oldest undelivered events (broadcast
//! lag) rather than blocking producers. Observer disconnection is not an
//! error for publishers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::{Message, Notable};

/// Events shipped to observers. Serialised as `{type, data}` envelopes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum HubEvent {
    /// A full persisted message record.
    Message(Message),
    /// A streamed content fragment.
    Token { stream_id: u64, text: String },
    /// A streamed reasoning fragment.
    Reasoning { stream_id: u64, text: String },
    /// Mode/delay snapshot.
    State { mode: String, delay: String },
    /// A curated highlight.
    Notable(Notable),
    /// Context pressure reading.
    ContextPressure {
        tokens: usize,
        max: usize,
        ratio: f64,
        level: String,
    },
    /// FSM state tag plus turn counter.
    FsmState { state: String, turn_number: u64 },
}

impl HubEvent {
    /// The envelope's `type` tag, used as the SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Token { .. } => "token",
            Self::Reasoning { .. } => "reasoning",
            Self::State { .. } => "state",
            Self::Notable(_) => "notable",
            Self::ContextPressure { .. } => "context_pressure",
            Self::FsmState { .. } => "fsm_state",
        }
    }
}

/// Buffered events per observer before drop-oldest kicks in.
const CHANNEL_CAPACITY: usize = 256;

/// Maximum concurrent observers.
const MAX_OBSERVERS: u64 = 100;

/// Fan-out hub for harness events.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<HubEvent>,
    observer_count: Arc<AtomicU64>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            observer_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event to all observers. Never blocks; send errors mean
    /// no observers are connected, which is fine.
    pub fn publish(&self, event: HubEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of attached observers.
    pub fn observer_count(&self) -> u64 {
        self.observer_count.load(Ordering::Relaxed)
    }

    /// Attach a new observer. Returns `None` when the observer limit has
    /// been reached. The returned handle detaches on drop.
    pub fn subscribe(&self) -> Option<Observer> {
        let counter = Arc::clone(&self.observer_count);
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (current < MAX_OBSERVERS).then_some(current + 1)
            })
            .ok()?;
        Some(Observer {
            rx: self.tx.subscribe(),
            counter,
        })
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One attached observer's event feed.
pub struct Observer {
    rx: broadcast::Receiver<HubEvent>,
    counter: Arc<AtomicU64>,
}

impl Observer {
    /// Receive the next event. Lagged observers skip ahead to the oldest
    /// retained event instead of erroring out; `None` means the hub was
    /// dropped.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("observer lagged, dropped {skipped} events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
