//! Sharing events for UI subscribers.
//!
//! Late subscribers get the events published within a short freshness
//! window before they subscribed, then the live stream.

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Something subscribers may want to react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SharingEvent {
    PageAddedToSharedList { page_url: String },
    PageRemovedFromSharedList { page_url: String },
}

/// Bounded buffer of recent events.
#[derive(Debug)]
pub struct EventReplayBuffer {
    window: Duration,
    capacity: usize,
    events: VecDeque<(Instant, SharingEvent)>,
}

impl EventReplayBuffer {
    /// Keep at most `capacity` events, each for at most `window`.
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity,
            events: VecDeque::with_capacity(capacity),
        }
    }

    /// Record an event, evicting the oldest when full.
    pub fn push(&mut self, event: SharingEvent) {
        if self.capacity == 0 {
            return;
        }
        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back((Instant::now(), event));
    }

    /// Drop stale events and return the fresh ones, oldest first.
    pub fn fresh(&mut self) -> Vec<SharingEvent> {
        let now = Instant::now();
        while let Some((at, _)) = self.events.front() {
            if now.duration_since(*at) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.iter().map(|(_, event)| event.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Publishes events to live subscribers and the replay buffer.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<SharingEvent>,
    replay: Arc<Mutex<EventReplayBuffer>>,
}

impl EventHub {
    /// Create a hub with the given replay settings and channel size.
    pub fn new(window: Duration, replay_capacity: usize, channel_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            tx,
            replay: Arc::new(Mutex::new(EventReplayBuffer::new(window, replay_capacity))),
        }
    }

    /// Publish an event.
    pub fn publish(&self, event: SharingEvent) {
        debug!("Sharing event: {:?}", event);
        let mut replay = self.replay.lock().unwrap_or_else(|e| e.into_inner());
        replay.push(event.clone());
        // Sent under the lock so a concurrent subscribe sees it exactly once.
        let _ = self.tx.send(event);
    }

    /// Subscribe, starting with the fresh buffered events.
    pub fn subscribe(&self) -> EventSubscription {
        let mut replay = self.replay.lock().unwrap_or_else(|e| e.into_inner());
        EventSubscription {
            replayed: replay.fresh().into(),
            rx: self.tx.subscribe(),
        }
    }
}

/// A stream of sharing events.
pub struct EventSubscription {
    replayed: VecDeque<SharingEvent>,
    rx: broadcast::Receiver<SharingEvent>,
}

impl EventSubscription {
    /// Next event, or `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<SharingEvent> {
        if let Some(event) = self.replayed.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Sharing event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is ready.
    pub fn try_recv(&mut self) -> Option<SharingEvent> {
        if let Some(event) = self.replayed.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Turn the subscription into a stream that ends with the hub.
    pub fn into_stream(self) -> impl Stream<Item = SharingEvent> {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|event| (event, subscription))
        })
    }
}
