pub mod audit;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::event::NotificationEvent;

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct DispatchError(pub String);

/// Receives events only after the transition that produced them committed.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError>;
}

pub const DEFAULT_INBOX_CAPACITY: usize = 100;

/// Keeps a bounded per-recipient inbox and fans every event out to live
/// subscribers. A full inbox drops its oldest event.
pub struct BroadcastDispatcher {
    inbox: DashMap<Uuid, VecDeque<NotificationEvent>>,
    inbox_capacity: usize,
    delivered: AtomicUsize,
    events_tx: broadcast::Sender<NotificationEvent>,
}

impl BroadcastDispatcher {
    pub fn new(buffer_size: usize) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(buffer_size.max(1));
        Self {
            inbox: DashMap::new(),
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            delivered: AtomicUsize::new(0),
            events_tx,
        }
    }

    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity.max(1);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.events_tx.subscribe()
    }

    pub fn events_for(&self, recipient: Uuid) -> Vec<NotificationEvent> {
        self.inbox
            .get(&recipient)
            .map(|events| events.value().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Hands the recipient its pending events, oldest first, and empties the inbox.
    pub fn drain_inbox(&self, recipient: Uuid) -> Vec<NotificationEvent> {
        self.inbox
            .remove(&recipient)
            .map(|(_, events)| Vec::from(events))
            .unwrap_or_default()
    }

    /// Events delivered since start, including ones since drained or evicted.
    pub fn total(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl NotificationDispatcher for BroadcastDispatcher {
    fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError> {
        {
            let mut inbox = self.inbox.entry(event.recipient_user_id).or_default();
            if inbox.len() >= self.inbox_capacity {
                inbox.pop_front();
            }
            inbox.push_back(event.clone());
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        // Nobody listening on the socket feed is fine; the inbox still has it.
        let _ = self.events_tx.send(event.clone());
        Ok(())
    }
}
