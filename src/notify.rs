use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-lot broadcast of committed events (occupancy changes, resizes, deletion).
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a lot's events. Creates the channel if needed.
    pub fn subscribe(&self, lot_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(lot_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, lot_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&lot_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a lot's channel; subscribers see the stream close.
    pub fn remove(&self, lot_id: &Ulid) {
        self.channels.remove(lot_id);
    }
}
