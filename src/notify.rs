use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

/// Events a slow subscriber may fall behind by before it starts observing
/// lag instead of events.
const SUBSCRIBER_BACKLOG: usize = 128;

/// Fan-out of applied events, one broadcast channel per facility.
/// Channels appear on first subscribe and are pruned lazily: a publish
/// that reaches nobody drops the channel again, so idle facilities cost
/// nothing between subscriptions.
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

    pub fn subscribe(&self, facility_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(facility_id)
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BACKLOG).0)
            .subscribe()
    }

    /// Offer an applied event to the facility's subscribers. Returns the
    /// number of subscribers reached.
    pub fn publish(&self, facility_id: Ulid, event: &Event) -> usize {
        let reached = match self.channels.get(&facility_id) {
            Some(sender) => sender.send(event.clone()).unwrap_or(0),
            None => return 0,
        };
        if reached == 0 {
            self.channels
                .remove_if(&facility_id, |_, s| s.receiver_count() == 0);
        }
        reached
    }

    /// Tear down a facility's channel; live subscribers see their stream
    /// end. Used when the facility itself is deleted.
    pub fn close(&self, facility_id: &Ulid) {
        self.channels.remove(facility_id);
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
