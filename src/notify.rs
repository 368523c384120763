use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// What a listener subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Changes to one item and its reservations.
    Item(Ulid),
    /// Every change in the tenant.
    All,
}

impl Topic {
    /// `item_<ulid>` or `all`.
    pub fn parse(channel: &str) -> Option<Topic> {
        let channel = channel.trim().trim_matches('"');
        if channel.eq_ignore_ascii_case("all") {
            return Some(Topic::All);
        }
        let id = channel
            .strip_prefix("item_")
            .or_else(|| channel.strip_prefix("ITEM_"))?;
        id.parse::<Ulid>().ok().map(Topic::Item)
    }

    pub fn channel_name(&self) -> String {
        match self {
            Topic::Item(id) => format!("item_{id}"),
            Topic::All => "all".to_string(),
        }
    }
}

/// Change notice pushed to listeners. Carries ids only: tokens and
/// customer details never leave the engine this way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: &'static str,
    pub item_id: Option<Ulid>,
    pub entity_id: Option<Ulid>,
}

impl Notice {
    pub fn from_event(event: &Event) -> Self {
        let entity_id = match event {
            Event::TenantConfigured { .. } => None,
            Event::ItemCreated { item } | Event::ItemUpdated { item } => Some(item.id),
            Event::ItemDeleted { id } => Some(*id),
            Event::ReservationPlaced { reservation, .. } => Some(reservation.id),
            Event::ReservationConfirmed { id, .. }
            | Event::ReservationStatusChanged { id, .. }
            | Event::PaymentRecorded { id, .. } => Some(*id),
        };
        Self {
            kind: event.kind(),
            item_id: event.item_id(),
            entity_id,
        }
    }
}

/// Broadcast hub for LISTEN/NOTIFY within one tenant.
pub struct NotifyHub {
    channels: DashMap<Topic, broadcast::Sender<Notice>>,
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

    /// Subscribe to a topic. Creates the channel if needed.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish to the event's item topic and to `All`. No-op without listeners.
    pub fn send(&self, event: &Event) {
        let notice = Notice::from_event(event);
        if let Some(item_id) = notice.item_id
            && let Some(sender) = self.channels.get(&Topic::Item(item_id))
        {
            let _ = sender.send(notice.clone());
        }
        if let Some(sender) = self.channels.get(&Topic::All) {
            let _ = sender.send(notice);
        }
        if let Event::ItemDeleted { id } = event {
            self.remove(&Topic::Item(*id));
        }
    }

    pub fn remove(&self, topic: &Topic) {
        self.channels.remove(topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    fn item(id: Ulid) -> InventoryItem {
        InventoryItem {
            id,
            name: "City bike".into(),
            total_stock: 4,
            broken_count: 0,
            hourly_cost_cents: None,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let id = Ulid::new();
        let mut rx = hub.subscribe(Topic::Item(id));

        hub.send(&Event::ItemUpdated { item: item(id) });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, "item_updated");
        assert_eq!(received.item_id, Some(id));
        assert_eq!(received.entity_id, Some(id));
    }

    #[tokio::test]
    async fn all_topic_sees_every_item() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Topic::All);
        let other = Ulid::new();
        let mut unrelated = hub.subscribe(Topic::Item(Ulid::new()));

        hub.send(&Event::ItemCreated { item: item(other) });

        assert_eq!(rx.recv().await.unwrap().item_id, Some(other));
        assert!(unrelated.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&Event::ItemDeleted { id: Ulid::new() });
    }

    #[test]
    fn topic_parse() {
        let id = Ulid::new();
        assert_eq!(Topic::parse(&format!("item_{id}")), Some(Topic::Item(id)));
        assert_eq!(Topic::parse("ALL"), Some(Topic::All));
        assert_eq!(Topic::parse("item_nope"), None);
        assert_eq!(Topic::parse("bikes"), None);
        assert_eq!(Topic::parse(&Topic::Item(id).channel_name()), Some(Topic::Item(id)));
    }
}
