use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Booking, Resource, SlotKey};

const CHANNEL_CAPACITY: usize = 256;

/// Who a notification is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every slot of one resource.
    Resource(Ulid),
    /// A single (resource, date, slot).
    Slot(SlotKey),
    /// Personal notifications for one user.
    User(Ulid),
}

/// Allocator output handed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    BookingCreated {
        key: SlotKey,
        booking: Booking,
    },
    BookingCancelled {
        key: SlotKey,
        cancelled: Booking,
        promoted: Option<Booking>,
    },
    WaitlistPromoted {
        booking: Booking,
    },
    /// Created, edited or deactivated.
    ResourceUpdated {
        resource: Resource,
    },
}

impl Notification {
    /// Topics this notification fans out to.
    pub fn topics(&self) -> Vec<Topic> {
        match self {
            Notification::BookingCreated { key, .. } | Notification::BookingCancelled { key, .. } => {
                vec![Topic::Slot(*key), Topic::Resource(key.resource_id)]
            }
            Notification::WaitlistPromoted { booking } => vec![Topic::User(booking.user_id)],
            Notification::ResourceUpdated { resource } => vec![Topic::Resource(resource.id)],
        }
    }
}

/// Broadcast hub, one channel per topic. Sending never blocks; slow
/// subscribers observe `RecvError::Lagged` instead of stalling the engine.
pub struct NotifyHub {
    channels: DashMap<Topic, broadcast::Sender<Notification>>,
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

    /// Subscribe to a topic, creating its channel on first use.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Deliver to every topic the notification addresses. No-op for topics nobody listens on.
    pub fn publish(&self, notification: &Notification) {
        for topic in notification.topics() {
            if let Some(sender) = self.channels.get(&topic) {
                let _ = sender.send(notification.clone());
            }
        }
    }

    /// Drop channels whose receivers are all gone.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn topic_count(&self) -> usize {
        self.channels.len()
    }
}
