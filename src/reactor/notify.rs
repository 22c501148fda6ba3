//! Publish/subscribe notifications.
//!
//! Subscriptions are one-shot. A publish delivers to the subscribers present
//! when it starts and forgets them; whoever wants the next notification
//! subscribes again. Late subscribers never see earlier publishes.

use std::collections::HashMap;

use super::Reactor;
use crate::error::Result;

/// Published whenever the speedtest queue may have moved.
pub const RENEGOTIATE: &str = "renegotiate";

/// Callback delivered on publish.
pub type Subscriber = Box<dyn FnOnce(&mut Reactor) -> Result<()>>;

/// Topic → waiting subscribers.
#[derive(Default)]
pub struct NotificationBus {
    subscribers: HashMap<String, Vec<Subscriber>>,
}

impl NotificationBus {
    /// Add a subscriber to `topic`.
    pub fn subscribe(&mut self, topic: &str, subscriber: Subscriber) {
        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .push(subscriber);
    }

    /// Detach every subscriber currently waiting on `topic`.
    pub fn take(&mut self, topic: &str) -> Vec<Subscriber> {
        self.subscribers.remove(topic).unwrap_or_default()
    }

    /// Number of subscribers waiting on `topic`.
    pub fn count(&self, topic: &str) -> usize {
        self.subscribers.get(topic).map_or(0, Vec::len)
    }
}
