use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::NodeError;

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = NodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(NodeError::Configuration(format!("invalid QoS value {other}, expected 0, 1 or 2"))),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// One desired subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub topic_filter: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new(topic_filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            qos,
        }
    }
}

/// Insertion-ordered set of subscriptions keyed by topic filter.
///
/// This is the desired state the node restores after every reconnect, so it
/// is never touched by connection events, only by subscribe and unsubscribe.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `topic_filter` unless it is already present. The first QoS
    /// registered for a filter wins. Returns `true` if the entry was added.
    pub fn insert(&mut self, topic_filter: &str, qos: QoS) -> bool {
        if self.contains(topic_filter) {
            return false;
        }
        self.entries.push(Subscription::new(topic_filter, qos));
        true
    }

    /// Remove the entry for `topic_filter`, keeping the order of the rest.
    pub fn remove(&mut self, topic_filter: &str) -> Option<Subscription> {
        let index = self.entries.iter().position(|s| s.topic_filter == topic_filter)?;
        Some(self.entries.remove(index))
    }

    pub fn contains(&self, topic_filter: &str) -> bool {
        self.entries.iter().any(|s| s.topic_filter == topic_filter)
    }

    pub fn get(&self, topic_filter: &str) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.topic_filter == topic_filter)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<Subscription> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
