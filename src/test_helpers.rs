//! In-memory transport for exercising the node without a broker.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::BrokerConfig;
use crate::subscription::QoS;
use crate::transport::{Transport, TransportError, TransportEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Reconnect,
    Disconnect,
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        user_properties: Vec<(String, String)>,
    },
    Subscribe(String, QoS),
    Unsubscribe(String),
}

/// Records every call and emits the events a real link would.
pub struct MockTransport {
    connected: AtomicBool,
    refusals: AtomicU32,
    late_connacks: AtomicU32,
    failing_subscribes: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Call>>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mock = Arc::new(Self {
            connected: AtomicBool::new(false),
            refusals: AtomicU32::new(0),
            late_connacks: AtomicU32::new(0),
            failing_subscribes: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(Some(tx)),
        });
        (mock, rx)
    }

    /// Refuse the next `n` reconnect attempts.
    pub fn refuse_next(&self, n: u32) {
        self.refusals.store(n, Ordering::SeqCst);
    }

    /// For the next `n` reconnects the link comes up, but only after the
    /// attempt has already reported a timeout.
    pub fn connack_after_deadline(&self, n: u32) {
        self.late_connacks.store(n, Ordering::SeqCst);
    }

    pub fn fail_subscribe_to(&self, topic: &str) {
        self.failing_subscribes.lock().unwrap().insert(topic.to_string());
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Simulate the broker dropping the link.
    pub fn drop_link(&self, reason: &str) {
        self.set_connected(false);
        self.emit(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Subscribe(topic, _) => Some(topic),
                _ => None,
            })
            .collect()
    }

    pub fn reconnect_count(&self) -> usize {
        self.calls().iter().filter(|c| **c == Call::Reconnect).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn reconnect(&self) -> Result<(), TransportError> {
        self.record(Call::Reconnect);
        self.emit(TransportEvent::PreConnect);

        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            self.emit(TransportEvent::ConnectFailed {
                reason: "refused".into(),
            });
            return Err(TransportError::ConnectionRefused("refused".into()));
        }

        self.set_connected(true);
        self.emit(TransportEvent::Connected);

        let late = self
            .late_connacks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if late {
            return Err(TransportError::Timeout(Duration::from_secs(2)));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record(Call::Disconnect);
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(TransportEvent::Disconnected {
                reason: "client disconnect".into(),
            });
        }
        self.events.lock().unwrap().take();
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        user_properties: Vec<(String, String)>,
    ) -> Result<(), TransportError> {
        self.record(Call::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            user_properties,
        });
        Ok(())
    }

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.record(Call::Subscribe(topic_filter.to_string(), qos));
        if self.failing_subscribes.lock().unwrap().contains(topic_filter) {
            return Err(TransportError::Client("subscribe rejected".into()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), TransportError> {
        self.record(Call::Unsubscribe(topic_filter.to_string()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub fn broker_config(reconnect_attempts: u32) -> BrokerConfig {
    BrokerConfig {
        username: "node".into(),
        password: "secret".into(),
        keepalive: 60,
        hostname: "broker.test".into(),
        port: 1883,
        timeout: 2,
        reconnect_attempts,
    }
}

/// Let the dispatch loop drain queued events.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
