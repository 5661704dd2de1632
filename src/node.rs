//! The connection supervisor: a node that keeps one logical MQTT session
//! alive across link failures.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::NodeError;
use crate::identity::{IdAllocator, NodeIdentity};
use crate::metrics::{MetricsRegistry, MetricsSnapshot, NodeMetrics};
use crate::mqtt_transport::RumqttTransport;
use crate::router;
use crate::service_utils::{convert_bytes_to_human_readable, parse_user_properties};
use crate::subscription::{QoS, Subscription, SubscriptionRegistry};
use crate::transport::{Transport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts ran out. The next `ensure_connection` starts over.
    Failed,
}

/// State shared between the caller-facing [`Node`] and the dispatch loop.
pub(crate) struct NodeShared {
    pub(crate) identity: NodeIdentity,
    pub(crate) config: BrokerConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: Mutex<SubscriptionRegistry>,
    pub(crate) state: Mutex<ConnectionState>,
    pub(crate) metrics: NodeMetrics,
}

impl NodeShared {
    pub(crate) async fn set_state(&self, state: ConnectionState) {
        *self.state.lock().await = state;
    }

    /// Move to `to` only if the current state is `from`.
    pub(crate) async fn transition(&self, from: ConnectionState, to: ConnectionState) {
        let mut state = self.state.lock().await;
        if *state == from {
            *state = to;
        }
    }

    /// Re-issue every desired subscription in registry order.
    ///
    /// The registry stays locked for the whole replay, so subscribe and
    /// unsubscribe calls wait until it is done.
    pub(crate) async fn restore_subscriptions(&self) -> usize {
        let registry = self.registry.lock().await;
        let mut restored = 0;

        for subscription in registry.iter() {
            match self
                .transport
                .subscribe(&subscription.topic_filter, subscription.qos)
                .await
            {
                Ok(()) => {
                    restored += 1;
                    info!(
                        topic = %subscription.topic_filter,
                        qos = %subscription.qos,
                        "Subscribed to topic: {}",
                        subscription.topic_filter
                    );
                }
                Err(e) => {
                    let failure = NodeError::SubscribeFailure {
                        topic: subscription.topic_filter.clone(),
                        reason: e.to_string(),
                    };
                    error!(topic = %subscription.topic_filter, "{}", failure);
                }
            }
        }
        restored
    }
}

/// Optional settings for a new node.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    pub name: Option<String>,
    /// Explicit id. Uniqueness is then up to the caller.
    pub node_id: Option<String>,
    pub node_type: Option<String>,
    /// Subscriptions desired from the start, replayed on every connect.
    pub subscriptions: Vec<Subscription>,
}

/// Creates nodes that share one id sequence and one metrics registry.
#[derive(Debug, Clone, Default)]
pub struct NodeFactory {
    ids: Arc<IdAllocator>,
    metrics: Arc<MetricsRegistry>,
}

impl NodeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parts(ids: Arc<IdAllocator>, metrics: Arc<MetricsRegistry>) -> Self {
        Self { ids, metrics }
    }

    pub fn metrics_registry(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Build a node connected through rumqttc. Nothing touches the network
    /// until [`Node::connect`].
    pub fn create(&self, config: BrokerConfig, options: NodeOptions) -> Result<Node, NodeError> {
        let identity = self.resolve_identity(&options);
        let (transport, events) = RumqttTransport::new(&config, &identity.node_id);
        Node::assemble(identity, config, Arc::new(transport), events, &self.metrics, options.subscriptions)
    }

    /// Build a node on top of a caller-supplied transport.
    pub fn create_with_transport(
        &self,
        config: BrokerConfig,
        options: NodeOptions,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<Node, NodeError> {
        let identity = self.resolve_identity(&options);
        Node::assemble(identity, config, transport, events, &self.metrics, options.subscriptions)
    }

    fn resolve_identity(&self, options: &NodeOptions) -> NodeIdentity {
        NodeIdentity::resolve(
            &self.ids,
            options.node_id.clone(),
            options.name.clone(),
            options.node_type.clone(),
        )
    }
}

/// A managed broker session.
///
/// Subscriptions are kept as desired state and replayed after every
/// (re)connect. Publishing on a dropped link reconnects first, bounded by
/// `reconnect_attempts`. Call [`Node::close`] when done.
pub struct Node {
    pub(crate) shared: Arc<NodeShared>,
    events: StdMutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
    connect_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Node {
    fn assemble(
        identity: NodeIdentity,
        config: BrokerConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        metrics: &MetricsRegistry,
        subscriptions: Vec<Subscription>,
    ) -> Result<Self, NodeError> {
        let mut registry = SubscriptionRegistry::new();
        for subscription in subscriptions {
            validate_filter(&subscription.topic_filter)?;
            registry.insert(&subscription.topic_filter, subscription.qos);
        }

        let metrics = NodeMetrics::new(metrics, &identity, &config.hostname)?;
        debug!(node_id = %identity.node_id, "Created node for broker at {}", config.address());

        Ok(Self {
            shared: Arc::new(NodeShared {
                identity,
                config,
                transport,
                registry: Mutex::new(registry),
                state: Mutex::new(ConnectionState::Disconnected),
                metrics,
            }),
            events: StdMutex::new(Some(events)),
            dispatcher: StdMutex::new(None),
            connect_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.shared.identity
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    pub fn is_connected(&self) -> bool {
        self.shared.transport.is_connected()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.lock().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.registry.lock().await.to_vec()
    }

    /// Start event processing and wait until the broker session is up.
    ///
    /// A no-op when already connected.
    pub async fn connect(&self) -> Result<(), NodeError> {
        self.check_open()?;
        self.start_dispatcher();
        self.ensure_connection().await
    }

    /// Reconnect if the link is down.
    ///
    /// Makes up to `reconnect_attempts` attempts, sleeping `timeout` seconds
    /// between them, and fails with [`NodeError::ConnectionExhausted`] after
    /// the last one. Returns at once, without touching the transport, when
    /// already connected.
    pub async fn ensure_connection(&self) -> Result<(), NodeError> {
        self.check_open()?;
        if self.shared.transport.is_connected() {
            return Ok(());
        }
        self.start_dispatcher();

        let _connecting = self.connect_lock.lock().await;
        if self.shared.transport.is_connected() {
            return Ok(());
        }

        let shared = &*self.shared;
        let attempts = shared.config.reconnect_attempts;
        let address = shared.config.address();
        if attempts == 0 {
            shared.set_state(ConnectionState::Failed).await;
            return Err(NodeError::ConnectionExhausted {
                attempts,
                last_error: "no reconnect attempts configured".to_string(),
            });
        }

        let retry_interval = shared.config.retry_interval();
        let strategy = FixedInterval::new(retry_interval).take(attempts as usize - 1);
        let attempt = AtomicU32::new(0);
        let (attempt, address_ref) = (&attempt, &address);

        let result = Retry::start(strategy, move || async move {
            let n = attempt.fetch_add(1, Ordering::Relaxed) + 1;
            shared.set_state(ConnectionState::Connecting).await;

            let result = match shared.transport.reconnect().await {
                // The CONNACK raced the attempt's deadline.
                Err(e) if shared.transport.is_connected() => {
                    debug!(attempt = n, "Link came up despite: {}", e);
                    Ok(())
                }
                other => other,
            };
            if let Err(e) = &result {
                if e.is_refused() {
                    error!(attempt = n, "Failed to reconnect to broker at {}: {}", address_ref, e);
                } else {
                    warn!(attempt = n, "Connection attempt to {} failed: {}", address_ref, e);
                }
                if n < attempts {
                    info!("Retry attempt {} in {}s", n + 1, retry_interval.as_secs());
                }
            }
            result
        })
        .await;

        match result {
            Ok(()) => {
                shared.set_state(ConnectionState::Connected).await;
                Ok(())
            }
            Err(_) if shared.transport.is_connected() => {
                shared.set_state(ConnectionState::Connected).await;
                Ok(())
            }
            Err(e) => {
                shared.set_state(ConnectionState::Failed).await;
                error!("Giving up on broker at {} after {} attempts", address, attempts);
                Err(NodeError::ConnectionExhausted {
                    attempts,
                    last_error: e.to_string(),
                })
            }
        }
    }

    /// Publish `payload` on `topic`, reconnecting first if needed.
    ///
    /// The message counts as sent once the broker acknowledges it.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), NodeError> {
        self.send(topic, payload.into(), qos, retain, Vec::new()).await
    }

    /// Publish with MQTT v5 user properties taken from a JSON object.
    pub async fn publish_with_properties(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
        properties: &Value,
    ) -> Result<(), NodeError> {
        let user_properties = parse_user_properties(properties)?;
        self.send(topic, payload.into(), qos, retain, user_properties).await
    }

    async fn send(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        user_properties: Vec<(String, String)>,
    ) -> Result<(), NodeError> {
        if topic.is_empty() {
            return Err(NodeError::Configuration("publish topic must not be empty".to_string()));
        }
        self.ensure_connection().await?;

        let len = payload.len();
        self.shared
            .transport
            .publish(topic, payload, qos, retain, user_properties)
            .await?;
        self.shared.metrics.record_bytes_sent(len);
        debug!(topic, qos = %qos, "Queued {} for publish", convert_bytes_to_human_readable(len as f64));
        Ok(())
    }

    /// Subscribe to `topic` and keep it desired across reconnects.
    ///
    /// While disconnected the filter is only recorded; the next connect sends
    /// it. A filter that is already registered keeps its QoS, but is sent
    /// again while connected so a rejected subscribe can be retried.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), NodeError> {
        self.check_open()?;
        validate_filter(topic)?;

        let mut registry = self.shared.registry.lock().await;
        let qos = match registry.get(topic) {
            Some(registered) => {
                debug!(topic, qos = %registered.qos, "Already registered, keeping its QoS");
                registered.qos
            }
            None => qos,
        };

        if self.shared.transport.is_connected() {
            match self.shared.transport.subscribe(topic, qos).await {
                Ok(()) => info!(topic, qos = %qos, "Subscribed to topic: {}", topic),
                Err(e) => {
                    let failure = NodeError::SubscribeFailure {
                        topic: topic.to_string(),
                        reason: e.to_string(),
                    };
                    error!(topic, "{}", failure);
                }
            }
        } else {
            debug!(topic, "Not connected, subscription will be sent on connect");
        }

        registry.insert(topic, qos);
        Ok(())
    }

    /// Stop receiving `topic` and drop it from the desired set, so it is not
    /// restored on the next reconnect.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), NodeError> {
        self.unsubscribe_many(&[topic]).await
    }

    /// [`Node::unsubscribe`] for several filters, all removed under one
    /// registry lock so a replay sees either none or all of them.
    pub async fn unsubscribe_many(&self, topics: &[&str]) -> Result<(), NodeError> {
        self.check_open()?;

        let mut registry = self.shared.registry.lock().await;
        for &topic in topics {
            if registry.remove(topic).is_none() {
                debug!(topic, "Topic was not in the subscription registry");
            }
        }
        if registry.is_empty() {
            debug!("No subscriptions left to restore");
        }

        if self.shared.transport.is_connected() {
            for &topic in topics {
                match self.shared.transport.unsubscribe(topic).await {
                    Ok(()) => info!(topic, "Unsubscribed from topic: {}", topic),
                    Err(e) => warn!(topic, "Failed to unsubscribe from topic {}: {}", topic, e),
                }
            }
        }
        Ok(())
    }

    /// Record a desired subscription without sending anything.
    /// Returns `false` if the filter was already registered.
    pub async fn add_subscription_topic(&self, topic: &str, qos: QoS) -> Result<bool, NodeError> {
        validate_filter(topic)?;
        Ok(self.shared.registry.lock().await.insert(topic, qos))
    }

    /// Re-send every registered subscription. Returns how many succeeded.
    pub async fn restore_subscriptions(&self) -> usize {
        self.shared.restore_subscriptions().await
    }

    /// Disconnect and stop background processing, each step bounded by `grace`.
    pub async fn close(&self, grace: Duration) -> Result<(), NodeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match timeout(grace, self.shared.transport.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Error while disconnecting: {}", e),
            Err(_) => warn!("Disconnect did not finish within {:?}", grace),
        }

        let dispatcher = self.dispatcher.lock().ok().and_then(|mut d| d.take());
        if let Some(mut handle) = dispatcher {
            if timeout(grace, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.shared.set_state(ConnectionState::Disconnected).await;

        let totals = self.metrics();
        info!(
            node_id = %self.shared.identity.node_id,
            "Disconnected from broker at {} (sent {} in {} messages, received {} in {} messages)",
            self.shared.config.address(),
            convert_bytes_to_human_readable(totals.bytes_sent as f64),
            totals.messages_sent,
            convert_bytes_to_human_readable(totals.bytes_received as f64),
            totals.messages_received
        );
        Ok(())
    }

    fn check_open(&self) -> Result<(), NodeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NodeError::Closed);
        }
        Ok(())
    }

    fn start_dispatcher(&self) {
        let events = match self.events.lock() {
            Ok(mut events) => events.take(),
            Err(_) => None,
        };
        if let Some(events) = events {
            let handle = tokio::spawn(router::run(self.shared.clone(), events));
            if let Ok(mut dispatcher) = self.dispatcher.lock() {
                *dispatcher = Some(handle);
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let dispatcher = self.dispatcher.get_mut().ok().and_then(|d| d.take());
        if let Some(handle) = dispatcher {
            if !self.closed.load(Ordering::SeqCst) {
                warn!(
                    node_id = %self.shared.identity.node_id,
                    "Node dropped without close(), stopping event dispatch"
                );
            }
            handle.abort();
        }
    }
}

fn validate_filter(topic: &str) -> Result<(), NodeError> {
    if topic.is_empty() {
        return Err(NodeError::Configuration("topic filter must not be empty".to_string()));
    }
    Ok(())
}
