use crate::config::BrokerConfig;
use crate::subscription::QoS;
use crate::transport::{Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{Packet, PublishProperties, SubscribeReasonCode};
use rumqttc::v5::mqttbytes::QoS as WireQoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions};
use rumqttc::Outgoing;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, trace, warn};

/// Capacity of the rumqttc request channel between the client and the event loop.
const REQUEST_CAPACITY: usize = 64;

type ConnectReply = oneshot::Sender<Result<(), TransportError>>;

/// Link state shared between the client half and the I/O task.
#[derive(Debug, Default)]
struct LinkState {
    connected: AtomicBool,
    // Filters handed to the client, waiting for their packet id.
    queued_subscribes: StdMutex<VecDeque<String>>,
    // Packet id -> filter, waiting for the SUBACK.
    inflight_subscribes: StdMutex<HashMap<u16, String>>,
}

impl LinkState {
    /// SUBACKs never arrive for a link that is gone. Returns how many
    /// subscribes were still pending.
    fn forget_subscribes(&self) -> usize {
        let mut dropped = 0;
        if let Ok(mut queued) = self.queued_subscribes.lock() {
            dropped += queued.len();
            queued.clear();
        }
        if let Ok(mut inflight) = self.inflight_subscribes.lock() {
            dropped += inflight.len();
            inflight.clear();
        }
        dropped
    }
}

/// [`Transport`] backed by a rumqttc MQTT v5 client.
///
/// The event loop is spawned on the first `reconnect`. While disconnected the
/// loop sits idle and only polls the broker again when asked to reconnect.
pub struct RumqttTransport {
    client: AsyncClient,
    link: Arc<LinkState>,
    driver: StdMutex<Option<Driver>>,
    commands: StdMutex<Option<mpsc::Sender<ConnectReply>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    connect_timeout: Duration,
    address: String,
}

impl RumqttTransport {
    pub fn new(config: &BrokerConfig, client_id: &str) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        debug!("Configuring MQTT broker at {}...", config.address());

        let mut mqtt_options = MqttOptions::new(client_id, &config.hostname, config.port);
        mqtt_options.set_keep_alive(config.keepalive_interval());
        mqtt_options.set_clean_start(true);

        if !config.username.is_empty() {
            mqtt_options.set_credentials(&config.username, &config.password);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(1);
        let link = Arc::new(LinkState::default());

        let driver = Driver {
            eventloop,
            commands: commands_rx,
            events: events_tx,
            link: link.clone(),
            address: config.address(),
        };

        let transport = Self {
            client,
            link,
            driver: StdMutex::new(Some(driver)),
            commands: StdMutex::new(Some(commands_tx)),
            task: Mutex::new(None),
            connect_timeout: config.connect_timeout(),
            address: config.address(),
        };

        (transport, events_rx)
    }

    fn take_driver(&self) -> Option<Driver> {
        match self.driver.lock() {
            Ok(mut driver) => driver.take(),
            Err(_) => None,
        }
    }

    fn command_sender(&self) -> Option<mpsc::Sender<ConnectReply>> {
        self.commands.lock().ok().and_then(|commands| commands.clone())
    }

    async fn start_driver(&self) {
        if let Some(driver) = self.take_driver() {
            debug!("Starting MQTT event loop for {}", self.address);
            let handle = tokio::spawn(driver.run());
            *self.task.lock().await = Some(handle);
        }
    }

    fn queue_subscribe(&self, topic_filter: &str) {
        if let Ok(mut queued) = self.link.queued_subscribes.lock() {
            queued.push_back(topic_filter.to_string());
        }
    }

    fn unqueue_subscribe(&self) {
        if let Ok(mut queued) = self.link.queued_subscribes.lock() {
            queued.pop_back();
        }
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        self.start_driver().await;

        let commands = self.command_sender().ok_or(TransportError::Closed)?;
        let (reply_tx, reply_rx) = oneshot::channel();

        // Dropping `reply_rx` on timeout cancels the attempt in the driver.
        let attempt = async move {
            if commands.send(reply_tx).await.is_err() {
                return Err(TransportError::Closed);
            }
            reply_rx.await.unwrap_or(Err(TransportError::Closed))
        };
        match timeout(self.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.connect_timeout)),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            if let Err(e) = self.client.disconnect().await {
                warn!("Failed to send disconnect to {}: {}", self.address, e);
            }
        }

        // Without a command sender the idle event loop exits.
        if let Ok(mut commands) = self.commands.lock() {
            commands.take();
        }
        drop(self.take_driver());

        let handle = self.task.lock().await.take();
        if let Some(mut handle) = handle {
            if timeout(self.connect_timeout, &mut handle).await.is_err() {
                warn!("MQTT event loop for {} did not stop in time, aborting it", self.address);
                handle.abort();
            }
        }
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
        let qos = to_wire(qos);
        let result = if user_properties.is_empty() {
            self.client.publish(topic, qos, retain, payload).await
        } else {
            let properties = PublishProperties {
                user_properties,
                ..Default::default()
            };
            self.client
                .publish_with_properties(topic, qos, retain, payload, properties)
                .await
        };
        result.map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.queue_subscribe(topic_filter);
        self.client
            .subscribe(topic_filter, to_wire(qos))
            .await
            .map_err(|e| {
                self.unqueue_subscribe();
                TransportError::Client(e.to_string())
            })
    }

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), TransportError> {
        self.client
            .unsubscribe(topic_filter)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

/// Owns the rumqttc event loop inside the background task.
struct Driver {
    eventloop: EventLoop,
    commands: mpsc::Receiver<ConnectReply>,
    events: mpsc::UnboundedSender<TransportEvent>,
    link: Arc<LinkState>,
    address: String,
}

impl Driver {
    async fn run(mut self) {
        while let Some(mut reply) = self.commands.recv().await {
            if reply.is_closed() {
                trace!("Skipping reconnect request nobody is waiting for");
                continue;
            }
            if self.link.connected.load(Ordering::SeqCst) {
                let _ = reply.send(Ok(()));
                continue;
            }

            self.emit(TransportEvent::PreConnect);
            // Nothing is connected until the CONNACK, so dropping the poll
            // here leaves the event loop idle.
            let outcome = tokio::select! {
                result = self.await_connack() => result,
                _ = reply.closed() => Err(TransportError::Connection("connect attempt abandoned".to_string())),
            };
            match outcome {
                Ok(()) => {
                    self.link.connected.store(true, Ordering::SeqCst);
                    self.emit(TransportEvent::Connected);
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", self.address, e);
                    self.link.forget_subscribes();
                    self.emit(TransportEvent::ConnectFailed { reason: e.to_string() });
                    let _ = reply.send(Err(e));
                    continue;
                }
            }

            let reason = self.pump().await;
            self.link.connected.store(false, Ordering::SeqCst);
            let dropped = self.link.forget_subscribes();
            if dropped > 0 {
                debug!("Dropped {} unacknowledged subscribes", dropped);
            }
            self.emit(TransportEvent::Disconnected { reason });
        }
        info!("MQTT event loop for {} stopped", self.address);
    }

    async fn await_connack(&mut self) -> Result<(), TransportError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(event) => {
                    if let Some(reason) = self.handle_event(event) {
                        return Err(TransportError::Connection(reason));
                    }
                }
                Err(e) => return Err(map_connection_error(e)),
            }
        }
    }

    /// Poll until the link ends and return why it ended.
    async fn pump(&mut self) -> String {
        loop {
            match self.eventloop.poll().await {
                Ok(event) => {
                    if let Some(reason) = self.handle_event(event) {
                        return reason;
                    }
                }
                Err(e) => return e.to_string(),
            }
        }
    }

    fn handle_event(&self, event: Event) -> Option<String> {
        match event {
            Event::Incoming(Packet::Publish(publish)) => {
                self.emit(TransportEvent::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                    payload: publish.payload.to_vec(),
                    qos: from_wire(publish.qos),
                });
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                self.emit(TransportEvent::PublishAcked { pkid: ack.pkid });
            }
            Event::Incoming(Packet::PubComp(comp)) => {
                self.emit(TransportEvent::PublishAcked { pkid: comp.pkid });
            }
            // QoS 0 publishes carry packet id 0 and are never acknowledged.
            Event::Outgoing(Outgoing::Publish(0)) => {
                self.emit(TransportEvent::PublishAcked { pkid: 0 });
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                let topic = self
                    .link
                    .queued_subscribes
                    .lock()
                    .ok()
                    .and_then(|mut queued| queued.pop_front());
                if let (Some(topic), Ok(mut inflight)) = (topic, self.link.inflight_subscribes.lock()) {
                    inflight.insert(pkid, topic);
                }
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let topic = self
                    .link
                    .inflight_subscribes
                    .lock()
                    .ok()
                    .and_then(|mut inflight| inflight.remove(&ack.pkid));
                for code in &ack.return_codes {
                    if !matches!(code, SubscribeReasonCode::Success(_)) {
                        self.emit(TransportEvent::SubscribeRejected {
                            topic: topic.clone(),
                            reason: format!("{:?}", code),
                        });
                    }
                }
            }
            Event::Incoming(Packet::Disconnect(disconnect)) => {
                return Some(format!("{:?}", disconnect.reason_code));
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                return Some("client disconnect".to_string());
            }
            other => {
                trace!("Unhandled event: {:?}", other);
            }
        }
        None
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }
}

fn map_connection_error(error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::ConnectionRefused(code) => TransportError::ConnectionRefused(format!("{:?}", code)),
        ConnectionError::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            TransportError::ConnectionRefused(e.to_string())
        }
        other => TransportError::Connection(other.to_string()),
    }
}

fn to_wire(qos: QoS) -> WireQoS {
    match qos {
        QoS::AtMostOnce => WireQoS::AtMostOnce,
        QoS::AtLeastOnce => WireQoS::AtLeastOnce,
        QoS::ExactlyOnce => WireQoS::ExactlyOnce,
    }
}

fn from_wire(qos: WireQoS) -> QoS {
    match qos {
        WireQoS::AtMostOnce => QoS::AtMostOnce,
        WireQoS::AtLeastOnce => QoS::AtLeastOnce,
        WireQoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNACK: [u8; 5] = [0x20, 0x03, 0x00, 0x00, 0x00];

    fn config(port: u16, timeout: u64) -> BrokerConfig {
        BrokerConfig {
            username: String::new(),
            password: String::new(),
            keepalive: 30,
            hostname: "127.0.0.1".into(),
            port,
            timeout,
            reconnect_attempts: 1,
        }
    }

    async fn local_broker() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    /// Next control packet from the client as (first header byte, body),
    /// skipping keepalive pings.
    async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        loop {
            let header = stream.read_u8().await.unwrap();
            let mut len = 0usize;
            let mut shift = 0;
            loop {
                let byte = stream.read_u8().await.unwrap();
                len |= ((byte & 0x7f) as usize) << shift;
                if byte & 0x80 == 0 {
                    break;
                }
                shift += 7;
            }
            let mut body = vec![0; len];
            stream.read_exact(&mut body).await.unwrap();
            if header != 0xC0 {
                return (header, body);
            }
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no transport event in time")
            .expect("event stream closed")
    }

    #[test]
    fn refused_connections_are_classified() {
        let error = ConnectionError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(map_connection_error(error).is_refused());

        let error = ConnectionError::Io(io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(map_connection_error(error), TransportError::Connection(_)));
    }

    #[test]
    fn qos_maps_both_ways() {
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
            assert_eq!(from_wire(to_wire(qos)), qos);
        }
    }

    #[tokio::test]
    async fn starts_disconnected_and_closes_without_connecting() {
        let (transport, mut events) = RumqttTransport::new(&config(1883, 1), "test-client");
        assert!(!transport.is_connected());

        transport.disconnect().await.unwrap();
        assert_eq!(transport.reconnect().await, Err(TransportError::Closed));
        // The unstarted driver was dropped, so the event stream is finished.
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn broker_traffic_becomes_events() {
        let (listener, port) = local_broker().await;
        let (hang_up_tx, hang_up) = oneshot::channel::<()>();

        let broker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (header, _) = read_packet(&mut stream).await;
            assert_eq!(header, 0x10);
            stream.write_all(&CONNACK).await.unwrap();

            // Refuse the first subscribe.
            let (header, body) = read_packet(&mut stream).await;
            assert_eq!(header, 0x82);
            stream.write_all(&[0x90, 0x04, body[0], body[1], 0x00, 0x87]).await.unwrap();

            // QoS 0 needs no answer, QoS 1 gets a PUBACK.
            let (header, _) = read_packet(&mut stream).await;
            assert_eq!(header & 0xF6, 0x30);
            let (header, body) = read_packet(&mut stream).await;
            assert_eq!(header & 0xF6, 0x32);
            let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
            let pkid = [body[2 + topic_len], body[3 + topic_len]];
            stream.write_all(&[0x40, 0x02, pkid[0], pkid[1]]).await.unwrap();

            // A message for the client on "s/t".
            stream
                .write_all(&[0x30, 0x08, 0x00, 0x03, b's', b'/', b't', 0x00, b'h', b'i'])
                .await
                .unwrap();

            // Leave this subscribe unanswered, then drop the link.
            let (header, _) = read_packet(&mut stream).await;
            assert_eq!(header, 0x82);
            let _ = hang_up.await;
            drop(stream);
            listener
        });

        let (transport, mut events) = RumqttTransport::new(&config(port, 2), "link-test");
        transport.reconnect().await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(next_event(&mut events).await, TransportEvent::PreConnect);
        assert_eq!(next_event(&mut events).await, TransportEvent::Connected);

        transport.subscribe("t/#", QoS::AtLeastOnce).await.unwrap();
        match next_event(&mut events).await {
            TransportEvent::SubscribeRejected { topic, reason } => {
                assert_eq!(topic.as_deref(), Some("t/#"));
                assert!(reason.contains("NotAuthorized"), "reason {reason}");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        transport
            .publish("a", b"x".to_vec(), QoS::AtMostOnce, false, Vec::new())
            .await
            .unwrap();
        assert_eq!(next_event(&mut events).await, TransportEvent::PublishAcked { pkid: 0 });
        transport
            .publish("a", b"y".to_vec(), QoS::AtLeastOnce, false, Vec::new())
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::PublishAcked { pkid } if pkid != 0
        ));

        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::MessageReceived {
                topic: "s/t".into(),
                payload: b"hi".to_vec(),
                qos: QoS::AtMostOnce,
            }
        );

        transport.subscribe("pending/#", QoS::AtMostOnce).await.unwrap();
        let _ = hang_up_tx.send(());
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Disconnected { .. }
        ));
        assert!(!transport.is_connected());
        assert_eq!(transport.link.forget_subscribes(), 0);

        // Nobody asked for a reconnect, so none happens.
        let listener = broker.await.unwrap();
        assert!(timeout(Duration::from_millis(500), listener.accept()).await.is_err());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn abandoned_connect_is_cancelled() {
        let (listener, port) = local_broker().await;

        let broker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_packet(&mut stream).await;
            tokio::time::sleep(Duration::from_millis(2500)).await;
            let _ = stream.write_all(&CONNACK).await;
            listener
        });

        let (transport, mut events) = RumqttTransport::new(&config(port, 1), "late-test");
        assert_eq!(
            transport.reconnect().await,
            Err(TransportError::Timeout(Duration::from_secs(1)))
        );
        assert_eq!(next_event(&mut events).await, TransportEvent::PreConnect);
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::ConnectFailed { .. }
        ));

        // The late CONNACK lands on a connection that was already dropped.
        let listener = broker.await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!transport.is_connected());
        assert!(timeout(Duration::from_millis(500), listener.accept()).await.is_err());
    }
}
