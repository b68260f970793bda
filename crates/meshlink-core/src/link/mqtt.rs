//! rumqttc-backed broker sessions
//!
//! `connect` polls the rumqttc event loop until the broker acknowledges the
//! connection, then hands the loop to a driver task that forwards inbound
//! publishes and reports the first transport error as a disconnect. The
//! driver never reconnects on its own; reconnection belongs to the
//! [`LinkManager`](super::LinkManager).
//!
//! A publish resolves only when the broker's PUBACK for its packet id comes
//! back. rumqttc hands requests to the wire in the order they were queued,
//! so each `Outgoing::Publish(pkid)` event is matched with the oldest
//! publish still waiting for its id.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{Connector, EventSink, Session};
use crate::config::LinkConfig;
use crate::error::{LinkError, Result};

/// Time allowed for the driver to send DISCONNECT before it is aborted
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Opens rumqttc sessions
#[derive(Debug, Clone)]
pub struct MqttConnector {
    request_capacity: usize,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self {
            request_capacity: 64,
        }
    }
}

impl MqttConnector {
    /// Create a connector with the default request queue capacity
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the client request queue capacity
    pub fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity.max(1);
        self
    }
}

/// Build rumqttc options from link configuration
pub fn mqtt_options(config: &LinkConfig) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(config.clean_session);
    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }
    if config.use_tls {
        options.set_transport(tls_transport(config)?);
    }
    Ok(options)
}

/// TLS transport for the configured trust mode
///
/// Without a `ca_file` the platform trust store decides. With one, that PEM
/// certificate is the trust root, which is how a self-signed broker is
/// accepted.
fn tls_transport(config: &LinkConfig) -> Result<Transport> {
    let tls = match &config.ca_file {
        Some(path) => {
            let ca = std::fs::read(path).map_err(|e| {
                LinkError::Tls(format!("reading {}: {}", path.display(), e))
            })?;
            // Fail here rather than on the first handshake
            native_tls::Certificate::from_pem(&ca)?;
            TlsConfiguration::SimpleNative {
                ca,
                client_auth: None,
            }
        }
        None if config.accept_untrusted_certs => {
            return Err(LinkError::InvalidConfig(
                "accept_untrusted_certs needs ca_file with the broker certificate".to_string(),
            ));
        }
        None => TlsConfiguration::Native,
    };
    Ok(Transport::tls_with_config(tls))
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, config: &LinkConfig, events: EventSink) -> Result<Arc<dyn Session>> {
        let options = mqtt_options(config)?;
        let (client, mut eventloop) = AsyncClient::new(options, self.request_capacity);

        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(LinkError::ConnectFailed(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )));
                    }
                    debug!(
                        session_present = ack.session_present,
                        generation = events.generation(),
                        "Broker accepted connection"
                    );
                    break;
                }
                other => trace!(event = ?other, "Event before CONNACK"),
            }
        }

        let acks = Arc::new(Mutex::new(AckTracker::default()));
        let driver = tokio::spawn(drive(eventloop, events, acks.clone()));
        Ok(Arc::new(MqttSession {
            client,
            driver: Mutex::new(Some(driver)),
            acks,
            order: tokio::sync::Mutex::new(()),
            ack_timeout: config.ack_timeout,
        }))
    }
}

type AckSender = oneshot::Sender<Result<()>>;

/// Publishes waiting on the broker
#[derive(Default)]
struct AckTracker {
    closed: bool,
    /// Queued with the client, packet id not assigned yet
    queued: VecDeque<AckSender>,
    /// Written to the wire, keyed by packet id
    inflight: HashMap<u16, AckSender>,
}

impl AckTracker {
    fn register(&mut self, tx: AckSender) -> Result<()> {
        if self.closed {
            return Err(LinkError::Disconnected);
        }
        self.queued.push_back(tx);
        Ok(())
    }

    fn written(&mut self, pkid: u16) {
        if let Some(tx) = self.queued.pop_front() {
            self.inflight.insert(pkid, tx);
        }
    }

    fn acked(&mut self, pkid: u16) {
        match self.inflight.remove(&pkid) {
            Some(tx) => {
                let _ = tx.send(Ok(()));
            }
            None => trace!(pkid, "PUBACK for unknown packet"),
        }
    }

    /// Fail everything still waiting; later registrations are refused
    fn close(&mut self) -> usize {
        self.closed = true;
        let pending = self.queued.len() + self.inflight.len();
        for tx in self.queued.drain(..).chain(self.inflight.drain().map(|(_, tx)| tx)) {
            let _ = tx.send(Err(LinkError::Disconnected));
        }
        pending
    }
}

async fn drive(mut eventloop: EventLoop, events: EventSink, acks: Arc<Mutex<AckTracker>>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if !events.message(publish.topic, publish.payload) {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.lock().written(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.lock().acked(ack.pkid),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                events.disconnected("broker sent DISCONNECT");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                events.disconnected("client disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                events.disconnected(e.to_string());
                break;
            }
        }
    }
    let unacked = acks.lock().close();
    if unacked > 0 {
        warn!(unacked, "Connection closed with publishes awaiting PUBACK");
    }
    trace!(generation = events.generation(), "MQTT driver stopped");
}

struct MqttSession {
    client: AsyncClient,
    driver: Mutex<Option<JoinHandle<()>>>,
    acks: Arc<Mutex<AckTracker>>,
    /// Keeps tracker order equal to client queue order
    order: tokio::sync::Mutex<()>,
    ack_timeout: Duration,
}

#[async_trait]
impl Session for MqttSession {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| LinkError::SubscribeFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        if self
            .driver
            .lock()
            .as_ref()
            .map_or(true, |driver| driver.is_finished())
        {
            return Err(LinkError::Disconnected);
        }

        let (tx, rx) = oneshot::channel();
        {
            let _order = self.order.lock().await;
            self.acks.lock().register(tx)?;
            if let Err(e) = self
                .client
                .publish_bytes(topic, QoS::AtLeastOnce, retain, payload)
                .await
            {
                // The request never reached the event loop
                self.acks.lock().queued.pop_back();
                return Err(e.into());
            }
        }

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::Disconnected),
            Err(_) => Err(LinkError::PublishFailed(format!(
                "no PUBACK within {}ms",
                self.ack_timeout.as_millis()
            ))),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let result = self.client.disconnect().await;
        let driver = self.driver.lock().take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver)
                .await
                .is_err()
            {
                driver.abort();
            }
        }
        self.acks.lock().close();
        result.map_err(LinkError::from)
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        self.acks.lock().close();
    }
}
