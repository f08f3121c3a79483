//! MQTT broker transport
//!
//! Wraps a `rumqttc` client. Connecting waits for the broker's CONNACK so an
//! unreachable broker fails up front; afterwards a background task drives the
//! event loop, reconnects after errors and tracks whether the link is up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Connector, Transport};
use crate::config::BrokerConfig;
use crate::error::TransportError;
use crate::PRODUCER_NAME;

/// Outstanding requests buffered between the client and the event loop
const REQUEST_CAPACITY: usize = 1024;

/// How long `disconnect` waits for the event loop to flush the DISCONNECT
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// A message received on a subscribed topic
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Map a numeric QoS level
pub fn qos_from_level(level: u8) -> Result<QoS, TransportError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransportError::InvalidQos(other)),
    }
}

fn mqtt_options(config: &BrokerConfig) -> Result<MqttOptions, TransportError> {
    let (host, port) = config.endpoint()?;
    let client_id = config
        .client_id
        .clone()
        .unwrap_or_else(|| format!("{}-{}", PRODUCER_NAME, Uuid::new_v4().simple()));

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(true);
    if let Some((username, password)) = config.credentials() {
        options.set_credentials(username, password);
    }
    Ok(options)
}

/// Connects to the broker described by a `BrokerConfig`
#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: BrokerConfig,
}

impl MqttConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

impl Connector for MqttConnector {
    type Transport = MqttTransport;

    async fn connect(&self) -> Result<MqttTransport, TransportError> {
        let qos = qos_from_level(self.config.qos)?;
        let options = mqtt_options(&self.config)?;
        let (host, port) = options.broker_address();
        info!(%host, port, client_id = %options.client_id(), "connecting to broker");

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(%host, port, error = %e, "broker connection failed");
                return Err(e);
            }
            Err(_) => {
                error!(%host, port, ?timeout, "broker did not answer in time");
                return Err(TransportError::ConnectTimeout(timeout));
            }
        }
        info!(%host, port, "connected to broker");

        let shared = Arc::new(LinkState {
            connected: AtomicBool::new(true),
            subscriptions: Mutex::new(Vec::new()),
            inbound: Mutex::new(None),
        });
        let shutdown = CancellationToken::new();
        let driver = tokio::spawn(drive_event_loop(
            eventloop,
            client.clone(),
            qos,
            Arc::clone(&shared),
            shutdown.clone(),
            self.config.reconnect_backoff,
        ));

        Ok(MqttTransport {
            client,
            qos,
            shared,
            driver: Mutex::new(Some(driver)),
            shutdown,
        })
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(TransportError::Connect(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(TransportError::Connect(e.to_string())),
        }
    }
}

/// Link status shared between the transport and its event-loop task
#[derive(Debug)]
struct LinkState {
    connected: AtomicBool,
    subscriptions: Mutex<Vec<String>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>,
}

impl LinkState {
    fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn forward(&self, message: InboundMessage) {
        let inbound = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = inbound.as_ref() {
            // Receiver gone means nobody is watching any more
            let _ = sender.send(message);
        }
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    qos: QoS,
    link: Arc<LinkState>,
    shutdown: CancellationToken,
    backoff: Duration,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if !link.connected.swap(true, Ordering::SeqCst) {
                    info!("reconnected to broker");
                    for topic in link.subscriptions() {
                        if let Err(e) = client.try_subscribe(topic.as_str(), qos) {
                            warn!(%topic, error = %e, "failed to restore subscription");
                        }
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                link.forward(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    received_at: Utc::now(),
                });
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                link.connected.store(false, Ordering::SeqCst);
                debug!("disconnect sent to broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if link.connected.swap(false, Ordering::SeqCst) {
                    warn!(error = %e, "broker connection lost, reconnecting");
                } else {
                    debug!(error = %e, "reconnect attempt failed");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
    debug!("broker event loop stopped");
}

/// Connected MQTT client
#[derive(Debug)]
pub struct MqttTransport {
    client: AsyncClient,
    qos: QoS,
    shared: Arc<LinkState>,
    driver: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl MqttTransport {
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Subscribe to a topic filter and receive every matching message.
    ///
    /// Subscriptions are restored after a reconnect. Only the receiver from
    /// the latest call gets messages.
    pub async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<InboundMessage>, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.shared.inbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(topic.to_string());

        self.client
            .subscribe(topic, self.qos)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        info!(topic, "subscribed");
        Ok(receiver)
    }
}

impl Transport for MqttTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.client
            .try_publish(topic, self.qos, false, payload)
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let requested = self.client.disconnect().await;

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = driver {
            if tokio::time::timeout(DISCONNECT_GRACE, handle).await.is_err() {
                debug!("event loop did not stop in time, shutting it down");
            }
        }
        self.shutdown.cancel();
        self.shared.connected.store(false, Ordering::SeqCst);
        info!("disconnected from broker");

        requested.map_err(|e| TransportError::Disconnect(e.to_string()))
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(qos_from_level(7), Err(TransportError::InvalidQos(7))));
    }

    #[test]
    fn test_options_from_config() {
        let config = BrokerConfig {
            url: "mqtt://127.0.0.1:2883".to_string(),
            keep_alive: Duration::from_secs(9),
            client_id: Some("replay-test".to_string()),
            ..Default::default()
        };

        let options = mqtt_options(&config).unwrap();
        assert_eq!(options.broker_address(), ("127.0.0.1".to_string(), 2883));
        assert_eq!(options.keep_alive(), Duration::from_secs(9));
        assert_eq!(options.client_id(), "replay-test");
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_to_connect() {
        let connector = MqttConnector::new(BrokerConfig {
            url: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        });

        let result = connector.connect().await;
        assert!(matches!(
            result,
            Err(TransportError::Connect(_)) | Err(TransportError::ConnectTimeout(_))
        ));
    }
}
