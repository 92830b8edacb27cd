use std::time::Duration;

use log::{debug, error, info};
use rumqttc::{
    ConnectionError, Event, MqttOptions, NetworkOptions, Outgoing, Packet, QoS, SubscribeFilter,
    SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;

use crate::{config, messages::TransportEvent};

const EVENT_QUEUE: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("transport already closed")]
    Closed,
    #[error("timed out flushing teardown to the broker")]
    CloseTimedOut,
}

/// Outbound half of the feed. Inbound traffic arrives as `TransportEvent`s on
/// the channel handed out when the transport is created.
pub trait Transport {
    fn subscribe(&mut self, topics: &[String]) -> Result<(), TransportError>;
    fn unsubscribe(&mut self, topics: &[String]) -> Result<(), TransportError>;
    /// Unsubscribes `topics` and disconnects, returning once the broker has
    /// been sent both or the attempt was abandoned.
    async fn close(&mut self, topics: &[String]) -> Result<(), TransportError>;
}

#[derive(Debug)]
pub struct MqttTransport {
    client: rumqttc::AsyncClient,
    pump: JoinHandle<()>,
    flushed: Option<oneshot::Receiver<()>>,
    closed: bool,
}

impl MqttTransport {
    /// Starts the session. Reconnection is left to rumqttc: after a failed
    /// poll the pump waits `reconnect_interval` and polls again.
    pub fn connect(config: &config::MqttConfig) -> (Self, mpsc::Receiver<TransportEvent>) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "bay-monitor".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id,
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, mut eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        let mut network = NetworkOptions::new();
        network.set_connection_timeout(config.connect_timeout().as_secs().max(1));
        eventloop.set_network_options(network);

        info!(
            "Connecting to MQTT broker at {}:{}",
            config.host,
            config.port.unwrap_or(1883)
        );

        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let (flushed_tx, flushed_rx) = oneshot::channel();
        let pump = tokio::spawn(pump(eventloop, tx, flushed_tx, config.reconnect_interval()));

        (
            MqttTransport {
                client,
                pump,
                flushed: Some(flushed_rx),
                closed: false,
            },
            rx,
        )
    }
}

impl Transport for MqttTransport {
    fn subscribe(&mut self, topics: &[String]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        debug!("Subscribing to {:?}", topics);
        self.client.try_subscribe_many(
            topics
                .iter()
                .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce)),
        )?;
        Ok(())
    }

    fn unsubscribe(&mut self, topics: &[String]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        for topic in topics {
            debug!("Unsubscribing from {}", topic);
            self.client.try_unsubscribe(topic.clone())?;
        }
        Ok(())
    }

    async fn close(&mut self, topics: &[String]) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let flushed = self.flushed.take();

        // Awaiting each request lets the pump drain the bounded request queue.
        let teardown = async {
            for topic in topics {
                debug!("Unsubscribing from {}", topic);
                self.client.unsubscribe(topic.clone()).await?;
            }
            debug!("Disconnecting MQTT client");
            self.client.disconnect().await?;
            if let Some(flushed) = flushed {
                if flushed.await.is_err() {
                    debug!("MQTT pump stopped before DISCONNECT was written");
                }
            }
            Ok::<(), TransportError>(())
        };
        match time::timeout(CLOSE_GRACE, teardown).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::CloseTimedOut),
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        // Nothing may be delivered once the owner lets go of the session.
        self.pump.abort();
    }
}

/// Polls until DISCONNECT has been written. Events stop being forwarded once
/// the receiver goes away, but polling carries on so teardown still drains.
async fn pump(
    mut eventloop: rumqttc::EventLoop,
    tx: mpsc::Sender<TransportEvent>,
    flushed: oneshot::Sender<()>,
    reconnect_interval: Duration,
) {
    let mut established = false;
    let mut forwarding = true;
    loop {
        let polled = eventloop.poll().await;
        if matches!(polled, Ok(Event::Outgoing(Outgoing::Disconnect))) {
            debug!("DISCONNECT written, stopping MQTT pump");
            if flushed.send(()).is_err() {
                debug!("Nobody is waiting for the DISCONNECT");
            }
            return;
        }
        let failed = polled.is_err();

        let translated = translate(polled, established);
        if matches!(translated, Some(TransportEvent::Connected)) {
            established = true;
        }
        if let Some(event) = translated {
            if forwarding && tx.send(event).await.is_err() {
                debug!("Event receiver closed, no longer forwarding MQTT events");
                forwarding = false;
            }
        }

        if failed {
            time::sleep(reconnect_interval).await;
        }
    }
}

/// Maps one `poll` result onto the lifecycle/message events we care about.
/// Until the first CONNACK (`established == false`) every failure is fatal.
fn translate(
    polled: Result<rumqttc::Event, ConnectionError>,
    established: bool,
) -> Option<TransportEvent> {
    match polled {
        Ok(notification) => match notification {
            rumqttc::Event::Incoming(Packet::Publish(p)) => {
                debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);
                Some(TransportEvent::Message {
                    topic: p.topic,
                    payload: p.payload.to_vec(),
                })
            }
            rumqttc::Event::Incoming(Packet::ConnAck(_)) => {
                debug!("Connection acknowledged");
                Some(TransportEvent::Connected)
            }
            rumqttc::Event::Incoming(Packet::SubAck(ack)) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Some(TransportEvent::SubscribeFailed(format!(
                        "broker rejected subscription (pkid {})",
                        ack.pkid
                    )))
                } else {
                    debug!("Subscription acknowledged");
                    None
                }
            }
            rumqttc::Event::Incoming(Packet::Disconnect) => Some(TransportEvent::Dropped(
                "broker closed the connection".to_string(),
            )),
            _ => None,
        },
        Err(ConnectionError::ConnectionRefused(code)) => {
            error!("MQTT broker refused connection: {:?}", code);
            Some(TransportEvent::Fatal(format!("connection refused: {:?}", code)))
        }
        Err(e) if !established => {
            error!("Could not connect to MQTT broker: {:?}", e);
            Some(TransportEvent::Fatal(e.to_string()))
        }
        Err(e) => {
            error!("Error polling MQTT event loop: {:?}", e);
            Some(TransportEvent::Dropped(e.to_string()))
        }
    }
}
