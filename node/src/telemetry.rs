//! Per-sample publishing over an MQTT session.

use std::time::Duration;

use decay_core::{config::BrokerConfig, topics::voltage_payload, CaptureBuffer, VoltageScale};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
};
use tokio::time::timeout;

const REQUEST_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("broker refused the connection: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("no answer from the broker within {0:?}")]
    Timeout(Duration),
}

/// A publish/subscribe session that may drop at any time.
#[allow(async_fn_in_trait)]
pub trait TelemetrySession {
    fn is_connected(&self) -> bool;
    async fn connect(&mut self) -> Result<(), TelemetryError>;
    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TelemetryError>;
    /// Ends the session once everything published so far has reached the
    /// broker.
    async fn disconnect(&mut self) -> Result<(), TelemetryError>;
}

pub struct MqttSession {
    options: MqttOptions,
    client: AsyncClient,
    eventloop: EventLoop,
    connected: bool,
    answer_timeout: Duration,
}

impl MqttSession {
    pub fn new(config: &BrokerConfig) -> Self {
        let mut mqttoptions = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        mqttoptions.set_clean_session(false);

        let (client, eventloop) = AsyncClient::new(mqttoptions.clone(), REQUEST_CAPACITY);

        Self {
            options: mqttoptions,
            client,
            eventloop,
            connected: false,
            answer_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }

    /// Drops the current connection, whatever state it is in. The next poll
    /// dials the broker from scratch.
    fn reset(&mut self) {
        let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        self.client = client;
        self.eventloop = eventloop;
        self.connected = false;
    }

    /// Drives the event loop until `done` accepts an event.
    async fn poll_until(
        &mut self,
        mut done: impl FnMut(&Event) -> Result<bool, TelemetryError>,
    ) -> Result<(), TelemetryError> {
        loop {
            let event = match timeout(self.answer_timeout, self.eventloop.poll()).await {
                Ok(Ok(event)) => event,
                Ok(Err(e)) => {
                    self.connected = false;
                    return Err(e.into());
                }
                Err(_) => {
                    // A silent broker may still hold the socket open
                    self.reset();
                    return Err(TelemetryError::Timeout(self.answer_timeout));
                }
            };
            log::trace!("{event:?}");
            if done(&event)? {
                return Ok(());
            }
        }
    }
}

impl TelemetrySession for MqttSession {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), TelemetryError> {
        self.poll_until(|event| match event {
            Event::Incoming(Incoming::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
                Ok(true)
            }
            Event::Incoming(Incoming::ConnAck(ack)) => Err(TelemetryError::Refused(ack.code)),
            _ => Ok(false),
        })
        .await?;
        self.connected = true;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TelemetryError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .await?;
        self.poll_until(|event| Ok(matches!(event, Event::Outgoing(Outgoing::Publish(_)))))
            .await
    }

    /// Sends DISCONNECT, then waits for the broker to hang up. The broker
    /// handles packets in order, so by then it has read every publish.
    async fn disconnect(&mut self) -> Result<(), TelemetryError> {
        if !self.connected {
            return Ok(());
        }
        self.client.disconnect().await?;

        let mut sent = false;
        let result = loop {
            match timeout(self.answer_timeout, self.eventloop.poll()).await {
                Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) => sent = true,
                Ok(Ok(event)) => log::trace!("{event:?}"),
                Ok(Err(_)) if sent => break Ok(()),
                Ok(Err(e)) => break Err(e.into()),
                Err(_) if sent => {
                    log::debug!("Broker kept the connection open after DISCONNECT");
                    break Ok(());
                }
                Err(_) => break Err(TelemetryError::Timeout(self.answer_timeout)),
            }
        };

        self.reset();
        result
    }
}

/// Publishes every sample of a capture as its own message.
pub struct StreamPublisher<S> {
    session: S,
    topic: String,
    reconnect_delay: Duration,
}

impl<S: TelemetrySession> StreamPublisher<S> {
    pub fn new(session: S, topic: impl Into<String>, reconnect_delay: Duration) -> Self {
        Self {
            session,
            topic: topic.into(),
            reconnect_delay,
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Blocks until the session is up. Retries forever.
    pub async fn ensure_connected(&mut self) {
        while !self.session.is_connected() {
            log::info!("Attempting MQTT connection...");
            match self.session.connect().await {
                Ok(()) => log::info!("Connected to the broker"),
                Err(e) => {
                    log::warn!(
                        "Retrying in {} seconds - failed: {e}",
                        self.reconnect_delay.as_secs()
                    );
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    /// Sends one message per sample, in capture order. A sample whose
    /// publish fails is sent again once the session is back.
    pub async fn publish_samples(&mut self, buffer: &CaptureBuffer, scale: &VoltageScale) -> usize {
        let mut published = 0;
        for sample in buffer.samples() {
            let volts = scale.volts(sample.value);
            let Some(payload) = voltage_payload(volts) else {
                log::error!("Voltage {volts} does not fit a payload, skipping the sample");
                continue;
            };
            loop {
                self.ensure_connected().await;
                match self.session.publish(&self.topic, &payload).await {
                    Ok(()) => break,
                    Err(e) => log::error!("Could not publish sample: {e}"),
                }
            }
            published += 1;
        }
        log::info!("Published {published} samples on '{}'", self.topic);
        published
    }

    /// Closes the session cleanly so nothing published is left unread.
    pub async fn close(&mut self) -> Result<(), TelemetryError> {
        self.session.disconnect().await?;
        log::info!("Disconnected from the broker");
        Ok(())
    }
}
