// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-sample messages pushed to an MQTT broker.
//!
//! Like the cache, the broker is owned by a background [`PublisherService`]
//! and fed through a non-blocking [`PublisherHandle`], so a slow or absent
//! broker never delays sampling.

use crate::connection::{Backoff, ConnectionState, Link};
use crate::constants::{
    BROKER_ERRORS_TOTAL, BROKER_LAST_SUCCESS_TIMESTAMP, BROKER_MESSAGES_TOTAL, BROKER_UP,
    MQTT_KEEP_ALIVE, MQTT_REQUEST_CAPACITY, SERVICE_CHANNEL_CAPACITY,
};
use crate::errors::PublishError;
use crate::payload::BrokerMessage;
use crate::registry::{log_registry_error, Registry};
use crate::sample::now_ms;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Delivery guarantee requested for published messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }
}

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
            Qos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// A topic-based message broker.
#[async_trait]
pub trait Broker: Send {
    async fn connect(&mut self) -> Result<(), PublishError>;

    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: Qos)
        -> Result<(), PublishError>;

    async fn close(&mut self);
}

struct MqttSession {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

/// MQTT 3.1.1 over plain TCP.
pub struct MqttBroker {
    client_id: String,
    host: String,
    port: u16,
    session: Option<MqttSession>,
}

impl MqttBroker {
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
            session: None,
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    /// Resolves once the broker has accepted the session. The event loop is
    /// then handed to a driver task that flags the session as lost on the
    /// first connection error.
    async fn connect(&mut self) -> Result<(), PublishError> {
        self.close().await;

        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        options.set_clean_session(true);
        let (client, mut eventloop) = AsyncClient::new(options, MQTT_REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(PublishError::BrokerUnreachable(format!(
                        "connection refused: {:?}",
                        ack.code
                    )));
                }
                Ok(_) => {}
                Err(e) => return Err(PublishError::BrokerUnreachable(e.to_string())),
            }
        }

        let connected = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&connected);
        let driver = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(event) => trace!("MQTT event: {event:?}"),
                    Err(e) => {
                        flag.store(false, Ordering::SeqCst);
                        debug!("MQTT event loop stopped: {e}");
                        break;
                    }
                }
            }
        });

        self.session = Some(MqttSession {
            client,
            connected,
            driver,
        });
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
    ) -> Result<(), PublishError> {
        let session = match &self.session {
            Some(session) if session.connected.load(Ordering::SeqCst) => session,
            _ => return Err(PublishError::Publish("connection lost".to_string())),
        };
        session
            .client
            .publish(topic, qos.into(), false, payload)
            .await
            .map_err(|e| PublishError::Publish(e.to_string()))
    }

    async fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if session.connected.load(Ordering::SeqCst) {
            if let Err(e) = session.client.disconnect().await {
                debug!("MQTT disconnect failed: {e}");
            }
            // Give the driver a moment to flush the DISCONNECT packet.
            let _ = tokio::time::timeout(Duration::from_millis(100), &mut session.driver).await;
        }
        session.driver.abort();
    }
}

#[derive(Debug)]
pub enum PublisherCommand {
    Publish(BrokerMessage),
    State(oneshot::Sender<ConnectionState>),
    Shutdown,
}

#[derive(Clone)]
pub struct PublisherHandle {
    tx: mpsc::Sender<PublisherCommand>,
}

impl PublisherHandle {
    /// Enqueues a message without waiting for delivery. A full queue drops
    /// the message.
    pub fn publish(&self, message: BrokerMessage) -> Result<(), PublishError> {
        self.tx
            .try_send(PublisherCommand::Publish(message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PublishError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => PublishError::Stopped,
            })
    }

    /// Connection state once every previously enqueued message has been
    /// handled.
    pub async fn state(&self) -> Result<ConnectionState, PublishError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(PublisherCommand::State(response_tx))
            .await
            .map_err(|_| PublishError::Stopped)?;
        response_rx.await.map_err(|_| PublishError::Stopped)
    }

    pub async fn shutdown(&self) -> Result<(), PublishError> {
        self.tx
            .send(PublisherCommand::Shutdown)
            .await
            .map_err(|_| PublishError::Stopped)
    }
}

pub struct PublisherService<B> {
    broker: B,
    qos: Qos,
    link: Link,
    timeout: Duration,
    registry: Arc<Registry>,
    rx: mpsc::Receiver<PublisherCommand>,
}

impl<B: Broker> PublisherService<B> {
    pub fn new(
        broker: B,
        qos: Qos,
        backoff: Backoff,
        timeout: Duration,
        registry: Arc<Registry>,
    ) -> (Self, PublisherHandle) {
        let (tx, rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);
        let service = Self {
            broker,
            qos,
            link: Link::new("broker", backoff),
            timeout,
            registry,
            rx,
        };
        (service, PublisherHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Publisher service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                PublisherCommand::Publish(message) => self.handle_publish(message).await,

                PublisherCommand::State(response_tx) => {
                    let _ = response_tx.send(self.link.state());
                }

                PublisherCommand::Shutdown => {
                    debug!("Publisher service shutting down");
                    break;
                }
            }
        }

        self.close().await;
        debug!("Publisher service stopped");
    }

    async fn handle_publish(&mut self, message: BrokerMessage) {
        let result = match self.ensure_connected().await {
            Ok(()) => {
                let timeout = self.timeout;
                let qos = self.qos;
                with_timeout(
                    timeout,
                    self.broker.publish(&message.topic, message.payload, qos),
                )
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                log_registry_error(self.registry.increment(BROKER_MESSAGES_TOTAL, 1.0));
                log_registry_error(
                    self.registry
                        .set(BROKER_LAST_SUCCESS_TIMESTAMP, now_ms() as f64 / 1000.0),
                );
            }
            Err(e) => {
                log_registry_error(self.registry.increment(BROKER_ERRORS_TOTAL, 1.0));
                if self.link.is_connected() {
                    self.link.failed(Instant::now(), &e);
                    log_registry_error(self.registry.set(BROKER_UP, 0.0));
                    self.broker.close().await;
                } else {
                    debug!("Publish to {} skipped: {e}", message.topic);
                }
            }
        }
    }

    async fn ensure_connected(&mut self) -> Result<(), PublishError> {
        if self.link.is_connected() {
            return Ok(());
        }
        let now = Instant::now();
        if !self.link.can_attempt(now) {
            return Err(PublishError::BrokerUnreachable(format!(
                "reconnect backoff, next attempt in {}ms",
                self.link.retry_in(now).as_millis()
            )));
        }

        self.link.begin_connect();
        let timeout = self.timeout;
        match with_timeout(timeout, self.broker.connect()).await {
            Ok(()) => {
                self.link.connected(Instant::now());
                log_registry_error(self.registry.set(BROKER_UP, 1.0));
                Ok(())
            }
            Err(e) => {
                self.link.failed(Instant::now(), &e);
                log_registry_error(self.registry.set(BROKER_UP, 0.0));
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        let timeout = self.timeout;
        if tokio::time::timeout(timeout, self.broker.close()).await.is_err() {
            warn!("Timed out closing broker connection after {timeout:?}");
        }
        log_registry_error(self.registry.set(BROKER_UP, 0.0));
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    operation: impl Future<Output = Result<T, PublishError>>,
) -> Result<T, PublishError> {
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(PublishError::Timeout(timeout)),
    }
}
