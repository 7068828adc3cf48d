// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared interface state in a remote key-value store.
//!
//! The agent loop never talks to the store directly. It enqueues writes on a
//! [`CacheHandle`]; a [`CacheService`] task owns the store connection, applies
//! the dependency timeout and reconnect backoff, and keeps the cache metrics
//! current.

use crate::connection::{Backoff, ConnectionState, Link};
use crate::constants::{
    CACHE_ERRORS_TOTAL, CACHE_LAST_SUCCESS_TIMESTAMP, CACHE_UP, CACHE_WRITES_TOTAL,
    SERVICE_CHANNEL_CAPACITY,
};
use crate::errors::CacheError;
use crate::payload::CacheEntry;
use crate::registry::{log_registry_error, Registry};
use crate::sample::now_ms;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error};

/// A remote key-value store with per-key expiry.
#[async_trait]
pub trait KeyValueStore: Send {
    async fn connect(&mut self) -> Result<(), CacheError>;

    async fn put(&mut self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// `Ok(None)` when the key does not exist or has expired.
    async fn get(&mut self, key: &str) -> Result<Option<String>, CacheError>;

    async fn close(&mut self);
}

/// Redis over one multiplexed connection.
pub struct RedisStore {
    client: redis::Client,
    connection: Option<MultiplexedConnection>,
}

impl RedisStore {
    pub fn new(url: &str) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(url).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            connection: None,
        })
    }

    fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        self.connection
            .clone()
            .ok_or_else(|| CacheError::Unavailable("not connected".to_string()))
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn connect(&mut self) -> Result<(), CacheError> {
        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        self.connection = Some(connection);
        Ok(())
    }

    async fn put(&mut self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut connection = self.connection()?;
        let seconds = ttl.as_secs().max(1);
        let _: () = connection
            .set_ex(key, value, seconds)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>, CacheError> {
        let mut connection = self.connection()?;
        connection
            .get(key)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    async fn close(&mut self) {
        self.connection = None;
    }
}

#[derive(Debug)]
pub enum CacheCommand {
    Put(CacheEntry),
    Get {
        key: String,
        response_tx: oneshot::Sender<Result<Option<String>, CacheError>>,
    },
    State(oneshot::Sender<ConnectionState>),
    Shutdown,
}

#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::Sender<CacheCommand>,
}

impl CacheHandle {
    /// Enqueues a write without waiting for it. A full queue drops the
    /// write.
    pub fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.tx
            .try_send(CacheCommand::Put(entry))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => CacheError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => CacheError::Stopped,
            })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(CacheCommand::Get {
                key: key.to_string(),
                response_tx,
            })
            .await
            .map_err(|_| CacheError::Stopped)?;

        response_rx.await.map_err(|_| CacheError::Stopped)?
    }

    /// Connection state once every previously enqueued command has been
    /// handled.
    pub async fn state(&self) -> Result<ConnectionState, CacheError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(CacheCommand::State(response_tx))
            .await
            .map_err(|_| CacheError::Stopped)?;
        response_rx.await.map_err(|_| CacheError::Stopped)
    }

    pub async fn shutdown(&self) -> Result<(), CacheError> {
        self.tx
            .send(CacheCommand::Shutdown)
            .await
            .map_err(|_| CacheError::Stopped)
    }
}

pub struct CacheService<S> {
    store: S,
    link: Link,
    timeout: Duration,
    registry: Arc<Registry>,
    rx: mpsc::Receiver<CacheCommand>,
}

impl<S: KeyValueStore> CacheService<S> {
    pub fn new(
        store: S,
        backoff: Backoff,
        timeout: Duration,
        registry: Arc<Registry>,
    ) -> (Self, CacheHandle) {
        let (tx, rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);
        let service = Self {
            store,
            link: Link::new("cache", backoff),
            timeout,
            registry,
            rx,
        };
        (service, CacheHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Cache service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                CacheCommand::Put(entry) => self.handle_put(entry).await,

                CacheCommand::Get { key, response_tx } => {
                    let result = self.handle_get(&key).await;
                    if response_tx.send(result).is_err() {
                        error!("Failed to send cache get response - receiver dropped");
                    }
                }

                CacheCommand::State(response_tx) => {
                    let _ = response_tx.send(self.link.state());
                }

                CacheCommand::Shutdown => {
                    debug!("Cache service shutting down");
                    break;
                }
            }
        }

        self.close().await;
        debug!("Cache service stopped");
    }

    async fn handle_put(&mut self, entry: CacheEntry) {
        let result = match self.ensure_connected().await {
            Ok(()) => {
                let timeout = self.timeout;
                with_timeout(timeout, self.store.put(&entry.key, &entry.value, entry.ttl)).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                log_registry_error(self.registry.increment(CACHE_WRITES_TOTAL, 1.0));
                log_registry_error(
                    self.registry
                        .set(CACHE_LAST_SUCCESS_TIMESTAMP, now_ms() as f64 / 1000.0),
                );
            }
            Err(e) => {
                log_registry_error(self.registry.increment(CACHE_ERRORS_TOTAL, 1.0));
                self.on_failure(e, &entry.key).await;
            }
        }
    }

    async fn handle_get(&mut self, key: &str) -> Result<Option<String>, CacheError> {
        self.ensure_connected().await?;
        let timeout = self.timeout;
        match with_timeout(timeout, self.store.get(key)).await {
            Ok(value) => Ok(value),
            Err(e) => {
                let message = e.to_string();
                self.on_failure(e, key).await;
                Err(CacheError::Unavailable(message))
            }
        }
    }

    async fn ensure_connected(&mut self) -> Result<(), CacheError> {
        if self.link.is_connected() {
            return Ok(());
        }
        let now = Instant::now();
        if !self.link.can_attempt(now) {
            return Err(CacheError::Unavailable(format!(
                "reconnect backoff, next attempt in {}ms",
                self.link.retry_in(now).as_millis()
            )));
        }

        self.link.begin_connect();
        let timeout = self.timeout;
        match with_timeout(timeout, self.store.connect()).await {
            Ok(()) => {
                self.link.connected(Instant::now());
                log_registry_error(self.registry.set(CACHE_UP, 1.0));
                Ok(())
            }
            Err(e) => {
                self.link.failed(Instant::now(), &e);
                log_registry_error(self.registry.set(CACHE_UP, 0.0));
                Err(e)
            }
        }
    }

    async fn on_failure(&mut self, error: CacheError, key: &str) {
        if self.link.is_connected() {
            self.link.failed(Instant::now(), &error);
            log_registry_error(self.registry.set(CACHE_UP, 0.0));
            self.store.close().await;
        } else {
            debug!("Cache operation on {key} skipped: {error}");
        }
    }

    async fn close(&mut self) {
        let timeout = self.timeout;
        if tokio::time::timeout(timeout, self.store.close()).await.is_err() {
            error!("Timed out closing cache connection after {timeout:?}");
        }
        log_registry_error(self.registry.set(CACHE_UP, 0.0));
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    operation: impl Future<Output = Result<T, CacheError>>,
) -> Result<T, CacheError> {
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout(timeout)),
    }
}
