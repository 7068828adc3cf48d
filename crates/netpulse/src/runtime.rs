// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process lifecycle: builds every component from a [`Config`], runs them
//! until cancellation, then shuts them down in order.
//!
//! Shutdown order is agent loop, then the cache and publisher services
//! (which close their connections), then the metrics endpoint, so the last
//! scrape still sees the final dependency state.

use crate::agent::{Agent, AgentSettings};
use crate::cache::{CacheService, KeyValueStore, RedisStore};
use crate::config::Config;
use crate::connection::Backoff;
use crate::errors::RuntimeError;
use crate::publisher::{Broker, MqttBroker, PublisherService};
use crate::registry::Registry;
use crate::sampler::{InterfaceSampler, ProcSampler};
use crate::server::MetricsServer;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Runtime<S, K, B> {
    config: Config,
    registry: Arc<Registry>,
    server: MetricsServer,
    sampler: S,
    store: K,
    broker: B,
}

impl Runtime<ProcSampler, RedisStore, MqttBroker> {
    /// Production wiring: `/proc` sampler, Redis cache, MQTT broker.
    pub async fn new(config: Config) -> Result<Self, RuntimeError> {
        let store = RedisStore::new(&config.redis_url())?;
        let broker = MqttBroker::new(
            config.mqtt_client_id(),
            config.mqtt.host.clone(),
            config.mqtt.port,
        );
        Self::with_components(config, ProcSampler::new(), store, broker).await
    }
}

impl<S, K, B> Runtime<S, K, B>
where
    S: InterfaceSampler + 'static,
    K: KeyValueStore + 'static,
    B: Broker + 'static,
{
    /// Builds the registry and binds the metrics endpoint. Fails if the
    /// endpoint address is unavailable.
    pub async fn with_components(
        config: Config,
        sampler: S,
        store: K,
        broker: B,
    ) -> Result<Self, RuntimeError> {
        let registry = Arc::new(Registry::for_agent(
            &config.metrics_namespace,
            &config.interface,
            &config.agent_id,
        )?);
        let server = MetricsServer::bind(config.metrics_addr(), Arc::clone(&registry)).await?;
        Ok(Self {
            config,
            registry,
            server,
            sampler,
            store,
            broker,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn metrics_addr(&self) -> io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Runs until `cancel` fires. Returns `ShutdownTimeout` if the
    /// dependency services did not stop within the grace period; they are
    /// aborted in that case.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RuntimeError> {
        let config = self.config;
        info!(
            "Starting agent {} on {} (cache {}, broker {})",
            config.agent_id, config.interface, config.redis, config.mqtt
        );

        let backoff = Backoff::new(config.backoff_initial, config.backoff_max);
        let (cache_service, cache) = CacheService::new(
            self.store,
            backoff.clone(),
            config.dependency_timeout,
            Arc::clone(&self.registry),
        );
        let (publisher_service, publisher) = PublisherService::new(
            self.broker,
            config.qos,
            backoff,
            config.dependency_timeout,
            Arc::clone(&self.registry),
        );
        let mut cache_task = tokio::spawn(cache_service.run());
        let mut publisher_task = tokio::spawn(publisher_service.run());

        let server_cancel = CancellationToken::new();
        let server_task = tokio::spawn(self.server.serve(server_cancel.clone()));

        let mut agent = Agent::new(
            AgentSettings::from(&config),
            self.sampler,
            Arc::clone(&self.registry),
            cache.clone(),
            publisher.clone(),
        );
        agent.run(cancel).await;

        debug!("Stopping dependency services");
        let grace = config.shutdown_grace;
        let shutdown = async {
            let _ = cache.shutdown().await;
            let _ = publisher.shutdown().await;
            let _ = (&mut cache_task).await;
            let _ = (&mut publisher_task).await;
        };
        let result = match tokio::time::timeout(grace, shutdown).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!("Dependency services did not stop within {grace:?}, aborting them");
                cache_task.abort();
                publisher_task.abort();
                Err(RuntimeError::ShutdownTimeout(grace))
            }
        };

        server_cancel.cancel();
        let _ = server_task.await;
        info!("Shutdown complete");
        result
    }
}
