// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The sampling loop.
//!
//! ```text
//! Sampling -> Computing -> Publishing -> Sleeping -> Sampling
//!     |                                     ^
//!     +------------- sample error ----------+
//! ```
//!
//! Any state moves to `Stopped` on cancellation. Each tick fans the sample
//! out to the cache, the registry and the broker independently; a failure in
//! one never stops the others.

use crate::cache::CacheHandle;
use crate::config::Config;
use crate::constants::{
    self, BROKER_ERRORS_TOTAL, CACHE_ERRORS_TOTAL, INTERFACE_COUNTER_RESETS_TOTAL, INTERFACE_UP,
    SAMPLE_ERRORS_TOTAL, SAMPLE_LAST_SUCCESS_TIMESTAMP, SAMPLE_OK, TICK_DURATION_SECONDS,
};
use crate::payload::{cache_key, BrokerMessage, CacheEntry};
use crate::publisher::PublisherHandle;
use crate::rate::Rate;
use crate::registry::{log_registry_error, Registry};
use crate::sample::{now_ms, Sample};
use crate::sampler::InterfaceSampler;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Sampling,
    Computing,
    Publishing,
    Sleeping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The sample was fanned out. `rate` is `None` on the first tick and
    /// after a failed sample.
    Published { sample: Sample, rate: Option<Rate> },
    SampleFailed,
}

/// The part of [`Config`] the loop needs.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub interface: String,
    pub agent_id: String,
    pub topic_prefix: String,
    pub key_prefix: String,
    pub interval: Duration,
    pub cache_ttl: Duration,
    pub dependency_timeout: Duration,
}

impl From<&Config> for AgentSettings {
    fn from(config: &Config) -> Self {
        Self {
            interface: config.interface.clone(),
            agent_id: config.agent_id.clone(),
            topic_prefix: config.topic_prefix.clone(),
            key_prefix: config.key_prefix.clone(),
            interval: config.interval,
            cache_ttl: config.cache_ttl(),
            dependency_timeout: config.dependency_timeout,
        }
    }
}

pub struct Agent<S> {
    settings: AgentSettings,
    sampler: S,
    registry: Arc<Registry>,
    cache: CacheHandle,
    publisher: PublisherHandle,
    previous: Option<Sample>,
    state: AgentState,
}

impl<S: InterfaceSampler> Agent<S> {
    pub fn new(
        settings: AgentSettings,
        sampler: S,
        registry: Arc<Registry>,
        cache: CacheHandle,
        publisher: PublisherHandle,
    ) -> Self {
        Self {
            settings,
            sampler,
            registry,
            cache,
            publisher,
            previous: None,
            state: AgentState::Sampling,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// The sample the next rate will be computed against.
    pub fn previous(&self) -> Option<&Sample> {
        self.previous.as_ref()
    }

    /// Ticks every interval until `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(
            "Sampling {} every {}s",
            self.settings.interface,
            self.settings.interval.as_secs()
        );
        self.seed_from_cache(&cancel).await;

        while !cancel.is_cancelled() {
            let tick_start = Instant::now();
            self.tick();

            let deadline = tick_start + self.settings.interval;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }

        self.state = AgentState::Stopped;
        info!("Agent loop stopped");
    }

    /// Loads the last cached sample of this interface so the first tick
    /// after a restart already reports a rate. Any failure is ignored.
    pub async fn seed_from_cache(&mut self, cancel: &CancellationToken) {
        let key = cache_key(&self.settings.key_prefix, &self.settings.interface);
        let lookup = tokio::time::timeout(self.settings.dependency_timeout, self.cache.get(&key));
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = lookup => result,
        };

        let value = match result {
            Ok(Ok(Some(value))) => value,
            Ok(Ok(None)) => {
                debug!("No cached sample under {key}");
                return;
            }
            Ok(Err(e)) => {
                debug!("Unable to read cached sample: {e}");
                return;
            }
            Err(_) => {
                debug!("Timed out reading cached sample");
                return;
            }
        };

        match serde_json::from_str::<Sample>(&value) {
            Ok(sample)
                if sample.interface == self.settings.interface && sample.timestamp_ms < now_ms() =>
            {
                info!(
                    "Resuming from cached sample taken at {}",
                    sample.timestamp_ms
                );
                self.previous = Some(sample);
            }
            Ok(_) => debug!("Ignoring cached sample under {key}"),
            Err(e) => debug!("Ignoring undecodable cached sample under {key}: {e}"),
        }
    }

    /// Runs one Sampling -> Computing -> Publishing pass and leaves the
    /// agent in `Sleeping`.
    pub fn tick(&mut self) -> TickOutcome {
        let started = Instant::now();

        self.state = AgentState::Sampling;
        let sample = match self.sampler.sample(&self.settings.interface) {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Failed to sample {}: {e}", self.settings.interface);
                log_registry_error(self.registry.increment(SAMPLE_ERRORS_TOTAL, 1.0));
                log_registry_error(self.registry.set(SAMPLE_OK, 0.0));
                // The next rate would span the gap; start over from the next sample.
                self.previous = None;
                self.finish_tick(started);
                return TickOutcome::SampleFailed;
            }
        };

        self.state = AgentState::Computing;
        let rate = self
            .previous
            .as_ref()
            .and_then(|previous| Rate::between(previous, &sample));
        if let Some(rate) = &rate {
            if !rate.resets.is_empty() {
                info!(
                    "Counters reset on {}: {}",
                    sample.interface,
                    rate.resets.join(", ")
                );
                log_registry_error(
                    self.registry
                        .increment(INTERFACE_COUNTER_RESETS_TOTAL, rate.resets.len() as f64),
                );
            }
        }

        self.state = AgentState::Publishing;
        self.write_cache(&sample);
        self.update_registry(&sample, rate.as_ref());
        self.publish(&sample, rate.as_ref());

        self.previous = Some(sample.clone());
        self.finish_tick(started);
        TickOutcome::Published { sample, rate }
    }

    fn write_cache(&self, sample: &Sample) {
        let entry = match CacheEntry::from_sample(
            &self.settings.key_prefix,
            sample,
            self.settings.cache_ttl,
        ) {
            Ok(entry) => entry,
            Err(e) => {
                error!("Failed to encode cache entry: {e}");
                debug_assert!(false, "failed to encode cache entry: {e}");
                return;
            }
        };
        if let Err(e) = self.cache.put(entry) {
            warn!("Cache write not queued: {e}");
            log_registry_error(self.registry.increment(CACHE_ERRORS_TOTAL, 1.0));
        }
    }

    fn update_registry(&self, sample: &Sample, rate: Option<&Rate>) {
        log_registry_error(self.registry.set_interface_counters(&sample.counters));
        match rate {
            Some(rate) => {
                for (counter, value) in rate.entries() {
                    log_registry_error(
                        self.registry
                            .set(&constants::interface_per_second(counter), value),
                    );
                }
            }
            // No baseline yet: a rate from before the gap must not read as current.
            None => log_registry_error(self.registry.clear_rates()),
        }
        log_registry_error(self.registry.set(INTERFACE_UP, sample.link.as_gauge()));
        log_registry_error(self.registry.set(SAMPLE_OK, 1.0));
        log_registry_error(
            self.registry
                .set(SAMPLE_LAST_SUCCESS_TIMESTAMP, sample.timestamp_secs()),
        );
    }

    fn publish(&self, sample: &Sample, rate: Option<&Rate>) {
        let message = match BrokerMessage::new(
            &self.settings.topic_prefix,
            &self.settings.agent_id,
            sample,
            rate,
        ) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to encode broker message: {e}");
                debug_assert!(false, "failed to encode broker message: {e}");
                return;
            }
        };
        if let Err(e) = self.publisher.publish(message) {
            warn!("Broker message not queued: {e}");
            log_registry_error(self.registry.increment(BROKER_ERRORS_TOTAL, 1.0));
        }
    }

    fn finish_tick(&mut self, started: Instant) {
        log_registry_error(
            self.registry
                .set(TICK_DURATION_SECONDS, started.elapsed().as_secs_f64()),
        );
        self.state = AgentState::Sleeping;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::{CacheService, KeyValueStore};
    use crate::connection::Backoff;
    use crate::errors::{CacheError, PublishError, SampleError};
    use crate::publisher::{Broker, PublisherService, Qos};
    use crate::sample::{InterfaceCounters, LinkState};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedSampler {
        script: Mutex<VecDeque<Result<Sample, SampleError>>>,
    }

    impl ScriptedSampler {
        fn new(script: Vec<Result<Sample, SampleError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }
    }

    impl InterfaceSampler for ScriptedSampler {
        fn sample(&self, interface: &str) -> Result<Sample, SampleError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SampleError::InterfaceNotFound(interface.to_string())))
        }
    }

    struct NullStore;

    #[async_trait]
    impl KeyValueStore for NullStore {
        async fn connect(&mut self) -> Result<(), CacheError> {
            Ok(())
        }
        async fn put(&mut self, _: &str, _: &str, _: Duration) -> Result<(), CacheError> {
            Ok(())
        }
        async fn get(&mut self, _: &str) -> Result<Option<String>, CacheError> {
            Ok(None)
        }
        async fn close(&mut self) {}
    }

    struct NullBroker;

    #[async_trait]
    impl Broker for NullBroker {
        async fn connect(&mut self) -> Result<(), PublishError> {
            Ok(())
        }
        async fn publish(&mut self, _: &str, _: Vec<u8>, _: Qos) -> Result<(), PublishError> {
            Ok(())
        }
        async fn close(&mut self) {}
    }

    fn sample(timestamp_ms: u64, rx_bytes: u64) -> Sample {
        Sample {
            interface: "eth0".to_string(),
            timestamp_ms,
            counters: InterfaceCounters {
                rx_bytes,
                ..Default::default()
            },
            link: LinkState::Up,
        }
    }

    fn settings() -> AgentSettings {
        AgentSettings {
            interface: "eth0".to_string(),
            agent_id: "edge-1".to_string(),
            topic_prefix: "netpulse".to_string(),
            key_prefix: "netpulse:iface:".to_string(),
            interval: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(15),
            dependency_timeout: Duration::from_secs(1),
        }
    }

    type IdleServices = (CacheService<NullStore>, PublisherService<NullBroker>);

    /// Builds an agent whose dependency services are never started, so
    /// enqueued writes simply wait in their queues.
    fn agent(
        script: Vec<Result<Sample, SampleError>>,
    ) -> (Agent<ScriptedSampler>, Arc<Registry>, IdleServices) {
        let registry = Arc::new(Registry::for_agent("netpulse", "eth0", "edge-1").unwrap());
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(10));
        let (cache_service, cache) = CacheService::new(
            NullStore,
            backoff.clone(),
            Duration::from_secs(1),
            Arc::clone(&registry),
        );
        let (publisher_service, publisher) = PublisherService::new(
            NullBroker,
            Qos::AtMostOnce,
            backoff,
            Duration::from_secs(1),
            Arc::clone(&registry),
        );
        let agent = Agent::new(
            settings(),
            ScriptedSampler::new(script),
            Arc::clone(&registry),
            cache,
            publisher,
        );
        (agent, registry, (cache_service, publisher_service))
    }

    #[tokio::test]
    async fn test_first_tick_has_no_rate() {
        let (mut agent, registry, _services) = agent(vec![Ok(sample(1_000, 1000))]);
        assert_eq!(agent.state(), AgentState::Sampling);

        let outcome = agent.tick();
        assert!(matches!(outcome, TickOutcome::Published { rate: None, .. }));
        assert_eq!(agent.state(), AgentState::Sleeping);
        assert_eq!(registry.get("interface_rx_bytes_total"), Some(1000.0));
        assert_eq!(registry.get(INTERFACE_UP), Some(1.0));
        assert_eq!(registry.get(SAMPLE_OK), Some(1.0));
        assert_eq!(registry.get(SAMPLE_LAST_SUCCESS_TIMESTAMP), Some(1.0));
    }

    #[tokio::test]
    async fn test_second_tick_reports_rate() {
        let (mut agent, registry, _services) =
            agent(vec![Ok(sample(1_000, 1000)), Ok(sample(6_000, 2500))]);
        agent.tick();
        let outcome = agent.tick();

        let TickOutcome::Published {
            rate: Some(rate), ..
        } = outcome
        else {
            panic!("expected a rate, got {outcome:?}");
        };
        assert!((rate.rx_bytes_per_sec - 300.0).abs() < f64::EPSILON);
        assert_eq!(registry.get("interface_rx_bytes_per_second"), Some(300.0));
        assert_eq!(registry.get("interface_rx_bytes_total"), Some(2500.0));
    }

    #[tokio::test]
    async fn test_sample_failure_rebaselines() {
        let (mut agent, registry, _services) = agent(vec![
            Ok(sample(1_000, 1000)),
            Ok(sample(6_000, 2500)),
            Err(SampleError::ReadError("boom".to_string())),
            Ok(sample(11_000, 5000)),
            Ok(sample(16_000, 6000)),
        ]);
        agent.tick();
        agent.tick();
        assert_eq!(registry.get("interface_rx_bytes_per_second"), Some(300.0));

        assert_eq!(agent.tick(), TickOutcome::SampleFailed);
        assert_eq!(agent.state(), AgentState::Sleeping);
        assert!(agent.previous().is_none());
        assert_eq!(registry.get(SAMPLE_ERRORS_TOTAL), Some(1.0));
        assert_eq!(registry.get(SAMPLE_OK), Some(0.0));
        // Last known good values survive the failure.
        assert_eq!(registry.get("interface_rx_bytes_total"), Some(2500.0));

        assert!(matches!(
            agent.tick(),
            TickOutcome::Published { rate: None, .. }
        ));
        assert_eq!(registry.get(SAMPLE_OK), Some(1.0));
        assert_eq!(registry.get("interface_rx_bytes_total"), Some(5000.0));
        for (counter, _) in InterfaceCounters::default().entries() {
            let name = constants::interface_per_second(counter);
            assert!(registry.get(&name).unwrap().is_nan(), "{name}");
        }

        let TickOutcome::Published { rate: Some(rate), .. } = agent.tick() else {
            panic!("expected a rate after re-baselining");
        };
        assert!((rate.rx_bytes_per_sec - 200.0).abs() < f64::EPSILON);
        assert_eq!(registry.get("interface_rx_bytes_per_second"), Some(200.0));
    }

    #[tokio::test]
    async fn test_counter_reset_is_counted() {
        let (mut agent, registry, _services) =
            agent(vec![Ok(sample(1_000, 5000)), Ok(sample(2_000, 10))]);
        agent.tick();
        let TickOutcome::Published { rate: Some(rate), .. } = agent.tick() else {
            panic!("expected a rate");
        };
        assert_eq!(rate.rx_bytes_per_sec, 0.0);
        assert_eq!(registry.get(INTERFACE_COUNTER_RESETS_TOTAL), Some(1.0));
        assert_eq!(registry.get("interface_rx_bytes_per_second"), Some(0.0));
    }

    #[tokio::test]
    async fn test_full_queues_count_dependency_errors() {
        let script = (0..20).map(|i| Ok(sample(1_000 * (i + 1), i))).collect();
        let (mut agent, registry, _services) = agent(script);
        for _ in 0..20 {
            agent.tick();
        }
        let dropped = (20 - crate::constants::SERVICE_CHANNEL_CAPACITY) as f64;
        assert_eq!(registry.get(CACHE_ERRORS_TOTAL), Some(dropped));
        assert_eq!(registry.get(BROKER_ERRORS_TOTAL), Some(dropped));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (mut agent, _registry, _services) = agent(vec![Ok(sample(1_000, 1))]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        agent.run(cancel).await;
        assert_eq!(agent.state(), AgentState::Stopped);
    }
}
