// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory stand-ins for the interface source, Redis and the MQTT broker

use async_trait::async_trait;
use netpulse::cache::KeyValueStore;
use netpulse::errors::{CacheError, PublishError, SampleError};
use netpulse::publisher::{Broker, Qos};
use netpulse::sample::{now_ms, InterfaceCounters, LinkState, Sample};
use netpulse::sampler::InterfaceSampler;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Interface whose counters grow by a fixed step on every reading. Readings
/// are spaced exactly one second apart so rates come out exact.
#[derive(Clone)]
pub struct SteppingSampler {
    pub interface: String,
    pub rx_step: u64,
    pub tx_step: u64,
    pub failing: Arc<AtomicBool>,
    readings: Arc<AtomicU64>,
    base_ms: u64,
}

impl SteppingSampler {
    pub fn new(interface: &str, rx_step: u64, tx_step: u64) -> Self {
        Self {
            interface: interface.to_string(),
            rx_step,
            tx_step,
            failing: Arc::new(AtomicBool::new(false)),
            readings: Arc::new(AtomicU64::new(0)),
            // Far enough in the past that no synthetic timestamp is in the future.
            base_ms: now_ms() - 3_600_000,
        }
    }

    pub fn readings(&self) -> u64 {
        self.readings.load(Ordering::SeqCst)
    }
}

impl InterfaceSampler for SteppingSampler {
    fn sample(&self, interface: &str) -> Result<Sample, SampleError> {
        if interface != self.interface {
            return Err(SampleError::InterfaceNotFound(interface.to_string()));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SampleError::ReadError("device vanished".to_string()));
        }
        let n = self.readings.fetch_add(1, Ordering::SeqCst);
        Ok(Sample {
            interface: interface.to_string(),
            timestamp_ms: self.base_ms + n * 1000,
            counters: InterfaceCounters {
                rx_bytes: 1000 + n * self.rx_step,
                rx_packets: 10 + n,
                tx_bytes: 2000 + n * self.tx_step,
                tx_packets: 20 + n,
                ..Default::default()
            },
            link: LinkState::Up,
        })
    }
}

/// Key-value store backed by a map. While `down` is set every call fails
/// as a refused connection would.
#[derive(Clone, Default)]
pub struct MemoryStore {
    pub down: Arc<AtomicBool>,
    pub connects: Arc<AtomicUsize>,
    pub puts: Arc<AtomicUsize>,
    pub data: Arc<Mutex<HashMap<String, (String, Duration)>>>,
}

impl MemoryStore {
    pub fn value(&self, key: &str) -> Option<String> {
        self.data
            .lock()
            .unwrap()
            .get(key)
            .map(|(value, _)| value.clone())
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.data.lock().unwrap().get(key).map(|(_, ttl)| *ttl)
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.down.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn connect(&mut self) -> Result<(), CacheError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.check()
    }

    async fn put(&mut self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), ttl));
        Ok(())
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        Ok(self.value(key))
    }

    async fn close(&mut self) {}
}

/// Broker that records every accepted message.
#[derive(Clone, Default)]
pub struct RecordingBroker {
    pub down: Arc<AtomicBool>,
    pub closed: Arc<AtomicBool>,
    pub messages: Arc<Mutex<Vec<(String, Vec<u8>, Qos)>>>,
}

impl RecordingBroker {
    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn last_json(&self) -> Option<(String, serde_json::Value)> {
        self.messages
            .lock()
            .unwrap()
            .last()
            .map(|(topic, payload, _)| (topic.clone(), serde_json::from_slice(payload).unwrap()))
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn connect(&mut self) -> Result<(), PublishError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(PublishError::BrokerUnreachable(
                "connection refused".to_string(),
            ));
        }
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
    ) -> Result<(), PublishError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(PublishError::Publish("connection lost".to_string()));
        }
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), payload, qos));
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
