// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The agent metric set, held in a `prometheus` registry.
//!
//! Metrics are registered once while the registry is still exclusively owned,
//! then the registry is shared behind an `Arc`. Callers address metrics by
//! their unprefixed name; the namespace and the constant `interface` and
//! `agent` labels are applied at registration.

use crate::constants::{
    self, BROKER_ERRORS_TOTAL, BROKER_LAST_SUCCESS_TIMESTAMP, BROKER_MESSAGES_TOTAL, BROKER_UP,
    CACHE_ERRORS_TOTAL, CACHE_LAST_SUCCESS_TIMESTAMP, CACHE_UP, CACHE_WRITES_TOTAL,
    INTERFACE_COUNTER_RESETS_TOTAL, INTERFACE_UP, SAMPLE_ERRORS_TOTAL,
    SAMPLE_LAST_SUCCESS_TIMESTAMP, SAMPLE_OK, TICK_DURATION_SECONDS,
};
use crate::errors::RegistryError;
use crate::sample::InterfaceCounters;
use prometheus::proto::MetricFamily;
use prometheus::{Counter, Gauge, Opts};
use std::collections::HashMap;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricDescriptor {
    /// Name without the registry namespace.
    pub name: String,
    pub kind: MetricKind,
    pub help: String,
}

impl MetricDescriptor {
    pub fn counter(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Counter,
            help: help.into(),
        }
    }

    pub fn gauge(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Gauge,
            help: help.into(),
        }
    }
}

#[derive(Debug, Clone)]
enum Handle {
    Counter(Counter),
    Gauge(Gauge),
}

pub struct Registry {
    namespace: String,
    const_labels: HashMap<String, String>,
    inner: prometheus::Registry,
    metrics: HashMap<String, Handle>,
}

impl Registry {
    /// Creates an empty registry. `namespace` is prefixed to every metric
    /// name with an underscore; `const_labels` are attached to every series.
    pub fn new(namespace: impl Into<String>, const_labels: Vec<(String, String)>) -> Self {
        Self {
            namespace: namespace.into(),
            const_labels: const_labels.into_iter().collect(),
            inner: prometheus::Registry::new(),
            metrics: HashMap::new(),
        }
    }

    /// Creates a registry holding the full agent metric set, labelled with
    /// the monitored interface and the agent identity.
    pub fn for_agent(
        namespace: &str,
        interface: &str,
        agent_id: &str,
    ) -> Result<Self, RegistryError> {
        let mut registry = Registry::new(
            namespace,
            vec![
                ("interface".to_string(), interface.to_string()),
                ("agent".to_string(), agent_id.to_string()),
            ],
        );
        for descriptor in agent_descriptors() {
            registry.register(descriptor)?;
        }
        registry.set(INTERFACE_UP, -1.0)?;
        registry.clear_rates()?;
        Ok(registry)
    }

    pub fn register(&mut self, descriptor: MetricDescriptor) -> Result<(), RegistryError> {
        let MetricDescriptor { name, kind, help } = descriptor;
        if self.metrics.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        let opts = Opts::new(name.as_str(), help)
            .namespace(self.namespace.as_str())
            .const_labels(self.const_labels.clone());
        let handle = match kind {
            MetricKind::Counter => Counter::with_opts(opts).map(Handle::Counter),
            MetricKind::Gauge => Gauge::with_opts(opts).map(Handle::Gauge),
        }
        .map_err(|_| RegistryError::InvalidName(name.clone()))?;

        let registered = match &handle {
            Handle::Counter(counter) => self.inner.register(Box::new(counter.clone())),
            Handle::Gauge(gauge) => self.inner.register(Box::new(gauge.clone())),
        };
        match registered {
            Ok(()) => {}
            Err(prometheus::Error::AlreadyReg) => return Err(RegistryError::Duplicate(name)),
            Err(e) => {
                return Err(RegistryError::Rejected {
                    name,
                    reason: e.to_string(),
                })
            }
        }

        self.metrics.insert(name, handle);
        Ok(())
    }

    /// Replaces the value of a metric. Counters may be set to an absolute
    /// value, which is how kernel counters are mirrored; a value below the
    /// current one restarts the counter from zero.
    pub fn set(&self, name: &str, value: f64) -> Result<(), RegistryError> {
        match self.metric(name)? {
            Handle::Gauge(gauge) => gauge.set(value),
            Handle::Counter(counter) => {
                if value < 0.0 || value.is_nan() {
                    return Err(RegistryError::NegativeIncrement(name.to_string()));
                }
                let current = counter.get();
                if value < current {
                    counter.reset();
                    counter.inc_by(value);
                } else {
                    counter.inc_by(value - current);
                }
            }
        }
        Ok(())
    }

    /// Adds `delta` to a metric and returns the value it observed right
    /// after the update. Counters reject negative deltas.
    pub fn increment(&self, name: &str, delta: f64) -> Result<f64, RegistryError> {
        match self.metric(name)? {
            Handle::Counter(counter) => {
                if delta < 0.0 || delta.is_nan() {
                    return Err(RegistryError::NegativeIncrement(name.to_string()));
                }
                counter.inc_by(delta);
                Ok(counter.get())
            }
            Handle::Gauge(gauge) => {
                gauge.add(delta);
                Ok(gauge.get())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).map(|handle| match handle {
            Handle::Counter(counter) => counter.get(),
            Handle::Gauge(gauge) => gauge.get(),
        })
    }

    /// Snapshot of every registered metric, ready for an encoder.
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.inner.gather()
    }

    /// Mirrors absolute interface counters into their `_total` metrics.
    pub fn set_interface_counters(
        &self,
        counters: &InterfaceCounters,
    ) -> Result<(), RegistryError> {
        for (counter, value) in counters.entries() {
            self.set(&constants::interface_total(counter), value as f64)?;
        }
        Ok(())
    }

    /// Marks every per-second gauge as having no current value.
    pub fn clear_rates(&self) -> Result<(), RegistryError> {
        for (counter, _) in InterfaceCounters::default().entries() {
            self.set(&constants::interface_per_second(counter), f64::NAN)?;
        }
        Ok(())
    }

    fn metric(&self, name: &str) -> Result<&Handle, RegistryError> {
        self.metrics
            .get(name)
            .ok_or_else(|| RegistryError::UnknownMetric(name.to_string()))
    }
}

/// Logs a failed registry update. Metric names are fixed at startup, so an
/// error here is a wiring defect.
pub fn log_registry_error<T>(result: Result<T, RegistryError>) {
    if let Err(e) = result {
        error!("Metrics registry update failed: {e}");
        debug_assert!(false, "metrics registry update failed: {e}");
    }
}

/// Every metric the agent exposes.
pub fn agent_descriptors() -> Vec<MetricDescriptor> {
    let mut descriptors = Vec::new();
    for (counter, _) in InterfaceCounters::default().entries() {
        let words = counter.replace('_', " ");
        descriptors.push(MetricDescriptor::counter(
            constants::interface_total(counter),
            format!("Interface {words} since boot, as reported by the kernel."),
        ));
    }
    for (counter, _) in InterfaceCounters::default().entries() {
        let words = counter.replace('_', " ");
        descriptors.push(MetricDescriptor::gauge(
            constants::interface_per_second(counter),
            format!("Interface {words} per second over the last sampling interval."),
        ));
    }
    descriptors.extend([
        MetricDescriptor::gauge(
            INTERFACE_UP,
            "Interface link state: 1 up, 0 down, -1 unknown.",
        ),
        MetricDescriptor::counter(
            INTERFACE_COUNTER_RESETS_TOTAL,
            "Interface counters observed going backwards.",
        ),
        MetricDescriptor::counter(SAMPLE_ERRORS_TOTAL, "Failed interface samples."),
        MetricDescriptor::gauge(
            SAMPLE_LAST_SUCCESS_TIMESTAMP,
            "Unix time of the last successful interface sample.",
        ),
        MetricDescriptor::gauge(
            SAMPLE_OK,
            "1 if the last tick sampled the interface successfully.",
        ),
        MetricDescriptor::gauge(TICK_DURATION_SECONDS, "Duration of the last agent tick."),
        MetricDescriptor::counter(CACHE_ERRORS_TOTAL, "Failed cache writes."),
        MetricDescriptor::counter(CACHE_WRITES_TOTAL, "Successful cache writes."),
        MetricDescriptor::gauge(CACHE_UP, "1 if the cache connection is established."),
        MetricDescriptor::gauge(
            CACHE_LAST_SUCCESS_TIMESTAMP,
            "Unix time of the last successful cache write.",
        ),
        MetricDescriptor::counter(BROKER_ERRORS_TOTAL, "Failed broker publishes."),
        MetricDescriptor::counter(BROKER_MESSAGES_TOTAL, "Messages handed to the broker."),
        MetricDescriptor::gauge(BROKER_UP, "1 if the broker connection is established."),
        MetricDescriptor::gauge(
            BROKER_LAST_SUCCESS_TIMESTAMP,
            "Unix time of the last successful broker publish.",
        ),
    ]);
    descriptors
}
