// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for every netpulse component.
//!
//! Sampling, cache and broker errors are recoverable: the agent counts and
//! logs them and keeps running. Configuration and bind errors are fatal.
//! Registry errors indicate wiring defects.

use std::time::Duration;

/// Failure to read one interface sample.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("interface {0} not found")]
    InterfaceNotFound(String),

    #[error("failed to read interface statistics: {0}")]
    ReadError(String),
}

impl From<std::io::Error> for SampleError {
    fn from(err: std::io::Error) -> Self {
        SampleError::ReadError(err.to_string())
    }
}

/// Failure talking to the key-value store.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("cache request queue is full, write dropped")]
    QueueFull,

    #[error("cache service stopped")]
    Stopped,
}

/// Failure talking to the message broker.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("broker operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("publish queue is full, message dropped")]
    QueueFull,

    #[error("publisher service stopped")]
    Stopped,
}

/// Misuse of the metrics registry. These are wiring defects, not runtime
/// conditions.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    #[error("metric already registered: {0}")]
    Duplicate(String),

    #[error("invalid metric name: {0}")]
    InvalidName(String),

    #[error("metric {name} rejected by the registry: {reason}")]
    Rejected { name: String, reason: String },

    #[error("counter {0} cannot be decremented")]
    NegativeIncrement(String),
}

/// Invalid or missing startup configuration.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Failures that stop the agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to bind metrics endpoint on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("metrics registry setup failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("cache client setup failed: {0}")]
    Cache(#[from] CacheError),

    #[error("shutdown grace period of {0:?} exceeded")]
    ShutdownTimeout(Duration),
}
