// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire shapes for the cache and the broker.

use crate::rate::Rate;
use crate::sample::{InterfaceCounters, LinkState, Sample};
use serde::Serialize;
use std::time::Duration;

/// One write to the key-value store. The value is the JSON encoding of the
/// sample, whose `timestamp_ms` doubles as the last-updated time.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn from_sample(
        key_prefix: &str,
        sample: &Sample,
        ttl: Duration,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            key: cache_key(key_prefix, &sample.interface),
            value: serde_json::to_string(sample)?,
            ttl,
        })
    }
}

pub fn cache_key(key_prefix: &str, interface: &str) -> String {
    format!("{key_prefix}{interface}")
}

/// Message body published once per tick.
#[derive(Debug, Serialize)]
struct StatsPayload<'a> {
    agent: &'a str,
    interface: &'a str,
    timestamp_ms: u64,
    link: LinkState,
    counters: &'a InterfaceCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    rates: Option<&'a Rate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(
        topic_prefix: &str,
        agent_id: &str,
        sample: &Sample,
        rate: Option<&Rate>,
    ) -> Result<Self, serde_json::Error> {
        let body = StatsPayload {
            agent: agent_id,
            interface: &sample.interface,
            timestamp_ms: sample.timestamp_ms,
            link: sample.link,
            counters: &sample.counters,
            rates: rate,
        };
        Ok(Self {
            topic: topic(topic_prefix, agent_id, &sample.interface),
            payload: serde_json::to_vec(&body)?,
        })
    }
}

/// `{prefix}/{agent}/{interface}/stats`
pub fn topic(topic_prefix: &str, agent_id: &str, interface: &str) -> String {
    format!(
        "{}/{agent_id}/{interface}/stats",
        topic_prefix.trim_end_matches('/')
    )
}
