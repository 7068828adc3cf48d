// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sample data model: one timestamped reading of an interface.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Operational state of the interface link, from `/sys/class/net/<iface>/operstate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
    Unknown,
}

impl LinkState {
    pub fn from_operstate(operstate: &str) -> Self {
        match operstate.trim() {
            "up" => LinkState::Up,
            "down" | "lowerlayerdown" | "dormant" | "notpresent" => LinkState::Down,
            _ => LinkState::Unknown,
        }
    }

    /// Gauge encoding: 1 up, 0 down, -1 unknown.
    pub fn as_gauge(self) -> f64 {
        match self {
            LinkState::Up => 1.0,
            LinkState::Down => 0.0,
            LinkState::Unknown => -1.0,
        }
    }
}

/// Cumulative interface counters as exposed by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
}

impl InterfaceCounters {
    /// Counter values keyed by their short name, in a fixed order.
    pub fn entries(&self) -> [(&'static str, u64); 8] {
        [
            ("rx_bytes", self.rx_bytes),
            ("rx_packets", self.rx_packets),
            ("rx_errors", self.rx_errors),
            ("rx_dropped", self.rx_dropped),
            ("tx_bytes", self.tx_bytes),
            ("tx_packets", self.tx_packets),
            ("tx_errors", self.tx_errors),
            ("tx_dropped", self.tx_dropped),
        ]
    }
}

/// One reading of one interface. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub interface: String,
    /// Wall-clock time of the reading, unix epoch milliseconds.
    pub timestamp_ms: u64,
    pub counters: InterfaceCounters,
    pub link: LinkState,
}

impl Sample {
    pub fn timestamp_secs(&self) -> f64 {
        self.timestamp_ms as f64 / 1000.0
    }
}

/// Current wall-clock time in unix epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
