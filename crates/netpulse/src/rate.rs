// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-second rates derived from two consecutive samples.
//!
//! `rate = (current - previous) / elapsed_seconds`. A counter that went
//! backwards (interface reset or wrap) reports zero for that tick instead of
//! a negative rate.

use crate::sample::Sample;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Rate {
    pub rx_bytes_per_sec: f64,
    pub rx_packets_per_sec: f64,
    pub rx_errors_per_sec: f64,
    pub rx_dropped_per_sec: f64,
    pub tx_bytes_per_sec: f64,
    pub tx_packets_per_sec: f64,
    pub tx_errors_per_sec: f64,
    pub tx_dropped_per_sec: f64,
    /// Seconds between the two samples.
    pub elapsed_secs: f64,
    /// Counters that decreased between the two samples.
    #[serde(skip)]
    pub resets: Vec<&'static str>,
}

impl Rate {
    /// Computes the rate between two samples of the same interface.
    ///
    /// Returns `None` if the samples belong to different interfaces or the
    /// current sample is not strictly newer than the previous one.
    pub fn between(previous: &Sample, current: &Sample) -> Option<Rate> {
        if previous.interface != current.interface {
            return None;
        }
        if current.timestamp_ms <= previous.timestamp_ms {
            return None;
        }
        let elapsed_secs = (current.timestamp_ms - previous.timestamp_ms) as f64 / 1000.0;

        let mut resets = Vec::new();
        let prev = previous.counters.entries();
        let cur = current.counters.entries();
        let mut per_sec = [0.0_f64; 8];
        for (i, ((name, before), (_, after))) in prev.iter().zip(cur.iter()).enumerate() {
            if after < before {
                resets.push(*name);
                continue;
            }
            per_sec[i] = (after - before) as f64 / elapsed_secs;
        }

        Some(Rate {
            rx_bytes_per_sec: per_sec[0],
            rx_packets_per_sec: per_sec[1],
            rx_errors_per_sec: per_sec[2],
            rx_dropped_per_sec: per_sec[3],
            tx_bytes_per_sec: per_sec[4],
            tx_packets_per_sec: per_sec[5],
            tx_errors_per_sec: per_sec[6],
            tx_dropped_per_sec: per_sec[7],
            elapsed_secs,
            resets,
        })
    }

    /// Rates keyed by the counter short name, same order as
    /// [`InterfaceCounters::entries`](crate::sample::InterfaceCounters::entries).
    pub fn entries(&self) -> [(&'static str, f64); 8] {
        [
            ("rx_bytes", self.rx_bytes_per_sec),
            ("rx_packets", self.rx_packets_per_sec),
            ("rx_errors", self.rx_errors_per_sec),
            ("rx_dropped", self.rx_dropped_per_sec),
            ("tx_bytes", self.tx_bytes_per_sec),
            ("tx_packets", self.tx_packets_per_sec),
            ("tx_errors", self.tx_errors_per_sec),
            ("tx_dropped", self.tx_dropped_per_sec),
        ]
    }
}
