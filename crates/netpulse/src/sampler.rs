// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interface statistics from the Linux `/proc` and `/sys` filesystems.
//!
//! # /proc/net/dev layout
//!
//! ```text
//! Inter-|   Receive                                                |  Transmit
//!  face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
//!   eth0:     180      10    1    2    0     0          0         0      254      12    3    4    0     0       0          0
//! ```
//!
//! Receive counters are columns 0..=3 after the interface name, transmit
//! counters are columns 8..=11. The kernel pads short names, but long values
//! can run into the colon (`wlan0:98765432109`), so lines are split on the
//! colon first.

use crate::constants::{PROC_NET_DEV_PATH, SYS_CLASS_NET_PATH};
use crate::errors::SampleError;
use crate::sample::{now_ms, InterfaceCounters, LinkState, Sample};
use std::fs::{self, File};
use std::io::{self, BufRead};
use std::path::PathBuf;
use tracing::debug;

/// Number of numeric columns the kernel writes per interface.
const NET_DEV_COLUMNS: usize = 16;

/// Produces samples for a named interface.
pub trait InterfaceSampler: Send + Sync {
    fn sample(&self, interface: &str) -> Result<Sample, SampleError>;
}

/// Reads counters from `/proc/net/dev` and link state from
/// `/sys/class/net/<iface>/operstate`.
#[derive(Debug, Clone)]
pub struct ProcSampler {
    net_dev_path: PathBuf,
    sys_class_net_path: PathBuf,
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcSampler {
    pub fn new() -> Self {
        Self::with_paths(PROC_NET_DEV_PATH, SYS_CLASS_NET_PATH)
    }

    pub fn with_paths(
        net_dev_path: impl Into<PathBuf>,
        sys_class_net_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            net_dev_path: net_dev_path.into(),
            sys_class_net_path: sys_class_net_path.into(),
        }
    }

    fn read_counters(&self, interface: &str) -> Result<InterfaceCounters, SampleError> {
        let file = File::open(&self.net_dev_path)?;
        let reader = io::BufReader::new(file);

        for line in reader.lines() {
            let line = line?;
            let Some((name, values)) = line.split_once(':') else {
                continue;
            };
            if name.trim() != interface {
                continue;
            }
            return parse_counters(interface, values);
        }

        Err(SampleError::InterfaceNotFound(interface.to_string()))
    }

    fn read_link_state(&self, interface: &str) -> LinkState {
        let path = self.sys_class_net_path.join(interface).join("operstate");
        match fs::read_to_string(&path) {
            Ok(operstate) => LinkState::from_operstate(&operstate),
            Err(e) => {
                debug!("Unable to read {}: {e}", path.display());
                LinkState::Unknown
            }
        }
    }
}

impl InterfaceSampler for ProcSampler {
    fn sample(&self, interface: &str) -> Result<Sample, SampleError> {
        let counters = self.read_counters(interface)?;
        let link = self.read_link_state(interface);
        Ok(Sample {
            interface: interface.to_string(),
            timestamp_ms: now_ms(),
            counters,
            link,
        })
    }
}

fn parse_counters(interface: &str, values: &str) -> Result<InterfaceCounters, SampleError> {
    let parsed = values
        .split_whitespace()
        .map(str::parse::<u64>)
        .collect::<Result<Vec<u64>, _>>()
        .map_err(|e| SampleError::ReadError(format!("{interface}: non-numeric counter: {e}")))?;

    if parsed.len() < NET_DEV_COLUMNS {
        return Err(SampleError::ReadError(format!(
            "{interface}: expected {NET_DEV_COLUMNS} columns, found {}",
            parsed.len()
        )));
    }

    Ok(InterfaceCounters {
        rx_bytes: parsed[0],
        rx_packets: parsed[1],
        rx_errors: parsed[2],
        rx_dropped: parsed[3],
        tx_bytes: parsed[8],
        tx_packets: parsed[9],
        tx_errors: parsed[10],
        tx_dropped: parsed[11],
    })
}
