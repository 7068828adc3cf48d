// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Filesystem paths, protocol defaults and metric names.

use std::time::Duration;

/// Per-interface counters, one line per interface after two header lines.
pub const PROC_NET_DEV_PATH: &str = "/proc/net/dev";

/// Holds one directory per interface; `<iface>/operstate` is the link state.
pub const SYS_CLASS_NET_PATH: &str = "/sys/class/net";

pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_MQTT_PORT: u16 = 1883;

pub const METRICS_ENDPOINT_PATH: &str = "/metrics";
pub const HEALTH_ENDPOINT_PATH: &str = "/healthz";

/// Queue depth between the agent loop and each dependency service.
pub const SERVICE_CHANNEL_CAPACITY: usize = 16;

/// Request channel capacity of the MQTT client.
pub const MQTT_REQUEST_CAPACITY: usize = 16;
pub const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);

// Metric names, without namespace.
pub const INTERFACE_UP: &str = "interface_up";
pub const INTERFACE_COUNTER_RESETS_TOTAL: &str = "interface_counter_resets_total";
pub const SAMPLE_ERRORS_TOTAL: &str = "sample_errors_total";
pub const SAMPLE_OK: &str = "sample_ok";
pub const SAMPLE_LAST_SUCCESS_TIMESTAMP: &str = "sample_last_success_timestamp_seconds";
pub const TICK_DURATION_SECONDS: &str = "tick_duration_seconds";
pub const CACHE_ERRORS_TOTAL: &str = "cache_errors_total";
pub const CACHE_WRITES_TOTAL: &str = "cache_writes_total";
pub const CACHE_UP: &str = "cache_up";
pub const CACHE_LAST_SUCCESS_TIMESTAMP: &str = "cache_last_success_timestamp_seconds";
pub const BROKER_ERRORS_TOTAL: &str = "broker_errors_total";
pub const BROKER_MESSAGES_TOTAL: &str = "broker_messages_total";
pub const BROKER_UP: &str = "broker_up";
pub const BROKER_LAST_SUCCESS_TIMESTAMP: &str = "broker_last_success_timestamp_seconds";

/// Name of the absolute counter metric for an interface counter, e.g.
/// `interface_rx_bytes_total`.
pub fn interface_total(counter: &str) -> String {
    format!("interface_{counter}_total")
}

/// Name of the rate gauge for an interface counter, e.g.
/// `interface_rx_bytes_per_second`.
pub fn interface_per_second(counter: &str) -> String {
    format!("interface_{counter}_per_second")
}
