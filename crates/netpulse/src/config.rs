// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Startup configuration, read once from the environment.

use crate::constants::{DEFAULT_MQTT_PORT, DEFAULT_REDIS_PORT};
use crate::errors::ConfigError;
use crate::publisher::Qos;
use std::env;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_INTERFACE: &str = "APP_INTERFACE";
pub const ENV_REDIS_HOST: &str = "APP_REDIS_HOST";
pub const ENV_MQTT_HOST: &str = "APP_MQTT_HOST";
pub const ENV_INTERVAL: &str = "APP_INTERVAL";
pub const ENV_PROMETHEUS_PORT: &str = "PROMETHEUS_PORT";
pub const ENV_LOG_LEVEL: &str = "APP_LOG_LEVEL";
pub const ENV_AGENT_ID: &str = "APP_AGENT_ID";
pub const ENV_MQTT_TOPIC_PREFIX: &str = "APP_MQTT_TOPIC_PREFIX";
pub const ENV_MQTT_QOS: &str = "APP_MQTT_QOS";
pub const ENV_REDIS_KEY_PREFIX: &str = "APP_REDIS_KEY_PREFIX";
pub const ENV_CACHE_TTL_MULTIPLIER: &str = "APP_CACHE_TTL_MULTIPLIER";
pub const ENV_DEPENDENCY_TIMEOUT_MS: &str = "APP_DEPENDENCY_TIMEOUT_MS";
pub const ENV_BACKOFF_INITIAL_MS: &str = "APP_BACKOFF_INITIAL_MS";
pub const ENV_BACKOFF_MAX_MS: &str = "APP_BACKOFF_MAX_MS";
pub const ENV_SHUTDOWN_GRACE_MS: &str = "APP_SHUTDOWN_GRACE_MS";
pub const ENV_METRICS_NAMESPACE: &str = "APP_METRICS_NAMESPACE";

pub const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_AGENT_ID: &str = "netpulse";
const DEFAULT_TOPIC_PREFIX: &str = "netpulse";
const DEFAULT_KEY_PREFIX: &str = "netpulse:iface:";
const DEFAULT_CACHE_TTL_MULTIPLIER: u32 = 3;
const DEFAULT_DEPENDENCY_TIMEOUT_MS: u64 = 2000;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5000;
const DEFAULT_METRICS_NAMESPACE: &str = "netpulse";
/// One day. Longer intervals overflow deadline arithmetic and cache TTLs.
const MAX_INTERVAL_SECS: u64 = 86_400;

/// A `host[:port]` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    /// Parses `host`, `host:port`, `[v6]` or `[v6]:port`. An unbracketed
    /// address with several colons is taken as a bare IPv6 host.
    pub fn parse(value: &str, default_port: u16) -> Result<Self, String> {
        let value = value.trim();
        if value.is_empty() {
            return Err("empty host".to_string());
        }

        let (host, port) = if let Some(rest) = value.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated IPv6 literal in {value}"))?;
            match after {
                "" => (host, None),
                _ => match after.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(format!("unexpected characters after ] in {value}")),
                },
            }
        } else if value.matches(':').count() == 1 {
            let (host, port) = value.split_once(':').unwrap_or((value, ""));
            (host, Some(port))
        } else {
            (value, None)
        };

        if host.is_empty() {
            return Err(format!("missing host in {value}"));
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| format!("invalid port {port:?}"))?,
            None => default_port,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub interface: String,
    pub redis: HostPort,
    pub mqtt: HostPort,
    pub interval: Duration,
    pub metrics_port: u16,
    pub log_level: String,
    pub agent_id: String,
    pub topic_prefix: String,
    pub qos: Qos,
    pub key_prefix: String,
    pub cache_ttl_multiplier: u32,
    /// Upper bound for every cache and broker call. Always shorter than
    /// `interval`.
    pub dependency_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub shutdown_grace: Duration,
    pub metrics_namespace: String,
}

impl Config {
    pub fn new() -> Result<Config, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source. Empty values are
    /// treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let required = |name: &'static str| var(name).ok_or(ConfigError::Missing(name));

        let interface = required(ENV_INTERFACE)?.trim().to_string();
        validate_topic_level(ENV_INTERFACE, &interface)?;

        let redis = HostPort::parse(&required(ENV_REDIS_HOST)?, DEFAULT_REDIS_PORT)
            .map_err(|reason| invalid(ENV_REDIS_HOST, reason))?;
        let mqtt = HostPort::parse(&required(ENV_MQTT_HOST)?, DEFAULT_MQTT_PORT)
            .map_err(|reason| invalid(ENV_MQTT_HOST, reason))?;

        let interval_secs: u64 = parse(ENV_INTERVAL, &required(ENV_INTERVAL)?)?;
        if interval_secs == 0 {
            return Err(invalid(ENV_INTERVAL, "must be greater than zero"));
        }
        if interval_secs > MAX_INTERVAL_SECS {
            return Err(invalid(
                ENV_INTERVAL,
                format!("must be at most {MAX_INTERVAL_SECS} seconds"),
            ));
        }
        let interval = Duration::from_secs(interval_secs);

        let metrics_port: u16 = parse(ENV_PROMETHEUS_PORT, &required(ENV_PROMETHEUS_PORT)?)?;

        let log_level = var(ENV_LOG_LEVEL)
            .map(|level| level.trim().to_lowercase())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        let agent_id = var(ENV_AGENT_ID)
            .or_else(|| var("HOSTNAME"))
            .map(|id| id.trim().to_string())
            .unwrap_or_else(|| DEFAULT_AGENT_ID.to_string());
        validate_topic_level(ENV_AGENT_ID, &agent_id)?;

        let topic_prefix = var(ENV_MQTT_TOPIC_PREFIX)
            .map(|prefix| prefix.trim().to_string())
            .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string());
        if topic_prefix.contains(['+', '#']) {
            return Err(invalid(
                ENV_MQTT_TOPIC_PREFIX,
                "must not contain MQTT wildcards",
            ));
        }

        let qos = match var(ENV_MQTT_QOS) {
            Some(level) => {
                let level: u8 = parse(ENV_MQTT_QOS, &level)?;
                Qos::from_level(level).ok_or_else(|| invalid(ENV_MQTT_QOS, "must be 0, 1 or 2"))?
            }
            None => Qos::default(),
        };

        let key_prefix = var(ENV_REDIS_KEY_PREFIX).unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());

        let cache_ttl_multiplier =
            optional(&var, ENV_CACHE_TTL_MULTIPLIER, DEFAULT_CACHE_TTL_MULTIPLIER)?;
        if cache_ttl_multiplier == 0 {
            return Err(invalid(ENV_CACHE_TTL_MULTIPLIER, "must be greater than zero"));
        }

        let dependency_timeout = Duration::from_millis(optional(
            &var,
            ENV_DEPENDENCY_TIMEOUT_MS,
            DEFAULT_DEPENDENCY_TIMEOUT_MS,
        )?);
        if dependency_timeout.is_zero() {
            return Err(invalid(ENV_DEPENDENCY_TIMEOUT_MS, "must be greater than zero"));
        }
        if dependency_timeout >= interval {
            return Err(invalid(
                ENV_DEPENDENCY_TIMEOUT_MS,
                format!(
                    "{}ms must be shorter than the sampling interval of {}s",
                    dependency_timeout.as_millis(),
                    interval.as_secs()
                ),
            ));
        }

        let backoff_initial = Duration::from_millis(optional(
            &var,
            ENV_BACKOFF_INITIAL_MS,
            DEFAULT_BACKOFF_INITIAL_MS,
        )?);
        let backoff_max =
            Duration::from_millis(optional(&var, ENV_BACKOFF_MAX_MS, DEFAULT_BACKOFF_MAX_MS)?);
        if backoff_initial.is_zero() {
            return Err(invalid(ENV_BACKOFF_INITIAL_MS, "must be greater than zero"));
        }
        if backoff_max < backoff_initial {
            return Err(invalid(
                ENV_BACKOFF_MAX_MS,
                format!("must be at least {ENV_BACKOFF_INITIAL_MS}"),
            ));
        }

        let shutdown_grace = Duration::from_millis(optional(
            &var,
            ENV_SHUTDOWN_GRACE_MS,
            DEFAULT_SHUTDOWN_GRACE_MS,
        )?);

        let metrics_namespace = var(ENV_METRICS_NAMESPACE)
            .map(|namespace| namespace.trim().to_string())
            .unwrap_or_else(|| DEFAULT_METRICS_NAMESPACE.to_string());
        if !is_valid_namespace(&metrics_namespace) {
            return Err(invalid(
                ENV_METRICS_NAMESPACE,
                "must match [a-zA-Z_][a-zA-Z0-9_]*",
            ));
        }

        Ok(Config {
            interface,
            redis,
            mqtt,
            interval,
            metrics_port,
            log_level,
            agent_id,
            topic_prefix,
            qos,
            key_prefix,
            cache_ttl_multiplier,
            dependency_timeout,
            backoff_initial,
            backoff_max,
            shutdown_grace,
            metrics_namespace,
        })
    }

    /// `cache_ttl_multiplier × interval`, rounded up to whole seconds and
    /// never below one second.
    pub fn cache_ttl(&self) -> Duration {
        let millis = self.interval.as_millis() * u128::from(self.cache_ttl_multiplier);
        let secs = millis.div_ceil(1000).max(1);
        Duration::from_secs(u64::try_from(secs).unwrap_or(u64::MAX))
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}/", self.redis)
    }

    pub fn mqtt_client_id(&self) -> String {
        format!("netpulse-{}", self.agent_id)
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.metrics_port))
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.into(),
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| invalid(name, format!("{value:?}: {e}")))
}

fn optional<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => parse(name, &value),
        None => Ok(default),
    }
}

/// Values that become one level of an MQTT topic.
fn validate_topic_level(name: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.contains(['/', '+', '#']) {
        return Err(invalid(name, format!("{value:?} must not contain '/', '+' or '#'")));
    }
    Ok(())
}

fn is_valid_namespace(namespace: &str) -> bool {
    let mut chars = namespace.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
