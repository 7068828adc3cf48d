// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Network interface telemetry agent.
//!
//! One named interface is sampled at a fixed interval. Every sample is
//! written to a Redis key with a TTL, published as JSON to an MQTT topic and
//! mirrored into a Prometheus registry served over HTTP. Redis and MQTT are
//! best-effort: while either is down the agent keeps sampling and serving
//! metrics, counting the failures and reconnecting with exponential backoff.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod cache;
pub mod config;
pub mod connection;
pub mod constants;
pub mod errors;
pub mod payload;
pub mod publisher;
pub mod rate;
pub mod registry;
pub mod runtime;
pub mod sample;
pub mod sampler;
pub mod server;
