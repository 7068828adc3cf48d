// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use netpulse::config::Config;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{timeout, Instant};

/// Config for a runtime on an ephemeral metrics port with a one second
/// interval and short dependency timeouts.
pub fn test_config(interface: &str, overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<&str, &str> = HashMap::from([
        ("APP_INTERFACE", interface),
        ("APP_REDIS_HOST", "127.0.0.1:6379"),
        ("APP_MQTT_HOST", "127.0.0.1:1883"),
        ("APP_INTERVAL", "1"),
        ("PROMETHEUS_PORT", "0"),
        ("APP_AGENT_ID", "it-agent"),
        ("APP_DEPENDENCY_TIMEOUT_MS", "200"),
        ("APP_BACKOFF_INITIAL_MS", "50"),
        ("APP_BACKOFF_MAX_MS", "200"),
        ("APP_SHUTDOWN_GRACE_MS", "2000"),
    ]);
    vars.extend(overrides.iter().copied());
    Config::from_lookup(|name| vars.get(name).map(|value| value.to_string()))
        .expect("test config should be valid")
}

/// Issues a request against the metrics endpoint and returns the status
/// and body.
pub async fn send_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
) -> Result<(StatusCode, String), Box<dyn std::error::Error>> {
    let port = addr.port();
    let stream = timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(format!("127.0.0.1:{port}")),
    )
    .await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("Host", format!("127.0.0.1:{port}"))
        .body(Empty::<Bytes>::new())?;

    let response = timeout(Duration::from_secs(2), sender.send_request(request)).await??;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8(body.to_vec())?))
}

pub async fn scrape(addr: SocketAddr) -> String {
    let (status, body) = send_request(addr, "GET", "/metrics")
        .await
        .expect("scrape failed");
    assert_eq!(status, StatusCode::OK);
    body
}

/// Polls `check` every 20ms until it returns true or `limit` elapses.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}

/// Value of an exposed metric line such as `netpulse_sample_ok{...} 1`.
pub fn metric_value(exposition: &str, exposed_name: &str) -> Option<f64> {
    exposition
        .lines()
        .filter(|line| !line.starts_with('#'))
        .find(|line| {
            line.strip_prefix(exposed_name)
                .is_some_and(|rest| rest.starts_with('{') || rest.starts_with(' '))
        })
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|value| value.parse().ok())
}
