// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP endpoint serving the registry to Prometheus scrapers.

use crate::constants::{HEALTH_ENDPOINT_PATH, METRICS_ENDPOINT_PATH};
use crate::errors::RuntimeError;
use crate::registry::Registry;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use prometheus::{Encoder, TextEncoder, TEXT_FORMAT};
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct MetricsServer {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl MetricsServer {
    pub async fn bind(addr: SocketAddr, registry: Arc<Registry>) -> Result<Self, RuntimeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RuntimeError::Bind { addr, source })?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `cancel` fires, then drops every open
    /// connection.
    pub async fn serve(self, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Serving metrics on http://{addr}{METRICS_ENDPOINT_PATH}");
        }

        let registry = self.registry;
        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let registry = Arc::clone(&registry);
            async move { Ok::<_, Infallible>(route(req.method(), req.uri().path(), &registry)) }
        });

        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                con_res = self.listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        // Usually descriptor exhaustion; keep serving once it clears.
                        error!("Metrics server accept error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Metrics connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("Metrics connection error: {e}");
                }
            });
        }

        joinset.shutdown().await;
        debug!("Metrics server stopped");
    }
}

/// Maps a request to its response. Unknown paths are 404 and wrong methods
/// are 405.
pub fn route(method: &Method, path: &str, registry: &Registry) -> Response<Full<Bytes>> {
    if path != METRICS_ENDPOINT_PATH && path != HEALTH_ENDPOINT_PATH {
        return text_response(StatusCode::NOT_FOUND, "not found");
    }
    if *method != Method::GET {
        let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET"));
        return response;
    }
    if path == HEALTH_ENDPOINT_PATH {
        return text_response(StatusCode::OK, "ok");
    }

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        error!("Failed to encode metrics: {e}");
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics");
    }
    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
    response
}

fn text_response(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn registry() -> Registry {
        Registry::for_agent("netpulse", "eth0", "edge-1").unwrap()
    }

    async fn body_string(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let registry = registry();
        registry.set("interface_rx_bytes_total", 180.0).unwrap();

        let response = route(&Method::GET, "/metrics", &registry);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; version=0.0.4");
        let body = body_string(response).await;
        assert!(body.contains(
            "netpulse_interface_rx_bytes_total{agent=\"edge-1\",interface=\"eth0\"} 180\n"
        ));
        assert!(body.contains("# TYPE netpulse_interface_rx_bytes_total counter\n"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = route(&Method::GET, "/healthz", &registry());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "ok");
    }

    #[test]
    fn test_unknown_path() {
        let response = route(&Method::GET, "/", &registry());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = route(&Method::POST, "/metricsz", &registry());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_wrong_method() {
        let response = route(&Method::POST, "/metrics", &registry());
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "GET");
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let registry = Arc::new(registry());
        let first = MetricsServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&registry))
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();

        let second = MetricsServer::bind(addr, registry).await;
        assert!(matches!(second, Err(RuntimeError::Bind { addr: a, .. }) if a == addr));
    }
}
