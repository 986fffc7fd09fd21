//! HTTP clients shared by the dispatcher and the health monitor
//!
//! Backend traffic and health probes ride on separate keep-alive pools:
//! hyper's typed request bodies mean a client that streams `Incoming`
//! bodies cannot also send the empty probe requests, and splitting them
//! keeps probe connections warm regardless of traffic shape.

use crate::backend::Backend;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// The client pair used to reach backends.
pub struct ProxyClient {
    /// Streams request bodies through to the selected backend.
    forward_client: Client<HttpConnector, Incoming>,
    /// Sends the body-less health probes.
    probe_client: Client<HttpConnector, Empty<Bytes>>,
}

impl ProxyClient {
    /// Build both clients over one connector. Idle connections per backend
    /// and their lifetime are capped so a shrunken pool does not pin
    /// sockets to containers that no longer exist.
    pub fn new(max_idle_per_host: usize, idle_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let forward_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(max_idle_per_host)
            .pool_idle_timeout(idle_timeout)
            .build(connector.clone());

        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(max_idle_per_host)
            .pool_idle_timeout(idle_timeout)
            .build(connector);

        Self {
            forward_client,
            probe_client,
        }
    }

    /// Forward a request to the given backend, rewriting the URI to its
    /// address and streaming the response back.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        backend: &Backend,
    ) -> anyhow::Result<Response<BoxBody<Bytes, hyper::Error>>> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = backend.target_uri(path_and_query);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }
        let backend_req = builder
            .body(body)
            .map_err(|e| anyhow::anyhow!("rebuilding request for {}: {}", uri, e))?;

        let response = self
            .forward_client
            .request(backend_req)
            .await
            .map_err(|e| anyhow::anyhow!("upstream request to {} failed: {}", uri, e))?;

        Ok(response.map(|body| body.boxed()))
    }

    /// Probe a backend's health endpoint.
    ///
    /// Success is any status in [200, 400). The body is drained so the
    /// connection can be reused. Transport errors and timeouts count as
    /// failures.
    pub async fn probe(&self, backend: &Backend, path: &str, timeout: Duration) -> bool {
        let uri = backend.target_uri(path);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match tokio::time::timeout(timeout, self.probe_client.request(req)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                // Drain the body so the connection can be reused cleanly.
                let _ = response.into_body().collect().await;
                status.is_success() || status.is_redirection()
            }
            Ok(Err(e)) => {
                debug!(uri, error = %e, "Probe failed");
                false
            }
            Err(_) => {
                debug!(uri, timeout_ms = timeout.as_millis() as u64, "Probe timed out");
                false
            }
        }
    }
}
