use crate::client::ProxyClient;
use crate::cluster::Cluster;
use crate::error::{json_error_response, GatewayErrorCode};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// The HTTP front: accepts every request on a single catch-all route,
/// counts it against the scaling window, and proxies it to the backend the
/// pool picks.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    cluster: Arc<Cluster>,
    client: Arc<ProxyClient>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        cluster: Arc<Cluster>,
        client: Arc<ProxyClient>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            cluster,
            client,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let cluster = Arc::clone(&self.cluster);
                            let client = Arc::clone(&self.client);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, cluster, client).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    cluster: Arc<Cluster>,
    client: Arc<ProxyClient>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let cluster = Arc::clone(&cluster);
        let client = Arc::clone(&client);
        async move { handle_request(req, cluster, client, addr).await }
    });

    // Use auto::Builder to support both HTTP/1.1 and HTTP/2 (h2c)
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    cluster: Arc<Cluster>,
    client: Arc<ProxyClient>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Every request counts against the current scaling window, including
    // the ones that end up rejected.
    cluster.note_request();

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // We overwrite X-Forwarded-* rather than appending: this proxy is
    // assumed to be the first trusted hop.
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    // Pick the current-best backend and account the in-flight request; the
    // guard releases the load slot however the proxying ends.
    let Some(guard) = cluster.pool().acquire() else {
        warn!(request_id, "no backends available");
        return Ok(json_error_response(
            GatewayErrorCode::NoBackendAvailable,
            "no backends available",
        ));
    };

    let backend = Arc::clone(guard.backend());
    debug!(
        request_id,
        method = %req.method(),
        uri = %req.uri(),
        backend = %backend.url(),
        load = backend.current_load(),
        "dispatching request"
    );

    let result = client.forward(req, &backend).await;
    drop(guard);

    match result {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(
                request_id,
                backend = %backend.url(),
                error = %e,
                "failed to proxy request"
            );
            Ok(json_error_response(
                GatewayErrorCode::UpstreamFailed,
                "failed to reach backend",
            ))
        }
    }
}
