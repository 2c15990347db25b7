//! Site serving HTTP server

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
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::dispatcher::RequestDispatcher;
use crate::error::{json_error_response, ErrorCode};

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";

/// Maximum accepted request id length
const MAX_REQUEST_ID_LEN: usize = 128;

pub struct SiteServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<RequestDispatcher>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SiteServer {
    pub fn new(
        bind_addr: SocketAddr,
        dispatcher: Arc<RequestDispatcher>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            dispatcher,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Site server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, dispatcher).await {
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
                        info!("Site server shutting down");
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
    dispatcher: Arc<RequestDispatcher>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { Ok::<_, hyper::Error>(handle_request(req, &dispatcher, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Serve one site request inside a `request` span
pub async fn handle_request<B>(
    req: Request<B>,
    dispatcher: &RequestDispatcher,
    client_addr: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let request_id = request_id(&req);
    let host = request_host(&req);
    let (parts, _) = req.into_parts();

    let mut response = match host {
        Some(host) => {
            let span = info_span!(
                "request",
                request_id = %request_id,
                host = %host,
                site = tracing::field::Empty,
            );
            async {
                debug!(method = %parts.method, uri = %parts.uri, "Incoming request");
                dispatcher
                    .serve(&host, &parts.method, parts.uri.path(), client_addr.ip())
                    .await
            }
            .instrument(span)
            .await
        }
        None => json_error_response(ErrorCode::MissingHostHeader, "Missing or invalid Host header"),
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

/// Propagate a sane incoming request id, otherwise generate one
pub fn request_id<B>(req: &Request<B>) -> String {
    req.headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .filter(|v| v.bytes().all(|b| b.is_ascii_graphic()))
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Host from the Host header, or the URI authority for HTTP/2
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))?;

    // Alphanumerics, '-', '.', ':' and IPv6 brackets only
    let valid = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':' | '[' | ']'));
    valid.then_some(host)
}
