//! HTTP-01 challenge listener
//!
//! A minimal plain-HTTP server: challenge paths are answered from the
//! [`ChallengeRegistry`], everything else gets a fixed placeholder page.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::challenge::ChallengeRegistry;
use crate::error::ResponderError;

/// First pause after a failed accept, doubled per consecutive failure
const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Body served for every non-challenge request
pub const PLACEHOLDER_BODY: &str = "This host only answers ACME HTTP-01 challenges.\n";

/// Bound HTTP-01 challenge listener
///
/// Binding happens in [`ChallengeResponder::bind`] so that a busy or
/// privileged port is reported before any issuance starts.
#[derive(Debug)]
pub struct ChallengeResponder {
    listener: TcpListener,
    registry: ChallengeRegistry,
}

impl ChallengeResponder {
    /// Bind the listener
    pub async fn bind(addr: SocketAddr, registry: ChallengeRegistry) -> Result<Self, ResponderError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ResponderError::Bind { addr, source })?;

        info!(addr = %addr, "ACME challenge listener bound");

        Ok(Self { listener, registry })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr, ResponderError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` is cancelled
    ///
    /// Dropping the listener on return releases the port.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ResponderError> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Serving ACME HTTP-01 challenges");

        let mut accept_errors = 0u32;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(addr = %addr, "Shutting down challenge listener");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            accept_errors = 0;
                            let registry = self.registry.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                Self::handle_connection(stream, remote_addr, registry, shutdown).await;
                            });
                        }
                        Err(e) => {
                            // EMFILE and friends fail again immediately
                            accept_errors = accept_errors.saturating_add(1);
                            let delay = accept_backoff(accept_errors);
                            warn!(error = %e, retry_in = ?delay, "Failed to accept connection");
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        remote_addr: SocketAddr,
        registry: ChallengeRegistry,
        shutdown: CancellationToken,
    ) {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req: Request<Incoming>| {
            let registry = registry.clone();
            async move { Ok::<_, Infallible>(respond(&req, &registry)) }
        });

        let connection = http1::Builder::new().serve_connection(io, service);
        tokio::select! {
            result = connection => {
                if let Err(e) = result {
                    debug!(error = %e, remote_addr = %remote_addr, "Connection error");
                }
            }
            _ = shutdown.cancelled() => {
                trace!(remote_addr = %remote_addr, "Dropping connection on shutdown");
            }
        }
    }
}

/// Build the response for one request
pub fn respond<B>(req: &Request<B>, registry: &ChallengeRegistry) -> Response<Full<Bytes>> {
    let path = req.uri().path();

    let Some(token) = ChallengeRegistry::extract_token(path) else {
        return text(StatusCode::OK, PLACEHOLDER_BODY.to_string());
    };

    let host = request_host(req);
    match host
        .as_deref()
        .and_then(|domain| registry.response_for(domain, token))
    {
        Some(key_authorization) => {
            info!(domain = ?host, token = %token, "Served ACME HTTP-01 challenge");
            text(StatusCode::OK, key_authorization)
        }
        None => {
            debug!(domain = ?host, token = %token, "Unknown ACME challenge requested");
            text(StatusCode::NOT_FOUND, PLACEHOLDER_BODY.to_string())
        }
    }
}

/// Requested host name, lower-cased and without port
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))?;

    Some(strip_port(raw.trim()).trim_end_matches('.').to_ascii_lowercase())
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal, keep brackets
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Pause before the next accept after `consecutive_errors` failures
fn accept_backoff(consecutive_errors: u32) -> Duration {
    let exponent = consecutive_errors.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_BASE
        .saturating_mul(1 << exponent)
        .min(ACCEPT_BACKOFF_MAX)
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
