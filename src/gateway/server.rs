use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::core::Core;
use crate::publish::{ErrorKind, PublishOutcome};

/// HTTP body type for responses
type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Acknowledgement returned for a delivered message
const ACK_MESSAGE: &str = "Sent to RabbitMQ";

/// Route extracted from an HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `GET /` or `POST /`
    PublishDefault,
    /// `POST /queues/{destination}`
    PublishTo(String),
    /// `GET /healthz`
    Health,
    /// `GET /stats`
    Stats,
    /// Known path, wrong method
    MethodNotAllowed,
    NotFound,
}

impl Route {
    /// Match a method and path to a route
    pub fn resolve(method: &Method, path: &str) -> Self {
        if let Some(raw) = path.strip_prefix("/queues/") {
            return match *method {
                Method::POST => Route::PublishTo(percent_decode(raw)),
                _ => Route::MethodNotAllowed,
            };
        }

        match (method, path) {
            (&Method::GET, "/") | (&Method::POST, "/") => Route::PublishDefault,
            (_, "/") => Route::MethodNotAllowed,
            (&Method::GET, "/healthz") => Route::Health,
            (&Method::GET, "/stats") => Route::Stats,
            (_, "/healthz") | (_, "/stats") => Route::MethodNotAllowed,
            _ => Route::NotFound,
        }
    }
}

/// HTTP status for a publish outcome
pub fn status_for(outcome: &PublishOutcome) -> StatusCode {
    match outcome.error_kind {
        None => StatusCode::OK,
        Some(ErrorKind::InvalidDestination) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::DeliveryFailed)
        | Some(ErrorKind::PoolExhausted)
        | Some(ErrorKind::TransportError) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Gateway server state
pub struct GatewayServer {
    core: Core,
    listen: String,
}

impl GatewayServer {
    /// Create a new gateway server with the given core and listen address
    pub fn new(core: Core, listen: String) -> Self {
        Self { core, listen }
    }

    /// Bind the listen address and serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr: SocketAddr = self
            .listen
            .parse()
            .context(format!("Invalid listen address: {}", self.listen))?;

        let listener = TcpListener::bind(addr)
            .await
            .context(format!("Failed to bind to {}", addr))?;

        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr().context("Listener has no local address")?;
        info!(
            "Gateway listening on {} (broker queue '{}', pool size {})",
            addr,
            self.core.config.gateway.default_destination,
            self.core.config.pool.max_size
        );

        let server = Arc::new(self);
        tokio::pin!(shutdown);

        // Stale idle connections are swept once per idle window
        let mut sweep = tokio::time::interval(Duration::from_secs(
            server.core.config.pool.max_idle_secs.max(1),
        ));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
                _ = sweep.tick() => {
                    server.core.pool.cleanup().await;
                    continue;
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let server = Arc::clone(&server);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_request(req).await }
                });

                if let Err(e) = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(io, service)
                    .await
                {
                    // Filter out benign connection reset errors
                    let err_str = format!("{}", e);
                    if !err_str.contains("connection reset") && !err_str.contains("broken pipe") {
                        error!("Error serving connection from {}: {}", remote_addr, e);
                    }
                }
            });
        }

        server.core.shutdown().await;
        Ok(())
    }

    /// Handle an incoming HTTP request
    pub async fn handle_request<B>(&self, req: Request<B>) -> Result<Response<BoxBody>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let route = Route::resolve(&method, req.uri().path());
        debug!("{} {} -> {:?}", method, req.uri(), route);

        match route {
            Route::PublishDefault => {
                let destination = self.core.config.gateway.default_destination.clone();
                self.publish_from(req, destination).await
            }
            Route::PublishTo(destination) => self.publish_from(req, destination).await,
            Route::Health => self.json_response(StatusCode::OK, json!({ "status": "ok" })),
            Route::Stats => {
                let stats = self.core.stats().await;
                let body = serde_json::to_value(&stats).context("Failed to encode pool stats")?;
                self.json_response(StatusCode::OK, body)
            }
            Route::MethodNotAllowed => {
                self.error_response(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed")
            }
            Route::NotFound => self.error_response(StatusCode::NOT_FOUND, "NotFound"),
        }
    }

    /// Publish the request body (or the default payload) to `destination`
    async fn publish_from<B>(&self, req: Request<B>, destination: String) -> Result<Response<BoxBody>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let limit = self.core.config.gateway.max_body_bytes;
        let body = match Limited::new(req.into_body(), limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                warn!(destination = %destination, limit_bytes = limit, "payload_too_large");
                return self.error_response(StatusCode::PAYLOAD_TOO_LARGE, "PayloadTooLarge");
            }
            Err(e) => {
                warn!("Failed to read request body: {}", e);
                return self.error_response(StatusCode::BAD_REQUEST, "BadRequest");
            }
        };

        let payload = if body.is_empty() {
            Bytes::from(self.core.config.gateway.default_payload.clone())
        } else {
            body
        };

        // Run the publish in its own task so a client disconnect cannot cut
        // an in-flight delivery short; only the response is lost.
        let publisher = Arc::clone(&self.core.publisher);
        let target = destination.clone();
        let task = tokio::spawn(async move { publisher.publish(target, payload).await });

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, destination = %destination, "publish_task_failed");
                return self.error_response(StatusCode::INTERNAL_SERVER_ERROR, "InternalError");
            }
        };

        let status = status_for(&outcome);
        match outcome.error_kind {
            None => self.json_response(
                status,
                json!({
                    "message": ACK_MESSAGE,
                    "destination": destination,
                    "attempts": outcome.attempts_used,
                }),
            ),
            Some(kind) => {
                warn!(
                    destination = %destination,
                    error_kind = %kind,
                    attempts = outcome.attempts_used,
                    status = status.as_u16(),
                    "publish_request_failed"
                );
                self.error_response(status, kind.as_str())
            }
        }
    }

    /// Create a JSON error response
    fn error_response(&self, status: StatusCode, kind: &str) -> Result<Response<BoxBody>> {
        self.json_response(status, json!({ "error": kind }))
    }

    /// Create a JSON response
    fn json_response(&self, status: StatusCode, body: serde_json::Value) -> Result<Response<BoxBody>> {
        let response = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Self::bytes_body(Bytes::from(body.to_string())))
            .context("Failed to build response")?;
        Ok(response)
    }

    /// Convert Bytes into a BoxBody
    fn bytes_body(b: Bytes) -> BoxBody {
        Full::new(b).map_err(|never| match never {}).boxed()
    }
}

/// Decode `%XX` escapes in a path segment; malformed escapes are kept verbatim
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
