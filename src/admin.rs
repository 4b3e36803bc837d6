//! Admin HTTP server: health probes and Prometheus metrics
//!
//! | Path                 | Response                                   |
//! |----------------------|--------------------------------------------|
//! | `/healthz`, `/livez` | `{"status":"ok"}`                          |
//! | `/readyz`            | [`ServiceStatus`] as JSON, 503 if not ready |
//! | `/metrics`           | Prometheus text exposition                 |

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::metrics;

/// Readiness report for `/readyz`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub service: &'static str,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels_available: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels_total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_tasks: Option<usize>,
}

impl ServiceStatus {
    pub fn new(service: &'static str, ready: bool) -> Self {
        Self {
            service,
            ready,
            channels_available: None,
            channels_total: None,
            queued_tasks: None,
        }
    }
}

/// Source of the current [`ServiceStatus`].
pub trait StatusProvider: Send + Sync + 'static {
    fn status(&self) -> ServiceStatus;
}

impl<F> StatusProvider for F
where
    F: Fn() -> ServiceStatus + Send + Sync + 'static,
{
    fn status(&self) -> ServiceStatus {
        self()
    }
}

/// Bind `addr` and serve admin requests forever.
pub async fn run_admin_server(addr: SocketAddr, status: Arc<dyn StatusProvider>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind admin server: {}", e)))?;

    info!("Admin server listening on {}", addr);
    serve_admin(listener, status).await
}

/// Serve admin requests on an already-bound listener.
pub async fn serve_admin(listener: TcpListener, status: Arc<dyn StatusProvider>) -> Result<()> {
    metrics::init();

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Admin server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let status = status.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| admin_handler(status.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Admin server connection error: {}", e);
            }
        });
    }
}

async fn admin_handler(
    status: Arc<dyn StatusProvider>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" | "/livez" => {
            json_response(StatusCode::OK, &serde_json::json!({"status": "ok"}))
        }
        "/readyz" => {
            let report = status.status();
            let code = if report.ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_response(code, &report)
        }
        "/metrics" => {
            let mut response = Response::new(Full::new(Bytes::from(metrics::render())));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        _ => {
            let mut response = Response::new(Full::new(Bytes::from("not found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    };
    Ok(response)
}

fn json_response<T: Serialize>(code: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let (code, body) = match serde_json::to_vec(value) {
        Ok(body) => (code, body),
        Err(e) => {
            error!("Failed to encode admin response: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    };
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = code;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    async fn start(ready: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let status: Arc<dyn StatusProvider> = Arc::new(move || ServiceStatus {
            channels_available: Some(3),
            channels_total: Some(4),
            ..ServiceStatus::new("webproxy", ready)
        });
        tokio::spawn(serve_admin(listener, status));
        addr
    }

    #[tokio::test]
    async fn test_probes() {
        let addr = start(true).await;

        let health = get(addr, "/healthz").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with(r#"{"status":"ok"}"#));

        let ready = get(addr, "/readyz").await;
        assert!(ready.starts_with("HTTP/1.1 200"));
        assert!(ready.contains(r#""channels_available":3"#));
        assert!(!ready.contains("queued_tasks"));

        assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_not_ready_is_503() {
        let addr = start(false).await;
        assert!(get(addr, "/readyz").await.starts_with("HTTP/1.1 503"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let addr = start(true).await;
        let body = get(addr, "/metrics").await;
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("shmcache_proxy_channels_available"));
    }
}
