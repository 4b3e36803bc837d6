//! HTTP front end for the transfer handler
//!
//! Every GET runs [`TransferHandler::handle`] on tokio's blocking pool. The
//! handler talks to an [`HttpSink`], which hands the header to the async side
//! through a oneshot and streams body chunks through a bounded channel, so a
//! slow client applies backpressure all the way to the cache worker.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::handler::{ResponseSink, ResponseStatus, TransferHandler};
use crate::error::{Error, Result};

/// Body chunks buffered between the handler thread and the connection
const BODY_CHANNEL_DEPTH: usize = 4;

type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

/// Serve proxy requests on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    handler: Arc<TransferHandler>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let addr = listener.local_addr()?;
    info!("Proxy listening on {}", addr);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Proxy accept error: {}", e);
                        continue;
                    }
                };

                let handler = handler.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle_request(handler.clone(), req));
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(%peer, "Proxy connection error: {}", e);
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Proxy server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request(
    handler: Arc<TransferHandler>,
    req: Request<Incoming>,
) -> std::result::Result<Response<ProxyBody>, Infallible> {
    if req.method() != Method::GET {
        return Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
    }

    let key = match urlencoding::decode(req.uri().path()) {
        Ok(key) => key.into_owned(),
        Err(_) => return Ok(text_response(StatusCode::BAD_REQUEST, "bad request path")),
    };

    let (header_tx, header_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
    let mut sink = HttpSink {
        header: Some(header_tx),
        body: body_tx,
    };

    // Detached: the transfer runs to completion even if the client leaves.
    tokio::task::spawn_blocking(move || {
        let _ = handler.handle(&key, &mut sink);
    });

    let response = match header_rx.await {
        Ok((ResponseStatus::Ok, content_length)) => {
            let stream = futures::stream::unfold(body_rx, |mut rx| async move {
                rx.recv().await.map(|item| (item.map(Frame::data), rx))
            });
            let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
            response
                .headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from(content_length));
            response
        }
        Ok((ResponseStatus::NotFound, _)) => text_response(StatusCode::NOT_FOUND, "not found"),
        Ok((ResponseStatus::Error, _)) => {
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
        Err(_) => {
            error!("Transfer handler exited without a response header");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    };
    Ok(response)
}

fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from_static(body.as_bytes()))
        .map_err(|never: Infallible| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// [`ResponseSink`] backed by a hyper response; used from a blocking thread.
struct HttpSink {
    header: Option<oneshot::Sender<(ResponseStatus, u64)>>,
    body: mpsc::Sender<io::Result<Bytes>>,
}

impl ResponseSink for HttpSink {
    fn send_header(&mut self, status: ResponseStatus, content_length: u64) -> Result<()> {
        let header = self
            .header
            .take()
            .ok_or_else(|| Error::ClientSendFailure("header already sent".into()))?;
        header
            .send((status, content_length))
            .map_err(|_| Error::ClientSendFailure("client connection closed".into()))
    }

    fn send_body(&mut self, buf: &[u8]) -> Result<usize> {
        self.body
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| Error::ClientSendFailure("client connection closed".into()))?;
        Ok(buf.len())
    }

    fn abort(&mut self) {
        // An error frame makes hyper cut the connection short.
        let _ = self.body.blocking_send(Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "transfer aborted",
        )));
    }
}
