//! C5 — Multiplexer.
//!
//! Bridges an inbound HTTP request to a Tunnel's `request` frame and turns
//! whatever comes back — a buffered `response`, a `stream_start`/`chunk`/
//! `end` sequence, a timeout, or a tunnel teardown — into an axum response.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use crate::address::AgentAddress;
use crate::error::RelayError;
use crate::registry::Registry;
use crate::tunnel::{Completion, OutboundRequest, StreamItem, SubmitOutcome};

/// 10 MiB request body cap.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "cookie",
    "authorization",
    "proxy-authorization",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-forwarded-port",
    "x-real-ip",
];

const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "transfer-encoding",
    "connection",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];

/// Submits one inbound HTTP request to the agent owning `address` and
/// returns the relayed (or error) response.
pub async fn submit_request(
    registry: &Registry,
    address: &AgentAddress,
    client_ip: &str,
    request: Request<Body>,
) -> Result<Response<Body>, RelayError> {
    let tunnel = registry.lookup(address).ok_or(RelayError::AgentOffline)?;

    let (parts, body) = request.into_parts();
    if let Some(len) = content_length(&parts.headers) {
        if len > MAX_BODY_BYTES {
            return Err(RelayError::BodyTooLarge);
        }
    }
    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| RelayError::BodyTooLarge)?;

    let headers = sanitize_request_headers(&parts.headers, address, client_ip);
    let outbound = OutboundRequest {
        method: parts.method.as_str().to_string(),
        path: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string()),
        headers,
        body: body_bytes,
    };

    match tunnel.submit(outbound).await {
        SubmitOutcome::SendFailed => Err(RelayError::TunnelSendFailed),
        SubmitOutcome::Timeout => Err(RelayError::GatewayTimeout),
        SubmitOutcome::Completed(Completion::TunnelClosed) => Err(RelayError::TunnelClosed),
        SubmitOutcome::Completed(Completion::Buffered { status, headers, body }) => {
            Ok(build_buffered_response(status, headers, body))
        }
        SubmitOutcome::Completed(Completion::StreamStarted { status, headers, receiver }) => {
            Ok(build_streaming_response(status, headers, receiver))
        }
    }
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn sanitize_request_headers(
    headers: &HeaderMap,
    address: &AgentAddress,
    client_ip: &str,
) -> Vec<(String, String)> {
    let mut out = Vec::with_capacity(headers.len() + 2);
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if STRIPPED_REQUEST_HEADERS.contains(&lower.as_str())
            || lower.starts_with("fly-")
            || lower.starts_with("cf-")
        {
            continue;
        }
        if let Ok(value_str) = value.to_str() {
            out.push((lower, value_str.to_string()));
        }
    }
    out.push(("x-agent-address".to_string(), address.as_str().to_string()));
    out.push(("x-forwarded-for".to_string(), client_ip.to_string()));
    out
}

/// CORS headers are not added here — the router's `CorsLayer` wraps every
/// response (buffered or streamed) on its way out, so this only has to
/// forward the agent's own headers.
fn apply_response_headers(builder: axum::http::response::Builder, headers: &[(String, String)]) -> axum::http::response::Builder {
    let mut builder = builder;
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if STRIPPED_RESPONSE_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(lower.as_str()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
}

fn build_buffered_response(status: u16, headers: Vec<(String, String)>, body: Bytes) -> Response<Body> {
    let builder = apply_response_headers(
        Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)),
        &headers,
    );
    builder.body(Body::from(body)).unwrap_or_else(|_| {
        Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .body(Body::empty())
            .expect("static response is valid")
    })
}

fn build_streaming_response(
    status: u16,
    headers: Vec<(String, String)>,
    receiver: mpsc::UnboundedReceiver<StreamItem>,
) -> Response<Body> {
    let builder = apply_response_headers(
        Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK)),
        &headers,
    );
    let body = Body::from_stream(StreamBody { receiver });
    builder.body(body).unwrap_or_else(|_| {
        Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .body(Body::empty())
            .expect("static response is valid")
    })
}

/// A stream's terminal state was a tunnel teardown rather than a clean
/// `stream_end`/idle timeout — surfaced to the HTTP body as a genuine read
/// error so the client observes an errored EOF instead of a clean one (S3).
#[derive(Debug)]
struct StreamTornDown;

impl std::fmt::Display for StreamTornDown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("tunnel closed mid-stream")
    }
}

impl std::error::Error for StreamTornDown {}

/// Adapts the tunnel's chunk channel into a byte stream for the HTTP
/// response body. Dropping this (the HTTP client disconnecting) simply
/// drops the receiver; further `stream_chunk` frames find no sink and are
/// discarded by the Tunnel.
struct StreamBody {
    receiver: mpsc::UnboundedReceiver<StreamItem>,
}

impl Stream for StreamBody {
    type Item = Result<Bytes, StreamTornDown>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        match self.receiver.poll_recv(cx) {
            std::task::Poll::Ready(Some(StreamItem::Chunk(bytes))) => {
                std::task::Poll::Ready(Some(Ok(bytes)))
            }
            std::task::Poll::Ready(Some(StreamItem::End)) | std::task::Poll::Ready(None) => {
                std::task::Poll::Ready(None)
            }
            std::task::Poll::Ready(Some(StreamItem::Error)) => {
                std::task::Poll::Ready(Some(Err(StreamTornDown)))
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leak_prone_request_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("Cookie", HeaderValue::from_static("secret"));
        headers.insert("Fly-Client-IP", HeaderValue::from_static("1.2.3.4"));
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        let address = AgentAddress::parse("0x0000000000000000000000000000000000000001").unwrap();

        let sanitized = sanitize_request_headers(&headers, &address, "9.9.9.9");
        let names: Vec<&str> = sanitized.iter().map(|(n, _)| n.as_str()).collect();

        assert!(!names.contains(&"cookie"));
        assert!(!names.contains(&"fly-client-ip"));
        assert!(names.contains(&"content-type"));
        assert!(names.contains(&"x-agent-address"));
        assert!(names.contains(&"x-forwarded-for"));
    }

    #[test]
    fn response_builder_strips_hop_by_hop_headers() {
        let response = build_buffered_response(
            200,
            vec![
                ("transfer-encoding".into(), "chunked".into()),
                ("content-type".into(), "text/plain".into()),
            ],
            Bytes::from_static(b"hi"),
        );
        assert!(!response.headers().contains_key("transfer-encoding"));
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
    }

    #[tokio::test]
    async fn stream_body_yields_chunks_then_clean_eof_on_stream_end() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut body = StreamBody { receiver: rx };
        tx.send(StreamItem::Chunk(Bytes::from_static(b"a"))).unwrap();
        tx.send(StreamItem::Chunk(Bytes::from_static(b"b"))).unwrap();
        tx.send(StreamItem::End).unwrap();

        assert_eq!(
            futures::StreamExt::next(&mut body).await.unwrap().unwrap(),
            Bytes::from_static(b"a")
        );
        assert_eq!(
            futures::StreamExt::next(&mut body).await.unwrap().unwrap(),
            Bytes::from_static(b"b")
        );
        assert!(futures::StreamExt::next(&mut body).await.is_none());
    }

    #[tokio::test]
    async fn stream_body_surfaces_teardown_as_an_error_not_a_clean_eof() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut body = StreamBody { receiver: rx };
        tx.send(StreamItem::Chunk(Bytes::from_static(b"partial"))).unwrap();
        tx.send(StreamItem::Error).unwrap();

        assert_eq!(
            futures::StreamExt::next(&mut body).await.unwrap().unwrap(),
            Bytes::from_static(b"partial")
        );
        assert!(futures::StreamExt::next(&mut body).await.unwrap().is_err());
    }
}
