//! C4 — Tunnel.
//!
//! One authenticated bidirectional channel between an agent runtime and this
//! relay. Owns the in-flight table, the streaming table, the pending-nonce
//! slot, and the keepalive counter; everything that mutates those lives
//! behind this module so its invariants hold by construction.
//!
//! The socket is driven by a single owning task: it runs the read-frame loop
//! and is the only place that mutates
//! `auth`/`agents`/`pending_nonce`/`unanswered_pings`. Writes from other
//! tasks (the Multiplexer submitting a `request` frame) go through
//! `outbound_tx`, a queue the owner drains — never by touching the socket
//! directly.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::address::AgentAddress;
use crate::auth::{self, AgentSignature};
use crate::protocol::{AcceptedAgent, ClientFrame, RejectedAgent, ServerFrame};
use crate::registry::Registry;

pub type TunnelId = String;

pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const ADD_NONCE_EXPIRY: Duration = Duration::from_secs(30);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub const MAX_MISSED_PONGS: u32 = 3;
pub const MAX_AGENTS: usize = 50;
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_FRAME_BYTES: usize = 11 * 1024 * 1024; // request body cap (10 MiB) plus slack for JSON/headers.

/// Close codes per the wire protocol: malformed pre-auth handshake.
pub const CLOSE_MALFORMED_HANDSHAKE: u16 = 4000;
/// Failed signature verification or auth-phase timeout.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// Three consecutive missed keepalive pongs.
pub const CLOSE_KEEPALIVE_TIMEOUT: u16 = 1000;

/// A message bound for the writer task: either a wire frame to serialize
/// and send, or an instruction to close the socket with a specific code —
/// the writer sends the one after the other and then stops draining.
pub(crate) enum Outbound {
    Frame(ServerFrame),
    Close(u16, &'static str),
}

/// Outcome handed back to the Multiplexer once a `response`/`stream_start`
/// frame arrives, or the tunnel tears down while the request was pending.
#[derive(Debug)]
pub enum Completion {
    Buffered {
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
    StreamStarted {
        status: u16,
        headers: Vec<(String, String)>,
        receiver: mpsc::UnboundedReceiver<StreamItem>,
    },
    TunnelClosed,
}

#[derive(Debug)]
pub enum StreamItem {
    Chunk(Bytes),
    End,
    Error,
}

pub enum SubmitOutcome {
    Completed(Completion),
    Timeout,
    SendFailed,
}

pub struct OutboundRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// One outstanding `request` frame awaiting a `response`/`stream_start` reply.
struct InFlightSlot {
    tx: oneshot::Sender<Completion>,
}

/// One open stream handed off to the Multiplexer. `last_activity` is read by
/// the idle watcher task and written by `dispatch_stream_chunk`, so it's
/// behind its own mutex rather than `Inner`'s — a chunk arriving on a
/// different stream shouldn't contend with this one's watcher.
struct StreamSlot {
    tx: mpsc::UnboundedSender<StreamItem>,
    last_activity: Arc<Mutex<Instant>>,
}

enum Phase {
    AwaitingAuth,
    Authenticated,
}

/// Mutable tunnel state, guarded by one mutex. Only the owning task in
/// [`run`] writes to it; the Multiplexer only reads `agents` (via
/// [`Tunnel::agents`]).
struct Inner {
    phase: Phase,
    /// Addresses this tunnel currently owns in the Registry.
    agents: HashSet<AgentAddress>,
    /// Nonce minted for an `add_agent`/`remove_agent` challenge, paired with
    /// the `Instant` it was issued at — not a deadline, checked against
    /// [`ADD_NONCE_EXPIRY`] at use time. `None` once consumed or never asked
    /// for.
    pending_add_nonce: Option<(String, Instant)>,
    /// Pings sent since the last `pong`; reset to 0 on `pong`, closes the
    /// socket at [`MAX_MISSED_PONGS`].
    unanswered_pings: u32,
}

/// One authenticated (or still-authenticating) tunnel. Always shared as
/// `Arc<Tunnel>` — the Registry and the Multiplexer both hold references,
/// but the actor task in [`run`] retains authoritative lifetime.
pub struct Tunnel {
    id: TunnelId,
    /// Queue drained by the writer task spawned in [`run`]; the only path
    /// any task (including this one's own) uses to reach the socket.
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    inner: Mutex<Inner>,
    /// Requests awaiting a reply, keyed by request id. Concurrent because
    /// the owning task inserts/reads here via `submit`/`dispatch_*` while
    /// [`InFlightGuard::drop`] can run on any task that drops the future.
    inflight: DashMap<String, InFlightSlot>,
    /// Open streams, keyed by request id. Concurrent for the same reason as
    /// `inflight`, plus the idle watcher task polling `last_activity`.
    streams: DashMap<String, StreamSlot>,
    /// Set once by [`teardown`]; makes teardown idempotent under concurrent
    /// callers (a read-loop exit racing a registry-triggered teardown).
    closed: AtomicBool,
}

impl Tunnel {
    fn new(outbound_tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            outbound_tx,
            inner: Mutex::new(Inner {
                phase: Phase::AwaitingAuth,
                agents: HashSet::new(),
                pending_add_nonce: None,
                unanswered_pings: 0,
            }),
            inflight: DashMap::new(),
            streams: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Test-only constructor returning the tunnel alongside its raw outbound
    /// channel, so tests can inspect exactly what was sent (frame or close).
    #[cfg(test)]
    pub(crate) fn new_for_test() -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(tx)), rx)
    }

    pub fn id(&self) -> &TunnelId {
        &self.id
    }

    pub fn agents(&self) -> Vec<AgentAddress> {
        self.inner.lock().expect("tunnel mutex poisoned").agents.iter().cloned().collect()
    }

    fn send(&self, frame: ServerFrame) -> bool {
        self.outbound_tx.send(Outbound::Frame(frame)).is_ok()
    }

    /// Asks the writer task to send a WebSocket close frame with `code` and
    /// stop draining further frames once it does.
    fn close(&self, code: u16, reason: &'static str) {
        let _ = self.outbound_tx.send(Outbound::Close(code, reason));
    }

    /// Submits an HTTP request to the agent and awaits either a buffered
    /// response, a stream handoff, or a 30 s deadline — whichever comes
    /// first. Cancellation-safe: if the returned future is dropped before
    /// completing (the HTTP client disconnected), the in-flight slot is
    /// cleaned up so a late reply from the agent is dropped rather than
    /// leaked.
    pub async fn submit(self: &Arc<Self>, request: OutboundRequest) -> SubmitOutcome {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inflight.insert(id.clone(), InFlightSlot { tx });
        let _guard = InFlightGuard {
            tunnel: self.clone(),
            id: id.clone(),
        };

        let frame = ServerFrame::Request {
            id: id.clone(),
            method: request.method,
            path: request.path,
            headers: request.headers.into_iter().collect(),
            body: BASE64.encode(&request.body),
        };
        if !self.send(frame) {
            self.inflight.remove(&id);
            return SubmitOutcome::SendFailed;
        }

        tokio::select! {
            result = rx => match result {
                Ok(completion) => SubmitOutcome::Completed(completion),
                Err(_) => SubmitOutcome::Completed(Completion::TunnelClosed),
            },
            _ = tokio::time::sleep(REQUEST_TIMEOUT) => SubmitOutcome::Timeout,
        }
    }

    fn dispatch_response(&self, id: String, status: u16, headers: Vec<(String, String)>, body_b64: String) {
        let Some(body) = decode_body(&body_b64) else {
            return; // malformed frame, silently dropped (post-auth)
        };
        if let Some((_, slot)) = self.inflight.remove(&id) {
            let _ = slot.tx.send(Completion::Buffered { status, headers, body });
        }
    }

    fn dispatch_stream_start(self: &Arc<Self>, id: String, status: u16, headers: Vec<(String, String)>) {
        if let Some((_, slot)) = self.inflight.remove(&id) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.streams.insert(
                id.clone(),
                StreamSlot {
                    tx,
                    last_activity: Arc::new(Mutex::new(Instant::now())),
                },
            );
            let _ = slot.tx.send(Completion::StreamStarted { status, headers, receiver: rx });
            spawn_stream_idle_watcher(self.clone(), id);
        }
    }

    fn dispatch_stream_chunk(&self, id: String, data_b64: String) {
        let Some(chunk) = decode_body(&data_b64) else {
            return;
        };
        if let Some(entry) = self.streams.get(&id) {
            *entry.last_activity.lock().expect("stream mutex poisoned") = Instant::now();
            let _ = entry.tx.send(StreamItem::Chunk(chunk));
        }
    }

    fn dispatch_stream_end(&self, id: String) {
        if let Some((_, slot)) = self.streams.remove(&id) {
            let _ = slot.tx.send(StreamItem::End);
        }
    }
}

fn decode_body(b64: &str) -> Option<Bytes> {
    BASE64.decode(b64).ok().map(Bytes::from)
}

struct InFlightGuard {
    tunnel: Arc<Tunnel>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tunnel.inflight.remove(&self.id);
    }
}

fn spawn_stream_idle_watcher(tunnel: Arc<Tunnel>, id: String) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let Some(entry) = tunnel.streams.get(&id) else {
                return; // already ended via stream_end or teardown
            };
            let idle = entry.last_activity.lock().expect("stream mutex poisoned").elapsed();
            if idle >= STREAM_IDLE_TIMEOUT {
                drop(entry);
                if let Some((_, slot)) = tunnel.streams.remove(&id) {
                    let _ = slot.tx.send(StreamItem::End);
                }
                return;
            }
        }
    });
}

/// Deterministic, idempotent teardown: cancels outstanding
/// timers implicitly (the tasks they belong to observe `closed` or simply
/// find their map entry gone), completes every in-flight request with
/// `tunnel_closed`, errors every open stream, and unregisters every owned
/// address using the Registry's "only if still mine" rule.
pub fn teardown(tunnel: &Arc<Tunnel>, registry: &Registry, reason: &str) {
    if tunnel.closed.swap(true, Ordering::SeqCst) {
        return;
    }
    info!(tunnel_id = %tunnel.id, reason, "tearing down tunnel");

    let inflight_ids: Vec<String> = tunnel.inflight.iter().map(|e| e.key().clone()).collect();
    for id in inflight_ids {
        if let Some((_, slot)) = tunnel.inflight.remove(&id) {
            let _ = slot.tx.send(Completion::TunnelClosed);
        }
    }

    let stream_ids: Vec<String> = tunnel.streams.iter().map(|e| e.key().clone()).collect();
    for id in stream_ids {
        if let Some((_, slot)) = tunnel.streams.remove(&id) {
            let _ = slot.tx.send(StreamItem::Error);
        }
    }

    let agents = tunnel.agents();
    for address in agents {
        registry.unregister(tunnel, &address);
    }
    registry.remove_tunnel(&tunnel.id);
}

/// Drives one tunnel's socket for its entire lifetime: challenge, strict
/// single-shot auth handshake, then the authenticated read/keepalive loop.
/// Returns once the socket is closed and teardown has run.
pub async fn run(socket: WebSocket, base_domain: Arc<str>, registry: Arc<Registry>) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let tunnel = Arc::new(Tunnel::new(outbound_tx));
    registry.insert_tunnel(tunnel.clone());

    // ── Writer task ──
    // Owns the sink half for the tunnel's whole life; every other task only
    // ever reaches the socket through `outbound_tx`.
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            match msg {
                Outbound::Frame(frame) => {
                    let Ok(text) = serde_json::to_string(&frame) else {
                        continue;
                    };
                    if ws_sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(code, reason) => {
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // ── Handshake ──
    // Single-shot: exactly one `auth` frame is accepted within
    // `AUTH_TIMEOUT` of the challenge going out; anything else tears down.
    let challenge_nonce = auth::generate_nonce();
    if !tunnel.send(ServerFrame::Challenge { nonce: challenge_nonce.clone() }) {
        writer.abort();
        teardown(&tunnel, &registry, "writer closed before challenge");
        return;
    }

    match tokio::time::timeout(AUTH_TIMEOUT, ws_stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => {
            if let Err(close_code) = handle_auth_attempt(&tunnel, &registry, &base_domain, &challenge_nonce, &text) {
                tunnel.close(close_code, "auth_rejected");
                let _ = writer.await;
                teardown(&tunnel, &registry, "auth rejected");
                return;
            }
        }
        Ok(Some(Ok(_))) | Ok(Some(Err(_))) => {
            tunnel.send(ServerFrame::AuthError { error: "malformed_frame".into() });
            tunnel.close(CLOSE_MALFORMED_HANDSHAKE, "malformed_handshake");
            let _ = writer.await;
            teardown(&tunnel, &registry, "malformed pre-auth frame");
            return;
        }
        Ok(None) => {
            writer.abort();
            teardown(&tunnel, &registry, "socket closed before auth");
            return;
        }
        Err(_) => {
            tunnel.send(ServerFrame::AuthError { error: "auth_timeout".into() });
            tunnel.close(CLOSE_AUTH_FAILED, "auth_timeout");
            let _ = writer.await;
            teardown(&tunnel, &registry, "auth timeout");
            return;
        }
    }

    // ── Authenticated loop ──
    // One task reading frames and ticking the keepalive clock; `tunnel.inner`
    // is only ever locked from here once past the handshake.
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await; // first tick fires immediately; discard it

    let mut keepalive_timed_out = false;
    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_authenticated_frame(&tunnel, &registry, &base_domain, &text);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => { /* binary/ping/pong frames outside the JSON protocol: dropped */ }
                    Some(Err(_)) => break,
                }
            }
            _ = keepalive.tick() => {
                let should_close = {
                    let mut inner = tunnel.inner.lock().expect("tunnel mutex poisoned");
                    if inner.unanswered_pings >= MAX_MISSED_PONGS {
                        true
                    } else {
                        inner.unanswered_pings += 1;
                        false
                    }
                };
                if should_close {
                    keepalive_timed_out = true;
                    break;
                }
                let ts = unix_timestamp();
                tunnel.send(ServerFrame::Ping { ts });
            }
        }
    }

    if keepalive_timed_out {
        tunnel.close(CLOSE_KEEPALIVE_TIMEOUT, "keepalive_timeout");
        let _ = writer.await;
    } else {
        writer.abort();
    }
    teardown(&tunnel, &registry, "socket closed");
}

/// Drives the single-shot `auth` handshake. On failure, returns the close
/// code the caller should use to tear the socket down: [`CLOSE_MALFORMED_HANDSHAKE`]
/// for a frame that didn't even parse, [`CLOSE_AUTH_FAILED`] for every other
/// rejection (bad nonce, bad signature, too many agents).
fn handle_auth_attempt(
    tunnel: &Arc<Tunnel>,
    registry: &Registry,
    base_domain: &str,
    challenge_nonce: &str,
    text: &str,
) -> Result<(), u16> {
    let Ok(ClientFrame::Auth { agents, nonce, timestamp }) = serde_json::from_str::<ClientFrame>(text) else {
        tunnel.send(ServerFrame::AuthError { error: "malformed_frame".into() });
        return Err(CLOSE_MALFORMED_HANDSHAKE);
    };

    if nonce != challenge_nonce {
        tunnel.send(ServerFrame::AuthError { error: "invalid_nonce".into() });
        return Err(CLOSE_AUTH_FAILED);
    }
    if agents.len() > MAX_AGENTS {
        tunnel.send(ServerFrame::AuthError { error: "too_many_agents".into() });
        return Err(CLOSE_AUTH_FAILED);
    }

    let mut parsed = Vec::with_capacity(agents.len());
    for agent in &agents {
        let Ok(address) = AgentAddress::parse(&agent.address) else {
            tunnel.send(ServerFrame::AuthError { error: "invalid_signature".into() });
            return Err(CLOSE_AUTH_FAILED);
        };
        parsed.push((address, agent.signature.clone()));
    }

    let now = unix_timestamp();
    let signatures: Vec<AgentSignature<'_>> = parsed
        .iter()
        .map(|(address, signature)| AgentSignature { address, signature })
        .collect();
    if !auth::verify_all(&signatures, &nonce, timestamp, now) {
        tunnel.send(ServerFrame::AuthError { error: "invalid_signature".into() });
        return Err(CLOSE_AUTH_FAILED);
    }

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for (address, _) in parsed {
        if registry.register(tunnel, address.clone()) {
            tunnel.inner.lock().expect("tunnel mutex poisoned").agents.insert(address.clone());
            accepted.push(AcceptedAgent {
                url: agent_url(&address, base_domain),
                address: address.as_str().to_string(),
            });
        } else {
            rejected.push(RejectedAgent {
                address: address.as_str().to_string(),
                reason: "already_registered".into(),
            });
        }
    }

    {
        let mut inner = tunnel.inner.lock().expect("tunnel mutex poisoned");
        inner.phase = Phase::Authenticated;
    }

    tunnel.send(ServerFrame::AuthOk {
        agents: accepted,
        rejected: if rejected.is_empty() { None } else { Some(rejected) },
    });
    Ok(())
}

fn handle_authenticated_frame(tunnel: &Arc<Tunnel>, registry: &Registry, base_domain: &str, text: &str) {
    if text.len() > MAX_FRAME_BYTES {
        debug!(tunnel_id = %tunnel.id(), "dropping oversized post-auth frame");
        return;
    }
    let Ok(frame) = serde_json::from_str::<ClientFrame>(text) else {
        debug!(tunnel_id = %tunnel.id(), "dropping malformed post-auth frame");
        return;
    };

    match frame {
        ClientFrame::Pong { .. } => {
            tunnel.inner.lock().expect("tunnel mutex poisoned").unanswered_pings = 0;
        }
        ClientFrame::Response { id, status, headers, body } => {
            tunnel.dispatch_response(id, status, headers.into_iter().collect(), body);
        }
        ClientFrame::StreamStart { id, status, headers } => {
            tunnel.dispatch_stream_start(id, status, headers.into_iter().collect());
        }
        ClientFrame::StreamChunk { id, data } => {
            tunnel.dispatch_stream_chunk(id, data);
        }
        ClientFrame::StreamEnd { id } => {
            tunnel.dispatch_stream_end(id);
        }
        ClientFrame::RequestChallenge => {
            let nonce = auth::generate_nonce();
            {
                let mut inner = tunnel.inner.lock().expect("tunnel mutex poisoned");
                inner.pending_add_nonce = Some((nonce.clone(), Instant::now()));
            }
            tunnel.send(ServerFrame::Challenge { nonce });
        }
        ClientFrame::AddAgent { address, signature, nonce, timestamp } => {
            handle_add_agent(tunnel, registry, base_domain, address, signature, nonce, timestamp);
        }
        ClientFrame::RemoveAgent { address } => {
            handle_remove_agent(tunnel, registry, address);
        }
        ClientFrame::Auth { .. } => {
            // A second `auth` frame mid-session is outside the strict
            // pre-auth handshake; treated as an unknown/ignored frame here.
        }
    }
}

fn handle_add_agent(
    tunnel: &Arc<Tunnel>,
    registry: &Registry,
    base_domain: &str,
    address: String,
    signature: String,
    nonce: String,
    timestamp: i64,
) {
    let Ok(address) = AgentAddress::parse(&address) else {
        tunnel.send(ServerFrame::Error { error: "invalid_signature".into() });
        return;
    };

    let current_count = tunnel.agents().len();
    if current_count >= MAX_AGENTS {
        // Rejected before any verification runs, so the pending nonce stays
        // live for a retry.
        tunnel.send(ServerFrame::Error { error: "max_agents_reached".into() });
        return;
    }

    let nonce_is_current = {
        let inner = tunnel.inner.lock().expect("tunnel mutex poisoned");
        matches!(&inner.pending_add_nonce, Some((pending, issued_at))
            if *pending == nonce && issued_at.elapsed() <= ADD_NONCE_EXPIRY)
    };
    if !nonce_is_current {
        tunnel.send(ServerFrame::Error { error: "invalid_nonce".into() });
        return;
    }

    let now = unix_timestamp();
    let signatures = [AgentSignature { address: &address, signature: &signature }];
    if !auth::verify_all(&signatures, &nonce, timestamp, now) {
        tunnel.send(ServerFrame::Error { error: "invalid_signature".into() });
        return;
    }

    // Consume the nonce now that verification succeeded.
    tunnel.inner.lock().expect("tunnel mutex poisoned").pending_add_nonce = None;

    if !registry.register(tunnel, address.clone()) {
        tunnel.send(ServerFrame::Error { error: "address_already_registered".into() });
        return;
    }
    tunnel.inner.lock().expect("tunnel mutex poisoned").agents.insert(address.clone());
    tunnel.send(ServerFrame::AgentAdded {
        url: agent_url(&address, base_domain),
        address: address.as_str().to_string(),
    });
}

fn handle_remove_agent(tunnel: &Arc<Tunnel>, registry: &Registry, address: String) {
    let Ok(address) = AgentAddress::parse(&address) else {
        return; // not owned (and not even well-formed): no-op
    };
    let owned = tunnel.inner.lock().expect("tunnel mutex poisoned").agents.remove(&address);
    if !owned {
        return; // removing an address we don't own is a no-op
    }
    registry.unregister(tunnel, &address);
    tunnel.send(ServerFrame::AgentRemoved { address: address.as_str().to_string() });
}

fn agent_url(address: &AgentAddress, base_domain: &str) -> String {
    format!("https://{address}.{base_domain}")
}

fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tunnel() -> (Arc<Tunnel>, mpsc::UnboundedReceiver<Outbound>) {
        Tunnel::new_for_test()
    }

    #[tokio::test]
    async fn submit_completes_on_buffered_response() {
        let (tunnel, mut rx) = test_tunnel();
        let tunnel_for_agent = tunnel.clone();
        let responder = tokio::spawn(async move {
            let Outbound::Frame(ServerFrame::Request { id, .. }) = rx.recv().await.unwrap() else {
                panic!("expected request frame");
            };
            tunnel_for_agent.dispatch_response(
                id,
                200,
                vec![("content-type".into(), "text/plain".into())],
                BASE64.encode(b"hello"),
            );
        });

        let outcome = tunnel
            .submit(OutboundRequest {
                method: "GET".into(),
                path: "/".into(),
                headers: vec![],
                body: Bytes::new(),
            })
            .await;
        responder.await.unwrap();

        match outcome {
            SubmitOutcome::Completed(Completion::Buffered { status, body, .. }) => {
                assert_eq!(status, 200);
                assert_eq!(&body[..], b"hello");
            }
            _ => panic!("expected buffered completion"),
        }
    }

    #[tokio::test]
    async fn submit_send_failed_when_writer_gone() {
        let (tunnel, rx) = test_tunnel();
        drop(rx);
        let outcome = tunnel
            .submit(OutboundRequest {
                method: "GET".into(),
                path: "/".into(),
                headers: vec![],
                body: Bytes::new(),
            })
            .await;
        assert!(matches!(outcome, SubmitOutcome::SendFailed));
    }

    #[tokio::test]
    async fn cancelled_submit_cleans_up_inflight_entry() {
        let (tunnel, _rx) = test_tunnel();
        let fut = tunnel.submit(OutboundRequest {
            method: "GET".into(),
            path: "/".into(),
            headers: vec![],
            body: Bytes::new(),
        });
        tokio::pin!(fut);
        // Poll once so the frame is sent and the slot inserted, then drop.
        let _ = futures::poll!(&mut fut);
        drop(fut);
        assert!(tunnel.inflight.is_empty());
    }

    #[tokio::test]
    async fn teardown_completes_inflight_with_tunnel_closed() {
        let (tunnel, _rx) = test_tunnel();
        let tunnel_for_submit = tunnel.clone();
        let submitted = tokio::spawn(async move {
            tunnel_for_submit
                .submit(OutboundRequest {
                    method: "GET".into(),
                    path: "/".into(),
                    headers: vec![],
                    body: Bytes::new(),
                })
                .await
        });
        tokio::task::yield_now().await;

        let registry = Registry::new();
        teardown(&tunnel, &registry, "test");
        let outcome = submitted.await.unwrap();
        assert!(matches!(
            outcome,
            SubmitOutcome::Completed(Completion::TunnelClosed)
        ));
    }

    #[test]
    fn malformed_body_is_dropped_silently() {
        let (tunnel, _rx) = test_tunnel();
        // No in-flight entry exists yet; dispatching should not panic.
        tunnel.dispatch_response("missing".into(), 200, vec![], "not-base64!!".into());
    }

    #[test]
    fn unparseable_auth_frame_closes_with_malformed_handshake_code() {
        let (tunnel, _rx) = test_tunnel();
        let registry = Registry::new();
        let result = handle_auth_attempt(&tunnel, &registry, "agent.osaurus.ai", "n", "not json");
        assert_eq!(result, Err(CLOSE_MALFORMED_HANDSHAKE));
    }

    #[test]
    fn wrong_nonce_closes_with_auth_failed_code() {
        let (tunnel, _rx) = test_tunnel();
        let registry = Registry::new();
        let frame = r#"{"type":"auth","agents":[],"nonce":"other","timestamp":0}"#;
        let result = handle_auth_attempt(&tunnel, &registry, "agent.osaurus.ai", "n", frame);
        assert_eq!(result, Err(CLOSE_AUTH_FAILED));
    }

    #[tokio::test]
    async fn close_sends_a_websocket_close_frame_with_the_given_code() {
        let (tunnel, mut rx) = test_tunnel();
        tunnel.close(CLOSE_KEEPALIVE_TIMEOUT, "keepalive_timeout");
        match rx.recv().await.unwrap() {
            Outbound::Close(code, reason) => {
                assert_eq!(code, CLOSE_KEEPALIVE_TIMEOUT);
                assert_eq!(reason, "keepalive_timeout");
            }
            Outbound::Frame(_) => panic!("expected a close instruction"),
        }
    }
}
