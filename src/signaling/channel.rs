//! Signaling channel: connection lifecycle, correlation, dispatch, reconnect
//!
//! One `SignalingChannel` owns at most one WebSocket at a time. Correlated
//! requests park a resolver in the pending table keyed by correlation id;
//! the reader task routes matching replies to exactly that resolver and
//! dispatches everything else to the registered event handlers. An
//! unexpected close triggers exponential-backoff reconnection; a deliberate
//! `disconnect` tears everything down idempotently.

use crate::config::ChannelConfig;
use crate::signaling::endpoint;
use crate::signaling::protocol::{types, Envelope, ErrorPayload};
use crate::{Error, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection state, observable through [`SignalingChannel::watch_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Registration handle returned by [`SignalingChannel::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// Event handler invoked for each matching inbound envelope
pub type EventHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Client side of the signaling protocol
///
/// Cheap to clone; clones share the same underlying connection.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    config: ChannelConfig,
    state_tx: watch::Sender<ChannelState>,
    next_request_id: AtomicU64,
    next_handler_id: AtomicU64,
    generation: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>,
    handlers: Mutex<HashMap<String, Vec<(HandlerId, EventHandler)>>>,
    conn: Mutex<Option<ConnectionHandle>>,
    connect_lock: tokio::sync::Mutex<()>,
    reconnect: Mutex<ReconnectCtl>,
    endpoint: Mutex<Option<String>>,
}

struct ConnectionHandle {
    tx: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    endpoint: Url,
    gen: u64,
}

#[derive(Default)]
struct ReconnectCtl {
    attempts: u32,
    task: Option<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Create a disconnected channel with the given policy
    pub fn new(config: ChannelConfig) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                config,
                state_tx,
                next_request_id: AtomicU64::new(0),
                next_handler_id: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                conn: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                reconnect: Mutex::new(ReconnectCtl::default()),
                endpoint: Mutex::new(None),
            }),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ChannelState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to connection state transitions
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }

    /// Number of requests currently awaiting a correlated response
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Establish the transport
    ///
    /// Idempotent: already connected to an equivalent endpoint returns
    /// immediately; a concurrent attempt in flight returns the observed
    /// `Connecting`/`Reconnecting` state without starting a second one.
    /// Candidate endpoints are tried in order with a bounded per-attempt
    /// timeout; the first completed open handshake wins.
    pub async fn connect(&self, url: &str) -> Result<ChannelState> {
        let _guard = match self.inner.connect_lock.try_lock() {
            Ok(guard) => guard,
            // another connect is already driving the transport
            Err(_) => return Ok(self.state()),
        };
        if matches!(self.state(), ChannelState::Reconnecting) {
            return Ok(ChannelState::Reconnecting);
        }

        let candidates = endpoint::resolve_candidates(url)?;

        if self.state() == ChannelState::Connected {
            let current = self.inner.conn.lock().as_ref().map(|h| h.endpoint.clone());
            if let Some(current) = current {
                if candidates.contains(&current) {
                    debug!("connect: already connected to {}", current);
                    return Ok(ChannelState::Connected);
                }
            }
            // connected elsewhere: a new endpoint starts a fresh session
            self.teardown(true).await;
        }

        self.inner.set_state(ChannelState::Connecting);
        match ChannelInner::try_candidates(&self.inner, &candidates).await {
            Ok(()) => {
                *self.inner.endpoint.lock() = Some(url.to_string());
                self.inner.reconnect.lock().attempts = 0;
                Ok(ChannelState::Connected)
            }
            Err(e) => {
                self.inner.set_state(ChannelState::Disconnected);
                Err(e)
            }
        }
    }

    /// Send a correlated request and await its response payload
    ///
    /// Rejects with `NotConnected` when no transport is live (leaving no
    /// pending entry behind), `RequestTimeout` when the deadline elapses,
    /// `ChannelClosed` when the connection drops mid-flight, and
    /// `ServerError` when the reply carries the reserved error tag.
    pub async fn send_request(&self, kind: &str, payload: Value) -> Result<Value> {
        let tx = self.writer_tx()?;
        let id = (self.inner.next_request_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();

        let (resolve_tx, resolve_rx) = oneshot::channel();
        self.inner.pending.lock().insert(id.clone(), resolve_tx);

        let envelope = Envelope::request(kind, id.clone(), payload);
        let text = serde_json::to_string(&envelope)
            .map_err(|e| Error::DecodeError(format!("failed to encode {kind}: {e}")))?;
        if tx.send(Message::Text(text)).await.is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(Error::NotConnected);
        }
        debug!("sent request '{}' (id {})", kind, id);

        match tokio::time::timeout(self.inner.config.request_timeout, resolve_rx).await {
            Ok(Ok(outcome)) => outcome,
            // resolver dropped without an answer: connection teardown raced us
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(Error::RequestTimeout {
                    kind: kind.to_string(),
                })
            }
        }
    }

    /// Fire-and-forget send with no correlation bookkeeping
    pub async fn send(&self, kind: &str, payload: Value) -> Result<()> {
        let tx = self.writer_tx()?;
        let envelope = Envelope::event(kind, payload);
        let text = serde_json::to_string(&envelope)
            .map_err(|e| Error::DecodeError(format!("failed to encode {kind}: {e}")))?;
        tx.send(Message::Text(text))
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Register a handler for a message type (or [`types::WILDCARD`])
    ///
    /// Multiple handlers per type are invoked in registration order.
    pub fn on(&self, kind: &str, handler: impl Fn(&Envelope) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.inner
            .handlers
            .lock()
            .entry(kind.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a previously registered handler; returns whether it existed
    pub fn off(&self, kind: &str, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.lock();
        match handlers.get_mut(kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(hid, _)| *hid != id);
                before != list.len()
            }
            None => false,
        }
    }

    /// Deliberate teardown: cancel reconnection, close the transport with a
    /// normal-closure code, reject every outstanding request, reset counters
    ///
    /// Callable repeatedly; calls after the first are no-ops.
    pub async fn disconnect(&self) {
        {
            let mut ctl = self.inner.reconnect.lock();
            if let Some(task) = ctl.task.take() {
                task.abort();
            }
            ctl.attempts = 0;
        }
        self.teardown(true).await;
        *self.inner.endpoint.lock() = None;
        self.inner.next_request_id.store(0, Ordering::Relaxed);
        self.inner.set_state(ChannelState::Disconnected);
    }

    async fn teardown(&self, send_close: bool) {
        let handle = self.inner.conn.lock().take();
        let Some(handle) = handle else { return };

        if send_close {
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            }));
            let _ = handle.tx.send(close).await;
        }
        handle.reader.abort();
        // dropping the last sender lets the writer flush the close and exit
        drop(handle.tx);
        let _ = tokio::time::timeout(Duration::from_millis(250), handle.writer).await;

        self.inner.reject_pending();
    }

    fn writer_tx(&self) -> Result<mpsc::Sender<Message>> {
        if self.state() != ChannelState::Connected {
            return Err(Error::NotConnected);
        }
        self.inner
            .conn
            .lock()
            .as_ref()
            .map(|h| h.tx.clone())
            .ok_or(Error::NotConnected)
    }
}

impl ChannelInner {
    fn set_state(&self, state: ChannelState) {
        self.state_tx.send_replace(state);
    }

    /// Try each candidate endpoint in order; first completed handshake wins
    async fn try_candidates(inner: &Arc<Self>, candidates: &[Url]) -> Result<()> {
        let mut last = "no candidate endpoints".to_string();
        for candidate in candidates {
            debug!("attempting signaling endpoint {}", candidate);
            match tokio::time::timeout(inner.config.connect_timeout, connect_async(candidate.as_str()))
                .await
            {
                Ok(Ok((ws, _response))) => {
                    Self::install(inner, candidate.clone(), ws);
                    info!("signaling connected to {}", candidate);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!("endpoint {} failed: {}", candidate, e);
                    last = e.to_string();
                }
                Err(_) => {
                    warn!(
                        "endpoint {} timed out after {:?}",
                        candidate, inner.config.connect_timeout
                    );
                    last = format!("handshake timed out after {:?}", inner.config.connect_timeout);
                }
            }
        }
        Err(Error::ConnectFailed { last })
    }

    fn install(inner: &Arc<Self>, endpoint: Url, ws: WsStream) {
        let gen = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::channel::<Message>(64);

        let writer = tokio::spawn(Self::write_loop(sink, rx));
        let reader = tokio::spawn(Self::read_loop(Arc::clone(inner), stream, gen));

        *inner.conn.lock() = Some(ConnectionHandle {
            tx,
            reader,
            writer,
            endpoint,
            gen,
        });
        inner.set_state(ChannelState::Connected);
    }

    async fn write_loop(mut sink: WsSink, mut rx: mpsc::Receiver<Message>) {
        while let Some(message) = rx.recv().await {
            if let Err(e) = sink.send(message).await {
                warn!("signaling write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    }

    async fn read_loop(inner: Arc<Self>, mut stream: WsSource, gen: u64) {
        // a plain stream end (no close frame) counts as abnormal
        let mut abnormal = true;
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => inner.handle_frame(&text),
                Ok(Message::Close(frame)) => {
                    abnormal = frame
                        .map(|f| !matches!(f.code, CloseCode::Normal | CloseCode::Away))
                        .unwrap_or(true);
                    debug!("signaling close frame received (abnormal: {})", abnormal);
                    break;
                }
                Ok(Message::Binary(data)) => {
                    warn!("dropping unexpected {}-byte binary frame", data.len());
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("signaling read failed: {}", e);
                    break;
                }
            }
        }
        Self::on_connection_lost(&inner, gen, abnormal);
    }

    /// Decode and route one inbound frame
    ///
    /// Correlated replies go exclusively to their pending request; all other
    /// frames go to the type handlers, then the wildcard handlers. Decode
    /// failures are logged and dropped.
    fn handle_frame(&self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                warn!("dropping undecodable signaling frame: {}", e);
                return;
            }
        };

        if let Some(id) = envelope.request_id.as_deref() {
            if let Some(resolver) = self.pending.lock().remove(id) {
                let outcome = if envelope.kind == types::ERROR {
                    match serde_json::from_value::<ErrorPayload>(envelope.payload.clone()) {
                        Ok(err) => Err(Error::ServerError {
                            code: err.code,
                            message: err.message,
                        }),
                        Err(_) => Err(Error::ServerError {
                            code: -1,
                            message: "malformed error payload".to_string(),
                        }),
                    }
                } else {
                    Ok(envelope.payload)
                };
                let _ = resolver.send(outcome);
                return;
            }
            debug!(
                "response with unknown correlation id {} dispatched as event",
                id
            );
        }

        let matching: Vec<EventHandler> = {
            let handlers = self.handlers.lock();
            handlers
                .get(&envelope.kind)
                .into_iter()
                .chain(handlers.get(types::WILDCARD))
                .flatten()
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };
        for handler in matching {
            // a panicking handler must not break delivery to the rest
            if catch_unwind(AssertUnwindSafe(|| handler(&envelope))).is_err() {
                error!("signaling handler panicked for '{}'", envelope.kind);
            }
        }
    }

    /// Reader exit path: decide between reconnection and staying down
    fn on_connection_lost(inner: &Arc<Self>, gen: u64, abnormal: bool) {
        {
            let mut conn = inner.conn.lock();
            match conn.as_ref() {
                // only the current connection's reader gets to act
                Some(handle) if handle.gen == gen => {}
                _ => return,
            }
            let handle = conn.take();
            if let Some(handle) = handle {
                handle.writer.abort();
            }
        }
        inner.reject_pending();

        let may_retry = {
            let ctl = inner.reconnect.lock();
            ctl.attempts < inner.config.max_reconnect_attempts
        };
        if abnormal && may_retry && inner.endpoint.lock().is_some() {
            warn!("signaling connection lost unexpectedly; scheduling reconnect");
            inner.set_state(ChannelState::Reconnecting);
            Self::spawn_reconnect(inner);
        } else {
            info!("signaling connection closed");
            inner.set_state(ChannelState::Disconnected);
        }
    }

    fn spawn_reconnect(inner: &Arc<Self>) {
        let mut ctl = inner.reconnect.lock();
        if ctl.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let inner = Arc::clone(inner);
        ctl.task = Some(tokio::spawn(async move {
            loop {
                let attempt = {
                    let mut ctl = inner.reconnect.lock();
                    if ctl.attempts >= inner.config.max_reconnect_attempts {
                        break;
                    }
                    ctl.attempts += 1;
                    ctl.attempts
                };
                let delay = backoff_delay(&inner.config, attempt);
                info!(
                    "reconnect attempt {}/{} in {:?}",
                    attempt, inner.config.max_reconnect_attempts, delay
                );
                tokio::time::sleep(delay).await;

                let Some(url) = inner.endpoint.lock().clone() else {
                    return;
                };
                let candidates = match endpoint::resolve_candidates(&url) {
                    Ok(candidates) => candidates,
                    Err(e) => {
                        error!("stored endpoint no longer resolvable: {}", e);
                        break;
                    }
                };
                match Self::try_candidates(&inner, &candidates).await {
                    Ok(()) => {
                        inner.reconnect.lock().attempts = 0;
                        info!("signaling reconnected");
                        return;
                    }
                    Err(e) => warn!("reconnect attempt {} failed: {}", attempt, e),
                }
            }
            error!("signaling reconnection attempts exhausted");
            inner.set_state(ChannelState::Disconnected);
        }));
    }

    fn reject_pending(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!("rejecting {} outstanding requests", drained.len());
        }
        for (_, resolver) in drained {
            let _ = resolver.send(Err(Error::ChannelClosed));
        }
    }
}

/// Exponential backoff: base doubled per attempt, capped
fn backoff_delay(config: &ChannelConfig, attempt: u32) -> Duration {
    let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
    config
        .reconnect_base
        .saturating_mul(factor)
        .min(config.reconnect_cap)
}
