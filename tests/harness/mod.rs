//! In-process WebSocket signaling server for integration tests
//!
//! Accepts real connections from the channel under test, records every
//! inbound envelope, and replies through an optional auto-responder with a
//! configurable delay. Connections can be killed abruptly (no close
//! handshake) to exercise the reconnect path.

#![allow(dead_code)]

use anyhow::Result;
use confero::signaling::protocol::Envelope;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Produces the reply (if any) for an inbound envelope
pub type AutoResponder = Arc<dyn Fn(&Envelope) -> Option<Envelope> + Send + Sync>;

pub struct TestServer {
    addr: SocketAddr,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    inner: Arc<ServerInner>,
}

struct ServerInner {
    connections: Mutex<Vec<ConnHandle>>,
    received: Mutex<Vec<Envelope>>,
    connects: AtomicUsize,
    responder: RwLock<Option<AutoResponder>>,
    reply_delay: Mutex<Duration>,
}

struct ConnHandle {
    tx: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Bind an ephemeral port and start accepting
    pub async fn spawn() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let inner = Arc::new(ServerInner {
            connections: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            responder: RwLock::new(None),
            reply_delay: Mutex::new(Duration::ZERO),
        });

        let accept_inner = Arc::clone(&inner);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _peer)) = listener.accept().await {
                let conn_inner = Arc::clone(&accept_inner);
                accept_inner.connects.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = mpsc::unbounded_channel();
                let tx_for_handle = tx.clone();
                let task = tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, conn_inner, tx, rx).await {
                        eprintln!("test server connection ended: {e}");
                    }
                });
                accept_inner.connections.lock().push(ConnHandle {
                    tx: tx_for_handle,
                    task,
                });
            }
        });

        Ok(Self {
            addr,
            accept_task: Mutex::new(Some(accept_task)),
            inner,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn set_responder(&self, responder: impl Fn(&Envelope) -> Option<Envelope> + Send + Sync + 'static) {
        *self.inner.responder.write() = Some(Arc::new(responder));
    }

    /// Delay applied before every auto-reply
    pub fn set_reply_delay(&self, delay: Duration) {
        *self.inner.reply_delay.lock() = delay;
    }

    /// Total connections accepted since spawn
    pub fn connection_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Snapshot of every envelope received so far
    pub fn received(&self) -> Vec<Envelope> {
        self.inner.received.lock().clone()
    }

    pub fn received_of_kind(&self, kind: &str) -> Vec<Envelope> {
        self.received()
            .into_iter()
            .filter(|env| env.kind == kind)
            .collect()
    }

    /// Push an envelope to the most recent connection
    pub fn send_to_latest(&self, envelope: &Envelope) {
        let text = serde_json::to_string(envelope).expect("envelope encodes");
        let connections = self.inner.connections.lock();
        if let Some(conn) = connections.last() {
            let _ = conn.tx.send(Message::Text(text));
        }
    }

    /// Drop the most recent connection without a close handshake
    pub fn kill_latest(&self) {
        let mut connections = self.inner.connections.lock();
        if let Some(conn) = connections.pop() {
            conn.task.abort();
        }
    }

    /// Stop accepting new connections (existing ones stay up)
    pub fn stop_accepting(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }

    /// Poll until the predicate holds or the timeout elapses
    pub async fn wait_until(&self, timeout: Duration, mut predicate: impl FnMut(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop_accepting();
        for conn in self.inner.connections.lock().drain(..) {
            conn.task.abort();
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    inner: Arc<ServerInner>,
    tx: mpsc::UnboundedSender<Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let Ok(envelope) = serde_json::from_str::<Envelope>(&text) else {
                    continue;
                };
                inner.received.lock().push(envelope.clone());

                let reply = inner
                    .responder
                    .read()
                    .as_ref()
                    .and_then(|responder| responder(&envelope));
                if let Some(reply) = reply {
                    let delay = *inner.reply_delay.lock();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if delay > Duration::ZERO {
                            tokio::time::sleep(delay).await;
                        }
                        let text = serde_json::to_string(&reply).expect("reply encodes");
                        let _ = tx.send(Message::Text(text));
                    });
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    writer.abort();
    Ok(())
}
