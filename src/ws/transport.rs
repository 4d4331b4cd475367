//! Slip-channel WebSocket transport.
//!
//! Owns exactly one physical connection. Connects lazily on the first
//! subscribe, reconnects with exponential backoff up to a fixed attempt
//! budget, and sends a periodic keepalive ping (no pong is required, so a
//! slow server never reads as a false disconnect).

use crate::ws::{ChannelError, ClientFrame, ServerFrame, Transport, TransportEvent};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle: `Idle → Connecting → Open → (Closing | Closed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closing,
            4 => ConnectionState::Closed,
            _ => ConnectionState::Idle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// First reconnect delay; doubles per consecutive failed attempt.
    pub base_delay: Duration,
    /// Consecutive failed attempts before the transport gives up.
    pub max_reconnect_attempts: u32,
    /// Keepalive ping interval while open.
    pub keepalive: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_reconnect_attempts: 5,
            keepalive: Duration::from_secs(30),
        }
    }
}

/// Delay before reconnect attempt `attempt` (0-based): `base * 2^attempt`.
pub(crate) fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

enum SessionEnd {
    Remote,
    LocalClose,
}

struct Inner {
    url: String,
    config: TransportConfig,
    state: AtomicU8,
    running: AtomicBool,
    closed: AtomicBool,
    close_notify: Notify,
    outbound_tx: mpsc::UnboundedSender<ClientFrame>,
    outbound_rx: Mutex<mpsc::UnboundedReceiver<ClientFrame>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Cheap cloneable handle to the single underlying connection.
#[derive(Clone)]
pub struct ChannelTransport {
    inner: Arc<Inner>,
}

impl ChannelTransport {
    /// Validates the URL up front; no connection is made until `connect()`.
    pub fn new(ws_url: &str, config: TransportConfig) -> Result<Self, ChannelError> {
        url::Url::parse(ws_url)?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(Inner {
                url: ws_url.to_string(),
                config,
                state: AtomicU8::new(ConnectionState::Idle as u8),
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
                outbound_tx,
                outbound_rx: Mutex::new(outbound_rx),
                events_tx,
                events_rx: StdMutex::new(Some(events_rx)),
            }),
        })
    }

    /// Takes the transport event stream. Yields `Some` exactly once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inner
            .events_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Idempotent. Spawns the connection task if one is not already running;
    /// after an exhausted backoff cycle, a fresh call starts a new cycle.
    pub fn connect(&self) {
        self.inner.closed.store(false, Ordering::SeqCst);
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                run(inner).await;
            });
        }
    }

    /// Queue a frame for the socket. Dropped (at debug level) when the socket
    /// is not open: subscription frames are re-sent on every `Open` by the
    /// registry, so nothing queued while closed is ever load-bearing.
    pub fn send(&self, frame: ClientFrame) {
        if self.inner.state() != ConnectionState::Open {
            debug!(frame = ?frame, "transport not open, dropping frame");
            return;
        }
        let _ = self.inner.outbound_tx.send(frame);
    }

    /// Stop reconnecting and close the current session, if any.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if self.inner.running.load(Ordering::SeqCst) {
            self.inner.set_state(ConnectionState::Closing);
            self.inner.close_notify.notify_waiters();
        } else {
            self.inner.set_state(ConnectionState::Closed);
        }
    }
}

impl Transport for ChannelTransport {
    fn connect(&self) {
        ChannelTransport::connect(self);
    }

    fn send_frame(&self, frame: ClientFrame) {
        self.send(frame);
    }
}

async fn run(inner: Arc<Inner>) {
    let mut attempt: u32 = 0;

    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }

        inner.set_state(ConnectionState::Connecting);
        info!(url = %inner.url, "connecting to slip channel");

        match connect_async(inner.url.as_str()).await {
            Ok((stream, _response)) => {
                attempt = 0;
                inner.set_state(ConnectionState::Open);
                info!("slip channel connected");
                let _ = inner.events_tx.send(TransportEvent::Open);

                let end = run_session(&inner, stream).await;

                inner.set_state(ConnectionState::Closed);
                let _ = inner.events_tx.send(TransportEvent::Closed);

                if matches!(end, SessionEnd::LocalClose) {
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "slip channel connect failed");
                inner.set_state(ConnectionState::Closed);
                let _ = inner.events_tx.send(TransportEvent::Closed);
            }
        }

        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        if attempt >= inner.config.max_reconnect_attempts {
            warn!(
                attempts = attempt,
                "reconnect attempts exhausted, staying closed"
            );
            let _ = inner.events_tx.send(TransportEvent::Exhausted);
            break;
        }

        let delay = reconnect_delay(inner.config.base_delay, attempt);
        attempt += 1;
        info!(delay = ?delay, attempt = attempt, "reconnecting to slip channel");
        tokio::time::sleep(delay).await;
    }

    inner.running.store(false, Ordering::SeqCst);
}

async fn run_session(inner: &Inner, stream: WsStream) -> SessionEnd {
    let (mut write, mut read) = stream.split();
    let mut outbound = inner.outbound_rx.lock().await;
    let mut keepalive = tokio::time::interval(inner.config.keepalive);

    loop {
        // notify_waiters only reaches a registered waiter; re-check the flag
        // so a close that lands between polls is still honored.
        if inner.closed.load(Ordering::SeqCst) {
            let _ = write.send(Message::Close(None)).await;
            return SessionEnd::LocalClose;
        }

        tokio::select! {
            _ = inner.close_notify.notified() => {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::LocalClose;
            }

            _ = keepalive.tick() => {
                if let Ok(text) = serde_json::to_string(&ClientFrame::Ping) {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        warn!(error = %e, "keepalive send failed");
                        return SessionEnd::Remote;
                    }
                }
            }

            Some(frame) = outbound.recv() => {
                match serde_json::to_string(&frame) {
                    Ok(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            error!(error = %e, "channel write error");
                            return SessionEnd::Remote;
                        }
                    }
                    Err(e) => warn!(error = %e, "unserializable frame dropped"),
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => process_frame(&text, &inner.events_tx),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(frame = ?frame, "channel close frame received");
                        return SessionEnd::Remote;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "channel read error");
                        return SessionEnd::Remote;
                    }
                    None => return SessionEnd::Remote,
                }
            }
        }
    }
}

/// One bad frame must not crash delivery to other topics: parse failures are
/// logged and dropped here, never propagated.
fn process_frame(text: &str, events_tx: &mpsc::UnboundedSender<TransportEvent>) {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(frame) => {
            let _ = events_tx.send(TransportEvent::Frame(frame));
        }
        Err(e) => warn!(error = %e, "malformed channel frame dropped"),
    }
}
