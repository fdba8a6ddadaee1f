//! Reconnecting websocket transport
//!
//! A thin connection state machine: connect with a timeout, surface typed
//! events on a channel, back off exponentially after unexpected closes, and
//! replay the last subscription after every reconnect. The transport never
//! buffers outbound traffic; queueing is the caller's policy.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use console_types::{SocketFrame, Subscription};

/// Connection lifecycle state, published on a `watch` channel for the
/// connectivity indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    /// Tooltip text for the status icon.
    pub fn status_hint(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Live events: attempting to connect to the server.",
            ConnectionState::Open => {
                "Live events: connected. Job status and output update in real time."
            }
            ConnectionState::Closed => {
                "Live events: not connected. Job status and output may be delayed."
            }
        }
    }
}

/// Events emitted by the connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A connection attempt is starting; `attempt` counts retries since the
    /// last successful open.
    Connecting { attempt: u32 },
    /// Handshake succeeded; `reconnect` is false only for the first open of
    /// this transport's lifetime.
    Open { reconnect: bool },
    /// One parsed inbound frame.
    Frame(SocketFrame),
    /// A connection-level failure. Informational; the task retries on its
    /// own.
    Error(String),
    /// The transport is done: explicit close, handle dropped, or retry
    /// budget exhausted.
    Closed,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("socket is not open")]
    NotConnected,

    #[error("connection task is gone")]
    ChannelClosed,
}

/// Backoff and timeout knobs.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// First retry delay
    pub base_interval: Duration,
    /// Retry delay ceiling
    pub max_interval: Duration,
    /// Multiplier applied per consecutive failed attempt
    pub decay: f64,
    /// Abort a connection attempt after this long and retry
    pub connect_timeout: Duration,
    /// Retries allowed after a failed first attempt; `None` retries
    /// forever
    pub max_attempts: Option<u32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(1000),
            max_interval: Duration::from_millis(30_000),
            decay: 1.5,
            connect_timeout: Duration::from_millis(2000),
            max_attempts: None,
        }
    }
}

/// Delay before retry number `attempts`:
/// `min(max_interval, base_interval * decay^attempts)`.
pub fn reconnect_delay(config: &TransportConfig, attempts: u32) -> Duration {
    let grown = config.base_interval.as_millis() as f64 * config.decay.powi(attempts as i32);
    let capped = grown.min(config.max_interval.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

enum Command {
    Subscribe(Subscription),
    Send(String),
    Close,
}

/// Cloneable handle to one connection task.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl SocketHandle {
    /// Replace the connection's group subscription. The envelope is stored
    /// and re-sent automatically after every reconnect.
    pub fn subscribe(&self, subscription: Subscription) -> Result<(), TransportError> {
        self.commands
            .send(Command::Subscribe(subscription))
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Send a raw text payload. Fails when the socket is not open; nothing
    /// is queued.
    pub fn send(&self, text: String) -> Result<(), TransportError> {
        if *self.state.borrow() != ConnectionState::Open {
            return Err(TransportError::NotConnected);
        }
        self.commands
            .send(Command::Send(text))
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Forced close: the task sends a close frame, reports `Closed`, and
    /// exits without reconnecting.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch endpoint for state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

/// Spawn a connection task for `url`, returning the command handle and the
/// event stream.
pub fn connect(
    url: impl Into<String>,
    config: TransportConfig,
) -> (SocketHandle, mpsc::UnboundedReceiver<TransportEvent>) {
    let url = url.into();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

    tokio::spawn(run_connection(url, config, command_rx, event_tx, state_tx));

    (
        SocketHandle {
            commands: command_tx,
            state: state_rx,
        },
        event_rx,
    )
}

/// Derive the socket endpoint from an HTTP(S) base URL.
pub fn http_to_ws_url(http_url: &str) -> String {
    if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http_url.to_string()
    }
}

async fn run_connection(
    url: String,
    config: TransportConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: watch::Sender<ConnectionState>,
) {
    let mut attempts: u32 = 0;
    let mut subscription: Option<Subscription> = None;
    let mut opened_before = false;

    loop {
        if let Some(max) = config.max_attempts {
            if attempts > max {
                tracing::warn!(url = %url, attempts, "retry budget exhausted, giving up");
                state.send_replace(ConnectionState::Closed);
                let _ = events.send(TransportEvent::Closed);
                return;
            }
        }

        state.send_replace(ConnectionState::Connecting);
        let _ = events.send(TransportEvent::Connecting { attempt: attempts });

        match timeout(config.connect_timeout, connect_async(&url)).await {
            Ok(Ok((socket, _response))) => {
                attempts = 0;
                state.send_replace(ConnectionState::Open);
                let _ = events.send(TransportEvent::Open {
                    reconnect: opened_before,
                });
                opened_before = true;
                tracing::debug!(url = %url, "socket open");

                let (mut sink, mut stream) = socket.split();

                // Re-establish server-side group membership before any
                // other traffic.
                if let Some(sub) = subscription.as_ref() {
                    if send_subscription(&mut sink, sub).await.is_err() {
                        tracing::warn!("socket dropped while resubscribing");
                        continue;
                    }
                }

                loop {
                    tokio::select! {
                        command = commands.recv() => match command {
                            None | Some(Command::Close) => {
                                let _ = sink.send(Message::Close(None)).await;
                                state.send_replace(ConnectionState::Closed);
                                let _ = events.send(TransportEvent::Closed);
                                return;
                            }
                            Some(Command::Subscribe(sub)) => {
                                let failed = send_subscription(&mut sink, &sub).await.is_err();
                                subscription = Some(sub);
                                if failed {
                                    break;
                                }
                            }
                            Some(Command::Send(text)) => {
                                if sink.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                        },
                        message = stream.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(frame) = parse_frame(&text) {
                                    let _ = events.send(TransportEvent::Frame(frame));
                                }
                            }
                            Some(Err(error)) => {
                                let _ = events.send(TransportEvent::Error(error.to_string()));
                                break;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                        },
                    }
                }

                // The connection is gone; the watch must not keep reporting
                // Open through the retry delay.
                state.send_replace(ConnectionState::Connecting);
                tracing::debug!(url = %url, "socket lost, scheduling reconnect");
            }
            Ok(Err(error)) => {
                tracing::warn!(url = %url, error = %error, "socket connect failed");
                let _ = events.send(TransportEvent::Error(error.to_string()));
            }
            Err(_) => {
                tracing::warn!(url = %url, timeout_ms = config.connect_timeout.as_millis() as u64, "socket connect timed out");
                let _ = events.send(TransportEvent::Error(format!(
                    "connect timed out after {}ms",
                    config.connect_timeout.as_millis()
                )));
            }
        }

        let delay = reconnect_delay(&config, attempts);
        attempts += 1;

        // Stay responsive while backing off: a close (or the handle being
        // dropped) must end the task without waiting out the delay.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = commands.recv() => match command {
                    None | Some(Command::Close) => {
                        state.send_replace(ConnectionState::Closed);
                        let _ = events.send(TransportEvent::Closed);
                        return;
                    }
                    Some(Command::Subscribe(sub)) => {
                        subscription = Some(sub);
                    }
                    Some(Command::Send(_)) => {}
                },
            }
        }
    }
}

async fn send_subscription<S>(sink: &mut S, subscription: &Subscription) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let payload = match serde_json::to_string(subscription) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::error!(error = %error, "subscription did not serialize");
            return Ok(());
        }
    };
    sink.send(Message::Text(payload)).await.map_err(|_| ())
}

/// Parse one inbound text frame. Frames for unknown groups (and the
/// server's connection-accept banner) do not match the contract and are
/// dropped here.
fn parse_frame(text: &str) -> Option<SocketFrame> {
    match serde_json::from_str(text) {
        Ok(frame) => Some(frame),
        Err(error) => {
            tracing::debug!(error = %error, "dropping unparseable socket frame");
            None
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
