//! # Connection Manager
//!
//! Owns the single physical WebSocket connection. A spawned task holds the
//! stream exclusively and multiplexes between outbound commands and inbound
//! frames; callers reach it through an mpsc command channel and observe its
//! state through a watch channel.
//!
//! Closure policy: code 1000 is a requested shutdown and ends the task;
//! the application-level authorization code is terminal and recorded as the
//! connection's last error; any other closure engages the reconnect loop,
//! sleeping 1s, 2s, 3s, … between attempts until one succeeds. An `Opened`
//! event is published after every successful (re)connection and a `Closed`
//! event on every closure.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use crate::event::event_bus::{ConnectionEvent, EventBus};
use crate::protocol::{ResponseEnvelope, AUTH_FAILURE_CLOSE, NORMAL_CLOSE};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Synthetic closure code reported when the stream dies without a close
/// frame (transport error, stream end).
const ABNORMAL_CLOSE: u16 = 1006;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("handshake with {uri} failed: {message}")]
    Handshake { uri: String, message: String },

    #[error("handshake with {uri} did not complete within {timeout:?}")]
    HandshakeTimeout { uri: String, timeout: Duration },

    #[error("the connection is not open")]
    NotOpen,

    #[error("the connection task is gone")]
    TaskGone,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("the authorization token is not a valid header value")]
    InvalidToken,
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Initial handshake still in flight.
    Connecting,
    Open,
    /// Closed; the task may be reconnecting or already gone.
    Closed,
    /// Closed for good (authorization failure); never retried.
    Terminated,
}

enum Command {
    Send {
        text: String,
        ack: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Close {
        code: u16,
        reason: String,
    },
}

/// Handle to the connection task. At most one physical connection is live
/// per handle at any time.
pub struct Connection {
    uri: String,
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<ConnectionStatus>,
    last_error: Arc<Mutex<Option<String>>>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Starts the connection task. The handshake proceeds in the background;
    /// use [`Connection::wait_ready`] to observe its outcome.
    pub fn open(
        uri: String,
        authorization: String,
        connect_timeout: Duration,
        bus: Arc<EventBus>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let last_error = Arc::new(Mutex::new(None));

        let task = tokio::spawn(connection_task(
            uri.clone(),
            authorization,
            connect_timeout,
            bus,
            cmd_rx,
            status_tx,
            last_error.clone(),
        ));

        Self {
            uri,
            cmd_tx,
            status_rx,
            last_error,
            task,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    /// The most recent terminal error, if any (handshake failure message or
    /// the reason of an authorization closure).
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Waits until the initial handshake settles, up to `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let mut status_rx = self.status_rx.clone();
        let settled = async {
            loop {
                let status = *status_rx.borrow_and_update();
                match status {
                    ConnectionStatus::Open => return Ok(()),
                    ConnectionStatus::Closed | ConnectionStatus::Terminated => {
                        return Err(ConnectionError::Handshake {
                            uri: self.uri.clone(),
                            message: self
                                .last_error()
                                .unwrap_or_else(|| "the session did not reach open state".into()),
                        });
                    }
                    ConnectionStatus::Connecting => {}
                }
                if status_rx.changed().await.is_err() {
                    return Err(ConnectionError::TaskGone);
                }
            }
        };
        match tokio::time::timeout(timeout, settled).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ConnectionError::HandshakeTimeout {
                uri: self.uri.clone(),
                timeout,
            }),
        }
    }

    /// Transmits one text frame, acknowledged by the connection task.
    pub async fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        let (ack, outcome) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send { text, ack })
            .await
            .map_err(|_| ConnectionError::TaskGone)?;
        outcome.await.map_err(|_| ConnectionError::TaskGone)?
    }

    /// Closes the connection with `code` and `reason`; the task ends.
    pub async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .cmd_tx
            .send(Command::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
    }

    /// Aborts the connection task outright. Used when a blocking
    /// construction gives up on the handshake.
    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn connection_task(
    uri: String,
    authorization: String,
    connect_timeout: Duration,
    bus: Arc<EventBus>,
    mut cmd_rx: mpsc::Receiver<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
    last_error: Arc<Mutex<Option<String>>>,
) {
    // Initial connect. A failure here is fatal to the construction attempt
    // and is not retried; the reconnect loop only serves established
    // sessions that closed unexpectedly.
    let mut ws: Option<WsStream> = match establish(&uri, &authorization, connect_timeout).await {
        Ok((stream, status)) => {
            status_tx.send_replace(ConnectionStatus::Open);
            bus.publish(&ConnectionEvent::Opened { status });
            info!(%uri, "connected");
            Some(stream)
        }
        Err(e) => {
            warn!(%uri, error = %e, "initial connection failed");
            record_error(&last_error, e.to_string());
            status_tx.send_replace(ConnectionStatus::Closed);
            return;
        }
    };

    // Linear backoff counter: first retry waits 1s, then 2s, 3s, …
    let mut attempts: u64 = 0;

    loop {
        let Some(stream) = ws.as_mut() else {
            // Disconnected. Sleep out the backoff (staying responsive to
            // close requests), then attempt a blocking reconnect.
            attempts += 1;
            info!(
                %uri,
                "disconnected from server, attempting to reconnect in {} seconds", attempts
            );
            let sleep = tokio::time::sleep(Duration::from_secs(attempts));
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(Command::Send { ack, .. }) => {
                            let _ = ack.send(Err(ConnectionError::NotOpen));
                        }
                        Some(Command::Close { code, reason }) => {
                            status_tx.send_replace(ConnectionStatus::Closed);
                            bus.publish(&ConnectionEvent::Closed { code, reason, remote: false });
                            return;
                        }
                        None => return,
                    }
                }
            }
            match establish(&uri, &authorization, connect_timeout).await {
                Ok((stream, status)) => {
                    attempts = 0;
                    status_tx.send_replace(ConnectionStatus::Open);
                    bus.publish(&ConnectionEvent::Opened { status });
                    info!(%uri, "reconnected to server successfully");
                    ws = Some(stream);
                }
                Err(e) => {
                    warn!(%uri, error = %e, "reconnect attempt {} failed", attempts);
                }
            }
            continue;
        };

        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send { text, ack }) => {
                    match stream.send(Message::text(text)).await {
                        Ok(()) => {
                            let _ = ack.send(Ok(()));
                        }
                        Err(e) => {
                            let message = e.to_string();
                            let _ = ack.send(Err(ConnectionError::Transport(message.clone())));
                            status_tx.send_replace(ConnectionStatus::Closed);
                            bus.publish(&ConnectionEvent::Closed {
                                code: ABNORMAL_CLOSE,
                                reason: message,
                                remote: false,
                            });
                            ws = None;
                        }
                    }
                }
                Some(Command::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    if let Err(e) = stream.close(Some(frame)).await {
                        debug!(error = %e, "close handshake did not complete cleanly");
                    }
                    status_tx.send_replace(ConnectionStatus::Closed);
                    bus.publish(&ConnectionEvent::Closed { code, reason, remote: false });
                    return;
                }
                // Every handle dropped; nothing can reach this task anymore.
                None => {
                    let _ = stream
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "driver dropped".into(),
                        }))
                        .await;
                    status_tx.send_replace(ConnectionStatus::Closed);
                    bus.publish(&ConnectionEvent::Closed {
                        code: NORMAL_CLOSE,
                        reason: "driver dropped".to_string(),
                        remote: false,
                    });
                    return;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&bus, text.as_str());
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = stream.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((ABNORMAL_CLOSE, String::new()));
                    bus.publish(&ConnectionEvent::Closed {
                        code,
                        reason: reason.clone(),
                        remote: true,
                    });
                    if code == AUTH_FAILURE_CLOSE {
                        warn!(%uri, %reason, "server closed the session for authorization failure");
                        record_error(&last_error, reason);
                        status_tx.send_replace(ConnectionStatus::Terminated);
                        return;
                    }
                    if code == NORMAL_CLOSE {
                        status_tx.send_replace(ConnectionStatus::Closed);
                        return;
                    }
                    status_tx.send_replace(ConnectionStatus::Closed);
                    ws = None;
                }
                Some(Ok(_)) => {
                    // Binary, pong and raw frames carry nothing for us.
                }
                Some(Err(e)) => {
                    let message = e.to_string();
                    warn!(%uri, error = %message, "transport error");
                    status_tx.send_replace(ConnectionStatus::Closed);
                    bus.publish(&ConnectionEvent::Closed {
                        code: ABNORMAL_CLOSE,
                        reason: message,
                        remote: true,
                    });
                    ws = None;
                }
                None => {
                    status_tx.send_replace(ConnectionStatus::Closed);
                    bus.publish(&ConnectionEvent::Closed {
                        code: ABNORMAL_CLOSE,
                        reason: "stream ended".to_string(),
                        remote: true,
                    });
                    ws = None;
                }
            }
        }
    }
}

/// Performs one handshake attempt under `timeout`, passing the token as an
/// authorization header. Returns the stream and the handshake HTTP status.
async fn establish(
    uri: &str,
    authorization: &str,
    timeout: Duration,
) -> Result<(WsStream, u16), ConnectionError> {
    debug!(%uri, "attempting to connect");
    let mut request = uri
        .into_client_request()
        .map_err(|e| ConnectionError::Handshake {
            uri: uri.to_string(),
            message: e.to_string(),
        })?;
    let token = HeaderValue::from_str(authorization).map_err(|_| ConnectionError::InvalidToken)?;
    request.headers_mut().insert("authorization", token);

    match tokio::time::timeout(timeout, connect_async(request)).await {
        Ok(Ok((stream, response))) => Ok((stream, response.status().as_u16())),
        Ok(Err(e)) => Err(ConnectionError::Handshake {
            uri: uri.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Err(ConnectionError::HandshakeTimeout {
            uri: uri.to_string(),
            timeout,
        }),
    }
}

/// Decodes an inbound text frame and publishes it when it is a reply
/// envelope; anything else is logged and dropped.
fn handle_text(bus: &EventBus, text: &str) {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) if ResponseEnvelope::looks_like_reply(&value) => {
            match serde_json::from_value::<ResponseEnvelope>(value) {
                Ok(envelope) => bus.publish(&ConnectionEvent::Received { envelope }),
                Err(e) => warn!(error = %e, "failed to decode reply envelope"),
            }
        }
        Ok(_) => debug!("ignoring inbound frame without kode/replyTo"),
        Err(e) => warn!(error = %e, "failed to parse inbound frame"),
    }
}

fn record_error(slot: &Mutex<Option<String>>, message: String) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_bus::{Listener, ListenerKind};
    use std::sync::Mutex as StdMutex;

    struct Sink {
        received: Arc<StdMutex<Vec<ConnectionEvent>>>,
        kind: ListenerKind,
    }

    impl Listener for Sink {
        fn kind(&self) -> ListenerKind {
            self.kind
        }
        fn on_event(&self, event: &ConnectionEvent) {
            self.received.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_handle_text_publishes_only_reply_envelopes() {
        let bus = EventBus::new();
        let received = Arc::new(StdMutex::new(Vec::new()));
        bus.register(Arc::new(Sink {
            received: received.clone(),
            kind: ListenerKind::Receive,
        }));

        handle_text(&bus, r#"{"kode":1,"replyTo":"id-1","response":"{}"}"#);
        handle_text(&bus, r#"{"notice":"not a reply"}"#);
        handle_text(&bus, "not json at all");

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        match &received[0] {
            ConnectionEvent::Received { envelope } => assert_eq!(envelope.reply_to, "id-1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_initial_connect_failure_is_fatal() {
        let bus = Arc::new(EventBus::new());
        // A port nothing listens on; the handshake fails outright.
        let connection = Connection::open(
            "ws://127.0.0.1:1".to_string(),
            "token".to_string(),
            Duration::from_millis(500),
            bus,
        );

        let outcome = connection.wait_ready(Duration::from_secs(2)).await;
        assert!(outcome.is_err());
        assert_eq!(connection.status(), ConnectionStatus::Closed);
        assert!(connection.last_error().is_some());
    }
}
