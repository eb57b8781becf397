//! # Request Manager
//!
//! Request/response correlation on top of the event bus. Each outbound
//! request registers a oneshot slot keyed by its correlation id; the
//! connection's receive listener fulfils the slot when the matching reply
//! arrives, waking exactly the caller that issued the request. Replies for
//! ids that are no longer pending (the caller timed out and moved on) are
//! discarded.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::DriverConfig;
use crate::connection::{Connection, ConnectionStatus};
use crate::error::{DriverResult, Error};
use crate::event::event_bus::{ConnectionEvent, Listener, ListenerKind};
use crate::protocol::{Method, RequestBuilder, ResponseEnvelope, VALIDATE_MESSAGE};

struct PendingEntry {
    sender: oneshot::Sender<ResponseEnvelope>,
    registered_at: Instant,
}

/// Concurrent table of in-flight requests, keyed by correlation id.
///
/// Insertion happens on the caller side, resolution on the connection's I/O
/// context; both see a fully written entry or none at all.
#[derive(Default)]
pub struct PendingRequests {
    entries: DashMap<String, PendingEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `unique` and returns the receiver its reply will arrive on.
    pub fn register(&self, unique: &str) -> oneshot::Receiver<ResponseEnvelope> {
        let (sender, receiver) = oneshot::channel();
        self.entries.insert(
            unique.to_string(),
            PendingEntry {
                sender,
                registered_at: Instant::now(),
            },
        );
        receiver
    }

    /// Hands `envelope` to the caller awaiting its `replyTo` id. Returns
    /// false when no such request is pending (a late or unsolicited reply).
    pub fn resolve(&self, envelope: ResponseEnvelope) -> bool {
        let unique = envelope.reply_to.clone();
        match self.entries.remove(&unique) {
            Some((_, entry)) => {
                debug!(
                    %unique,
                    elapsed = ?entry.registered_at.elapsed(),
                    "resolving pending request"
                );
                // The receiver may have been dropped by a caller that gave
                // up between removal and send; that reply is discarded too.
                entry.sender.send(envelope).is_ok()
            }
            None => false,
        }
    }

    /// Drops a request that will no longer be awaited.
    pub fn abandon(&self, unique: &str) {
        self.entries.remove(unique);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Correlation ids still awaiting a reply.
    pub fn outstanding(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Built-in receive listener: routes every decoded reply envelope into the
/// pending table.
pub struct ReceiveListener {
    pending: Arc<PendingRequests>,
}

impl ReceiveListener {
    pub fn new(pending: Arc<PendingRequests>) -> Self {
        Self { pending }
    }
}

impl Listener for ReceiveListener {
    fn kind(&self) -> ListenerKind {
        ListenerKind::Receive
    }

    fn on_event(&self, event: &ConnectionEvent) {
        if let ConnectionEvent::Received { envelope } = event {
            if !self.pending.resolve(envelope.clone()) {
                debug!(unique = %envelope.reply_to, "discarding reply with no pending request");
            }
        }
    }
}

/// The request/response engine shared by every driver operation.
#[derive(Clone)]
pub struct RequestManager {
    connection: Arc<Connection>,
    pending: Arc<PendingRequests>,
    authorization: String,
    config: DriverConfig,
    shutdown: Arc<AtomicBool>,
}

impl RequestManager {
    pub fn new(
        connection: Arc<Connection>,
        pending: Arc<PendingRequests>,
        authorization: String,
        config: DriverConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connection,
            pending,
            authorization,
            config,
            shutdown,
        }
    }

    /// Sends a request and waits for its correlated reply.
    ///
    /// A shut-down driver rejects immediately with [`Error::Inactive`]. A
    /// momentarily closed connection delays and re-checks every
    /// `retry_delay`, for at most `retry_grace`, instead of failing fast;
    /// calls already past this admission point complete even if a shutdown
    /// starts meanwhile. No response within `request_timeout` resolves to
    /// [`Error::FailedAuthorization`] carrying the validation message.
    #[instrument(skip(self, request), fields(method = %request.method()))]
    pub async fn send(&self, request: RequestBuilder) -> DriverResult<ResponseEnvelope> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Inactive);
        }
        self.wait_for_open().await?;

        let unique = Uuid::new_v4().to_string();
        let method = request.method();
        let envelope = request.build(unique.clone(), &self.authorization);
        let text = serde_json::to_string(&envelope)?;

        let receiver = self.pending.register(&unique);
        debug!(%unique, "transmitting request");
        if let Err(e) = self.connection.send_text(text).await {
            self.pending.abandon(&unique);
            return Err(Error::FailedConnection(e.to_string()));
        }

        match tokio::time::timeout(self.config.request_timeout, receiver).await {
            Ok(Ok(reply)) => classify(reply, method),
            Ok(Err(_)) | Err(_) => {
                self.pending.abandon(&unique);
                warn!(
                    %unique,
                    timeout = ?self.config.request_timeout,
                    "no response arrived within the configured bound"
                );
                Err(Error::FailedAuthorization(VALIDATE_MESSAGE.to_string()))
            }
        }
    }

    /// Delays until the connection is open. A terminal connection fails
    /// immediately; otherwise gives up after `retry_grace`.
    async fn wait_for_open(&self) -> DriverResult<()> {
        let deadline = Instant::now() + self.config.retry_grace;
        loop {
            match self.connection.status() {
                ConnectionStatus::Open => return Ok(()),
                ConnectionStatus::Terminated => {
                    let reason = self
                        .connection
                        .last_error()
                        .unwrap_or_else(|| "the connection was terminated".to_string());
                    return Err(Error::FailedConnection(reason));
                }
                ConnectionStatus::Connecting | ConnectionStatus::Closed => {
                    if Instant::now() >= deadline {
                        return Err(Error::FailedConnection(format!(
                            "connection did not reach open state within {:?}",
                            self.config.retry_grace
                        )));
                    }
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }
}

/// Maps a reply envelope onto the failure taxonomy.
///
/// `kode` 1 passes through; otherwise the authorization message wins, then
/// delete/drop failures classify as deletion errors, everything else as
/// modification errors.
pub(crate) fn classify(
    envelope: ResponseEnvelope,
    method: Method,
) -> DriverResult<ResponseEnvelope> {
    if envelope.is_success() {
        return Ok(envelope);
    }
    let message = envelope.message().unwrap_or_default().to_string();
    if message.eq_ignore_ascii_case(VALIDATE_MESSAGE) {
        Err(Error::FailedAuthorization(message))
    } else if method.is_destructive() {
        Err(Error::FileDeletion(message))
    } else {
        Err(Error::FileModification(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(unique: &str, kode: i32, response: serde_json::Value) -> ResponseEnvelope {
        serde_json::from_value(json!({
            "kode": kode,
            "response": response,
            "replyTo": unique,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let pending = PendingRequests::new();
        let receiver = pending.register("id-1");
        assert_eq!(pending.len(), 1);

        assert!(pending.resolve(reply("id-1", 1, json!("{}"))));
        assert!(pending.is_empty());

        let resolved = receiver.await.unwrap();
        assert!(resolved.is_success());
    }

    #[tokio::test]
    async fn test_late_reply_is_discarded() {
        let pending = PendingRequests::new();
        let receiver = pending.register("id-2");
        pending.abandon("id-2");

        assert!(!pending.resolve(reply("id-2", 1, json!("{}"))));
        assert!(receiver.await.is_err());
    }

    #[tokio::test]
    async fn test_outstanding_lists_pending_ids() {
        let pending = PendingRequests::new();
        let _rx1 = pending.register("id-3");
        let _rx2 = pending.register("id-4");

        let mut outstanding = pending.outstanding();
        outstanding.sort();
        assert_eq!(outstanding, vec!["id-3", "id-4"]);
    }

    #[tokio::test]
    async fn test_receive_listener_routes_into_pending() {
        let pending = Arc::new(PendingRequests::new());
        let listener = ReceiveListener::new(pending.clone());
        let receiver = pending.register("id-5");

        listener.on_event(&ConnectionEvent::Received {
            envelope: reply("id-5", 1, json!("{\"v\":1}")),
        });
        assert_eq!(receiver.await.unwrap().reply_to, "id-5");

        // An unknown id must be ignored, not panic.
        listener.on_event(&ConnectionEvent::Received {
            envelope: reply("id-unknown", 1, json!("{}")),
        });
    }

    #[test]
    fn test_classify_success_passes_through() {
        let resolved = classify(reply("id-6", 1, json!("{}")), Method::Get);
        assert!(resolved.is_ok());
    }

    #[test]
    fn test_classify_authorization_message() {
        let resolved = classify(
            reply("id-7", 0, json!(VALIDATE_MESSAGE)),
            Method::Update,
        );
        assert!(matches!(resolved, Err(Error::FailedAuthorization(_))));

        // The comparison ignores ASCII casing.
        let shouted = VALIDATE_MESSAGE.to_uppercase();
        let resolved = classify(reply("id-8", 0, json!(shouted)), Method::Get);
        assert!(matches!(resolved, Err(Error::FailedAuthorization(_))));
    }

    #[test]
    fn test_classify_by_method() {
        let deletion = classify(reply("id-9", 0, json!("item is locked")), Method::Delete);
        assert!(matches!(deletion, Err(Error::FileDeletion(_))));

        let dropped = classify(reply("id-10", 0, json!("database is busy")), Method::Drop);
        assert!(matches!(dropped, Err(Error::FileDeletion(_))));

        let modification = classify(reply("id-11", 0, json!("bad document")), Method::Add);
        assert!(matches!(modification, Err(Error::FileModification(_))));

        let reverted = classify(reply("id-12", 0, json!("no history")), Method::Revert);
        assert!(matches!(reverted, Err(Error::FileModification(_))));
    }
}
