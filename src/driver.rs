//! # Driver
//!
//! The public face of the client. One [`Driver`] owns one physical
//! connection plus the subsystems around it (event bus, pending-request
//! table, request manager); it is cheap to clone and every operation takes
//! `&self`, so any number of tasks may issue requests concurrently against
//! the shared connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::aggregate::{AggregateError, AggregatedCollection, AggregatedDatabase, Filter};
use crate::config::DriverConfig;
use crate::connection::Connection;
use crate::error::{DriverResult, Error};
use crate::event::event_bus::EventBus;
use crate::event::request_manager::{PendingRequests, ReceiveListener, RequestManager};
use crate::protocol::{Method, RequestEnvelope, NORMAL_CLOSE};

/// Close reason used by the no-argument shutdown variants.
pub const DEFAULT_SHUTDOWN_MESSAGE: &str = "The client requested a shutdown.";

/// Assembles a [`Driver`] from the connection parameters.
///
/// ```rust,no_run
/// # use petaldb_client::DriverBuilder;
/// # use std::time::Duration;
/// # async fn example() -> petaldb_client::DriverResult<()> {
/// let driver = DriverBuilder::new("localhost", 5995, "token")
///     .timeout(Duration::from_secs(3))
///     .build()
///     .await?;
/// let book = driver.get("library", "books", "dune").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DriverBuilder {
    host: String,
    port: u16,
    authorization: String,
    config: DriverConfig,
}

impl DriverBuilder {
    pub fn new(host: &str, port: u16, authorization: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            authorization: authorization.to_string(),
            config: DriverConfig::default(),
        }
    }

    /// Handshake deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.connect.timeout = timeout;
        self
    }

    /// Whether [`DriverBuilder::build`] waits for the handshake.
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.config.connect.blocking = blocking;
        self
    }

    /// Bound on the wait for a correlated response.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Bound on the graceful-shutdown drain.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Delay between open-state re-checks while disconnected.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Total time a request may wait for the connection to come back.
    pub fn retry_grace(mut self, grace: Duration) -> Self {
        self.config.retry_grace = grace;
        self
    }

    /// Replaces the whole configuration at once.
    pub fn config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the driver. With `blocking` set (the default) this resolves
    /// only once the session is open, or fails with
    /// [`Error::FailedConnection`] at the deadline; otherwise it returns
    /// immediately and readiness is observed through [`Driver::ready`].
    pub async fn build(self) -> DriverResult<Driver> {
        let blocking = self.config.connect.blocking;
        let driver = self.start();
        if blocking {
            if let Err(e) = driver.ready().await {
                driver.connection.abort();
                return Err(e);
            }
        }
        Ok(driver)
    }

    /// Non-blocking construction: starts the handshake and returns at once.
    pub fn build_async(mut self) -> Driver {
        self.config.connect.blocking = false;
        self.start()
    }

    fn start(self) -> Driver {
        let uri = format!("ws://{}:{}", self.host, self.port);
        let bus = Arc::new(EventBus::new());
        let pending = Arc::new(PendingRequests::new());
        bus.register(Arc::new(ReceiveListener::new(pending.clone())));

        let connection = Arc::new(Connection::open(
            uri,
            self.authorization.clone(),
            self.config.connect.timeout,
            bus.clone(),
        ));
        let shutdown = Arc::new(AtomicBool::new(false));
        let requests = RequestManager::new(
            connection.clone(),
            pending.clone(),
            self.authorization,
            self.config.clone(),
            shutdown.clone(),
        );

        Driver {
            config: self.config,
            bus,
            pending,
            connection,
            requests,
            shutdown,
        }
    }
}

/// Shared handle to one PetalDB session.
#[derive(Clone)]
pub struct Driver {
    config: DriverConfig,
    bus: Arc<EventBus>,
    pending: Arc<PendingRequests>,
    connection: Arc<Connection>,
    requests: RequestManager,
    shutdown: Arc<AtomicBool>,
}

impl Driver {
    /// Resolves once the initial handshake settles: `Ok` when the session
    /// reached open state, [`Error::FailedConnection`] when it failed or the
    /// deadline elapsed. Nothing blocks while waiting.
    pub async fn ready(&self) -> DriverResult<()> {
        self.connection
            .wait_ready(self.config.connect.timeout)
            .await
            .map_err(|e| Error::FailedConnection(e.to_string()))
    }

    /// Retrieves one document.
    pub async fn get(
        &self,
        database: &str,
        collection: &str,
        identifier: &str,
    ) -> DriverResult<Value> {
        let reply = self
            .requests
            .send(
                RequestEnvelope::builder(Method::Get)
                    .database(database)
                    .collection(collection)
                    .identifier(identifier),
            )
            .await?;
        Ok(reply.document()?)
    }

    /// Stores a document under `identifier`, returning it as the server
    /// acknowledged it.
    pub async fn add(
        &self,
        database: &str,
        collection: &str,
        identifier: &str,
        document: &Value,
    ) -> DriverResult<Value> {
        let reply = self
            .requests
            .send(
                RequestEnvelope::builder(Method::Add)
                    .database(database)
                    .collection(collection)
                    .identifier(identifier)
                    .value(Value::String(document.to_string())),
            )
            .await?;
        Ok(reply.document()?)
    }

    /// Sets one key of a document (adding it when absent) and returns the
    /// updated document.
    pub async fn update<V: Serialize>(
        &self,
        database: &str,
        collection: &str,
        identifier: &str,
        key: &str,
        value: V,
    ) -> DriverResult<Value> {
        let reply = self
            .requests
            .send(
                RequestEnvelope::builder(Method::Update)
                    .database(database)
                    .collection(collection)
                    .identifier(identifier)
                    .key(key)
                    .value(serde_json::to_value(value)?),
            )
            .await?;
        Ok(reply.document()?)
    }

    /// Sets several keys at once; keys and values pair positionally on the
    /// wire.
    pub async fn update_many(
        &self,
        database: &str,
        collection: &str,
        identifier: &str,
        entries: &HashMap<String, Value>,
    ) -> DriverResult<Value> {
        let (keys, values): (Vec<String>, Vec<Value>) =
            entries.iter().map(|(k, v)| (k.clone(), v.clone())).unzip();
        let reply = self
            .requests
            .send(
                RequestEnvelope::builder(Method::Update)
                    .database(database)
                    .collection(collection)
                    .identifier(identifier)
                    .keys(keys)
                    .value(Value::Array(values)),
            )
            .await?;
        Ok(reply.document()?)
    }

    /// Removes one key from a document and returns the updated document.
    pub async fn remove_key(
        &self,
        database: &str,
        collection: &str,
        identifier: &str,
        key: &str,
    ) -> DriverResult<Value> {
        let reply = self
            .requests
            .send(
                RequestEnvelope::builder(Method::Delete)
                    .database(database)
                    .collection(collection)
                    .identifier(identifier)
                    .key(key),
            )
            .await?;
        Ok(reply.document()?)
    }

    /// Removes several keys from a document.
    pub async fn remove_keys(
        &self,
        database: &str,
        collection: &str,
        identifier: &str,
        keys: &[&str],
    ) -> DriverResult<Value> {
        let reply = self
            .requests
            .send(
                RequestEnvelope::builder(Method::Delete)
                    .database(database)
                    .collection(collection)
                    .identifier(identifier)
                    .keys(keys.iter().copied()),
            )
            .await?;
        Ok(reply.document()?)
    }

    /// Removes a whole document. Returns whether the deletion was
    /// acknowledged.
    pub async fn remove(
        &self,
        database: &str,
        collection: &str,
        identifier: &str,
    ) -> DriverResult<bool> {
        let reply = self
            .requests
            .send(
                RequestEnvelope::builder(Method::Delete)
                    .database(database)
                    .collection(collection)
                    .identifier(identifier),
            )
            .await?;
        Ok(reply.is_success())
    }

    /// Removes an entire collection including its data.
    pub async fn remove_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> DriverResult<bool> {
        let reply = self
            .requests
            .send(
                RequestEnvelope::builder(Method::Drop)
                    .database(database)
                    .collection(collection),
            )
            .await?;
        Ok(reply.is_success())
    }

    /// Removes an entire database including its data.
    pub async fn remove_database(&self, database: &str) -> DriverResult<bool> {
        let reply = self
            .requests
            .send(RequestEnvelope::builder(Method::Drop).database(database))
            .await?;
        Ok(reply.is_success())
    }

    /// Restores the previous stored version of a document and returns it.
    pub async fn revert(
        &self,
        database: &str,
        collection: &str,
        identifier: &str,
    ) -> DriverResult<Value> {
        let reply = self
            .requests
            .send(
                RequestEnvelope::builder(Method::Revert)
                    .database(database)
                    .collection(collection)
                    .identifier(identifier),
            )
            .await?;
        Ok(reply.document()?)
    }

    /// Retrieves a whole database as structured entities.
    pub async fn aggregate_database(&self, database: &str) -> DriverResult<AggregatedDatabase> {
        self.aggregate_database_inner(database, None).await
    }

    /// Retrieves a whole database, keeping only the items whose `key` field
    /// satisfies `filter`.
    pub async fn filter_database(
        &self,
        database: &str,
        key: &str,
        filter: Filter,
    ) -> DriverResult<AggregatedDatabase> {
        self.aggregate_database_inner(database, Some((key, &filter)))
            .await
    }

    async fn aggregate_database_inner(
        &self,
        database: &str,
        filter: Option<(&str, &Filter)>,
    ) -> DriverResult<AggregatedDatabase> {
        let reply = self
            .requests
            .send(RequestEnvelope::builder(Method::Aggregate).database(database))
            .await?;
        let dump = reply.dump(database).ok_or_else(|| AggregateError::MissingDump {
            name: database.to_string(),
        })?;
        Ok(AggregatedDatabase::from_dump(database, dump, filter)?)
    }

    /// Retrieves one collection as structured entities.
    pub async fn aggregate_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> DriverResult<AggregatedCollection> {
        self.aggregate_collection_inner(database, collection, None)
            .await
    }

    /// Retrieves one collection, keeping only the items whose `key` field
    /// satisfies `filter`.
    pub async fn filter_collection(
        &self,
        database: &str,
        collection: &str,
        key: &str,
        filter: Filter,
    ) -> DriverResult<AggregatedCollection> {
        self.aggregate_collection_inner(database, collection, Some((key, &filter)))
            .await
    }

    async fn aggregate_collection_inner(
        &self,
        database: &str,
        collection: &str,
        filter: Option<(&str, &Filter)>,
    ) -> DriverResult<AggregatedCollection> {
        let reply = self
            .requests
            .send(
                RequestEnvelope::builder(Method::Aggregate)
                    .database(database)
                    .collection(collection),
            )
            .await?;
        let dump = reply
            .dump(collection)
            .ok_or_else(|| AggregateError::MissingDump {
                name: collection.to_string(),
            })?;
        Ok(AggregatedCollection::from_dump(collection, dump, filter)?)
    }

    /// Gracefully shuts the driver down: stops admitting requests, drains
    /// outstanding ones (polling once per second, bounded by the configured
    /// shutdown timeout, logging the ids still in flight), then closes the
    /// connection with code 1000 and `message`.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, message: &str) {
        self.shutdown.store(true, Ordering::SeqCst);

        if !self.pending.is_empty() {
            let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
            while !self.pending.is_empty() {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    break;
                }
                info!(
                    "waiting for requests: [{}] to complete...",
                    self.pending.outstanding().join(", ")
                );
                tokio::time::sleep(Duration::from_secs(1).min(deadline - now)).await;
            }
        }

        info!("the client is now closing down");
        self.connection.close(NORMAL_CLOSE, message).await;
    }

    /// [`Driver::shutdown`] with the default close message.
    pub async fn shutdown_default(&self) {
        self.shutdown(DEFAULT_SHUTDOWN_MESSAGE).await;
    }

    /// Runs the graceful shutdown on a background task.
    pub fn shutdown_async(&self, message: &str) -> JoinHandle<()> {
        let driver = self.clone();
        let message = message.to_string();
        tokio::spawn(async move { driver.shutdown(&message).await })
    }

    /// Closes immediately, abandoning outstanding requests; their waiters
    /// observe the correlation timeout and report failure to their callers.
    #[instrument(skip(self))]
    pub async fn force_shutdown(&self, message: &str) {
        self.shutdown.store(true, Ordering::SeqCst);
        debug!("the client is now closing down");
        self.connection.close(NORMAL_CLOSE, message).await;
    }

    /// [`Driver::force_shutdown`] with the default close message.
    pub async fn force_shutdown_default(&self) {
        self.force_shutdown(DEFAULT_SHUTDOWN_MESSAGE).await;
    }

    /// The event bus carrying open/close/receive events of this session.
    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// The connection's most recent terminal error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.connection.last_error()
    }

    /// Correlation ids still awaiting a reply.
    pub fn outstanding_requests(&self) -> Vec<String> {
        self.pending.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_wires_config() {
        let builder = DriverBuilder::new("localhost", 5995, "token")
            .timeout(Duration::from_secs(2))
            .blocking(false)
            .request_timeout(Duration::from_millis(750))
            .shutdown_timeout(Duration::from_secs(3))
            .retry_delay(Duration::from_millis(50))
            .retry_grace(Duration::from_secs(1));
        assert_eq!(builder.config.connect.timeout, Duration::from_secs(2));
        assert!(!builder.config.connect.blocking);
        assert_eq!(builder.config.request_timeout, Duration::from_millis(750));
        assert_eq!(builder.config.shutdown_timeout, Duration::from_secs(3));
        assert_eq!(builder.config.retry_delay, Duration::from_millis(50));
        assert_eq!(builder.config.retry_grace, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_are_inactive() {
        // Nothing listens on this endpoint; the admission check must reject
        // before the connection state is ever consulted.
        let driver = DriverBuilder::new("127.0.0.1", 1, "token").build_async();
        driver.force_shutdown("closing").await;
        assert!(driver.is_shut_down());

        let outcome = driver.get("db", "col", "id").await;
        assert!(matches!(outcome, Err(Error::Inactive)));
        let outcome = driver.remove_database("db").await;
        assert!(matches!(outcome, Err(Error::Inactive)));
    }

    #[tokio::test]
    async fn test_ready_fails_against_dead_endpoint() {
        let driver = DriverBuilder::new("127.0.0.1", 1, "token")
            .timeout(Duration::from_millis(500))
            .build_async();
        let outcome = driver.ready().await;
        assert!(matches!(outcome, Err(Error::FailedConnection(_))));
    }

    #[tokio::test]
    async fn test_blocking_build_fails_against_dead_endpoint() {
        let outcome = DriverBuilder::new("127.0.0.1", 1, "token")
            .timeout(Duration::from_millis(500))
            .build()
            .await;
        assert!(matches!(outcome, Err(Error::FailedConnection(_))));
    }
}
