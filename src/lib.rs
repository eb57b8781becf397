//! # PetalDB client driver
//!
//! An async Rust client for the PetalDB document store. One driver instance
//! owns one persistent WebSocket connection and multiplexes any number of
//! concurrent callers over it; replies arrive out of order and are matched
//! back to their callers by correlation id.
//!
//! ## Architecture
//!
//! - [`connection`]: owns the physical duplex connection; detects closures
//!   and reconnects with linearly increasing backoff.
//! - [`event`]: the event bus ([`event::event_bus`]) distributing
//!   open/close/receive events, and the request manager
//!   ([`event::request_manager`]) correlating requests with replies.
//! - [`aggregate`]: materializes bulk dumps into structured entities with
//!   optional predicate filtering.
//! - [`driver`]: the public operations, construction and shutdown.
//!
//! ```text
//! caller ──▶ Driver ──▶ RequestManager ──▶ Connection ══ ws ══▶ server
//!                         ▲     │register
//!                  resolve│     ▼
//!                  ReceiveListener ◀── EventBus ◀── inbound frames
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use petaldb_client::{DriverBuilder, Filter, NumberComparator};
//!
//! # async fn example() -> petaldb_client::DriverResult<()> {
//! let driver = DriverBuilder::new("localhost", 5995, "token").build().await?;
//!
//! driver
//!     .add("library", "books", "dune", &serde_json::json!({"pages": 412}))
//!     .await?;
//!
//! let thick = driver
//!     .filter_collection("library", "books", "pages", Filter::int(400, NumberComparator::GreaterThan))
//!     .await?;
//! println!("{} thick books", thick.len());
//!
//! driver.shutdown("done for today").await;
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod event;
pub mod protocol;

// Re-exports
pub use aggregate::{
    AggregateError, AggregatedCollection, AggregatedDatabase, Document, Filter, FilterCasing,
    NumberComparator,
};
pub use config::{ConnectOptions, DriverConfig};
pub use connection::{ConnectionError, ConnectionStatus};
pub use driver::{Driver, DriverBuilder, DEFAULT_SHUTDOWN_MESSAGE};
pub use error::{DriverResult, Error};
pub use event::event_bus::{ConnectionEvent, EventBus, Listener, ListenerKind};
pub use protocol::{Method, RequestEnvelope, ResponseEnvelope};
