//! Connection events and the request/response engine built on them.
//!
//! The connection task publishes every lifecycle transition to the
//! [`event_bus::EventBus`]: an `Opened` event after each successful
//! (re)connection, a `Closed` event on every closure and a `Received` event
//! for each decoded reply envelope. Listeners run in registration order and
//! are isolated from one another; a failing listener is logged, never
//! propagated into connection handling.
//!
//! ```text
//! ┌────────────┐   publish    ┌──────────┐   on_event   ┌────────────────┐
//! │ connection │─────────────▶│ EventBus │─────────────▶│ ReceiveListener │
//! └────────────┘              └──────────┘              └───────┬────────┘
//!                                                               │ resolve
//!                                                       ┌───────▼────────┐
//!                                                       │ PendingRequests │
//!                                                       └────────────────┘
//! ```
//!
//! [`request_manager::RequestManager`] sits on the caller side of that
//! diagram: it registers a pending slot, transmits the envelope and awaits
//! the slot under the configured bound.

pub mod event_bus;
pub mod request_manager;
