//! Core abstractions for resumable RPC sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionEvent` - Append-only log entries
//! - `RequestTable` - Request state derived from the log
//! - `sync` - Pure helpers reconciling a log with a store
//! - `RequestManager` - Correlation of outbound requests
//! - `SessionStore`, `Transport` and `ConnectionContext` contracts

pub mod catalog;
pub mod context;
pub mod correlation;
pub mod error;
pub mod event;
pub mod event_feed;
pub mod protocol;
pub mod request;
pub mod store;
pub mod sync;
pub mod transport;

pub use catalog::{Catalog, Keyed};
pub use context::{ChannelWriter, ConnectionContext, Outbound};
pub use correlation::{HANDSHAKE_REQUEST_ID, PendingRequest, RequestManager};
pub use error::{ChannelError, RequestError, SessionError, TransportError};
pub use event::{EventId, EventPayload, NewEvent, SessionEvent, Side};
pub use event_feed::EventFeed;
pub use protocol::{ErrorObject, Message, MessageKind, RequestId};
pub use request::{RequestOutcome, RequestStatus, RequestTable, SessionRequest};
pub use store::{SessionId, SessionSnapshot, SessionStore, StoreCapabilities, StoreError};
pub use transport::Transport;
