//! # broker-client
//!
//! Publish/subscribe and request/reply client for a NATS style broker.
//!
//! This library provides:
//! - **Connection manager** with reconnect/backoff, graceful drain and
//!   immediate close, observable through a state watch.
//! - **Subject router** dispatching each subscription on its own task, with
//!   `*` and `>` wildcard patterns.
//! - **Publisher** with a bounded outbound buffer, backpressure and flush.
//! - **Request/reply** over generated inbox subjects with timeout and
//!   cancellation.
//!
//! Two transports ship with the crate: [`NatsConnector`] on top of
//! `async-nats`, used by [`Connection::connect`], and the in-process
//! [`MemoryBroker`] for tests and demos.

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod connection;
pub mod error;
pub mod message;
pub mod metrics;
pub mod options;
mod publisher;
pub mod request;
pub mod router;
pub mod subject;
pub mod transport;

pub use connection::{Connection, ConnectionState};
pub use error::{ClientError, ClientResult};
pub use message::{Headers, Message};
pub use options::ConnectionOptions;
pub use request::{INBOX_PREFIX, PendingRequest, RequestState, new_inbox};
pub use router::{Subscription, SubscriptionId};
pub use subject::{SubjectError, SubjectPattern, validate_subject};
pub use transport::{Connector, Link, MemoryBroker, NatsConnector, TransportError};
