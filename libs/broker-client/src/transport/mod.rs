//! Transport seam between the connection manager and the broker.
//!
//! A [`Connector`] establishes a [`Link`]: one live session to the broker.
//! The link carries outbound messages, broker-side subscription changes and
//! flushes; inbound deliveries arrive on the channel returned alongside it.
//! Loss of the session is signalled through [`Link::lost`] or by closing the
//! delivery channel, after which the connection manager reconnects with a
//! fresh link.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::options::ConnectionOptions;
use crate::router::SubscriptionId;
use crate::subject::SubjectPattern;

pub mod memory;
pub mod nats;

pub use memory::MemoryBroker;
pub use nats::NatsConnector;

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The broker could not be reached or refused the handshake.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The link is gone; the operation may succeed on a new link.
    #[error("link closed")]
    Closed,

    /// The broker refused this one operation; the link is still usable.
    #[error("rejected by broker: {0}")]
    Rejected(String),
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A message delivered for one broker-side subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub sid: SubscriptionId,
    pub message: Message,
}

/// An established link plus its inbound delivery stream.
#[derive(Debug)]
pub struct LinkParts {
    pub link: Box<dyn Link>,
    /// Closed when the transport is lost.
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// Establishes links to a broker endpoint.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    /// Open a new link. Called for the initial connect and for every
    /// reconnect attempt.
    async fn connect(&self, endpoint: &str, options: &ConnectionOptions)
    -> TransportResult<LinkParts>;
}

/// One live session to the broker.
///
/// Subscribe and unsubscribe are idempotent per [`SubscriptionId`]. Operations
/// on one link are applied in call order, so a subscription registered before
/// a send is active at the broker before that send is routed.
#[async_trait]
pub trait Link: Send + Sync + fmt::Debug {
    /// Hand one message to the broker.
    async fn send(&self, message: &Message) -> TransportResult<()>;

    /// Register broker-side interest in `pattern`, tagged with `sid`.
    async fn subscribe(&self, sid: SubscriptionId, pattern: &SubjectPattern)
    -> TransportResult<()>;

    /// Remove broker-side interest for `sid`.
    async fn unsubscribe(&self, sid: SubscriptionId) -> TransportResult<()>;

    /// Round trip to the broker: resolves once everything sent before the
    /// call has been acknowledged.
    async fn flush(&self) -> TransportResult<()>;

    /// Token cancelled when the transport is lost.
    fn lost(&self) -> CancellationToken;

    /// Close the session. Unflushed data may be discarded.
    async fn close(&self);
}
