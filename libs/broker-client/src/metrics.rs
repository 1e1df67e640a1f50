//! Broker client metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!` and
//! registered in the default prometheus registry. Registration failures are
//! fatal, a duplicate metric name is a programming error.

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGaugeVec, register_int_counter, register_int_counter_vec,
    register_int_gauge_vec,
};

lazy_static! {
    /// Messages accepted into the outbound buffer
    pub static ref MESSAGES_PUBLISHED: IntCounter = register_int_counter!(
        "broker_client_messages_published",
        "count of messages accepted into the outbound buffer"
    ).unwrap();

    /// Messages handed to the broker link
    pub static ref MESSAGES_SENT: IntCounter = register_int_counter!(
        "broker_client_messages_sent",
        "count of messages handed to the broker"
    ).unwrap();

    /// Messages the broker refused individually
    pub static ref MESSAGES_REJECTED: IntCounter = register_int_counter!(
        "broker_client_messages_rejected",
        "count of outbound messages rejected by the broker"
    ).unwrap();

    /// Deliveries handed to subscription callbacks
    pub static ref MESSAGES_DELIVERED: IntCounter = register_int_counter!(
        "broker_client_messages_delivered",
        "count of deliveries dispatched to subscription callbacks"
    ).unwrap();

    /// Deliveries dropped because a subscription exceeded its pending limit
    pub static ref MESSAGES_DROPPED: IntCounter = register_int_counter!(
        "broker_client_messages_dropped",
        "count of deliveries dropped for slow consumers"
    ).unwrap();

    pub static ref BACKPRESSURE_REJECTIONS: IntCounter = register_int_counter!(
        "broker_client_backpressure_rejections",
        "count of publishes rejected because the outbound buffer was full"
    ).unwrap();

    pub static ref FLUSHES: IntCounter = register_int_counter!(
        "broker_client_flushes",
        "count of completed flushes"
    ).unwrap();

    pub static ref RECONNECTS: IntCounter = register_int_counter!(
        "broker_client_reconnects",
        "count of successful reconnects after transport loss"
    ).unwrap();

    pub static ref HANDLER_PANICS: IntCounter = register_int_counter!(
        "broker_client_handler_panics",
        "count of subscription callbacks that panicked"
    ).unwrap();

    /// Request outcomes labeled fulfilled, timed_out or cancelled
    pub static ref REQUESTS: IntCounterVec = register_int_counter_vec!(
        "broker_client_requests",
        "count of finished requests by outcome",
        &["outcome"]
    ).unwrap();

    /// Connection state as its numeric code per endpoint, see
    /// `ConnectionState::code`
    pub static ref CONNECTION_STATE: IntGaugeVec = register_int_gauge_vec!(
        "broker_client_connection_state",
        "current connection state code",
        &["endpoint"]
    ).unwrap();
}
