//! NATS transport backed by `async-nats`.
//!
//! Each link wraps one `async_nats::Client`. Broker-side subscriptions are
//! forwarded into the link's delivery channel by one task per subscription.
//!
//! Reconnecting belongs to the connection manager, which replaces the whole
//! client and replays subscriptions and unacknowledged publishes. The
//! library is therefore left a single reconnect attempt that is parked for
//! [`PARKED_RECONNECT_DELAY`] once the link is established. Loss is reported
//! by the client's `Disconnected`/`Closed` events, with a state poll as a
//! backstop for events dropped on a full event channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::connection::State;
use async_nats::{ConnectOptions, Event, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Connector, Delivery, Link, LinkParts, TransportError, TransportResult};
use crate::message::{Headers, Message};
use crate::options::ConnectionOptions;
use crate::router::SubscriptionId;
use crate::subject::SubjectPattern;

/// Delay before the library's own reconnect attempt. The link is replaced
/// long before it fires.
pub const PARKED_RECONNECT_DELAY: Duration = Duration::from_secs(3600);

/// Opens links to a NATS server.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsConnector;

impl NatsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(
        &self,
        endpoint: &str,
        options: &ConnectionOptions,
    ) -> TransportResult<LinkParts> {
        let lost = CancellationToken::new();
        let established = Arc::new(AtomicBool::new(false));
        let client = ConnectOptions::new()
            .name(&options.name)
            .connection_timeout(options.connect_timeout)
            // zero would mean unlimited
            .max_reconnects(1)
            .reconnect_delay_callback({
                let established = established.clone();
                move |_attempts| {
                    if established.load(Ordering::Acquire) {
                        PARKED_RECONNECT_DELAY
                    } else {
                        Duration::ZERO
                    }
                }
            })
            .event_callback({
                let lost = lost.clone();
                move |event| {
                    let lost = lost.clone();
                    async move { on_event(event, &lost) }
                }
            })
            .connect(endpoint)
            .await
            .map_err(|e| TransportError::Unreachable(format!("{endpoint}: {e}")))?;
        established.store(true, Ordering::Release);

        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = spawn_state_monitor(client.clone(), lost.clone(), options.state_poll_interval);
        debug!(endpoint, "nats link opened");

        Ok(LinkParts {
            link: Box::new(NatsLink {
                client,
                tx,
                lost,
                forwarders: Mutex::new(HashMap::new()),
                monitor,
            }),
            deliveries: rx,
        })
    }
}

fn on_event(event: Event, lost: &CancellationToken) {
    match event {
        Event::Disconnected | Event::Closed => {
            if !lost.is_cancelled() {
                warn!(%event, "nats link lost");
                lost.cancel();
            }
        }
        Event::SlowConsumer(sid) => warn!(sid, "nats reports slow consumer"),
        Event::ServerError(err) => warn!(error = %err, "nats server error"),
        other => debug!(event = %other, "nats event"),
    }
}

/// Whether the client can still carry traffic. `Pending` means the library
/// is between connections, which already counts as lost here.
fn is_live(state: &State) -> bool {
    matches!(state, State::Connected)
}

/// Cancel `lost` once the client leaves the connected state.
fn spawn_state_monitor(
    client: async_nats::Client,
    lost: CancellationToken,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = lost.cancelled() => return,
                _ = ticker.tick() => {
                    let state = client.connection_state();
                    if !is_live(&state) {
                        warn!(%state, "nats client is no longer connected");
                        lost.cancel();
                        return;
                    }
                }
            }
        }
    })
}

#[derive(Debug)]
struct NatsLink {
    client: async_nats::Client,
    tx: mpsc::UnboundedSender<Delivery>,
    lost: CancellationToken,
    forwarders: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    monitor: JoinHandle<()>,
}

impl NatsLink {
    /// Classify a library error: a dead client means the link is gone,
    /// anything else only affects the one operation.
    fn classify(&self, err: impl std::fmt::Display) -> TransportError {
        if self.lost.is_cancelled() || !is_live(&self.client.connection_state()) {
            TransportError::Closed
        } else {
            TransportError::Rejected(err.to_string())
        }
    }
}

#[async_trait]
impl Link for NatsLink {
    async fn send(&self, message: &Message) -> TransportResult<()> {
        let subject = message.subject().to_owned();
        let payload = message.payload().clone();
        let res = match (message.reply(), message.headers()) {
            (None, None) => self.client.publish(subject, payload).await,
            (Some(reply), None) => {
                self.client
                    .publish_with_reply(subject, reply.to_owned(), payload)
                    .await
            }
            (None, Some(headers)) => {
                self.client
                    .publish_with_headers(subject, to_header_map(headers), payload)
                    .await
            }
            (Some(reply), Some(headers)) => {
                self.client
                    .publish_with_reply_and_headers(
                        subject,
                        reply.to_owned(),
                        to_header_map(headers),
                        payload,
                    )
                    .await
            }
        };
        res.map_err(|e| self.classify(e))
    }

    async fn subscribe(
        &self,
        sid: SubscriptionId,
        pattern: &SubjectPattern,
    ) -> TransportResult<()> {
        if self.forwarders.lock().contains_key(&sid) {
            return Ok(());
        }
        let subscriber = self
            .client
            .subscribe(pattern.as_str().to_owned())
            .await
            .map_err(|e| self.classify(e))?;

        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut subscriber = subscriber;
            while let Some(msg) = subscriber.next().await {
                if tx
                    .send(Delivery {
                        sid,
                        message: from_nats(msg),
                    })
                    .is_err()
                {
                    break;
                }
            }
            trace!(subscription = %sid, "nats forwarder finished");
        });
        self.forwarders.lock().insert(sid, handle);
        Ok(())
    }

    async fn unsubscribe(&self, sid: SubscriptionId) -> TransportResult<()> {
        // dropping the subscriber inside the aborted task sends UNSUB
        if let Some(handle) = self.forwarders.lock().remove(&sid) {
            handle.abort();
        }
        Ok(())
    }

    async fn flush(&self) -> TransportResult<()> {
        self.client.flush().await.map_err(|e| self.classify(e))
    }

    fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    async fn close(&self) {
        if let Err(err) = self.client.flush().await {
            debug!(error = %err, "final flush on close failed");
        }
        self.abort_tasks();
        debug!("nats link closed");
    }
}

impl NatsLink {
    fn abort_tasks(&self) {
        for (_, handle) in self.forwarders.lock().drain() {
            handle.abort();
        }
        self.monitor.abort();
    }
}

impl Drop for NatsLink {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

fn from_nats(msg: async_nats::Message) -> Message {
    let mut message = Message::new(msg.subject.to_string(), msg.payload);
    if let Some(reply) = msg.reply {
        message = message.with_reply(reply.to_string());
    }
    if let Some(headers) = msg.headers {
        let headers: Headers = headers
            .iter()
            .filter_map(|(name, values)| {
                values
                    .first()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();
        message = message.with_headers(headers);
    }
    message
}
