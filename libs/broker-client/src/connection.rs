//! Connection manager with reconnect/backoff, graceful drain and close.
//!
//! A [`Connection`] owns one background task that holds the current broker
//! link. The task services two queues: a control queue for subscription
//! changes and the bounded outbound queue for publishes and flush markers.
//! Control commands are always handled first, so a subscription registered
//! before a publish is active at the broker before that publish is sent.
//!
//! On transport loss the task reconnects with exponential backoff and replays
//! every registered subscription on the new link. Messages the old link never
//! acknowledged with a flush are resent before the queue continues, so a
//! flush only succeeds once everything before it reached the broker. Every
//! link operation is raced against loss and shutdown, so a stuck send never
//! hides a disconnect.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{ClientError, ClientResult};
use crate::message::Message;
use crate::metrics::{CONNECTION_STATE, MESSAGES_REJECTED, MESSAGES_SENT, RECONNECTS};
use crate::options::ConnectionOptions;
use crate::router::{SubjectRouter, Subscription, SubscriptionId};
use crate::subject::SubjectPattern;
use crate::transport::{
    Connector, Delivery, Link, LinkParts, NatsConnector, TransportError, TransportResult,
};

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Transport lost, reconnecting with backoff.
    Reconnecting,
    /// Graceful shutdown in progress.
    Draining,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Nothing leaves `Closed`, anything else may close. Apart from the
    /// `Connected`/`Reconnecting` pair, transitions only move forward.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Reconnecting) | (Reconnecting, Connected) => true,
            (Connecting | Connected | Reconnecting, Draining) => true,
            _ => false,
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }

    pub(crate) fn code(self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Draining => 4,
            ConnectionState::Closed => 5,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Draining => "draining",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Entry of the outbound queue.
#[derive(Debug)]
pub(crate) enum Outbound {
    Message(Message),
    /// Acknowledged once everything queued before it has been flushed.
    Flush(oneshot::Sender<()>),
}

#[derive(Debug)]
pub(crate) enum Control {
    Subscribe(SubscriptionId, SubjectPattern),
    Unsubscribe(SubscriptionId),
}

/// State shared between connection handles and the connection task.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) endpoint: String,
    pub(crate) options: ConnectionOptions,
    state_tx: watch::Sender<ConnectionState>,
    pub(crate) router: SubjectRouter,
    pub(crate) outbound_tx: mpsc::Sender<Outbound>,
    control_tx: mpsc::UnboundedSender<Control>,
    publishes_closed: AtomicBool,
    reconnects: AtomicU64,
    shutdown: CancellationToken,
}

impl Shared {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Apply a state transition. Returns false if the state machine does not
    /// allow it.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut prev = next;
        let changed = self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                prev = *state;
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            CONNECTION_STATE
                .with_label_values(&[&self.endpoint])
                .set(next.code());
            debug!(endpoint = %self.endpoint, from = %prev, to = %next, "connection state changed");
        }
        changed
    }

    /// Fails once the connection no longer accepts publishes.
    pub(crate) fn check_publishable(&self) -> ClientResult<()> {
        if self.state().is_closed() || self.publishes_closed.load(Ordering::Acquire) {
            return Err(self.publish_refused());
        }
        Ok(())
    }

    /// Error for a publish the connection can no longer carry.
    pub(crate) fn publish_refused(&self) -> ClientError {
        ClientError::Publish(format!("connection is {}", self.state()))
    }

    /// Close without draining: stop publishes, discard queued deliveries.
    fn mark_closed(&self) {
        self.publishes_closed.store(true, Ordering::Release);
        self.transition(ConnectionState::Closed);
        self.router.abort();
    }
}

struct Inner {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

/// Handle to one logical broker connection.
///
/// Cloning is cheap and every clone refers to the same connection. When the
/// last handle is dropped the background task shuts down without draining.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connect to a NATS server at `endpoint`.
    pub async fn connect(
        endpoint: impl Into<String>,
        options: ConnectionOptions,
    ) -> ClientResult<Connection> {
        Self::connect_with(NatsConnector::new(), endpoint, options).await
    }

    /// Connect through any [`Connector`].
    pub async fn connect_with<C: Connector>(
        connector: C,
        endpoint: impl Into<String>,
        options: ConnectionOptions,
    ) -> ClientResult<Connection> {
        let endpoint = endpoint.into();
        let (outbound_tx, outbound_rx) = mpsc::channel(options.outbound_capacity.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(Shared {
            router: SubjectRouter::new(options.max_pending_per_subscription),
            endpoint,
            options,
            state_tx,
            outbound_tx,
            control_tx,
            publishes_closed: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        shared.transition(ConnectionState::Connecting);
        let parts = match initial_connect(&connector, &shared).await {
            Ok(parts) => parts,
            Err(err) => {
                shared.mark_closed();
                return Err(err);
            }
        };
        shared.transition(ConnectionState::Connected);

        let task = ConnectionTask {
            connector: Box::new(connector),
            shared: shared.clone(),
            outbound_rx,
            control_rx,
            replay: VecDeque::new(),
            unacked: Vec::new(),
        };
        let handle = tokio::spawn(task.run(parts));

        Ok(Connection {
            inner: Arc::new(Inner {
                shared,
                task: Mutex::new(Some(handle)),
            }),
        })
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    pub fn state(&self) -> ConnectionState {
        self.shared().state()
    }

    /// Receiver that observes every state change.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared().state_watch()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn endpoint(&self) -> &str {
        &self.shared().endpoint
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.shared().options
    }

    /// Successful reconnects since connect.
    pub fn reconnects(&self) -> u64 {
        self.shared().reconnects.load(Ordering::Relaxed)
    }

    /// Number of live subscriptions, including transient request inboxes.
    pub fn subscription_count(&self) -> usize {
        self.shared().router.len()
    }

    /// Register `handler` for every message matching `pattern`.
    ///
    /// Each subscription dispatches on its own task, in arrival order. A
    /// handler that panics is logged and the subscription keeps running.
    pub async fn subscribe<F, Fut>(&self, pattern: &str, handler: F) -> ClientResult<Subscription>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let pattern = SubjectPattern::parse(pattern)?;
        let shared = self.shared();
        if matches!(
            shared.state(),
            ConnectionState::Draining | ConnectionState::Closed
        ) {
            return Err(ClientError::Closed);
        }

        let (id, stats) = shared.router.register(pattern.clone(), handler)?;
        if shared
            .control_tx
            .send(Control::Subscribe(id, pattern.clone()))
            .is_err()
        {
            shared.router.remove(id);
            return Err(ClientError::Closed);
        }
        Ok(Subscription::new(id, pattern, stats, self.clone()))
    }

    pub(crate) fn remove_subscription(&self, id: SubscriptionId) -> bool {
        let shared = self.shared();
        if !shared.router.remove(id) {
            return false;
        }
        // the task may be gone already, then there is nothing to unsubscribe
        let _ = shared.control_tx.send(Control::Unsubscribe(id));
        true
    }

    /// Gracefully shut the connection down.
    ///
    /// Removes every subscription, waits for already received deliveries to
    /// be handled, stops accepting publishes, flushes and closes the link,
    /// all within `drain_timeout`. The connection is `Closed` afterwards even
    /// when this returns [`ClientError::Drain`]. Calling it again, or after
    /// [`Connection::close`], returns `Ok(())` immediately.
    pub async fn drain(&self) -> ClientResult<()> {
        let shared = self.shared();
        if !shared.transition(ConnectionState::Draining) {
            debug!(state = %shared.state(), "drain requested, nothing to do");
            return Ok(());
        }
        info!(endpoint = %shared.endpoint, "draining connection");
        let deadline = Instant::now() + shared.options.drain_timeout;
        let mut failures = Vec::new();

        for id in shared.router.close() {
            let _ = shared.control_tx.send(Control::Unsubscribe(id));
        }
        if !shared.router.wait_idle(deadline).await {
            failures.push("subscription callbacks still running".to_owned());
        }

        shared.publishes_closed.store(true, Ordering::Release);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Err(err) = self.flush_within(remaining).await {
            failures.push(err.to_string());
        }

        self.stop_task(shared.options.connect_timeout).await;
        shared.transition(ConnectionState::Closed);

        if failures.is_empty() {
            info!(endpoint = %shared.endpoint, "connection drained");
            Ok(())
        } else {
            let reason = failures.join("; ");
            warn!(endpoint = %shared.endpoint, %reason, "drain did not complete in time");
            Err(ClientError::Drain(reason))
        }
    }

    /// Close immediately, discarding buffered publishes and queued
    /// deliveries.
    pub async fn close(&self) {
        let shared = self.shared();
        let was = shared.state();
        shared.mark_closed();
        self.stop_task(shared.options.connect_timeout).await;
        if !was.is_closed() {
            info!(endpoint = %shared.endpoint, "connection closed");
        }
    }

    async fn stop_task(&self, grace: Duration) {
        self.shared().shutdown.cancel();
        let handle = self.inner.task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("connection task did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

async fn open_link(
    connector: &dyn Connector,
    endpoint: &str,
    options: &ConnectionOptions,
) -> TransportResult<LinkParts> {
    match tokio::time::timeout(options.connect_timeout, connector.connect(endpoint, options)).await
    {
        Ok(res) => res,
        Err(_) => Err(TransportError::Unreachable(format!(
            "connect timed out after {:?}",
            options.connect_timeout
        ))),
    }
}

/// Backoff for `attempt` plus a random jitter.
fn backoff_with_jitter(options: &ConnectionOptions, attempt: u32) -> Duration {
    let jitter_ms = options.reconnect_jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    options.backoff(attempt) + Duration::from_millis(jitter)
}

async fn initial_connect(connector: &dyn Connector, shared: &Shared) -> ClientResult<LinkParts> {
    let options = &shared.options;
    let total_attempts = options.connect_retries.saturating_add(1);
    info!(endpoint = %shared.endpoint, total_attempts, "connecting to broker");

    let mut attempt = 0;
    loop {
        match open_link(connector, &shared.endpoint, options).await {
            Ok(parts) => {
                info!(
                    endpoint = %shared.endpoint,
                    attempt = attempt + 1,
                    total_attempts, "broker connection established"
                );
                return Ok(parts);
            }
            Err(err) => {
                let attempt_num = attempt + 1;
                if attempt_num >= total_attempts {
                    error!(
                        endpoint = %shared.endpoint,
                        attempts = total_attempts,
                        error = %err,
                        "broker connection failed after all attempts"
                    );
                    return Err(ClientError::Connection(format!(
                        "{} unreachable after {total_attempts} attempt(s): {err}",
                        shared.endpoint
                    )));
                }
                let delay = backoff_with_jitter(options, attempt);
                warn!(
                    attempt = attempt_num,
                    total_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "broker connection attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt = attempt_num;
            }
        }
    }
}

/// Why the task stopped serving a link.
enum Exit {
    Shutdown,
    Lost,
}

struct ConnectionTask {
    connector: Box<dyn Connector>,
    shared: Arc<Shared>,
    outbound_rx: mpsc::Receiver<Outbound>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    /// Entries to resend on the next link before taking new work.
    replay: VecDeque<Outbound>,
    /// Messages handed to the current link since its last acknowledged
    /// flush. A lost link may have dropped them, so they are replayed.
    unacked: Vec<Message>,
}

impl ConnectionTask {
    async fn run(mut self, mut parts: LinkParts) {
        loop {
            let LinkParts { link, deliveries } = parts;
            let mut reader = tokio::spawn(read_deliveries(self.shared.clone(), deliveries));
            let exit = self.serve(link.as_ref(), &mut reader).await;
            reader.abort();

            match exit {
                Exit::Shutdown => {
                    link.close().await;
                    break;
                }
                Exit::Lost => {
                    drop(link);
                    self.requeue_unacked();
                    match self.reconnect().await {
                        Some(next) => parts = next,
                        None => break,
                    }
                }
            }
        }
        trace!(endpoint = %self.shared.endpoint, "connection task finished");
    }

    async fn serve(&mut self, link: &dyn Link, reader: &mut JoinHandle<()>) -> Exit {
        let lost = link.lost();
        while let Some(out) = self.replay.pop_front() {
            if let Err(exit) = self.write(link, &lost, out).await {
                return exit;
            }
        }

        loop {
            let res = tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => return Exit::Shutdown,
                _ = lost.cancelled() => return Exit::Lost,
                _ = &mut *reader => return Exit::Lost,
                Some(control) = self.control_rx.recv() => self.apply(link, &lost, control).await,
                Some(out) = self.outbound_rx.recv() => self.write(link, &lost, out).await,
            };
            if let Err(exit) = res {
                return exit;
            }
        }
    }

    /// Hand one outbound entry to the link. On error the entry is kept for
    /// the next link.
    async fn write(
        &mut self,
        link: &dyn Link,
        lost: &CancellationToken,
        out: Outbound,
    ) -> Result<(), Exit> {
        match out {
            Outbound::Message(message) => {
                let res = guarded(&self.shared.shutdown, lost, link.send(&message)).await;
                match res {
                    Ok(Ok(())) => {
                        MESSAGES_SENT.inc();
                        self.unacked.push(message);
                        if self.unacked.len() >= self.shared.options.outbound_capacity {
                            self.checkpoint(link, lost).await?;
                        }
                        Ok(())
                    }
                    Ok(Err(TransportError::Rejected(reason))) => {
                        MESSAGES_REJECTED.inc();
                        warn!(subject = message.subject(), %reason, "broker rejected message");
                        Ok(())
                    }
                    Ok(Err(err)) => {
                        debug!(error = %err, "send failed, keeping message for the next link");
                        self.replay.push_front(Outbound::Message(message));
                        Err(Exit::Lost)
                    }
                    Err(exit) => {
                        debug!("link went away mid send, keeping message for the next link");
                        self.replay.push_front(Outbound::Message(message));
                        Err(exit)
                    }
                }
            }
            Outbound::Flush(ack) => {
                match guarded(&self.shared.shutdown, lost, link.flush()).await {
                    Ok(Ok(())) => {
                        self.unacked.clear();
                        let _ = ack.send(());
                        Ok(())
                    }
                    Ok(Err(TransportError::Rejected(reason))) => {
                        // dropping the ack fails the waiting flush
                        warn!(%reason, "broker rejected flush");
                        Ok(())
                    }
                    Ok(Err(_)) => {
                        self.replay.push_front(Outbound::Flush(ack));
                        Err(Exit::Lost)
                    }
                    Err(exit) => {
                        self.replay.push_front(Outbound::Flush(ack));
                        Err(exit)
                    }
                }
            }
        }
    }

    /// Flush the link once too many messages are unacknowledged, so the
    /// replay buffer stays bounded.
    async fn checkpoint(&mut self, link: &dyn Link, lost: &CancellationToken) -> Result<(), Exit> {
        match guarded(&self.shared.shutdown, lost, link.flush()).await? {
            Ok(()) => {
                self.unacked.clear();
                Ok(())
            }
            Err(TransportError::Rejected(reason)) => {
                warn!(%reason, "broker rejected checkpoint flush");
                Ok(())
            }
            Err(_) => Err(Exit::Lost),
        }
    }

    /// Put messages the lost link never acknowledged in front of the replay
    /// queue, keeping their original order.
    fn requeue_unacked(&mut self) {
        if self.unacked.is_empty() {
            return;
        }
        debug!(count = self.unacked.len(), "replaying unacknowledged messages on the next link");
        for message in self.unacked.drain(..).rev() {
            self.replay.push_front(Outbound::Message(message));
        }
    }

    async fn apply(
        &self,
        link: &dyn Link,
        lost: &CancellationToken,
        control: Control,
    ) -> Result<(), Exit> {
        let res = match control {
            Control::Subscribe(sid, pattern) => {
                if !self.shared.router.contains(sid) {
                    // removed before it reached the broker
                    return Ok(());
                }
                guarded(&self.shared.shutdown, lost, link.subscribe(sid, &pattern)).await?
            }
            Control::Unsubscribe(sid) => {
                guarded(&self.shared.shutdown, lost, link.unsubscribe(sid)).await?
            }
        };
        match res {
            Ok(()) => Ok(()),
            Err(TransportError::Rejected(reason)) => {
                warn!(%reason, "broker rejected subscription change");
                Ok(())
            }
            // the registration snapshot is replayed on the next link
            Err(_) => Err(Exit::Lost),
        }
    }

    async fn reconnect(&mut self) -> Option<LinkParts> {
        let shared = self.shared.clone();
        if shared.state().is_closed() {
            return None;
        }
        // a draining connection keeps its state but still needs a link to flush
        shared.transition(ConnectionState::Reconnecting);
        warn!(endpoint = %shared.endpoint, "broker connection lost, reconnecting");

        let options = &shared.options;
        let mut attempt: u32 = 0;
        loop {
            if options.max_reconnects.is_some_and(|max| attempt >= max) {
                error!(
                    endpoint = %shared.endpoint,
                    attempts = attempt,
                    "giving up reconnecting, closing connection"
                );
                shared.mark_closed();
                return None;
            }

            let delay = backoff_with_jitter(options, attempt);
            attempt += 1;
            let res = tokio::select! {
                _ = shared.shutdown.cancelled() => return None,
                res = async {
                    tokio::time::sleep(delay).await;
                    open_link(self.connector.as_ref(), &shared.endpoint, options).await
                } => res,
            };

            let parts = match res {
                Ok(parts) => parts,
                Err(err) => {
                    warn!(
                        attempt,
                        retry_in_ms = options.backoff(attempt).as_millis() as u64,
                        error = %err,
                        "reconnect attempt failed"
                    );
                    continue;
                }
            };

            // the registration snapshot below covers everything still queued
            while self.control_rx.try_recv().is_ok() {}
            match self.resubscribe(parts.link.as_ref()).await {
                Ok(()) => {}
                Err(Exit::Shutdown) => return None,
                Err(Exit::Lost) => {
                    warn!(attempt, "link lost while resubscribing");
                    continue;
                }
            }

            shared.transition(ConnectionState::Connected);
            shared.reconnects.fetch_add(1, Ordering::Relaxed);
            RECONNECTS.inc();
            info!(
                endpoint = %shared.endpoint,
                attempt,
                subscriptions = shared.router.len(),
                "reconnected to broker"
            );
            return Some(parts);
        }
    }

    async fn resubscribe(&self, link: &dyn Link) -> Result<(), Exit> {
        let lost = link.lost();
        for (sid, pattern) in self.shared.router.registrations() {
            match guarded(&self.shared.shutdown, &lost, link.subscribe(sid, &pattern)).await? {
                Ok(()) => {}
                Err(TransportError::Rejected(reason)) => {
                    warn!(subscription = %sid, %pattern, %reason, "resubscribe rejected");
                }
                Err(_) => return Err(Exit::Lost),
            }
        }
        Ok(())
    }
}

/// Run one link operation unless the task is shut down or the link is lost
/// first. The operation's future is dropped in either case.
async fn guarded<T>(
    shutdown: &CancellationToken,
    lost: &CancellationToken,
    op: impl Future<Output = TransportResult<T>>,
) -> Result<TransportResult<T>, Exit> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(Exit::Shutdown),
        _ = lost.cancelled() => Err(Exit::Lost),
        res = op => Ok(res),
    }
}

/// Route inbound deliveries until the link's delivery stream ends.
async fn read_deliveries(shared: Arc<Shared>, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(Delivery { sid, message }) = deliveries.recv().await {
        shared.router.route(sid, message);
    }
    debug!(endpoint = %shared.endpoint, "delivery stream ended");
}
