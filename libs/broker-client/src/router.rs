//! Subject router.
//!
//! Every local subscription has one broker-side registration tagged with its
//! [`SubscriptionId`] and one dispatch task. Deliveries are routed by id,
//! checked against the registration's pattern and queued on that
//! subscription's channel, so a message matching several subscriptions is
//! handled exactly once by each of them. Subscriptions run concurrently; a
//! single subscription sees its messages in arrival order.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};

use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::message::Message;
use crate::metrics::{HANDLER_PANICS, MESSAGES_DELIVERED, MESSAGES_DROPPED};
use crate::subject::SubjectPattern;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Default)]
pub(crate) struct SubscriptionStats {
    delivered: AtomicU64,
    pending: AtomicUsize,
    dropped: AtomicU64,
    active: AtomicBool,
}

/// Result of routing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteOutcome {
    Dispatched,
    /// No live subscription with that id, e.g. it was just removed.
    Unknown,
    /// The subject does not match the subscription's pattern.
    Mismatch,
    SlowConsumer,
    Closed,
}

#[derive(Debug)]
struct Route {
    pattern: SubjectPattern,
    tx: mpsc::UnboundedSender<Message>,
    stop: CancellationToken,
    stats: Arc<SubscriptionStats>,
}

#[derive(Debug, Default)]
struct RouterState {
    routes: HashMap<SubscriptionId, Route>,
    closed: bool,
}

#[derive(Debug)]
pub(crate) struct SubjectRouter {
    state: Mutex<RouterState>,
    tracker: TaskTracker,
    /// parent of every subscription's stop token
    abort: CancellationToken,
    max_pending: usize,
}

impl SubjectRouter {
    pub(crate) fn new(max_pending: usize) -> Self {
        Self {
            state: Mutex::new(RouterState::default()),
            tracker: TaskTracker::new(),
            abort: CancellationToken::new(),
            max_pending: max_pending.max(1),
        }
    }

    /// Register `handler` for `pattern` and start its dispatch task.
    pub(crate) fn register<F, Fut>(
        &self,
        pattern: SubjectPattern,
        handler: F,
    ) -> ClientResult<(SubscriptionId, Arc<SubscriptionStats>)>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ClientError::Closed);
        }

        let id = SubscriptionId::next();
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = self.abort.child_token();
        let stats = Arc::new(SubscriptionStats::default());
        stats.active.store(true, Ordering::Release);

        self.tracker
            .spawn(dispatch(id, rx, stop.clone(), handler, stats.clone()));
        state.routes.insert(
            id,
            Route {
                pattern: pattern.clone(),
                tx,
                stop,
                stats: stats.clone(),
            },
        );
        debug!(subscription = %id, %pattern, "subscription registered");
        Ok((id, stats))
    }

    /// Remove a subscription, discarding deliveries it has not started yet.
    /// Returns false if it was already gone.
    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let Some(route) = self.state.lock().routes.remove(&id) else {
            return false;
        };
        route.stop.cancel();
        route.stats.active.store(false, Ordering::Release);
        debug!(subscription = %id, "subscription removed");
        true
    }

    pub(crate) fn contains(&self, id: SubscriptionId) -> bool {
        self.state.lock().routes.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().routes.len()
    }

    /// Route one delivery to the subscription it was registered for.
    pub(crate) fn route(&self, id: SubscriptionId, message: Message) -> RouteOutcome {
        let state = self.state.lock();
        if state.closed {
            return RouteOutcome::Closed;
        }
        let Some(route) = state.routes.get(&id) else {
            trace!(subscription = %id, "delivery for unknown subscription");
            return RouteOutcome::Unknown;
        };
        if !route.pattern.matches(message.subject()) {
            trace!(subscription = %id, subject = message.subject(), "delivery does not match");
            return RouteOutcome::Mismatch;
        }

        if route.stats.pending.load(Ordering::Acquire) >= self.max_pending {
            let dropped = route.stats.dropped.fetch_add(1, Ordering::Relaxed);
            MESSAGES_DROPPED.inc();
            if dropped == 0 {
                warn!(
                    subscription = %id,
                    max_pending = self.max_pending,
                    "slow consumer, dropping deliveries"
                );
            }
            return RouteOutcome::SlowConsumer;
        }

        route.stats.pending.fetch_add(1, Ordering::AcqRel);
        if route.tx.send(message).is_err() {
            route.stats.pending.fetch_sub(1, Ordering::AcqRel);
            return RouteOutcome::Unknown;
        }
        RouteOutcome::Dispatched
    }

    /// Registered subscriptions ordered by id, used to resubscribe after a
    /// reconnect.
    pub(crate) fn registrations(&self) -> Vec<(SubscriptionId, SubjectPattern)> {
        let state = self.state.lock();
        let mut regs: Vec<_> = state
            .routes
            .iter()
            .map(|(id, route)| (*id, route.pattern.clone()))
            .collect();
        regs.sort_by_key(|(id, _)| *id);
        regs
    }

    /// Stop accepting deliveries and registrations. Already queued deliveries
    /// still run. Returns the ids that were registered.
    pub(crate) fn close(&self) -> Vec<SubscriptionId> {
        let routes: Vec<(SubscriptionId, Route)> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.routes.drain().collect()
        };
        self.tracker.close();
        let mut ids: Vec<_> = routes
            .into_iter()
            .map(|(id, route)| {
                // dropping the sender lets the dispatch task finish its queue
                route.stats.active.store(false, Ordering::Release);
                id
            })
            .collect();
        ids.sort();
        ids
    }

    /// Close and discard every queued delivery. In-flight callbacks finish on
    /// their own.
    pub(crate) fn abort(&self) {
        self.close();
        self.abort.cancel();
    }

    /// Wait until every dispatch task has finished. Returns false if the
    /// deadline passed first.
    pub(crate) async fn wait_idle(&self, deadline: Instant) -> bool {
        self.tracker.close();
        tokio::time::timeout_at(deadline, self.tracker.wait())
            .await
            .is_ok()
    }
}

async fn dispatch<F, Fut>(
    id: SubscriptionId,
    mut rx: mpsc::UnboundedReceiver<Message>,
    stop: CancellationToken,
    handler: F,
    stats: Arc<SubscriptionStats>,
) where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = rx.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };
        stats.pending.fetch_sub(1, Ordering::AcqRel);
        stats.delivered.fetch_add(1, Ordering::Relaxed);
        MESSAGES_DELIVERED.inc();

        let subject = message.subject().to_owned();
        let outcome = AssertUnwindSafe(async { handler(message).await })
            .catch_unwind()
            .await;
        if outcome.is_err() {
            HANDLER_PANICS.inc();
            error!(subscription = %id, subject, "subscription callback panicked");
        }
    }
    stats.active.store(false, Ordering::Release);
    stats.pending.store(0, Ordering::Release);
    trace!(subscription = %id, "dispatch task finished");
}

/// Handle to a registered subscription.
///
/// Dropping the handle does not unsubscribe; the callback stays registered
/// until [`Subscription::unsubscribe`] or until the connection drains or
/// closes.
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    pattern: SubjectPattern,
    stats: Arc<SubscriptionStats>,
    connection: Connection,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        pattern: SubjectPattern,
        stats: Arc<SubscriptionStats>,
        connection: Connection,
    ) -> Self {
        Self {
            id,
            pattern,
            stats,
            connection,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn pattern(&self) -> &SubjectPattern {
        &self.pattern
    }

    /// Deliveries handed to the callback so far.
    pub fn delivered(&self) -> u64 {
        self.stats.delivered.load(Ordering::Relaxed)
    }

    /// Deliveries queued but not yet handed to the callback.
    pub fn pending(&self) -> usize {
        self.stats.pending.load(Ordering::Acquire)
    }

    /// Deliveries dropped because the pending limit was reached.
    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.stats.active.load(Ordering::Acquire)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Remove the subscription locally and at the broker. Returns false if
    /// it was already removed.
    pub fn unsubscribe(&self) -> bool {
        self.connection.remove_subscription(self.id)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern.as_str())
            .field("delivered", &self.delivered())
            .field("pending", &self.pending())
            .field("active", &self.is_active())
            .finish()
    }
}
