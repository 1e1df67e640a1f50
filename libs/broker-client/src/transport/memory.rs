//! In-process broker.
//!
//! Routes messages between links opened on the same [`MemoryBroker`] using
//! the same subject matching rules as a real broker. Deliveries are handed
//! over synchronously, so a successful `send` followed by `flush` means every
//! matching subscriber already has the message queued.
//!
//! The broker can be taken offline and its links severed to exercise the
//! reconnect and backpressure paths of a connection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Connector, Delivery, Link, LinkParts, TransportError, TransportResult};
use crate::message::Message;
use crate::options::ConnectionOptions;
use crate::router::SubscriptionId;
use crate::subject::{SubjectPattern, validate_subject};

type LinkId = u64;

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

#[derive(Debug, Default)]
struct BrokerState {
    links: HashMap<LinkId, LinkEntry>,
    next_link: LinkId,
    offline: bool,
    published: u64,
    connects: u64,
}

#[derive(Debug)]
struct LinkEntry {
    subs: HashMap<SubscriptionId, SubjectPattern>,
    tx: mpsc::UnboundedSender<Delivery>,
    lost: CancellationToken,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every connect attempt fails as unreachable. Existing
    /// links are not affected, see [`MemoryBroker::sever_links`].
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
        debug!(offline, "memory broker availability changed");
    }

    /// Drop every live link as if the broker restarted. Returns how many
    /// links were severed.
    pub fn sever_links(&self) -> usize {
        let links: Vec<LinkEntry> = {
            let mut state = self.inner.lock();
            state.links.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &links {
            entry.lost.cancel();
        }
        debug!(severed = links.len(), "memory broker severed links");
        links.len()
    }

    /// Number of live links.
    pub fn link_count(&self) -> usize {
        self.inner.lock().links.len()
    }

    /// Broker-side subscriptions across all live links.
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().links.values().map(|l| l.subs.len()).sum()
    }

    /// Messages accepted by the broker since it was created.
    pub fn published(&self) -> u64 {
        self.inner.lock().published
    }

    /// Successful connects since the broker was created.
    pub fn connects(&self) -> u64 {
        self.inner.lock().connects
    }

    fn deliver(&self, from: LinkId, message: &Message) -> TransportResult<()> {
        let mut state = self.inner.lock();
        if !state.links.contains_key(&from) {
            return Err(TransportError::Closed);
        }
        if let Err(err) = validate_subject(message.subject()) {
            return Err(TransportError::Rejected(err.to_string()));
        }
        state.published += 1;

        for entry in state.links.values() {
            for (sid, pattern) in &entry.subs {
                if pattern.matches(message.subject()) {
                    // receiver gone means the link is being torn down
                    let _ = entry.tx.send(Delivery {
                        sid: *sid,
                        message: message.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn with_link<T>(
        &self,
        id: LinkId,
        f: impl FnOnce(&mut LinkEntry) -> T,
    ) -> TransportResult<T> {
        let mut state = self.inner.lock();
        state
            .links
            .get_mut(&id)
            .map(f)
            .ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        endpoint: &str,
        _options: &ConnectionOptions,
    ) -> TransportResult<LinkParts> {
        let mut state = self.inner.lock();
        if state.offline {
            return Err(TransportError::Unreachable(format!(
                "memory broker for '{endpoint}' is offline"
            )));
        }

        state.next_link += 1;
        state.connects += 1;
        let id = state.next_link;
        let (tx, rx) = mpsc::unbounded_channel();
        let lost = CancellationToken::new();
        state.links.insert(
            id,
            LinkEntry {
                subs: HashMap::new(),
                tx,
                lost: lost.clone(),
            },
        );
        debug!(link = id, endpoint, "memory link opened");

        Ok(LinkParts {
            link: Box::new(MemoryLink {
                id,
                broker: self.clone(),
                lost,
            }),
            deliveries: rx,
        })
    }
}

#[derive(Debug)]
struct MemoryLink {
    id: LinkId,
    broker: MemoryBroker,
    lost: CancellationToken,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&self, message: &Message) -> TransportResult<()> {
        self.broker.deliver(self.id, message)
    }

    async fn subscribe(
        &self,
        sid: SubscriptionId,
        pattern: &SubjectPattern,
    ) -> TransportResult<()> {
        self.broker.with_link(self.id, |entry| {
            entry.subs.insert(sid, pattern.clone());
        })
    }

    async fn unsubscribe(&self, sid: SubscriptionId) -> TransportResult<()> {
        self.broker.with_link(self.id, |entry| {
            entry.subs.remove(&sid);
        })
    }

    async fn flush(&self) -> TransportResult<()> {
        self.broker.with_link(self.id, |_| ())
    }

    fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    async fn close(&self) {
        let removed = self.broker.inner.lock().links.remove(&self.id);
        if removed.is_some() {
            debug!(link = self.id, "memory link closed");
        }
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.broker.inner.lock().links.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(n: u64) -> SubscriptionId {
        SubscriptionId::from_raw(n)
    }

    async fn open(broker: &MemoryBroker) -> LinkParts {
        broker
            .connect("memory://test", &ConnectionOptions::default())
            .await
            .expect("connect")
    }

    #[tokio::test]
    async fn routes_to_matching_subscriptions_only() {
        let broker = MemoryBroker::new();
        let mut a = open(&broker).await;
        let b = open(&broker).await;

        a.link
            .subscribe(sid(1), &SubjectPattern::parse("a.*.c").unwrap())
            .await
            .unwrap();
        a.link
            .subscribe(sid(2), &SubjectPattern::parse("a.>").unwrap())
            .await
            .unwrap();

        b.link.send(&Message::new("a.b.c", "x")).await.unwrap();
        b.link.send(&Message::new("a.b.c.d", "y")).await.unwrap();
        b.link.flush().await.unwrap();

        let mut got = Vec::new();
        while let Ok(d) = a.deliveries.try_recv() {
            got.push((d.sid, d.message.payload_str().into_owned()));
        }
        got.sort();
        assert_eq!(
            got,
            vec![
                (sid(1), "x".to_owned()),
                (sid(2), "x".to_owned()),
                (sid(2), "y".to_owned()),
            ]
        );
        assert_eq!(broker.published(), 2);
        assert_eq!(broker.subscription_count(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_deliveries() {
        let broker = MemoryBroker::new();
        let mut a = open(&broker).await;
        let pattern = SubjectPattern::parse("updates").unwrap();

        a.link.subscribe(sid(7), &pattern).await.unwrap();
        // idempotent
        a.link.subscribe(sid(7), &pattern).await.unwrap();
        assert_eq!(broker.subscription_count(), 1);

        a.link.unsubscribe(sid(7)).await.unwrap();
        a.link.send(&Message::new("updates", "z")).await.unwrap();
        assert!(a.deliveries.try_recv().is_err());
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn offline_broker_refuses_connects() {
        let broker = MemoryBroker::new();
        broker.set_offline(true);
        let err = broker
            .connect("memory://test", &ConnectionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));

        broker.set_offline(false);
        open(&broker).await;
        assert_eq!(broker.connects(), 1);
    }

    #[tokio::test]
    async fn severed_link_reports_loss() {
        let broker = MemoryBroker::new();
        let mut parts = open(&broker).await;
        let lost = parts.link.lost();
        assert!(!lost.is_cancelled());

        assert_eq!(broker.sever_links(), 1);
        assert!(lost.is_cancelled());
        assert!(parts.deliveries.recv().await.is_none());
        assert_eq!(
            parts.link.send(&Message::new("a", "b")).await,
            Err(TransportError::Closed)
        );
        assert_eq!(parts.link.flush().await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn wildcard_publish_is_rejected_without_losing_link() {
        let broker = MemoryBroker::new();
        let parts = open(&broker).await;
        let err = parts.link.send(&Message::new("a.*", "b")).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
        assert!(parts.link.flush().await.is_ok());
        parts.link.close().await;
        assert_eq!(broker.link_count(), 0);
    }
}
