#![allow(unused)]

use std::time::Duration;

use broker_client::{Connection, ConnectionOptions, MemoryBroker, Message, Subscription};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

/// Options with fast, deterministic reconnects.
pub fn fast_options() -> ConnectionOptions {
    ConnectionOptions::default()
        .with_reconnect_delay(Duration::from_millis(10), Duration::from_millis(50))
        .with_reconnect_jitter(Duration::ZERO)
}

pub async fn connect(broker: &MemoryBroker, options: ConnectionOptions) -> Connection {
    Connection::connect_with(broker.clone(), "memory://test", options)
        .await
        .expect("connect to memory broker")
}

/// Subscribe and forward every delivery into a channel.
pub async fn collect(
    conn: &Connection,
    pattern: &str,
) -> (Subscription, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = conn
        .subscribe(pattern, move |msg: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg);
            }
        })
        .await
        .expect("subscribe");
    (sub, rx)
}

pub async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("delivery in time")
        .expect("channel open")
}

/// Assert nothing more arrives within a short grace period.
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Message>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    if let Ok(msg) = rx.try_recv() {
        panic!("unexpected delivery on '{}'", msg.subject());
    }
}

/// Poll `cond` until it holds or `WAIT` elapses.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
