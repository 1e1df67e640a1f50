mod common;

use std::time::Duration;

use broker_client::{
    ClientError, Connection, ConnectionOptions, ConnectionState, MemoryBroker, Message,
};
use common::{collect, connect, eventually, fast_options, recv};
use tokio::sync::mpsc;

async fn wait_for_state(conn: &Connection, state: ConnectionState) {
    let mut rx = conn.state_watch();
    tokio::time::timeout(common::WAIT, rx.wait_for(|s| *s == state))
        .await
        .expect("state reached in time")
        .expect("state sender alive");
}

#[tokio::test]
async fn connect_to_offline_broker_fails() {
    let broker = MemoryBroker::new();
    broker.set_offline(true);
    let err = Connection::connect_with(broker, "memory://down", ConnectionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Connection(_)));
}

#[tokio::test]
async fn connect_to_unreachable_nats_fails() {
    let options = ConnectionOptions::default().with_connect_timeout(Duration::from_millis(500));
    let err = Connection::connect("nats://127.0.0.1:1", options)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Connection(_)));
}

#[tokio::test]
async fn drain_is_idempotent() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, ConnectionOptions::default()).await;
    assert_eq!(conn.state(), ConnectionState::Connected);

    conn.drain().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);
    conn.drain().await.unwrap();
    conn.close().await;
    conn.drain().await.unwrap();

    assert!(matches!(conn.publish("a", "b").await, Err(ClientError::Publish(_))));
    assert_eq!(broker.link_count(), 0);
}

#[tokio::test]
async fn concurrent_drains_both_succeed() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, ConnectionOptions::default()).await;
    let (a, b) = tokio::join!(conn.drain(), conn.drain());
    assert!(a.is_ok());
    assert!(b.is_ok());
}

#[tokio::test]
async fn drain_flushes_buffered_publishes() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, ConnectionOptions::default()).await;
    for i in 0..1_000 {
        conn.publish("updates", format!("msg {i}")).await.unwrap();
    }
    conn.drain().await.unwrap();
    assert_eq!(broker.published(), 1_000);
}

#[tokio::test]
async fn drain_lets_running_callbacks_publish() {
    let broker = MemoryBroker::new();
    let worker = connect(&broker, ConnectionOptions::default()).await;
    let observer = connect(&broker, ConnectionOptions::default()).await;
    let client = connect(&broker, ConnectionOptions::default()).await;

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let publisher = worker.clone();
    worker
        .subscribe("jobs", move |_msg: Message| {
            let publisher = publisher.clone();
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = publisher.publish("jobs.done", "ok").await;
            }
        })
        .await
        .unwrap();
    worker.flush_default().await.unwrap();
    let (_done, mut done_rx) = collect(&observer, "jobs.done").await;
    observer.flush_default().await.unwrap();

    client.publish("jobs", "run").await.unwrap();
    client.flush_default().await.unwrap();
    tokio::time::timeout(common::WAIT, started_rx.recv())
        .await
        .unwrap();

    worker.drain().await.unwrap();
    assert_eq!(recv(&mut done_rx).await.payload_str(), "ok");
    assert_eq!(worker.subscription_count(), 0);
}

#[tokio::test]
async fn drain_times_out_on_stuck_callback() {
    let broker = MemoryBroker::new();
    let options = ConnectionOptions::default().with_drain_timeout(Duration::from_millis(100));
    let conn = connect(&broker, options).await;
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    conn.subscribe("stuck", move |_msg: Message| {
        let started_tx = started_tx.clone();
        async move {
            let _ = started_tx.send(());
            std::future::pending::<()>().await;
        }
    })
    .await
    .unwrap();
    conn.publish("stuck", "x").await.unwrap();
    started_rx.recv().await.unwrap();

    let err = conn.drain().await.unwrap_err();
    assert!(matches!(err, ClientError::Drain(_)));
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn publish_while_disconnected_fails_with_backpressure() {
    let broker = MemoryBroker::new();
    let options = ConnectionOptions::default()
        .with_outbound_capacity(4)
        .with_reconnect_delay(Duration::from_secs(30), Duration::from_secs(30));
    let conn = connect(&broker, options).await;

    broker.set_offline(true);
    broker.sever_links();
    wait_for_state(&conn, ConnectionState::Reconnecting).await;

    for i in 0..4 {
        conn.publish("updates", format!("{i}")).await.unwrap();
    }
    assert_eq!(conn.outbound_len(), 4);

    let res = tokio::time::timeout(Duration::from_secs(1), conn.publish("updates", "4"))
        .await
        .expect("publish must not block while disconnected");
    assert!(matches!(res, Err(ClientError::Backpressure { capacity: 4 })));
    assert!(matches!(
        conn.try_publish("updates", "5"),
        Err(ClientError::Backpressure { .. })
    ));
    conn.close().await;
}

#[tokio::test]
async fn reconnect_preserves_subscriptions_and_buffered_publishes() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, fast_options()).await;
    let (sub, mut rx) = collect(&conn, "updates").await;
    conn.flush_default().await.unwrap();

    broker.set_offline(true);
    broker.sever_links();
    wait_for_state(&conn, ConnectionState::Reconnecting).await;
    conn.publish("updates", "queued").await.unwrap();

    broker.set_offline(false);
    conn.flush(common::WAIT).await.unwrap();
    assert_eq!(recv(&mut rx).await.payload_str(), "queued");
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.reconnects(), 1);
    assert!(sub.is_active());
    assert_eq!(broker.subscription_count(), 1);

    conn.publish("updates", "after").await.unwrap();
    assert_eq!(recv(&mut rx).await.payload_str(), "after");
}

#[tokio::test]
async fn exhausted_reconnects_close_the_connection() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, fast_options().with_max_reconnects(Some(2))).await;

    broker.set_offline(true);
    broker.sever_links();
    wait_for_state(&conn, ConnectionState::Closed).await;

    assert!(matches!(conn.publish("a", "b").await, Err(ClientError::Publish(_))));
    assert!(matches!(
        conn.subscribe("a", |_msg: Message| async {}).await,
        Err(ClientError::Closed)
    ));
    assert_eq!(conn.reconnects(), 0);
}

#[tokio::test]
async fn close_discards_buffered_publishes() {
    let broker = MemoryBroker::new();
    let options = ConnectionOptions::default()
        .with_reconnect_delay(Duration::from_secs(30), Duration::from_secs(30));
    let conn = connect(&broker, options).await;

    broker.set_offline(true);
    broker.sever_links();
    wait_for_state(&conn, ConnectionState::Reconnecting).await;
    for _ in 0..3 {
        conn.publish("updates", "lost").await.unwrap();
    }

    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    broker.set_offline(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.published(), 0);
    assert_eq!(broker.connects(), 1);
}

#[tokio::test]
async fn state_watch_follows_the_lifecycle() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, fast_options()).await;
    let mut states = conn.state_watch();
    assert!(conn.is_connected());

    broker.sever_links();
    assert!(eventually(|| conn.reconnects() == 1).await);
    assert!(conn.is_connected());

    conn.drain().await.unwrap();
    states.wait_for(|s| s.is_closed()).await.unwrap();
    assert!(!conn.is_connected());
    assert_eq!(conn.endpoint(), "memory://test");
}
