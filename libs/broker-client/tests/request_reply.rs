mod common;

use std::time::Duration;

use broker_client::{
    ClientError, Connection, ConnectionOptions, ConnectionState, MemoryBroker, Message,
    RequestState,
};
use common::{connect, eventually};
use tokio_util::sync::CancellationToken;

/// Serve `subject` with a fixed reply; payload "boom" makes the responder
/// panic instead.
async fn serve(conn: &Connection, subject: &str, reply: &'static str) {
    let responder = conn.clone();
    conn.subscribe(subject, move |msg: Message| {
        let responder = responder.clone();
        async move {
            if msg.payload_str() == "boom" {
                panic!("responder failed");
            }
            if let Err(err) = responder.respond(&msg, reply).await {
                eprintln!("reply failed: {err}");
            }
        }
    })
    .await
    .unwrap();
    conn.flush_default().await.unwrap();
}

#[tokio::test]
async fn request_receives_reply() {
    let broker = MemoryBroker::new();
    let rep = connect(&broker, ConnectionOptions::default()).await;
    let req = connect(&broker, ConnectionOptions::default()).await;
    serve(&rep, "ping", "pong").await;

    let reply = req
        .request("ping", "ping", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply.payload_str(), "pong");
    assert!(reply.subject().starts_with("_INBOX."));
    assert!(eventually(|| req.subscription_count() == 0).await);
}

#[tokio::test]
async fn request_times_out_without_responder() {
    let broker = MemoryBroker::new();
    let req = connect(&broker, ConnectionOptions::default()).await;

    let err = req
        .request("nobody.home", "hello", Duration::from_millis(100))
        .await
        .unwrap_err();
    match err {
        ClientError::Timeout { subject, timeout } => {
            assert_eq!(subject, "nobody.home");
            assert_eq!(timeout, Duration::from_millis(100));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(req.subscription_count(), 0);
}

#[tokio::test]
async fn cancellation_releases_inbox() {
    let broker = MemoryBroker::new();
    let req = connect(&broker, ConnectionOptions::default()).await;
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
    }

    let started = tokio::time::Instant::now();
    let err = req
        .request_with_cancel("slow", "hello", Duration::from_secs(10), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Cancelled { ref subject } if subject == "slow"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(req.subscription_count(), 0);
    assert!(eventually(|| broker.subscription_count() == 0).await);
}

#[tokio::test]
async fn late_reply_is_discarded() {
    let broker = MemoryBroker::new();
    let rep = connect(&broker, ConnectionOptions::default()).await;
    let req = connect(&broker, ConnectionOptions::default()).await;

    let responder = rep.clone();
    rep.subscribe("slow", move |msg: Message| {
        let responder = responder.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = responder.respond(&msg, "too late").await;
        }
    })
    .await
    .unwrap();
    rep.flush_default().await.unwrap();

    let err = req
        .request("slow", "hello", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // the reply lands after the inbox is gone and must not resurrect it
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(req.subscription_count(), 0);
    assert!(req.is_connected());
}

#[tokio::test]
async fn only_first_of_several_replies_is_returned() {
    let broker = MemoryBroker::new();
    let first = connect(&broker, ConnectionOptions::default()).await;
    let second = connect(&broker, ConnectionOptions::default()).await;
    let req = connect(&broker, ConnectionOptions::default()).await;
    serve(&first, "svc", "a").await;
    serve(&second, "svc", "a").await;

    let reply = req.request("svc", "go", Duration::from_secs(1)).await.unwrap();
    assert_eq!(reply.payload_str(), "a");
    assert!(eventually(|| req.subscription_count() == 0).await);
}

#[tokio::test]
async fn failing_responder_keeps_serving() {
    let broker = MemoryBroker::new();
    let rep = connect(&broker, ConnectionOptions::default()).await;
    let req = connect(&broker, ConnectionOptions::default()).await;
    serve(&rep, "ping", "pong").await;

    let err = req
        .request("ping", "boom", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    let reply = req
        .request("ping", "ping", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply.payload_str(), "pong");
}

#[tokio::test]
async fn closing_connection_cancels_pending_request() {
    let broker = MemoryBroker::new();
    let req = connect(&broker, ConnectionOptions::default()).await;

    let pending = req
        .send_request(Message::new("ping", "ping"), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(pending.state(), RequestState::Pending);
    assert!(pending.inbox().starts_with("_INBOX."));

    req.close().await;
    let err = pending.wait(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ClientError::Cancelled { .. }));
}

#[tokio::test]
async fn request_on_closed_connection_fails() {
    let broker = MemoryBroker::new();
    let req = connect(&broker, ConnectionOptions::default()).await;
    req.drain().await.unwrap();

    let err = req
        .request("ping", "ping", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Publish(_)));
}

#[tokio::test]
async fn request_while_draining_fails_as_publish_error() {
    let broker = MemoryBroker::new();
    let options = ConnectionOptions::default().with_drain_timeout(Duration::from_millis(300));
    let req = connect(&broker, options).await;

    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    req.subscribe("stuck", move |_msg: Message| {
        let started_tx = started_tx.clone();
        async move {
            let _ = started_tx.send(());
            std::future::pending::<()>().await;
        }
    })
    .await
    .unwrap();
    req.publish("stuck", "x").await.unwrap();
    started_rx.recv().await.unwrap();

    // the stuck callback holds the drain in its dispatch phase
    let drain = {
        let req = req.clone();
        tokio::spawn(async move { req.drain().await })
    };
    let mut states = req.state_watch();
    states
        .wait_for(|s| *s == ConnectionState::Draining)
        .await
        .unwrap();

    let err = req
        .request("ping", "ping", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Publish(_)));
    assert!(drain.await.unwrap().is_err());
}
