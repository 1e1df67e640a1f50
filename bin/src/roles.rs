//! The four demo roles.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use broker_client::{Connection, Message};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::cli::{Config, Role};

/// subject used by `pub` and `sub`
pub const UPDATES_SUBJECT: &str = "updates";
/// subject used by `req` and `rep`
pub const PING_SUBJECT: &str = "ping";

/// Run `config.role` on `conn`. Long running roles return once `shutdown`
/// fires.
pub async fn run(conn: &Connection, config: &Config, shutdown: CancellationToken) -> Result<()> {
    match config.role {
        Role::Pub => publisher(conn, config.count).await.map(|_| ()),
        Role::Sub => subscriber(conn, shutdown).await,
        Role::Req => requester(conn, config.request_timeout()).await.map(|_| ()),
        Role::Rep => replier(conn, shutdown).await,
    }
}

pub async fn subscriber(conn: &Connection, shutdown: CancellationToken) -> Result<()> {
    conn.subscribe(UPDATES_SUBJECT, |msg: Message| async move {
        info!("received: {}", msg.payload_str());
    })
    .await
    .with_context(|| format!("failed to subscribe to '{UPDATES_SUBJECT}'"))?;
    // make sure the broker has the subscription before we report ready
    conn.flush_default()
        .await
        .context("failed to flush subscription")?;

    info!("subscribed to '{UPDATES_SUBJECT}' – waiting …");
    shutdown.cancelled().await;
    Ok(())
}

/// Publish `count` messages and return how long it took including the flush.
pub async fn publisher(conn: &Connection, count: usize) -> Result<Duration> {
    let start = Instant::now();
    for i in 0..count {
        conn.publish(UPDATES_SUBJECT, format!("msg {i}"))
            .await
            .with_context(|| format!("failed to publish message {i}"))?;
    }
    conn.flush_default()
        .await
        .context("failed to flush published messages")?;

    let elapsed = start.elapsed();
    let rate = count as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    info!("sent {count} msgs in {elapsed:?} ({rate:.0} msg/s)");
    Ok(elapsed)
}

pub async fn replier(conn: &Connection, shutdown: CancellationToken) -> Result<()> {
    let responder = conn.clone();
    conn.subscribe(PING_SUBJECT, move |msg: Message| {
        let responder = responder.clone();
        async move {
            if let Err(err) = responder.respond(&msg, "pong").await {
                warn!(error = %err, subject = msg.subject(), "failed to reply");
            }
        }
    })
    .await
    .with_context(|| format!("failed to subscribe to '{PING_SUBJECT}'"))?;
    conn.flush_default()
        .await
        .context("failed to flush subscription")?;

    info!("replying on subject '{PING_SUBJECT}'");
    shutdown.cancelled().await;
    Ok(())
}

pub async fn requester(conn: &Connection, timeout: Duration) -> Result<Message> {
    let reply = conn
        .request(PING_SUBJECT, "ping", timeout)
        .await
        .with_context(|| format!("request to '{PING_SUBJECT}' failed"))?;
    info!("request/reply → {:?}", reply.payload_str());
    Ok(reply)
}
