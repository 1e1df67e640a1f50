//! Publishing with local buffering, backpressure and flush.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tracing::trace;

use crate::connection::{Connection, ConnectionState, Outbound, Shared};
use crate::error::{ClientError, ClientResult};
use crate::message::Message;
use crate::metrics::{BACKPRESSURE_REJECTIONS, FLUSHES, MESSAGES_PUBLISHED};
use crate::subject::validate_subject;

fn validate(message: &Message) -> ClientResult<()> {
    validate_subject(message.subject())?;
    if let Some(reply) = message.reply() {
        validate_subject(reply)?;
    }
    Ok(())
}

fn backpressure(shared: &Shared) -> ClientError {
    BACKPRESSURE_REJECTIONS.inc();
    ClientError::Backpressure {
        capacity: shared.options.outbound_capacity,
    }
}

impl Connection {
    /// Publish `payload` to `subject`.
    ///
    /// Fire-and-forget: success means the message is buffered, only
    /// [`Connection::flush`] confirms it reached the broker. With a full
    /// buffer this waits for space while connected and fails with
    /// [`ClientError::Backpressure`] otherwise, or right away when
    /// `block_on_full` is off.
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> ClientResult<()> {
        self.publish_message(Message::new(subject, payload)).await
    }

    /// Publish with a reply subject attached.
    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: impl Into<Bytes>,
    ) -> ClientResult<()> {
        self.publish_message(Message::new(subject, payload).with_reply(reply))
            .await
    }

    /// Publish a prebuilt message, headers included.
    pub async fn publish_message(&self, message: Message) -> ClientResult<()> {
        validate(&message)?;
        let shared = self.shared();
        shared.check_publishable()?;

        let out = match shared.outbound_tx.try_send(Outbound::Message(message)) {
            Ok(()) => {
                MESSAGES_PUBLISHED.inc();
                return Ok(());
            }
            Err(TrySendError::Closed(_)) => return Err(shared.publish_refused()),
            Err(TrySendError::Full(out)) => out,
        };

        if !shared.options.block_on_full || !shared.state().is_connected() {
            return Err(backpressure(shared));
        }

        trace!("outbound buffer full, waiting for space");
        let mut state_rx = shared.state_watch();
        tokio::select! {
            res = shared.outbound_tx.send(out) => match res {
                Ok(()) => {
                    MESSAGES_PUBLISHED.inc();
                    Ok(())
                }
                Err(_) => Err(shared.publish_refused()),
            },
            _ = async {
                let _ = state_rx.wait_for(|state| !state.is_connected()).await;
            } => Err(backpressure(shared)),
        }
    }

    /// Publish without ever waiting; a full buffer fails with
    /// [`ClientError::Backpressure`].
    pub fn try_publish(&self, subject: &str, payload: impl Into<Bytes>) -> ClientResult<()> {
        let message = Message::new(subject, payload);
        validate(&message)?;
        let shared = self.shared();
        shared.check_publishable()?;

        match shared.outbound_tx.try_send(Outbound::Message(message)) {
            Ok(()) => {
                MESSAGES_PUBLISHED.inc();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(backpressure(shared)),
            Err(TrySendError::Closed(_)) => Err(shared.publish_refused()),
        }
    }

    /// Wait until the broker acknowledged everything buffered before this
    /// call, or fail with [`ClientError::Flush`] after `timeout`.
    pub async fn flush(&self, timeout: Duration) -> ClientResult<()> {
        self.flush_within(timeout).await
    }

    /// [`Connection::flush`] with the configured `flush_timeout`.
    pub async fn flush_default(&self) -> ClientResult<()> {
        self.flush(self.shared().options.flush_timeout).await
    }

    pub(crate) async fn flush_within(&self, timeout: Duration) -> ClientResult<()> {
        let shared = self.shared();
        if shared.state() == ConnectionState::Closed {
            return Err(ClientError::Flush("connection is closed".into()));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let flushed = async {
            shared
                .outbound_tx
                .send(Outbound::Flush(ack_tx))
                .await
                .map_err(|_| ClientError::Flush("connection is closed".into()))?;
            ack_rx
                .await
                .map_err(|_| ClientError::Flush("flush was not acknowledged".into()))
        };

        match tokio::time::timeout(timeout, flushed).await {
            Ok(Ok(())) => {
                FLUSHES.inc();
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ClientError::Flush(format!(
                "not acknowledged within {timeout:?}"
            ))),
        }
    }

    /// Messages currently buffered and not yet handed to the broker.
    pub fn outbound_len(&self) -> usize {
        let shared = self.shared();
        shared
            .options
            .outbound_capacity
            .saturating_sub(shared.outbound_tx.capacity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ConnectionOptions;
    use crate::subject::SubjectError;
    use crate::transport::MemoryBroker;

    async fn connect(broker: &MemoryBroker, options: ConnectionOptions) -> Connection {
        Connection::connect_with(broker.clone(), "memory://publisher", options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn rejects_invalid_subjects() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker, ConnectionOptions::default()).await;
        assert!(matches!(
            conn.publish("a.*", "x").await,
            Err(ClientError::InvalidSubject(SubjectError::WildcardInSubject { .. }))
        ));
        assert!(matches!(
            conn.publish_with_reply("a", "bad reply", "x").await,
            Err(ClientError::InvalidSubject(SubjectError::Whitespace { .. }))
        ));
        assert!(matches!(conn.try_publish("", "x"), Err(ClientError::InvalidSubject(_))));
        conn.close().await;
    }

    #[tokio::test]
    async fn flush_confirms_everything_buffered() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker, ConnectionOptions::default()).await;
        for i in 0..100 {
            conn.publish("updates", format!("msg {i}")).await.unwrap();
        }
        conn.flush(Duration::from_secs(5)).await.unwrap();
        assert_eq!(broker.published(), 100);
        assert_eq!(conn.outbound_len(), 0);
        conn.close().await;
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker, ConnectionOptions::default()).await;
        conn.close().await;
        assert!(matches!(conn.publish("a", "b").await, Err(ClientError::Publish(_))));
        assert!(matches!(conn.try_publish("a", "b"), Err(ClientError::Publish(_))));
        assert!(matches!(
            conn.flush(Duration::from_millis(50)).await,
            Err(ClientError::Flush(_))
        ));
    }
}
