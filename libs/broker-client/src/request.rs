//! Request/reply over publish and subscribe.
//!
//! A request subscribes to a fresh inbox subject, publishes the request with
//! that inbox as reply subject and waits for the first reply, the deadline or
//! cancellation. The inbox subscription is removed on every exit path,
//! including when the waiting future is dropped.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::connection::{Connection, ConnectionState};
use crate::error::{ClientError, ClientResult};
use crate::message::Message;
use crate::metrics::REQUESTS;
use crate::router::Subscription;
use crate::subject::validate_subject;

/// Prefix of generated reply subjects.
pub const INBOX_PREFIX: &str = "_INBOX";

/// Generate a unique, unguessable reply subject.
pub fn new_inbox() -> String {
    format!("{INBOX_PREFIX}.{}", Uuid::new_v4().simple())
}

/// Lifecycle of a [`PendingRequest`]. Every state but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Fulfilled,
    TimedOut,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        self != RequestState::Pending
    }

    fn label(self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Fulfilled => "fulfilled",
            RequestState::TimedOut => "timed_out",
            RequestState::Cancelled => "cancelled",
        }
    }
}

/// A published request waiting for its reply.
#[derive(Debug)]
pub struct PendingRequest {
    subject: String,
    timeout: Duration,
    deadline: Instant,
    state: RequestState,
    reply_rx: oneshot::Receiver<Message>,
    inbox: Subscription,
}

impl PendingRequest {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Reply subject the responder publishes to.
    pub fn inbox(&self) -> &str {
        self.inbox.pattern().as_str()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Wait for the reply.
    ///
    /// Resolves as [`ClientError::Timeout`] at the deadline and as
    /// [`ClientError::Cancelled`] when `cancel` fires or the connection
    /// closes first. Replies arriving afterwards are discarded.
    pub async fn wait(mut self, cancel: &CancellationToken) -> ClientResult<Message> {
        let mut state_rx = self.inbox.connection().state_watch();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RequestState::Cancelled),
            reply = &mut self.reply_rx => reply.map_err(|_| RequestState::Cancelled),
            _ = async {
                let _ = state_rx.wait_for(|state| *state == ConnectionState::Closed).await;
            } => Err(RequestState::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(RequestState::TimedOut),
        };
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: Result<Message, RequestState>) -> ClientResult<Message> {
        self.inbox.unsubscribe();
        let (state, result) = match outcome {
            Ok(reply) => (RequestState::Fulfilled, Ok(reply)),
            Err(RequestState::TimedOut) => (
                RequestState::TimedOut,
                Err(ClientError::Timeout {
                    subject: self.subject.clone(),
                    timeout: self.timeout,
                }),
            ),
            Err(_) => (
                RequestState::Cancelled,
                Err(ClientError::Cancelled {
                    subject: self.subject.clone(),
                }),
            ),
        };
        self.state = state;
        REQUESTS.with_label_values(&[state.label()]).inc();
        debug!(subject = %self.subject, inbox = self.inbox(), outcome = state.label(), "request finished");
        result
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.inbox.unsubscribe();
            self.state = RequestState::Cancelled;
            REQUESTS.with_label_values(&[self.state.label()]).inc();
        }
    }
}

impl Connection {
    /// Send `payload` to `subject` and wait up to `timeout` for one reply.
    pub async fn request(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> ClientResult<Message> {
        self.request_with_cancel(subject, payload, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`Connection::request`], resolving as cancelled once `cancel`
    /// fires.
    pub async fn request_with_cancel(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ClientResult<Message> {
        self.request_message(Message::new(subject, payload), timeout, cancel)
            .await
    }

    /// Request with a prebuilt message. Any reply subject it carries is
    /// replaced by the generated inbox.
    pub async fn request_message(
        &self,
        message: Message,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ClientResult<Message> {
        self.send_request(message, timeout).await?.wait(cancel).await
    }

    /// Publish a request and return the pending reply without waiting.
    pub async fn send_request(
        &self,
        message: Message,
        timeout: Duration,
    ) -> ClientResult<PendingRequest> {
        validate_subject(message.subject())?;
        // a request that can never be sent fails like a publish
        self.shared().check_publishable()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(reply_tx)));
        let inbox = self
            .subscribe(&new_inbox(), move |reply: Message| {
                let slot = slot.clone();
                async move {
                    // only the first reply counts
                    if let Some(tx) = slot.lock().take() {
                        let _ = tx.send(reply);
                    }
                }
            })
            .await
            .map_err(|err| match err {
                ClientError::Closed => self.shared().publish_refused(),
                other => other,
            })?;

        let pending = PendingRequest {
            subject: message.subject().to_owned(),
            timeout,
            deadline: Instant::now() + timeout,
            state: RequestState::Pending,
            reply_rx,
            inbox,
        };
        let reply_to = pending.inbox().to_owned();
        self.publish_message(message.with_reply(reply_to)).await?;
        debug!(subject = pending.subject(), inbox = pending.inbox(), "request sent");
        Ok(pending)
    }

    /// Reply to a received request.
    pub async fn respond(&self, request: &Message, payload: impl Into<Bytes>) -> ClientResult<()> {
        let reply = request.reply().ok_or(ClientError::NoReplySubject)?;
        self.publish(reply, payload).await
    }
}
