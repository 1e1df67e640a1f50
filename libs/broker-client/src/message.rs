//! Messages exchanged with the broker.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Correlation metadata carried alongside a payload.
pub type Headers = BTreeMap<String, String>;

/// One unit of data in flight. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    subject: String,
    payload: Bytes,
    reply: Option<String>,
    headers: Option<Headers>,
}

impl Message {
    /// Build a message for `subject`.
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            reply: None,
            headers: None,
        }
    }

    /// Attach a reply subject.
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Attach a header, creating the header map on first use.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Headers::new)
            .insert(name.into(), value.into());
        self
    }

    /// Replace all headers.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = if headers.is_empty() {
            None
        } else {
            Some(headers)
        };
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn reply(&self) -> Option<&str> {
        self.reply.as_deref()
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }

    /// Look up a single header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.as_ref()?.get(name).map(String::as_str)
    }

    /// Payload interpreted as UTF-8, lossily.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_optional_parts() {
        let msg = Message::new("ping", "ping")
            .with_reply("_INBOX.1")
            .with_header("trace-id", "abc");
        assert_eq!(msg.subject(), "ping");
        assert_eq!(msg.payload().as_ref(), b"ping");
        assert_eq!(msg.reply(), Some("_INBOX.1"));
        assert_eq!(msg.header("trace-id"), Some("abc"));
        assert_eq!(msg.header("missing"), None);
        assert_eq!(msg.len(), 4);
    }

    #[test]
    fn empty_header_map_is_dropped() {
        let msg = Message::new("a", Bytes::new()).with_headers(Headers::new());
        assert!(msg.headers().is_none());
        assert!(msg.is_empty());
        assert_eq!(msg.payload_str(), "");
    }
}
