//! Message types exchanged between the codec and transaction handlers.

use super::types::StreamId;

/// A header field (name-value pair).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    /// Create a new header field.
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A parsed request or response head.
///
/// The session treats messages as opaque beyond the fields it needs for
/// admission and direct error responses; interpretation belongs to the
/// codec and the handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Request method, if this is a request head.
    pub method: Option<String>,
    /// Request path, if this is a request head.
    pub path: Option<String>,
    /// Response status, if this is a response head.
    pub status: Option<u16>,
    /// All header fields, in wire order.
    pub headers: Vec<HeaderField>,
    /// Stream this message arrived on or will be sent on.
    pub stream_id: StreamId,
}

impl Message {
    /// Create a request head.
    pub fn request(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Create a response head.
    pub fn response(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Append a header field.
    pub fn add_header(&mut self, name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.headers.push(HeaderField::new(name, value));
    }

    /// Look up the first header with the given name.
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_slice())
    }

    /// Whether this is a response head.
    pub fn is_response(&self) -> bool {
        self.status.is_some()
    }
}
