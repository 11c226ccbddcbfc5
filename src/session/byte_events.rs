//! Byte-offset event tracking.
//!
//! Senders register events keyed by the session byte offset at which they
//! become true (the last byte of a message hit the kernel, a ping reply
//! left the machine). Write completions advance cumulative progress and
//! fire every event whose offset has been covered.

use std::collections::VecDeque;

use crate::codec::StreamId;

/// What a byte event marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteEventKind {
    /// First byte of a message head was written.
    FirstHeaderByte,
    /// Final body byte of a message was written.
    LastByte,
    /// A ping reply was written.
    PingReply { id: u64 },
}

/// An event registered against a session byte offset.
#[derive(Debug, Clone, Copy)]
pub struct ByteEvent {
    /// Session byte offset at which the event fires.
    pub offset: u64,
    pub kind: ByteEventKind,
    /// Transaction the event belongs to, when stream-scoped.
    pub stream_id: Option<StreamId>,
}

/// Time-ordered queue of byte events.
///
/// Offsets are registered monotonically (egress is serialized in offset
/// order), so a deque suffices.
#[derive(Debug, Default)]
pub struct ByteEventTracker {
    events: VecDeque<ByteEvent>,
}

impl ByteEventTracker {
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
        }
    }

    /// Register an event at the given session byte offset.
    pub fn add(&mut self, event: ByteEvent) {
        debug_assert!(
            self.events.back().is_none_or(|last| last.offset <= event.offset),
            "byte events must be registered in offset order"
        );
        self.events.push_back(event);
    }

    /// Fire all events whose offset is now covered by `bytes_written`,
    /// appending them to `fired` in registration order.
    pub fn process(&mut self, bytes_written: u64, fired: &mut Vec<ByteEvent>) {
        while let Some(event) = self.events.front() {
            if event.offset > bytes_written {
                break;
            }
            if let Some(event) = self.events.pop_front() {
                fired.push(event);
            }
        }
    }

    /// Drop all pending events, returning them for delete-ack delivery.
    pub fn drain(&mut self) -> Vec<ByteEvent> {
        self.events.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}
