//! Per-stream bookkeeping (RFC 7540 Section 5.1).

use crate::flow::Window;

/// RFC 7540 stream states, client subset.
///
/// `ReservedRemote`/`ReservedLocal` never occur here: push is disabled and
/// any PUSH_PROMISE is refused before a reserved stream can exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// HEADERS sent; both directions open.
    Open,
    /// END_STREAM sent; only the response is outstanding.
    HalfClosedLocal,
    /// END_STREAM received; request body may still be in flight.
    HalfClosedRemote,
    /// Terminal, by both sides finishing or by RST_STREAM.
    Closed,
}

pub(crate) struct StreamRecord {
    pub phase: StreamPhase,
    pub recv_window: Window,
    pub send_window: Window,
    /// Partial header block across HEADERS + CONTINUATION frames.
    pub header_fragments: Vec<u8>,
    /// END_STREAM flag carried by the HEADERS frame that opened the block.
    pub block_ends_stream: bool,
    /// Response DATA received but not yet acknowledged by the caller.
    pub unacked_recv: u32,
}

impl StreamRecord {
    pub fn open(recv_window: i64, send_window: i64, end_stream_sent: bool) -> Self {
        Self {
            phase: if end_stream_sent {
                StreamPhase::HalfClosedLocal
            } else {
                StreamPhase::Open
            },
            recv_window: Window::new(recv_window),
            send_window: Window::new(send_window),
            header_fragments: Vec::new(),
            block_ends_stream: false,
            unacked_recv: 0,
        }
    }

    /// Transition on an END_STREAM observed from the peer.
    pub fn remote_closed(&mut self) {
        self.phase = match self.phase {
            StreamPhase::HalfClosedLocal => StreamPhase::Closed,
            _ => StreamPhase::HalfClosedRemote,
        };
    }

    /// Transition on an END_STREAM we sent.
    pub fn local_closed(&mut self) {
        self.phase = match self.phase {
            StreamPhase::HalfClosedRemote => StreamPhase::Closed,
            _ => StreamPhase::HalfClosedLocal,
        };
    }

    pub fn is_closed(&self) -> bool {
        self.phase == StreamPhase::Closed
    }
}
