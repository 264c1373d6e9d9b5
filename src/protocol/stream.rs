//! Streams
//!
//! One application-level connection multiplexed over a circuit. A stream
//! is owned by the circuit it is attached to, and is attached to at most
//! one circuit at a time. While its send window is exhausted, outbound
//! bytes queue here — bounded by the configured cap so a stalled or
//! malicious peer cannot grow memory without limit.

use std::collections::VecDeque;

use crate::error::{EngineError, Result};
use crate::protocol::flow_control::StreamFlowControl;

/// Stream attachment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Begin sent, not yet acknowledged by the exit.
    Pending,
    /// Connected end to end.
    Attached,
    /// We sent End; awaiting the peer's.
    HalfClosed,
    /// Terminal.
    Closed,
    /// Detached by circuit teardown; queued for reattachment elsewhere.
    Orphaned,
}

/// Target of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A single stream on a circuit.
#[derive(Debug)]
pub struct Stream {
    /// Stream ID, unique within the owning circuit.
    pub id: u16,

    /// Destination.
    pub target: StreamTarget,

    /// Attachment state.
    pub state: StreamState,

    /// Stream-level windows.
    pub flow: StreamFlowControl,

    /// Outbound bytes waiting for window credit.
    queued: VecDeque<u8>,

    /// Bytes sent on this stream.
    pub bytes_sent: u64,

    /// Bytes received on this stream.
    pub bytes_received: u64,
}

impl Stream {
    pub fn new(id: u16, target: StreamTarget, flow: StreamFlowControl) -> Self {
        Self {
            id,
            target,
            state: StreamState::Pending,
            flow,
            queued: VecDeque::new(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, StreamState::Pending | StreamState::Attached)
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Queue outbound bytes that cannot be sent yet. Fails (and the caller
    /// drops the stream) once the cap would be exceeded.
    pub fn queue_outbound(&mut self, data: &[u8], cap: usize) -> Result<()> {
        if self.queued.len() + data.len() > cap {
            return Err(EngineError::BackpressureOverflow {
                stream: self.id,
                queued: self.queued.len() + data.len(),
                cap,
            });
        }
        self.queued.extend(data);
        Ok(())
    }

    /// Take up to `max` queued bytes for transmission.
    pub fn dequeue(&mut self, max: usize) -> Vec<u8> {
        let n = self.queued.len().min(max);
        self.queued.drain(..n).collect()
    }

    pub fn has_queued(&self) -> bool {
        !self.queued.is_empty()
    }

    /// Discard queued bytes that will never be sent.
    pub fn clear_queued(&mut self) {
        self.queued.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Stream {
        Stream::new(
            7,
            StreamTarget {
                host: "example.com".into(),
                port: 443,
            },
            StreamFlowControl::new(500, 50),
        )
    }

    #[test]
    fn queue_respects_cap() {
        let mut s = stream();
        s.queue_outbound(&[1u8; 900], 1000).unwrap();
        let err = s.queue_outbound(&[2u8; 200], 1000).unwrap_err();
        assert!(matches!(err, EngineError::BackpressureOverflow { .. }));
        // The earlier queue contents survive a rejected append.
        assert_eq!(s.queued_len(), 900);
    }

    #[test]
    fn dequeue_in_order() {
        let mut s = stream();
        s.queue_outbound(&[1, 2, 3, 4, 5], 1000).unwrap();
        assert_eq!(s.dequeue(3), vec![1, 2, 3]);
        assert_eq!(s.dequeue(10), vec![4, 5]);
        assert!(!s.has_queued());
    }

    #[test]
    fn open_states() {
        let mut s = stream();
        assert!(s.is_open());
        s.state = StreamState::Attached;
        assert!(s.is_open());
        s.state = StreamState::Orphaned;
        assert!(!s.is_open());
    }
}
