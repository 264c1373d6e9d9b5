//! Sendme flow control
//!
//! Each stream and each circuit carries send/receive windows. Sending a
//! data cell spends send-window credit; credit comes back only with a
//! sendme acknowledgment. When the receive window depletes we owe the
//! peer a sendme. Counters are unsigned and checked, so a window can
//! never go negative, and a sendme that would push the send window past
//! its initial value is a protocol violation.

use crate::error::{EngineError, Result};

/// One direction-pair of windows with fixed increment.
#[derive(Debug, Clone)]
pub struct Window {
    /// Cells we may still send before needing a sendme.
    send: u16,
    /// Cells until we owe the peer a sendme.
    recv: u16,
    /// Configured initial send window (also the maximum).
    initial: u16,
    /// Credit per sendme.
    increment: u16,
}

impl Window {
    pub fn new(initial: u16, increment: u16) -> Self {
        Self {
            send: initial,
            recv: increment,
            initial,
            increment,
        }
    }

    pub fn send_window(&self) -> u16 {
        self.send
    }

    /// Whether a data cell may be sent right now.
    pub fn can_send(&self) -> bool {
        self.send > 0
    }

    /// Spend one cell of send credit. The caller must have checked
    /// `can_send`; a zero window here is an engine bug, not a peer fault.
    pub fn note_sent(&mut self) -> Result<()> {
        self.send = self
            .send
            .checked_sub(1)
            .ok_or_else(|| EngineError::Internal("send window underflow".into()))?;
        Ok(())
    }

    /// Apply a sendme from the peer. Overflow past the initial window
    /// means the peer acked credit we never spent.
    pub fn note_sendme_received(&mut self) -> Result<()> {
        let restored = self.send.saturating_add(self.increment);
        if restored > self.initial {
            return Err(EngineError::ProtocolViolation(format!(
                "sendme would raise window to {} (max {})",
                restored, self.initial
            )));
        }
        self.send = restored;
        Ok(())
    }

    /// Account one received data cell. Returns `true` when a sendme is
    /// now owed to the peer.
    pub fn note_received(&mut self) -> bool {
        if self.recv > 0 {
            self.recv -= 1;
        }
        if self.recv == 0 {
            self.recv = self.increment;
            return true;
        }
        false
    }
}

/// Circuit-level flow control.
#[derive(Debug, Clone)]
pub struct CircuitFlowControl {
    pub window: Window,
}

impl CircuitFlowControl {
    pub fn new(initial: u16, increment: u16) -> Self {
        Self {
            window: Window::new(initial, increment),
        }
    }
}

/// Stream-level flow control.
#[derive(Debug, Clone)]
pub struct StreamFlowControl {
    pub window: Window,
}

impl StreamFlowControl {
    pub fn new(initial: u16, increment: u16) -> Self {
        Self {
            window: Window::new(initial, increment),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn send_and_restore() {
        let mut w = Window::new(1000, 100);
        assert!(w.can_send());

        for _ in 0..1000 {
            w.note_sent().unwrap();
        }
        assert!(!w.can_send());
        assert_eq!(w.send_window(), 0);

        w.note_sendme_received().unwrap();
        assert!(w.can_send());
        assert_eq!(w.send_window(), 100);
    }

    #[test]
    fn sendme_overflow_is_violation() {
        let mut w = Window::new(500, 50);
        // Window is already full; any sendme is bogus credit.
        let err = w.note_sendme_received().unwrap_err();
        assert!(matches!(err, EngineError::ProtocolViolation(_)));
    }

    #[test]
    fn receive_owes_sendme_at_increment() {
        let mut w = Window::new(1000, 100);
        for i in 1..=100 {
            let owed = w.note_received();
            assert_eq!(owed, i == 100, "iteration {}", i);
        }
        // Window reset; next batch behaves the same.
        for i in 1..=100 {
            let owed = w.note_received();
            assert_eq!(owed, i == 100);
        }
    }

    #[test]
    fn window_invariant_under_random_events() {
        // For any event sequence the counter stays within [0, initial].
        let mut rng = rand::rngs::SmallRng::seed_from_u64(42);
        let mut w = Window::new(500, 50);
        let mut outstanding: u32 = 0; // cells sent since last ack

        for _ in 0..20_000 {
            if rng.gen_bool(0.6) {
                if w.can_send() {
                    w.note_sent().unwrap();
                    outstanding += 1;
                }
            } else if outstanding >= 50 {
                w.note_sendme_received().unwrap();
                outstanding -= 50;
            }
            assert!(w.send_window() <= 500);
        }
    }
}
