//! Error types for the circuit engine
//!
//! Two layers of taxonomy:
//! - [`SelectionError`] is returned by path selection only; the caller
//!   decides whether to relax constraints or surface the failure.
//! - [`EngineError`] covers everything else, with classification helpers
//!   so callers can tell circuit-fatal conditions from recoverable ones.

use thiserror::Error;

use crate::compress::CompressError;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Why a path could not be selected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    /// A hop position had zero eligible candidates.
    #[error("no eligible relay for hop {position}")]
    InsufficientRelays { position: usize },

    /// The requested length can never be satisfied against this snapshot
    /// (e.g. more hops than distinct countries).
    #[error("constraints unsatisfiable: {0}")]
    ConstraintUnsatisfiable(String),
}

/// Main error type for the circuit engine.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    // ===== Path selection =====
    #[error("path selection failed: {0}")]
    Selection(#[from] SelectionError),

    // ===== Protocol violations (always fatal to the circuit) =====
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    // ===== Timeouts =====
    #[error("handshake timed out at hop {hop}")]
    HandshakeTimeout { hop: usize },

    // ===== Stream attach (synchronous, no teardown) =====
    #[error("circuit {0} is not open")]
    CircuitNotOpen(u32),

    #[error("exit policy rejects target {0}")]
    ExitPolicyRejected(String),

    // ===== Lookup misses (recoverable) =====
    #[error("no such circuit: {0}")]
    CircuitNotFound(u32),

    #[error("no such stream: {0} on circuit {1}")]
    StreamNotFound(u16, u32),

    #[error("no open circuit qualifies for this stream")]
    NoEligibleCircuit,

    // ===== Backpressure =====
    #[error("stream {stream} queued bytes exceed cap ({queued} > {cap})")]
    BackpressureOverflow {
        stream: u16,
        queued: usize,
        cap: usize,
    },

    // ===== Handshake / crypto seam =====
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // ===== Decompression =====
    #[error("decompression failed: {0}")]
    Compress(#[from] CompressError),

    // ===== Resource exhaustion =====
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    // ===== Configuration =====
    #[error("invalid configuration: {0}")]
    Config(String),

    // ===== Internal =====
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether this error must tear down the circuit it occurred on.
    ///
    /// Protocol violations and handshake timeouts are always fatal to the
    /// circuit, never to the process.
    pub fn is_circuit_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ProtocolViolation(_)
                | EngineError::HandshakeTimeout { .. }
                | EngineError::HandshakeFailed(_)
        )
    }

    /// Whether the failed operation can be retried with a fresh path.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::HandshakeTimeout { .. }
                | EngineError::HandshakeFailed(_)
                | EngineError::CircuitNotFound(_)
                | EngineError::NoEligibleCircuit
                | EngineError::Selection(SelectionError::InsufficientRelays { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_fatal_classification() {
        assert!(EngineError::ProtocolViolation("bad cell".into()).is_circuit_fatal());
        assert!(EngineError::HandshakeTimeout { hop: 2 }.is_circuit_fatal());

        assert!(!EngineError::CircuitNotOpen(7).is_circuit_fatal());
        assert!(!EngineError::ExitPolicyRejected("example.com:80".into()).is_circuit_fatal());
    }

    #[test]
    fn retryable_classification() {
        assert!(EngineError::HandshakeTimeout { hop: 1 }.is_retryable());
        assert!(
            EngineError::Selection(SelectionError::InsufficientRelays { position: 0 })
                .is_retryable()
        );

        assert!(!EngineError::Selection(SelectionError::ConstraintUnsatisfiable(
            "too long".into()
        ))
        .is_retryable());
        assert!(!EngineError::ProtocolViolation("x".into()).is_retryable());
    }
}
