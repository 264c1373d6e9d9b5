//! Engine configuration
//!
//! All tunables the engine consumes. Loading (files, UI, defaults) is the
//! host's problem; the engine only sees the resulting values, passed in at
//! construction. No ambient globals.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::directory::Fingerprint;
use crate::error::{EngineError, Result};

/// Which live circuits an AS-disjointness check compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsIntersectionScope {
    /// Avoid AS numbers used by any live circuit.
    AllCircuits,
    /// Avoid AS numbers used by live circuits with the same purpose.
    SamePurpose,
}

/// What happens to attached streams when their circuit is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetachPolicy {
    /// Close the streams and report the failure upward.
    CloseStreams,
    /// Mark the streams orphaned; an external retry policy may reattach
    /// them to a different open circuit.
    OrphanStreams,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default number of hops for a new circuit (1-10).
    pub default_circuit_length: u8,

    /// Require every hop to be in a different country.
    pub distinct_countries: bool,

    /// Forbid sharing an AS number with other live circuits.
    pub no_as_intersection: bool,

    /// Scope of the AS-disjointness check.
    pub as_scope: AsIntersectionScope,

    /// Relays that must never appear in a path.
    pub banned_relays: HashSet<Fingerprint>,

    /// Relays preferred whenever they are eligible for a position.
    pub favorite_relays: Vec<Fingerprint>,

    /// How long to wait for each hop's handshake acknowledgment.
    pub handshake_timeout: Duration,

    /// Initial circuit-level send/receive window, in cells.
    pub circuit_window_initial: u16,

    /// Circuit-level window credit restored per sendme.
    pub circuit_window_increment: u16,

    /// Initial stream-level send/receive window, in cells.
    pub stream_window_initial: u16,

    /// Stream-level window credit restored per sendme.
    pub stream_window_increment: u16,

    /// Maximum bytes queued per stream while its window is exhausted.
    /// Exceeding this drops the stream (bounds memory under a stalled peer).
    pub queued_bytes_cap: usize,

    /// Maximum streams attached to one circuit.
    pub max_streams_per_circuit: u16,

    /// Stream handling on circuit teardown.
    pub detach_policy: DetachPolicy,

    /// Maximum allowed output:input ratio when decompressing.
    pub max_uncompression_factor: u64,

    /// Output size after which the uncompression factor is enforced.
    pub bomb_check_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_circuit_length: 3,
            distinct_countries: false,
            no_as_intersection: false,
            as_scope: AsIntersectionScope::SamePurpose,
            banned_relays: HashSet::new(),
            favorite_relays: Vec::new(),
            handshake_timeout: Duration::from_secs(10),
            circuit_window_initial: 1000,
            circuit_window_increment: 100,
            stream_window_initial: 500,
            stream_window_increment: 50,
            queued_bytes_cap: 256 * 1024,
            max_streams_per_circuit: 50,
            detach_policy: DetachPolicy::OrphanStreams,
            max_uncompression_factor: 25,
            bomb_check_threshold: 64 * 1024,
        }
    }
}

impl EngineConfig {
    /// Check the configuration for values the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.default_circuit_length) {
            return Err(EngineError::Config(format!(
                "circuit length {} outside 1-10",
                self.default_circuit_length
            )));
        }
        if self.circuit_window_initial == 0 || self.stream_window_initial == 0 {
            return Err(EngineError::Config("window size must be non-zero".into()));
        }
        if self.circuit_window_increment == 0 || self.stream_window_increment == 0 {
            return Err(EngineError::Config(
                "window increment must be non-zero".into(),
            ));
        }
        if self.circuit_window_increment > self.circuit_window_initial
            || self.stream_window_increment > self.stream_window_initial
        {
            return Err(EngineError::Config(
                "window increment larger than initial window".into(),
            ));
        }
        if self.queued_bytes_cap == 0 {
            return Err(EngineError::Config("queued_bytes_cap must be non-zero".into()));
        }
        if self.max_uncompression_factor == 0 {
            return Err(EngineError::Config(
                "max_uncompression_factor must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
