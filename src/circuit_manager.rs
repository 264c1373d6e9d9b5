//! Circuit table and lifecycle management
//!
//! Owns every live circuit, allocates identifiers (monotonic, never
//! reused within the process), launches builds against a pinned directory
//! snapshot, and tracks streams detached by teardown for reattachment.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use rand::Rng;
use serde::Serialize;

use crate::config::{AsIntersectionScope, EngineConfig};
use crate::directory::{DirectorySnapshot, Fingerprint};
use crate::error::{EngineError, Result};
use crate::path_selector::{select_path, PathConstraints};
use crate::protocol::cell::Cell;
use crate::protocol::circuit::{Circuit, CircuitPurpose, CircuitState, CloseReason};
use crate::protocol::crypto::HandshakeDriver;
use crate::protocol::flow_control::CircuitFlowControl;
use crate::protocol::stream::Stream;

/// Running counters, exported for host-side observability.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    /// Circuits that reached `Open`.
    pub circuits_opened: u64,
    /// Circuits torn down before reaching `Open`.
    pub circuits_failed: u64,
    /// Circuits closed after being open, for any reason.
    pub circuits_closed: u64,
    /// Link cells handed to the transport.
    pub cells_sent: u64,
    /// Link cells accepted from the transport.
    pub cells_received: u64,
    /// Cells dropped because their circuit id was unknown.
    pub cells_dropped: u64,
    /// Streams attached.
    pub streams_opened: u64,
    /// Streams closed or dropped.
    pub streams_closed: u64,
}

/// Owns all circuits and hands out identifiers.
pub struct CircuitManager {
    config: EngineConfig,
    circuits: HashMap<u32, Circuit>,
    /// Next identifier to hand out. Strictly increasing; exhaustion is an
    /// error rather than a wraparound.
    next_circuit_id: u32,
    /// Streams detached by teardown under the orphan policy, awaiting
    /// reattachment by the caller's retry logic.
    orphaned: Vec<Stream>,
    pub stats: EngineStats,
}

impl CircuitManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            circuits: HashMap::new(),
            next_circuit_id: 1,
            orphaned: Vec::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn circuit(&self, id: u32) -> Option<&Circuit> {
        self.circuits.get(&id)
    }

    pub fn circuit_mut(&mut self, id: u32) -> Option<&mut Circuit> {
        self.circuits.get_mut(&id)
    }

    pub fn circuit_ids(&self) -> Vec<u32> {
        self.circuits.keys().copied().collect()
    }

    pub fn circuit_count(&self) -> usize {
        self.circuits.len()
    }

    /// Remove a fully closed circuit from the table. The identifier stays
    /// burned.
    pub fn remove_circuit(&mut self, id: u32) -> Option<Circuit> {
        self.circuits.remove(&id)
    }

    /// Select a path and launch a build. Returns the new circuit id and
    /// the create cell to hand to the transport.
    ///
    /// The whole selection runs against the single `snapshot`, so a
    /// concurrent directory republish cannot produce a path that mixes
    /// two directory views.
    pub fn build_circuit(
        &mut self,
        snapshot: &DirectorySnapshot,
        purpose: CircuitPurpose,
        constraints: &PathConstraints,
        handshake: Box<dyn HandshakeDriver>,
        now: Instant,
        rng: &mut impl Rng,
    ) -> Result<(u32, Cell)> {
        let as_in_use = if constraints.no_as_intersection {
            self.live_as_numbers(purpose)
        } else {
            HashSet::new()
        };

        let path = select_path(constraints, snapshot, &as_in_use, rng)?;
        let id = self.allocate_circuit_id()?;

        let mut circuit = Circuit::new(
            id,
            path,
            purpose,
            handshake,
            self.config.handshake_timeout,
            CircuitFlowControl::new(
                self.config.circuit_window_initial,
                self.config.circuit_window_increment,
            ),
            self.config.stream_window_initial,
            self.config.stream_window_increment,
            now,
        );
        let create = circuit.start_build(now)?;
        self.circuits.insert(id, circuit);
        self.stats.cells_sent += 1;
        Ok((id, create))
    }

    /// AS numbers of hops on live circuits, scoped per configuration.
    pub fn live_as_numbers(&self, purpose: CircuitPurpose) -> HashSet<u32> {
        self.circuits
            .values()
            .filter(|c| {
                matches!(c.state(), CircuitState::Building | CircuitState::Open)
                    && match self.config.as_scope {
                        AsIntersectionScope::AllCircuits => true,
                        AsIntersectionScope::SamePurpose => c.purpose == purpose,
                    }
            })
            .flat_map(|c| c.as_numbers())
            .collect()
    }

    /// Pick an open circuit that can carry a new stream (exit-capable if
    /// required, ending at `required_exit` when one is pinned, stream
    /// slot available).
    pub fn open_circuit_for(
        &self,
        purpose: CircuitPurpose,
        needs_exit: bool,
        required_exit: Option<&Fingerprint>,
    ) -> Result<u32> {
        self.circuits
            .values()
            .filter(|c| {
                c.is_open()
                    && c.purpose == purpose
                    && (!needs_exit || c.can_exit())
                    && required_exit.map_or(true, |fp| {
                        c.hops().last().map(|h| &h.relay.fingerprint == fp).unwrap_or(false)
                    })
                    && c.stream_count() < self.config.max_streams_per_circuit as usize
            })
            // Prefer the emptiest circuit.
            .min_by_key(|c| c.stream_count())
            .map(|c| c.id)
            .ok_or(EngineError::NoEligibleCircuit)
    }

    /// Advance per-circuit deadlines. Returns circuits whose handshake
    /// timed out; they are now `Closing` and awaiting teardown.
    pub fn expired_circuits(&mut self, now: Instant) -> Vec<(u32, CloseReason)> {
        let mut expired = Vec::new();
        for circuit in self.circuits.values_mut() {
            if let Some(reason) = circuit.tick(now) {
                expired.push((circuit.id, reason));
            }
        }
        expired
    }

    /// Stash streams detached by a teardown.
    pub fn push_orphans(&mut self, streams: Vec<Stream>) {
        self.orphaned.extend(streams);
    }

    /// Drain the orphan stash. The caller reattaches them (or closes
    /// them) according to its retry policy.
    pub fn take_orphaned(&mut self) -> Vec<Stream> {
        std::mem::take(&mut self.orphaned)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphaned.len()
    }

    fn allocate_circuit_id(&mut self) -> Result<u32> {
        let id = self.next_circuit_id;
        self.next_circuit_id = self.next_circuit_id.checked_add(1).ok_or_else(|| {
            EngineError::ResourceExhausted("circuit identifier space exhausted".into())
        })?;
        Ok(id)
    }
}
