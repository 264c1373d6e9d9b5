//! Circuit entity and build state machine
//!
//! A circuit walks `Pending -> Building -> Open -> Closing -> Closed`.
//! Building extends hop by hop: the create cell handshakes with hop 0,
//! then each acknowledged hop relays an extend to the next. Hop
//! acknowledgments must arrive strictly in order; anything else is a
//! protocol violation and tears the circuit down. Once a circuit is open
//! its hop list never changes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::DetachPolicy;
use crate::directory::RelayDescriptor;
use crate::error::{EngineError, Result};
use crate::protocol::cell::{Cell, CellCommand, DestroyReason, RelayCell, RelayCommand};
use crate::protocol::crypto::{HandshakeDriver, HopKeys, RelayCrypto};
use crate::protocol::flow_control::{CircuitFlowControl, StreamFlowControl};
use crate::protocol::stream::{Stream, StreamState, StreamTarget};

/// Circuit lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Path selected, nothing sent yet.
    Pending,
    /// Create sent; extends pending for the remaining hops.
    Building,
    /// Every hop acknowledged.
    Open,
    /// Teardown initiated; streams being released.
    Closing,
    /// Terminal. The identifier is never reused.
    Closed,
}

/// What a circuit is for; constrains reuse and AS-disjointness scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPurpose {
    General,
    DirectoryFetch,
    ExitTest,
}

/// Why a circuit is closing or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit local teardown request.
    Requested,
    /// Malformed cell, out-of-order ack, or invalid reference.
    ProtocolViolation,
    /// A hop's handshake acknowledgment never arrived.
    Timeout,
    /// The network sent us a destroy cell.
    Destroyed(DestroyReason),
    /// Connection to the first hop was lost.
    TransportLost,
    /// Normal end of life.
    Finished,
}

/// One relay position within a circuit.
#[derive(Debug, Clone)]
pub struct Hop {
    pub relay: RelayDescriptor,
    pub acked: bool,
}

/// Result of processing one in-order hop acknowledgment.
#[derive(Debug)]
pub enum BuildProgress {
    /// Send this extend cell toward the next hop.
    ExtendNext(Cell),
    /// All hops acknowledged; the circuit is open.
    Open,
}

/// Streams released by `finish_close`, split by what happened to them.
pub struct ReleasedStreams {
    pub closed: Vec<Stream>,
    pub orphaned: Vec<Stream>,
}

/// A single circuit through the overlay.
pub struct Circuit {
    /// Locally unique identifier; never reused within the process.
    pub id: u32,

    pub purpose: CircuitPurpose,

    /// Ordered hops. Fixed after building completes.
    hops: Vec<Hop>,

    /// Derived transport keys, one per acknowledged hop, in hop order.
    key_ring: Vec<HopKeys>,

    state: CircuitState,
    close_reason: Option<CloseReason>,

    pub created_at: Instant,

    /// Armed while a hop acknowledgment is outstanding.
    handshake_deadline: Option<Instant>,
    handshake_timeout: Duration,
    handshake: Option<Box<dyn HandshakeDriver>>,

    /// Index of the next hop whose ack we expect.
    next_unacked: usize,

    /// Circuit-level windows.
    pub flow: CircuitFlowControl,

    streams: HashMap<u16, Stream>,
    next_stream_id: u16,

    stream_window_initial: u16,
    stream_window_increment: u16,
}

impl Circuit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        path: Vec<RelayDescriptor>,
        purpose: CircuitPurpose,
        handshake: Box<dyn HandshakeDriver>,
        handshake_timeout: Duration,
        circuit_flow: CircuitFlowControl,
        stream_window_initial: u16,
        stream_window_increment: u16,
        now: Instant,
    ) -> Self {
        debug_assert!(!path.is_empty());
        Self {
            id,
            purpose,
            hops: path
                .into_iter()
                .map(|relay| Hop {
                    relay,
                    acked: false,
                })
                .collect(),
            key_ring: Vec::new(),
            state: CircuitState::Pending,
            close_reason: None,
            created_at: now,
            handshake_deadline: None,
            handshake_timeout,
            handshake: Some(handshake),
            next_unacked: 0,
            flow: circuit_flow,
            streams: HashMap::new(),
            next_stream_id: 1, // Stream IDs start at 1; 0 addresses the circuit
            stream_window_initial,
            stream_window_increment,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Transport keys for the acknowledged hops, in hop order.
    pub fn keys(&self) -> &[HopKeys] {
        &self.key_ring
    }

    /// AS numbers this circuit traverses.
    pub fn as_numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.hops.iter().map(|h| h.relay.as_number)
    }

    /// Whether the last hop can carry exit traffic to `target`.
    pub fn can_exit(&self) -> bool {
        self.hops
            .last()
            .map(|h| h.relay.exit_capable())
            .unwrap_or(false)
    }

    // ===== Build state machine =====

    /// Send the create cell for hop 0. `Pending -> Building`.
    pub fn start_build(&mut self, now: Instant) -> Result<Cell> {
        if self.state != CircuitState::Pending {
            return Err(EngineError::Internal(format!(
                "start_build in state {:?}",
                self.state
            )));
        }
        let onionskin = self
            .handshake
            .as_mut()
            .ok_or_else(|| EngineError::Internal("handshake driver missing".into()))?
            .onionskin(0, &self.hops[0].relay)?;

        self.state = CircuitState::Building;
        self.handshake_deadline = Some(now + self.handshake_timeout);
        log::debug!(
            "circuit {}: building, {} hops, entry {}",
            self.id,
            self.hops.len(),
            self.hops[0].relay.fingerprint.short()
        );
        Ok(Cell::new(self.id, CellCommand::Create, onionskin))
    }

    /// Process hop `hop_index`'s handshake acknowledgment.
    ///
    /// Acks must arrive strictly in order. An ack for any hop other than
    /// the next expected one forces `Closing` with `ProtocolViolation`.
    pub fn handle_hop_ack(
        &mut self,
        hop_index: usize,
        reply: &[u8],
        now: Instant,
        relay_crypto: &dyn RelayCrypto,
    ) -> Result<BuildProgress> {
        if self.state != CircuitState::Building {
            self.begin_close(CloseReason::ProtocolViolation);
            return Err(EngineError::ProtocolViolation(format!(
                "hop ack in state {:?}",
                self.state
            )));
        }
        if hop_index != self.next_unacked {
            self.begin_close(CloseReason::ProtocolViolation);
            return Err(EngineError::ProtocolViolation(format!(
                "out-of-order ack: got hop {}, expected hop {}",
                hop_index, self.next_unacked
            )));
        }

        let keys = match self
            .handshake
            .as_mut()
            .ok_or_else(|| EngineError::Internal("handshake driver missing".into()))?
            .complete(hop_index, reply)
        {
            Ok(keys) => keys,
            Err(e) => {
                self.begin_close(CloseReason::ProtocolViolation);
                return Err(e);
            }
        };
        self.hops[hop_index].acked = true;
        self.key_ring.push(keys);
        self.next_unacked += 1;

        if self.next_unacked == self.hops.len() {
            self.state = CircuitState::Open;
            self.handshake = None;
            self.handshake_deadline = None;
            log::info!("circuit {} open ({} hops)", self.id, self.hops.len());
            return Ok(BuildProgress::Open);
        }

        let cell = self.extend_cell(now, relay_crypto)?;
        Ok(BuildProgress::ExtendNext(cell))
    }

    /// Build the layer-encrypted extend cell for the next hop and re-arm
    /// the per-hop deadline.
    fn extend_cell(&mut self, now: Instant, relay_crypto: &dyn RelayCrypto) -> Result<Cell> {
        let next = self.next_unacked;
        let relay = self.hops[next].relay.clone();
        let onionskin = self
            .handshake
            .as_mut()
            .ok_or_else(|| EngineError::Internal("handshake driver missing".into()))?
            .onionskin(next, &relay)?;

        // Extend body: target fingerprint, then the handshake blob.
        let mut body = Vec::with_capacity(20 + onionskin.len());
        body.extend_from_slice(relay.fingerprint.as_bytes());
        body.extend_from_slice(&onionskin);

        let relay_cell = RelayCell::new(RelayCommand::Extend, 0, body);
        let mut payload: [u8; Cell::PAYLOAD_SIZE] = relay_cell
            .to_bytes()?
            .try_into()
            .map_err(|_| EngineError::Internal("relay payload size".into()))?;
        relay_crypto.wrap_outbound(&self.key_ring, &mut payload)?;

        self.handshake_deadline = Some(now + self.handshake_timeout);
        log::debug!(
            "circuit {}: extending to hop {} ({})",
            self.id,
            next,
            relay.fingerprint.short()
        );
        Ok(Cell::new(self.id, CellCommand::Relay, payload.to_vec()))
    }

    /// Observe the clock. Returns the close reason if a deadline fired.
    pub fn tick(&mut self, now: Instant) -> Option<CloseReason> {
        if self.state == CircuitState::Building {
            if let Some(deadline) = self.handshake_deadline {
                if now >= deadline {
                    log::warn!(
                        "circuit {}: handshake timeout at hop {}",
                        self.id,
                        self.next_unacked
                    );
                    self.begin_close(CloseReason::Timeout);
                    return Some(CloseReason::Timeout);
                }
            }
        }
        None
    }

    /// Cooperative teardown: mark `Closing`. In-flight processing of the
    /// current cell finishes before `finish_close` runs cleanup.
    pub fn begin_close(&mut self, reason: CloseReason) {
        match self.state {
            CircuitState::Closing | CircuitState::Closed => {}
            _ => {
                log::info!("circuit {} closing: {:?}", self.id, reason);
                self.state = CircuitState::Closing;
                self.close_reason = Some(reason);
            }
        }
    }

    /// Release all streams and key material. `Closing -> Closed`.
    pub fn finish_close(&mut self, policy: DetachPolicy) -> ReleasedStreams {
        debug_assert_eq!(self.state, CircuitState::Closing);
        let mut closed = Vec::new();
        let mut orphaned = Vec::new();

        for (_, mut stream) in self.streams.drain() {
            match policy {
                DetachPolicy::OrphanStreams if stream.is_open() => {
                    stream.state = StreamState::Orphaned;
                    orphaned.push(stream);
                }
                // A half-closed stream was already reported closed when
                // the local end went out; nothing left to release.
                _ if stream.state == StreamState::HalfClosed => {}
                _ => {
                    stream.state = StreamState::Closed;
                    closed.push(stream);
                }
            }
        }

        // Dropping the ring zeroizes each hop's key material synchronously.
        self.key_ring.clear();
        self.handshake = None;
        self.state = CircuitState::Closed;
        ReleasedStreams { closed, orphaned }
    }

    // ===== Streams =====

    /// Attach a new stream. Only an `Open` circuit accepts streams.
    pub fn attach_stream(&mut self, target: StreamTarget, max_streams: u16) -> Result<u16> {
        if self.state != CircuitState::Open {
            return Err(EngineError::CircuitNotOpen(self.id));
        }
        if self.streams.len() >= max_streams as usize {
            return Err(EngineError::ResourceExhausted(format!(
                "circuit {} stream limit ({}) reached",
                self.id, max_streams
            )));
        }
        let id = self.allocate_stream_id()?;
        let flow = StreamFlowControl::new(self.stream_window_initial, self.stream_window_increment);
        self.streams.insert(id, Stream::new(id, target, flow));
        Ok(id)
    }

    /// Re-home an orphaned stream onto this circuit with a fresh id and
    /// fresh windows.
    pub fn adopt_stream(&mut self, mut stream: Stream, max_streams: u16) -> Result<u16> {
        if self.state != CircuitState::Open {
            return Err(EngineError::CircuitNotOpen(self.id));
        }
        if self.streams.len() >= max_streams as usize {
            return Err(EngineError::ResourceExhausted(format!(
                "circuit {} stream limit ({}) reached",
                self.id, max_streams
            )));
        }
        let id = self.allocate_stream_id()?;
        stream.id = id;
        stream.state = StreamState::Pending;
        stream.flow = StreamFlowControl::new(self.stream_window_initial, self.stream_window_increment);
        self.streams.insert(id, stream);
        Ok(id)
    }

    pub fn stream(&self, id: u16) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn stream_mut(&mut self, id: u16) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn remove_stream(&mut self, id: u16) -> Option<Stream> {
        self.streams.remove(&id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_ids(&self) -> Vec<u16> {
        self.streams.keys().copied().collect()
    }

    /// Next free stream id, skipping 0 and wrapping; errors only if all
    /// 65535 ids are in use.
    fn allocate_stream_id(&mut self) -> Result<u16> {
        let start = self.next_stream_id;
        loop {
            let id = self.next_stream_id;
            self.next_stream_id = self.next_stream_id.wrapping_add(1);
            if self.next_stream_id == 0 {
                self.next_stream_id = 1;
            }
            if !self.streams.contains_key(&id) {
                return Ok(id);
            }
            if self.next_stream_id == start {
                return Err(EngineError::ResourceExhausted(
                    "no stream ids available".into(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{CountryCode, Fingerprint as Fp, RelayFlags, FINGERPRINT_LEN};
    use crate::protocol::crypto::testing::{NullCrypto, NullHandshake};
    use rand::{Rng, SeedableRng};

    fn relay(id: u8) -> RelayDescriptor {
        RelayDescriptor {
            fingerprint: Fp::new([id; FINGERPRINT_LEN]),
            nickname: format!("relay{}", id),
            address: format!("10.0.0.{}:9001", id).parse().unwrap(),
            onion_key: [id; 32],
            bandwidth: 1_000_000,
            country: CountryCode::new("de"),
            as_number: id as u32,
            flags: RelayFlags {
                guard: true,
                exit: true,
                fast: true,
                stable: true,
                running: true,
                valid: true,
                ..Default::default()
            },
        }
    }

    fn circuit(hops: usize) -> Circuit {
        Circuit::new(
            1,
            (0..hops).map(|i| relay(i as u8 + 1)).collect(),
            CircuitPurpose::General,
            Box::new(NullHandshake),
            Duration::from_secs(10),
            CircuitFlowControl::new(1000, 100),
            500,
            50,
            Instant::now(),
        )
    }

    #[test]
    fn builds_through_ordered_acks() {
        let crypto = NullCrypto;
        let mut c = circuit(3);
        let now = Instant::now();

        assert_eq!(c.state(), CircuitState::Pending);
        let create = c.start_build(now).unwrap();
        assert_eq!(create.command, CellCommand::Create);
        assert_eq!(c.state(), CircuitState::Building);

        for hop in 0..3 {
            let progress = c.handle_hop_ack(hop, &[0u8; 64], now, &crypto).unwrap();
            match progress {
                BuildProgress::ExtendNext(cell) => {
                    assert!(hop < 2);
                    assert_eq!(cell.command, CellCommand::Relay);
                }
                BuildProgress::Open => assert_eq!(hop, 2),
            }
        }
        assert!(c.is_open());
        assert_eq!(c.keys().len(), 3);
    }

    #[test]
    fn out_of_order_ack_is_protocol_violation() {
        let crypto = NullCrypto;
        let mut c = circuit(3);
        let now = Instant::now();
        c.start_build(now).unwrap();

        c.handle_hop_ack(0, &[0u8; 64], now, &crypto).unwrap();
        // Hop 2's ack arrives before hop 1's.
        let err = c.handle_hop_ack(2, &[0u8; 64], now, &crypto).unwrap_err();
        assert!(matches!(err, EngineError::ProtocolViolation(_)));
        assert_eq!(c.state(), CircuitState::Closing);
        assert_eq!(c.close_reason(), Some(CloseReason::ProtocolViolation));
    }

    #[test]
    fn duplicate_ack_is_protocol_violation() {
        let crypto = NullCrypto;
        let mut c = circuit(2);
        let now = Instant::now();
        c.start_build(now).unwrap();
        c.handle_hop_ack(0, &[0u8; 64], now, &crypto).unwrap();
        assert!(c.handle_hop_ack(0, &[0u8; 64], now, &crypto).is_err());
        assert_eq!(c.state(), CircuitState::Closing);
    }

    #[test]
    fn handshake_timeout_closes() {
        let mut c = circuit(3);
        let now = Instant::now();
        c.start_build(now).unwrap();

        assert_eq!(c.tick(now), None);
        let later = now + Duration::from_secs(11);
        assert_eq!(c.tick(later), Some(CloseReason::Timeout));
        assert_eq!(c.state(), CircuitState::Closing);
    }

    #[test]
    fn random_ack_orders_only_in_order_survives() {
        // Any permutation other than 0,1,2,... must end in
        // Closing/ProtocolViolation.
        let crypto = NullCrypto;
        let mut rng = rand::rngs::SmallRng::seed_from_u64(11);
        let now = Instant::now();

        for _ in 0..200 {
            let hops = rng.gen_range(2..=5usize);
            let mut order: Vec<usize> = (0..hops).collect();
            // Fisher-Yates
            for i in (1..hops).rev() {
                let j = rng.gen_range(0..=i);
                order.swap(i, j);
            }

            let mut c = circuit(hops);
            c.start_build(now).unwrap();
            let in_order = order.iter().copied().eq(0..hops);

            let mut violated = false;
            for &hop in &order {
                match c.handle_hop_ack(hop, &[0u8; 64], now, &crypto) {
                    Ok(_) => {}
                    Err(_) => {
                        violated = true;
                        break;
                    }
                }
            }

            if in_order {
                assert!(!violated);
                assert!(c.is_open());
            } else {
                assert!(violated);
                assert_eq!(c.state(), CircuitState::Closing);
                assert_eq!(c.close_reason(), Some(CloseReason::ProtocolViolation));
            }
        }
    }

    #[test]
    fn finish_close_releases_streams_per_policy() {
        let crypto = NullCrypto;
        let now = Instant::now();
        let mut c = circuit(2);
        c.start_build(now).unwrap();
        c.handle_hop_ack(0, &[0u8; 64], now, &crypto).unwrap();
        c.handle_hop_ack(1, &[0u8; 64], now, &crypto).unwrap();

        let target = StreamTarget {
            host: "example.com".into(),
            port: 80,
        };
        c.attach_stream(target.clone(), 50).unwrap();
        c.attach_stream(target.clone(), 50).unwrap();

        // Already half-closed locally; its closure was reported then.
        let half = c.attach_stream(target, 50).unwrap();
        c.stream_mut(half).unwrap().state = StreamState::HalfClosed;

        c.begin_close(CloseReason::Requested);
        let released = c.finish_close(DetachPolicy::OrphanStreams);
        assert_eq!(released.orphaned.len(), 2);
        assert!(released.closed.is_empty());
        assert_eq!(c.state(), CircuitState::Closed);
        assert!(c.keys().is_empty());
    }

    #[test]
    fn attach_requires_open() {
        let mut c = circuit(2);
        let err = c
            .attach_stream(
                StreamTarget {
                    host: "example.com".into(),
                    port: 80,
                },
                50,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::CircuitNotOpen(_)));
    }

    #[test]
    fn stream_ids_skip_zero_and_do_not_collide() {
        let crypto = NullCrypto;
        let now = Instant::now();
        let mut c = circuit(1);
        c.start_build(now).unwrap();
        c.handle_hop_ack(0, &[0u8; 64], now, &crypto).unwrap();

        let target = StreamTarget {
            host: "example.com".into(),
            port: 80,
        };
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = c.attach_stream(target.clone(), 200).unwrap();
            assert_ne!(id, 0);
            assert!(seen.insert(id));
        }
    }
}
