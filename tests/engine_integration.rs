//! End-to-end engine scenarios over the public API: wire-level circuit
//! builds, flow control, teardown semantics and document decompression.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use onion_engine::protocol::cell::{Cell, CellCommand, DestroyReason, RelayCell, RelayCommand};
use onion_engine::protocol::circuit::CircuitPurpose;
use onion_engine::protocol::crypto::testing::{NullHandshake, NullSuite};
use onion_engine::protocol::crypto::{CryptoSuite, HandshakeDriver, HopKeys, RelayCrypto};
use onion_engine::{
    AsIntersectionScope, CloseReason, CompressError, CompressionMethod, CountryCode, Engine,
    EngineConfig, EngineEvent, Fingerprint, InMemoryDirectory, PathConstraints, RelayDescriptor,
    RelayFlags, StreamRequest, FINGERPRINT_LEN,
};

fn relay(id: u8, country: &str, asn: u32) -> RelayDescriptor {
    RelayDescriptor {
        fingerprint: Fingerprint::new([id; FINGERPRINT_LEN]),
        nickname: format!("relay{}", id),
        address: format!("10.0.0.{}:9001", id).parse().unwrap(),
        onion_key: [id; 32],
        bandwidth: 1_000_000,
        country: CountryCode::new(country),
        as_number: asn,
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

fn six_relay_directory() -> Arc<InMemoryDirectory> {
    Arc::new(InMemoryDirectory::new(vec![
        relay(1, "de", 100),
        relay(2, "de", 200),
        relay(3, "fr", 300),
        relay(4, "fr", 400),
        relay(5, "nl", 500),
        relay(6, "nl", 600),
    ]))
}

fn engine(config: EngineConfig) -> Engine {
    Engine::with_seed(config, six_relay_directory(), Box::new(NullSuite::new()), 1234).unwrap()
}

fn created_cell(circuit_id: u32) -> Cell {
    Cell::new(circuit_id, CellCommand::Created, vec![0u8; 64])
}

fn relay_wire_cell(circuit_id: u32, command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Cell {
    let rc = RelayCell::new(command, stream_id, data);
    Cell::new(circuit_id, CellCommand::Relay, rc.to_bytes().unwrap())
}

fn extended_cell(circuit_id: u32) -> Cell {
    relay_wire_cell(circuit_id, RelayCommand::Extended, 0, vec![0u8; 64])
}

/// Feed the acknowledgment cells for a full build; returns true once the
/// open event fires.
fn drive_build(engine: &mut Engine, circuit_id: u32, hops: usize, now: Instant) -> bool {
    let out = engine.handle_cell(created_cell(circuit_id), now).unwrap();
    if out
        .events
        .contains(&EngineEvent::CircuitOpen { circuit_id })
    {
        return true;
    }
    for _ in 1..hops {
        let out = engine.handle_cell(extended_cell(circuit_id), now).unwrap();
        if out
            .events
            .contains(&EngineEvent::CircuitOpen { circuit_id })
        {
            return true;
        }
    }
    false
}

fn open_circuit(engine: &mut Engine, now: Instant) -> u32 {
    let (id, out) = engine
        .build_circuit(CircuitPurpose::General, now)
        .unwrap();
    assert_eq!(out.cells.len(), 1);
    assert_eq!(out.cells[0].command, CellCommand::Create);
    let hops = engine.manager().circuit(id).unwrap().hop_count();
    assert!(drive_build(engine, id, hops, now));
    id
}

fn attach_stream(engine: &mut Engine, now: Instant) -> (u32, u16) {
    let constraints = PathConstraints::from_config(engine.config(), true);
    let (req, out) = engine
        .request_stream("example.com", 80, &constraints, now)
        .unwrap();
    let StreamRequest::Opened {
        circuit_id,
        stream_id,
    } = req
    else {
        panic!("expected an open circuit to carry the stream");
    };
    assert_eq!(out.cells.len(), 1);
    let out = engine
        .handle_cell(
            relay_wire_cell(circuit_id, RelayCommand::Connected, stream_id, Vec::new()),
            now,
        )
        .unwrap();
    assert!(out.events.contains(&EngineEvent::StreamAttached {
        circuit_id,
        stream_id
    }));
    (circuit_id, stream_id)
}

#[test]
fn country_diverse_path_uses_one_hop_per_country() {
    let mut config = EngineConfig::default();
    config.distinct_countries = true;
    let mut engine = engine(config);
    let now = Instant::now();

    for _ in 0..10 {
        let (id, _) = engine
            .build_circuit(CircuitPurpose::General, now)
            .unwrap();
        let countries: HashSet<&str> = engine
            .manager()
            .circuit(id)
            .unwrap()
            .hops()
            .iter()
            .map(|h| h.relay.country.as_str())
            .collect();
        assert_eq!(countries.len(), 3);
        engine.close_circuit(id);
    }
}

#[test]
fn full_circuit_lifecycle_over_the_wire() {
    let mut engine = engine(EngineConfig::default());
    let now = Instant::now();

    let circuit_id = open_circuit(&mut engine, now);
    assert_eq!(engine.stats().circuits_opened, 1);

    let (cid, stream_id) = attach_stream(&mut engine, now);
    assert_eq!(cid, circuit_id);

    // Send a request, receive a response.
    let out = engine.send(circuit_id, stream_id, b"GET / HTTP/1.0\r\n\r\n").unwrap();
    assert_eq!(out.cells.len(), 1);

    let out = engine
        .handle_cell(
            relay_wire_cell(circuit_id, RelayCommand::Data, stream_id, b"200 OK".to_vec()),
            now,
        )
        .unwrap();
    assert!(out.events.contains(&EngineEvent::StreamData {
        circuit_id,
        stream_id,
        data: b"200 OK".to_vec()
    }));

    // Remote end closes the stream.
    let out = engine
        .handle_cell(
            relay_wire_cell(circuit_id, RelayCommand::End, stream_id, Vec::new()),
            now,
        )
        .unwrap();
    assert!(out.events.contains(&EngineEvent::StreamClosed {
        circuit_id,
        stream_id
    }));

    // Local teardown emits a destroy cell.
    let out = engine.close_circuit(circuit_id);
    assert!(out
        .cells
        .iter()
        .any(|c| c.command == CellCommand::Destroy));
    assert!(engine.manager().circuit(circuit_id).is_none());
}

#[test]
fn peer_end_reply_completes_local_close() {
    let mut engine = engine(EngineConfig::default());
    let now = Instant::now();

    let circuit_id = open_circuit(&mut engine, now);
    let (cid, stream_id) = attach_stream(&mut engine, now);
    assert_eq!(cid, circuit_id);

    let out = engine.close_stream(circuit_id, stream_id).unwrap();
    assert!(out.events.contains(&EngineEvent::StreamClosed {
        circuit_id,
        stream_id
    }));

    // The exit answers our end with its own; the circuit survives.
    let out = engine
        .handle_cell(
            relay_wire_cell(circuit_id, RelayCommand::End, stream_id, Vec::new()),
            now,
        )
        .unwrap();
    assert!(out.is_empty());
    assert!(engine.manager().circuit(circuit_id).unwrap().is_open());

    // And keeps carrying new streams.
    let (cid, _) = attach_stream(&mut engine, now);
    assert_eq!(cid, circuit_id);
}

#[test]
fn stream_request_launches_build_when_no_circuit_qualifies() {
    let mut engine = engine(EngineConfig::default());
    let now = Instant::now();

    // Cold start: no circuits at all.
    let constraints = PathConstraints::from_config(engine.config(), true);
    let (req, out) = engine
        .request_stream("example.com", 80, &constraints, now)
        .unwrap();
    let StreamRequest::BuildLaunched { circuit_id } = req else {
        panic!("expected a build to be launched");
    };
    assert_eq!(out.cells.len(), 1);
    assert_eq!(out.cells[0].command, CellCommand::Create);
    // The stream waits for the circuit.
    assert_eq!(engine.manager().orphan_count(), 1);

    // Once the build completes, reattachment sends the begin cell.
    let hops = engine.manager().circuit(circuit_id).unwrap().hop_count();
    assert!(drive_build(&mut engine, circuit_id, hops, now));
    let out = engine.reattach_orphaned();
    assert_eq!(out.cells.len(), 1);
    let rc = RelayCell::from_bytes(&out.cells[0].payload).unwrap();
    assert_eq!(rc.command, RelayCommand::Begin);
    assert_eq!(engine.manager().orphan_count(), 0);
    assert_eq!(
        engine.manager().circuit(circuit_id).unwrap().stream_count(),
        1
    );
}

/// Crypto double whose inbound attribution skips one hop: an extended
/// appears to acknowledge hop k+2 instead of k+1.
struct SkipHopRelay;

impl RelayCrypto for SkipHopRelay {
    fn wrap_outbound(&self, _hops: &[HopKeys], _payload: &mut [u8; 509]) -> onion_engine::Result<()> {
        Ok(())
    }
    fn unwrap_inbound(&self, hops: &[HopKeys], _payload: &mut [u8; 509]) -> onion_engine::Result<usize> {
        Ok(hops.len())
    }
}

struct SkipHopSuite {
    relay: SkipHopRelay,
}

impl CryptoSuite for SkipHopSuite {
    fn new_handshake(&self) -> Box<dyn HandshakeDriver> {
        Box::new(NullHandshake)
    }
    fn relay_crypto(&self) -> &dyn RelayCrypto {
        &self.relay
    }
}

#[test]
fn skipped_hop_ack_tears_circuit_down() {
    let mut engine = Engine::with_seed(
        EngineConfig::default(),
        six_relay_directory(),
        Box::new(SkipHopSuite { relay: SkipHopRelay }),
        1234,
    )
    .unwrap();
    let now = Instant::now();

    let (circuit_id, _) = engine
        .build_circuit(CircuitPurpose::General, now)
        .unwrap();
    // Hop 0 acknowledges normally.
    engine.handle_cell(created_cell(circuit_id), now).unwrap();

    // The next extended claims to acknowledge hop 2 while hop 1 is still
    // outstanding.
    let out = engine.handle_cell(extended_cell(circuit_id), now).unwrap();
    assert!(out.events.contains(&EngineEvent::CircuitClosed {
        circuit_id,
        reason: CloseReason::ProtocolViolation
    }));
    assert!(out
        .cells
        .iter()
        .any(|c| c.command == CellCommand::Destroy));
    assert!(engine.manager().circuit(circuit_id).is_none());
    assert_eq!(engine.stats().circuits_failed, 1);
}

#[test]
fn data_stalls_without_sendme_credit() {
    let mut config = EngineConfig::default();
    config.stream_window_initial = 4;
    config.stream_window_increment = 2;
    let mut engine = engine(config);
    let now = Instant::now();

    open_circuit(&mut engine, now);
    let (circuit_id, stream_id) = attach_stream(&mut engine, now);

    // Seven cells' worth against a window of 4: exactly 4 transmitted.
    let payload = vec![5u8; RelayCell::MAX_DATA_SIZE * 7];
    let out = engine.send(circuit_id, stream_id, &payload).unwrap();
    assert_eq!(out.cells.len(), 4);

    // Still nothing without credit.
    let out = engine.send(circuit_id, stream_id, &[]).unwrap();
    assert!(out.cells.is_empty());

    // Each sendme releases increment-many queued cells.
    let out = engine
        .handle_cell(
            relay_wire_cell(circuit_id, RelayCommand::Sendme, stream_id, Vec::new()),
            now,
        )
        .unwrap();
    assert_eq!(out.cells.len(), 2);
    let out = engine
        .handle_cell(
            relay_wire_cell(circuit_id, RelayCommand::Sendme, stream_id, Vec::new()),
            now,
        )
        .unwrap();
    assert_eq!(out.cells.len(), 1);
}

#[test]
fn as_disjoint_circuits_share_no_network() {
    let mut config = EngineConfig::default();
    config.no_as_intersection = true;
    config.as_scope = AsIntersectionScope::AllCircuits;
    let mut engine = engine(config);
    let now = Instant::now();

    let (a, _) = engine.build_circuit(CircuitPurpose::General, now).unwrap();
    let (b, _) = engine.build_circuit(CircuitPurpose::General, now).unwrap();

    let as_a: HashSet<u32> = engine.manager().circuit(a).unwrap().as_numbers().collect();
    let as_b: HashSet<u32> = engine.manager().circuit(b).unwrap().as_numbers().collect();
    assert!(as_a.is_disjoint(&as_b));
}

#[test]
fn handshake_timeout_fails_the_build() {
    let mut config = EngineConfig::default();
    config.handshake_timeout = Duration::from_secs(5);
    let mut engine = engine(config);
    let now = Instant::now();

    let (circuit_id, _) = engine.build_circuit(CircuitPurpose::General, now).unwrap();

    // Nothing expires early.
    assert!(engine.tick(now + Duration::from_secs(4)).is_empty());

    let out = engine.tick(now + Duration::from_secs(6));
    assert!(out.events.contains(&EngineEvent::CircuitClosed {
        circuit_id,
        reason: CloseReason::Timeout
    }));
    assert!(out
        .cells
        .iter()
        .any(|c| c.command == CellCommand::Destroy));
    assert_eq!(engine.stats().circuits_failed, 1);
}

#[test]
fn network_destroy_orphans_streams_for_reattachment() {
    let mut engine = engine(EngineConfig::default());
    let now = Instant::now();

    open_circuit(&mut engine, now);
    let (circuit_id, _stream_id) = attach_stream(&mut engine, now);

    let out = engine
        .handle_cell(Cell::destroy(circuit_id, DestroyReason::Hibernating), now)
        .unwrap();
    assert!(out.events.contains(&EngineEvent::CircuitClosed {
        circuit_id,
        reason: CloseReason::Destroyed(DestroyReason::Hibernating)
    }));
    assert!(out
        .events
        .contains(&EngineEvent::StreamsOrphaned { count: 1 }));
    assert_eq!(engine.manager().orphan_count(), 1);

    // No open circuit yet; the orphan stays stashed.
    assert!(engine.reattach_orphaned().is_empty());
    assert_eq!(engine.manager().orphan_count(), 1);

    // A fresh circuit picks it up with a new begin cell.
    let replacement = open_circuit(&mut engine, now);
    let out = engine.reattach_orphaned();
    assert_eq!(out.cells.len(), 1);
    assert_eq!(engine.manager().orphan_count(), 0);
    assert_eq!(
        engine.manager().circuit(replacement).unwrap().stream_count(),
        1
    );
}

#[test]
fn transport_loss_closes_everything_silently() {
    let mut engine = engine(EngineConfig::default());
    let now = Instant::now();

    let a = open_circuit(&mut engine, now);
    let (b, _) = engine.build_circuit(CircuitPurpose::General, now).unwrap();

    let out = engine.transport_lost();
    // No cells can be delivered on a dead transport.
    assert!(out.cells.is_empty());
    for id in [a, b] {
        assert!(out.events.contains(&EngineEvent::CircuitClosed {
            circuit_id: id,
            reason: CloseReason::TransportLost
        }));
        assert!(engine.manager().circuit(id).is_none());
    }
}

#[test]
fn shutdown_destroys_all_circuits() {
    let mut engine = engine(EngineConfig::default());
    let now = Instant::now();

    open_circuit(&mut engine, now);
    open_circuit(&mut engine, now);

    let out = engine.shutdown();
    assert_eq!(
        out.cells
            .iter()
            .filter(|c| c.command == CellCommand::Destroy)
            .count(),
        2
    );
    assert_eq!(engine.manager().circuit_count(), 0);
}

#[test]
fn directory_documents_decompress_with_bomb_guard() {
    let engine = engine(EngineConfig::default());

    let doc = b"router relay1 10.0.0.1 9001\nbandwidth 1000000\n".repeat(50);
    let packed = onion_engine::compress::compress_all(&doc, CompressionMethod::Gzip).unwrap();
    assert_eq!(engine.decompress_document(&packed).unwrap(), doc);

    // 4 MiB of zeros compresses far past the allowed expansion ratio.
    let bomb_input = onion_engine::compress::compress_all(
        &vec![0u8; 4 * 1024 * 1024],
        CompressionMethod::Zlib,
    )
    .unwrap();
    let err = engine.decompress_document(&bomb_input).unwrap_err();
    assert!(matches!(
        err,
        onion_engine::EngineError::Compress(CompressError::Bomb { .. })
    ));
}

#[test]
fn late_cell_for_closed_circuit_is_harmless() {
    let mut engine = engine(EngineConfig::default());
    let now = Instant::now();

    let circuit_id = open_circuit(&mut engine, now);
    engine.close_circuit(circuit_id);

    // A straggler data cell for the dead circuit is dropped, and the
    // engine keeps working.
    let out = engine
        .handle_cell(
            relay_wire_cell(circuit_id, RelayCommand::Data, 1, b"late".to_vec()),
            now,
        )
        .unwrap();
    assert!(out.is_empty());
    assert_eq!(engine.stats().cells_dropped, 1);

    open_circuit(&mut engine, now);
}
