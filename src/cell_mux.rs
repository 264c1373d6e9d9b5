//! Cell multiplexer
//!
//! The single dispatch point between the transport and the circuit table.
//! Inbound cells are routed by circuit id, relay payloads are unwrapped
//! through the crypto seam, and every state change comes back to the
//! caller as a batch of outbound cells plus host-visible events. A cell
//! that violates the protocol tears its circuit down; it is never
//! silently ignored. The one exception is a cell for an unknown circuit
//! id, which is logged and dropped so a late cell for an already-closed
//! circuit cannot kill anything else.

use std::time::Instant;

use crate::circuit_manager::CircuitManager;
use crate::error::{EngineError, Result};
use crate::protocol::cell::{Cell, CellCommand, DestroyReason, RelayCell, RelayCommand};
use crate::protocol::circuit::{BuildProgress, CircuitState, CloseReason};
use crate::protocol::crypto::{HopKeys, RelayCrypto};
use crate::protocol::stream::{StreamState, StreamTarget};

/// Host-visible notification produced while processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// All hops acknowledged; the circuit accepts streams now.
    CircuitOpen { circuit_id: u32 },

    /// The circuit is gone. Its id will never be reused.
    CircuitClosed { circuit_id: u32, reason: CloseReason },

    /// The exit acknowledged the stream; data may flow.
    StreamAttached { circuit_id: u32, stream_id: u16 },

    /// Inbound application data.
    StreamData {
        circuit_id: u32,
        stream_id: u16,
        data: Vec<u8>,
    },

    /// The stream is closed (remote end, local close, or dropped for
    /// exceeding its queue cap).
    StreamClosed { circuit_id: u32, stream_id: u16 },

    /// Streams were detached by a teardown and moved to the orphan
    /// stash for reattachment.
    StreamsOrphaned { count: usize },
}

/// Result of one engine operation: cells for the transport plus events
/// for the host, in the order they were produced.
#[derive(Debug, Default)]
pub struct Output {
    pub cells: Vec<Cell>,
    pub events: Vec<EngineEvent>,
}

impl Output {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.events.is_empty()
    }

    pub fn merge(&mut self, other: Output) {
        self.cells.extend(other.cells);
        self.events.extend(other.events);
    }
}

/// Process one inbound cell.
pub fn handle_cell(
    mgr: &mut CircuitManager,
    crypto: &dyn RelayCrypto,
    cell: Cell,
    now: Instant,
) -> Result<Output> {
    mgr.stats.cells_received += 1;

    if mgr.circuit(cell.circuit_id).is_none() {
        // Late cell for a closed circuit, or garbage. Drop it.
        log::warn!(
            "dropping {:?} cell for unknown circuit {}",
            cell.command,
            cell.circuit_id
        );
        mgr.stats.cells_dropped += 1;
        return Ok(Output::default());
    }

    match cell.command {
        CellCommand::Padding => Ok(Output::default()),
        CellCommand::Created => handle_created(mgr, crypto, cell, now),
        CellCommand::Relay => handle_relay(mgr, crypto, cell, now),
        CellCommand::Destroy => {
            let reason = DestroyReason::from_u8(cell.payload.first().copied().unwrap_or(0));
            log::info!(
                "circuit {}: destroy from network ({})",
                cell.circuit_id,
                reason.name()
            );
            // The peer already considers the circuit dead; no destroy
            // goes back.
            Ok(teardown(
                mgr,
                cell.circuit_id,
                CloseReason::Destroyed(reason),
                false,
            ))
        }
        CellCommand::Create => {
            // Only relays receive create cells.
            Ok(teardown(
                mgr,
                cell.circuit_id,
                CloseReason::ProtocolViolation,
                true,
            ))
        }
    }
}

/// First hop's handshake acknowledgment.
fn handle_created(
    mgr: &mut CircuitManager,
    crypto: &dyn RelayCrypto,
    cell: Cell,
    now: Instant,
) -> Result<Output> {
    let circuit_id = cell.circuit_id;
    let circuit = mgr
        .circuit_mut(circuit_id)
        .ok_or(EngineError::CircuitNotFound(circuit_id))?;

    match circuit.handle_hop_ack(0, &cell.payload, now, crypto) {
        Ok(BuildProgress::ExtendNext(extend)) => {
            let mut out = Output::default();
            push_cell(mgr, &mut out, extend);
            Ok(out)
        }
        Ok(BuildProgress::Open) => {
            mgr.stats.circuits_opened += 1;
            Ok(Output {
                cells: Vec::new(),
                events: vec![EngineEvent::CircuitOpen { circuit_id }],
            })
        }
        Err(e) if e.is_circuit_fatal() => Ok(teardown(
            mgr,
            circuit_id,
            CloseReason::ProtocolViolation,
            true,
        )),
        Err(e) => Err(e),
    }
}

/// Unwrap and dispatch a relay cell.
fn handle_relay(
    mgr: &mut CircuitManager,
    crypto: &dyn RelayCrypto,
    cell: Cell,
    now: Instant,
) -> Result<Output> {
    let circuit_id = cell.circuit_id;

    let mut payload: [u8; Cell::PAYLOAD_SIZE] = match cell.payload.try_into() {
        Ok(p) => p,
        Err(_) => {
            return Ok(teardown(
                mgr,
                circuit_id,
                CloseReason::ProtocolViolation,
                true,
            ))
        }
    };

    let unwrapped = {
        let circuit = mgr
            .circuit(circuit_id)
            .ok_or(EngineError::CircuitNotFound(circuit_id))?;
        crypto.unwrap_inbound(circuit.keys(), &mut payload)
    };
    let from_hop = match unwrapped {
        Ok(h) => h,
        // No hop recognized the cell.
        Err(_) => {
            return Ok(teardown(
                mgr,
                circuit_id,
                CloseReason::ProtocolViolation,
                true,
            ))
        }
    };
    let relay_cell = match RelayCell::from_bytes(&payload) {
        Ok(rc) if rc.recognized == 0 => rc,
        _ => {
            return Ok(teardown(
                mgr,
                circuit_id,
                CloseReason::ProtocolViolation,
                true,
            ))
        }
    };

    match relay_cell.command {
        RelayCommand::Extended => handle_extended(mgr, crypto, circuit_id, from_hop, relay_cell, now),
        RelayCommand::Data => handle_data(mgr, crypto, circuit_id, relay_cell),
        RelayCommand::Connected => handle_connected(mgr, circuit_id, relay_cell),
        RelayCommand::End => handle_end(mgr, circuit_id, relay_cell),
        RelayCommand::Sendme => handle_sendme(mgr, crypto, circuit_id, relay_cell),
        RelayCommand::Truncated => {
            let reason = DestroyReason::from_u8(relay_cell.data.first().copied().unwrap_or(0));
            log::info!(
                "circuit {}: truncated by relay ({})",
                circuit_id,
                reason.name()
            );
            Ok(teardown(
                mgr,
                circuit_id,
                CloseReason::Destroyed(reason),
                true,
            ))
        }
        RelayCommand::Drop => Ok(Output::default()),
        // Begin, Extend and Truncate only ever travel away from us.
        RelayCommand::Begin | RelayCommand::Extend | RelayCommand::Truncate => Ok(teardown(
            mgr,
            circuit_id,
            CloseReason::ProtocolViolation,
            true,
        )),
    }
}

fn handle_extended(
    mgr: &mut CircuitManager,
    crypto: &dyn RelayCrypto,
    circuit_id: u32,
    from_hop: usize,
    relay_cell: RelayCell,
    now: Instant,
) -> Result<Output> {
    if relay_cell.stream_id != 0 {
        return Ok(teardown(
            mgr,
            circuit_id,
            CloseReason::ProtocolViolation,
            true,
        ));
    }
    let circuit = mgr
        .circuit_mut(circuit_id)
        .ok_or(EngineError::CircuitNotFound(circuit_id))?;

    // An extended relayed by hop k acknowledges hop k+1.
    match circuit.handle_hop_ack(from_hop + 1, &relay_cell.data, now, crypto) {
        Ok(BuildProgress::ExtendNext(extend)) => {
            let mut out = Output::default();
            push_cell(mgr, &mut out, extend);
            Ok(out)
        }
        Ok(BuildProgress::Open) => {
            mgr.stats.circuits_opened += 1;
            Ok(Output {
                cells: Vec::new(),
                events: vec![EngineEvent::CircuitOpen { circuit_id }],
            })
        }
        Err(e) if e.is_circuit_fatal() => Ok(teardown(
            mgr,
            circuit_id,
            CloseReason::ProtocolViolation,
            true,
        )),
        Err(e) => Err(e),
    }
}

fn handle_data(
    mgr: &mut CircuitManager,
    crypto: &dyn RelayCrypto,
    circuit_id: u32,
    relay_cell: RelayCell,
) -> Result<Output> {
    let mut out = Output::default();
    let stream_id = relay_cell.stream_id;

    let stream_state = mgr
        .circuit(circuit_id)
        .and_then(|c| c.stream(stream_id))
        .map(|s| s.state);
    let Some(stream_state) = stream_state else {
        return Ok(teardown(
            mgr,
            circuit_id,
            CloseReason::ProtocolViolation,
            true,
        ));
    };

    let (circuit_owes, stream_owes) = {
        let circuit = mgr
            .circuit_mut(circuit_id)
            .ok_or(EngineError::CircuitNotFound(circuit_id))?;
        let circuit_owes = circuit.flow.window.note_received();
        let stream = circuit
            .stream_mut(stream_id)
            .ok_or_else(|| EngineError::Internal("stream vanished".into()))?;
        let stream_owes = stream.flow.window.note_received();
        stream.bytes_received += relay_cell.data.len() as u64;
        (circuit_owes, stream_owes)
    };

    if circuit_owes {
        send_sendme(mgr, crypto, circuit_id, 0, &mut out)?;
    }
    if stream_owes {
        send_sendme(mgr, crypto, circuit_id, stream_id, &mut out)?;
    }

    // Data racing our own end still spends window credit, but there is
    // no one left to deliver it to.
    if stream_state != StreamState::HalfClosed {
        out.events.push(EngineEvent::StreamData {
            circuit_id,
            stream_id,
            data: relay_cell.data,
        });
    }
    Ok(out)
}

fn handle_connected(
    mgr: &mut CircuitManager,
    circuit_id: u32,
    relay_cell: RelayCell,
) -> Result<Output> {
    let stream_id = relay_cell.stream_id;
    let state = mgr
        .circuit(circuit_id)
        .and_then(|c| c.stream(stream_id))
        .map(|s| s.state);

    // We closed the stream while its begin was still unanswered; the
    // exit's connected crossed our end in flight.
    if state == Some(StreamState::HalfClosed) {
        return Ok(Output::default());
    }
    // Connected for an unknown stream, or a stream already attached.
    if state != Some(StreamState::Pending) {
        return Ok(teardown(
            mgr,
            circuit_id,
            CloseReason::ProtocolViolation,
            true,
        ));
    }

    let circuit = mgr
        .circuit_mut(circuit_id)
        .ok_or(EngineError::CircuitNotFound(circuit_id))?;
    let stream = circuit
        .stream_mut(stream_id)
        .ok_or_else(|| EngineError::Internal("stream vanished".into()))?;
    stream.state = StreamState::Attached;
    log::debug!("circuit {} stream {}: attached", circuit_id, stream_id);
    Ok(Output {
        cells: Vec::new(),
        events: vec![EngineEvent::StreamAttached {
            circuit_id,
            stream_id,
        }],
    })
}

fn handle_end(mgr: &mut CircuitManager, circuit_id: u32, relay_cell: RelayCell) -> Result<Output> {
    let stream_id = relay_cell.stream_id;
    let state = mgr
        .circuit(circuit_id)
        .and_then(|c| c.stream(stream_id))
        .map(|s| s.state);

    match state {
        // An end referencing a stream we never had is a violation.
        None => Ok(teardown(
            mgr,
            circuit_id,
            CloseReason::ProtocolViolation,
            true,
        )),
        // The peer's half of the close handshake: either its reply to
        // our end or the two ends crossing in flight. The stream was
        // already reported closed when ours went out.
        Some(StreamState::HalfClosed) => {
            let circuit = mgr
                .circuit_mut(circuit_id)
                .ok_or(EngineError::CircuitNotFound(circuit_id))?;
            circuit.remove_stream(stream_id);
            Ok(Output::default())
        }
        Some(_) => {
            let circuit = mgr
                .circuit_mut(circuit_id)
                .ok_or(EngineError::CircuitNotFound(circuit_id))?;
            circuit.remove_stream(stream_id);
            mgr.stats.streams_closed += 1;
            Ok(Output {
                cells: Vec::new(),
                events: vec![EngineEvent::StreamClosed {
                    circuit_id,
                    stream_id,
                }],
            })
        }
    }
}

fn handle_sendme(
    mgr: &mut CircuitManager,
    crypto: &dyn RelayCrypto,
    circuit_id: u32,
    relay_cell: RelayCell,
) -> Result<Output> {
    let stream_id = relay_cell.stream_id;
    {
        let circuit = mgr
            .circuit_mut(circuit_id)
            .ok_or(EngineError::CircuitNotFound(circuit_id))?;

        let applied = if stream_id == 0 {
            circuit.flow.window.note_sendme_received()
        } else {
            match circuit.stream_mut(stream_id) {
                Some(stream) => stream.flow.window.note_sendme_received(),
                None => Err(EngineError::ProtocolViolation(format!(
                    "sendme for unknown stream {}",
                    stream_id
                ))),
            }
        };
        if applied.is_err() {
            // Bogus credit or bogus stream reference.
            return Ok(teardown(
                mgr,
                circuit_id,
                CloseReason::ProtocolViolation,
                true,
            ));
        }
    }

    // Fresh credit may release queued bytes.
    let mut out = Output::default();
    if stream_id == 0 {
        let ids = mgr
            .circuit(circuit_id)
            .map(|c| c.stream_ids())
            .unwrap_or_default();
        for id in ids {
            flush_stream(mgr, crypto, circuit_id, id, &mut out)?;
        }
    } else {
        flush_stream(mgr, crypto, circuit_id, stream_id, &mut out)?;
    }
    Ok(out)
}

/// Open a stream on an already-open circuit. Emits the begin cell.
pub fn open_stream(
    mgr: &mut CircuitManager,
    crypto: &dyn RelayCrypto,
    circuit_id: u32,
    target: StreamTarget,
) -> Result<(u16, Output)> {
    let max_streams = mgr.config().max_streams_per_circuit;
    let circuit = mgr
        .circuit_mut(circuit_id)
        .ok_or(EngineError::CircuitNotFound(circuit_id))?;

    if circuit.state() == CircuitState::Open && !circuit.can_exit() {
        return Err(EngineError::ExitPolicyRejected(target.to_string()));
    }

    let stream_id = circuit.attach_stream(target.clone(), max_streams)?;

    // Begin body: "host:port" NUL-terminated.
    let mut body = target.to_string().into_bytes();
    body.push(0);
    let begin = RelayCell::new(RelayCommand::Begin, stream_id, body);
    let keys: Vec<HopKeys> = circuit.keys().to_vec();
    let cell = wrap_relay(crypto, &keys, circuit_id, &begin)?;

    mgr.stats.streams_opened += 1;
    let mut out = Output::default();
    push_cell(mgr, &mut out, cell);
    log::debug!(
        "circuit {} stream {}: begin {}",
        circuit_id,
        stream_id,
        target
    );
    Ok((stream_id, out))
}

/// Re-home a stream detached by teardown onto another open circuit.
///
/// The stream keeps its target, byte counters and queued bytes, but gets
/// a fresh id and fresh windows and must be re-acknowledged by the exit
/// before data flows again.
pub fn adopt_orphan(
    mgr: &mut CircuitManager,
    crypto: &dyn RelayCrypto,
    circuit_id: u32,
    stream: crate::protocol::stream::Stream,
) -> Result<(u16, Output)> {
    let max_streams = mgr.config().max_streams_per_circuit;
    let target = stream.target.clone();

    let (stream_id, cell) = {
        let circuit = mgr
            .circuit_mut(circuit_id)
            .ok_or(EngineError::CircuitNotFound(circuit_id))?;
        if circuit.is_open() && !circuit.can_exit() {
            return Err(EngineError::ExitPolicyRejected(target.to_string()));
        }
        let stream_id = circuit.adopt_stream(stream, max_streams)?;

        let mut body = target.to_string().into_bytes();
        body.push(0);
        let begin = RelayCell::new(RelayCommand::Begin, stream_id, body);
        let keys: Vec<HopKeys> = circuit.keys().to_vec();
        (stream_id, wrap_relay(crypto, &keys, circuit_id, &begin)?)
    };

    let mut out = Output::default();
    push_cell(mgr, &mut out, cell);
    log::debug!(
        "circuit {} stream {}: reattached ({})",
        circuit_id,
        stream_id,
        target
    );
    Ok((stream_id, out))
}

/// Send application data on a stream.
///
/// Chunks the data into relay cells. Each data cell spends one unit of
/// the stream window and one of the circuit window; bytes that cannot be
/// covered right now are queued on the stream. Overflowing the queue cap
/// drops the stream (end cell plus closed event) rather than growing
/// memory.
pub fn send_data(
    mgr: &mut CircuitManager,
    crypto: &dyn RelayCrypto,
    circuit_id: u32,
    stream_id: u16,
    data: &[u8],
) -> Result<Output> {
    let cap = mgr.config().queued_bytes_cap;
    let mut out = Output::default();

    let overflow = {
        let circuit = mgr
            .circuit_mut(circuit_id)
            .ok_or(EngineError::CircuitNotFound(circuit_id))?;
        if !circuit.is_open() {
            return Err(EngineError::CircuitNotOpen(circuit_id));
        }
        let stream = circuit
            .stream_mut(stream_id)
            .ok_or(EngineError::StreamNotFound(stream_id, circuit_id))?;
        if !stream.is_open() {
            return Err(EngineError::StreamNotFound(stream_id, circuit_id));
        }
        stream.queue_outbound(data, cap).is_err()
    };

    if overflow {
        log::warn!(
            "circuit {} stream {}: queue cap exceeded, dropping stream",
            circuit_id,
            stream_id
        );
        out.merge(close_stream(mgr, crypto, circuit_id, stream_id)?);
        return Ok(out);
    }

    flush_stream(mgr, crypto, circuit_id, stream_id, &mut out)?;
    Ok(out)
}

/// Transmit as much of the stream's queue as both windows allow.
fn flush_stream(
    mgr: &mut CircuitManager,
    crypto: &dyn RelayCrypto,
    circuit_id: u32,
    stream_id: u16,
    out: &mut Output,
) -> Result<()> {
    loop {
        let cell = {
            let Some(circuit) = mgr.circuit_mut(circuit_id) else {
                return Ok(());
            };
            if !circuit.flow.window.can_send() {
                return Ok(());
            }
            let keys: Vec<HopKeys> = circuit.keys().to_vec();
            let Some(stream) = circuit.stream_mut(stream_id) else {
                return Ok(());
            };
            if !stream.is_open() || !stream.has_queued() || !stream.flow.window.can_send() {
                return Ok(());
            }

            let chunk = stream.dequeue(RelayCell::MAX_DATA_SIZE);
            stream.bytes_sent += chunk.len() as u64;
            stream.flow.window.note_sent()?;
            let data_cell = RelayCell::new(RelayCommand::Data, stream_id, chunk);

            let circuit = mgr
                .circuit_mut(circuit_id)
                .ok_or(EngineError::CircuitNotFound(circuit_id))?;
            circuit.flow.window.note_sent()?;
            wrap_relay(crypto, &keys, circuit_id, &data_cell)?
        };
        push_cell(mgr, out, cell);
    }
}

/// Locally close a stream: send end and mark it half-closed. The entry
/// stays in the table until the peer's own end completes the handshake,
/// so that reply cannot be mistaken for an unknown-stream violation.
pub fn close_stream(
    mgr: &mut CircuitManager,
    crypto: &dyn RelayCrypto,
    circuit_id: u32,
    stream_id: u16,
) -> Result<Output> {
    let cell = {
        let circuit = mgr
            .circuit_mut(circuit_id)
            .ok_or(EngineError::CircuitNotFound(circuit_id))?;
        let keys: Vec<HopKeys> = circuit.keys().to_vec();
        let stream = circuit
            .stream_mut(stream_id)
            .ok_or(EngineError::StreamNotFound(stream_id, circuit_id))?;
        if !stream.is_open() {
            return Err(EngineError::StreamNotFound(stream_id, circuit_id));
        }
        stream.state = StreamState::HalfClosed;
        stream.clear_queued();
        let end = RelayCell::new(
            RelayCommand::End,
            stream_id,
            vec![DestroyReason::Requested as u8],
        );
        wrap_relay(crypto, &keys, circuit_id, &end)?
    };

    mgr.stats.streams_closed += 1;
    let mut out = Output::default();
    push_cell(mgr, &mut out, cell);
    out.events.push(EngineEvent::StreamClosed {
        circuit_id,
        stream_id,
    });
    Ok(out)
}

/// Tear a circuit down and remove it from the table.
///
/// `send_destroy` is false when the network initiated the teardown (the
/// peer already considers the circuit dead).
pub fn teardown(
    mgr: &mut CircuitManager,
    circuit_id: u32,
    reason: CloseReason,
    send_destroy: bool,
) -> Output {
    let policy = mgr.config().detach_policy;
    let mut out = Output::default();

    let Some(mut circuit) = mgr.remove_circuit(circuit_id) else {
        return out;
    };
    let was_open = circuit.is_open();
    circuit.begin_close(reason);
    let reason = circuit.close_reason().unwrap_or(reason);
    let released = circuit.finish_close(policy);

    for stream in &released.closed {
        mgr.stats.streams_closed += 1;
        out.events.push(EngineEvent::StreamClosed {
            circuit_id,
            stream_id: stream.id,
        });
    }
    // Orphaned streams are still alive in the stash; they are counted
    // closed only once they actually close.
    if !released.orphaned.is_empty() {
        out.events.push(EngineEvent::StreamsOrphaned {
            count: released.orphaned.len(),
        });
        mgr.push_orphans(released.orphaned);
    }

    if was_open {
        mgr.stats.circuits_closed += 1;
    } else {
        mgr.stats.circuits_failed += 1;
    }

    if send_destroy {
        push_cell(mgr, &mut out, Cell::destroy(circuit_id, destroy_reason(reason)));
    }
    out.events.push(EngineEvent::CircuitClosed { circuit_id, reason });
    out
}

fn destroy_reason(reason: CloseReason) -> DestroyReason {
    match reason {
        CloseReason::Requested => DestroyReason::Requested,
        CloseReason::ProtocolViolation => DestroyReason::Protocol,
        CloseReason::Timeout => DestroyReason::Timeout,
        CloseReason::Destroyed(r) => r,
        CloseReason::TransportLost => DestroyReason::ChannelClosed,
        CloseReason::Finished => DestroyReason::Finished,
    }
}

/// Emit a sendme for `stream_id` (0 addresses the circuit itself).
fn send_sendme(
    mgr: &mut CircuitManager,
    crypto: &dyn RelayCrypto,
    circuit_id: u32,
    stream_id: u16,
    out: &mut Output,
) -> Result<()> {
    let cell = {
        let circuit = mgr
            .circuit_mut(circuit_id)
            .ok_or(EngineError::CircuitNotFound(circuit_id))?;
        let keys: Vec<HopKeys> = circuit.keys().to_vec();
        let sendme = RelayCell::new(RelayCommand::Sendme, stream_id, Vec::new());
        wrap_relay(crypto, &keys, circuit_id, &sendme)?
    };
    push_cell(mgr, out, cell);
    Ok(())
}

/// Serialize and layer-encrypt a relay cell into a link cell.
fn wrap_relay(
    crypto: &dyn RelayCrypto,
    keys: &[HopKeys],
    circuit_id: u32,
    relay_cell: &RelayCell,
) -> Result<Cell> {
    let mut payload: [u8; Cell::PAYLOAD_SIZE] = relay_cell
        .to_bytes()?
        .try_into()
        .map_err(|_| EngineError::Internal("relay payload size".into()))?;
    crypto.wrap_outbound(keys, &mut payload)?;
    Ok(Cell::new(circuit_id, CellCommand::Relay, payload.to_vec()))
}

fn push_cell(mgr: &mut CircuitManager, out: &mut Output, cell: Cell) {
    mgr.stats.cells_sent += 1;
    out.cells.push(cell);
}
