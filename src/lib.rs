//! # Onion Engine
//!
//! Circuit construction and relay plumbing for an onion-routing overlay
//! client: path selection under policy constraints, the circuit build
//! state machine, cell multiplexing with sendme flow control, and safe
//! decompression of directory documents.
//!
//! The engine is a synchronous state machine. The host owns the sockets,
//! the clock and the crypto primitives:
//!
//! - inbound bytes come in through [`Engine::handle_inbound`],
//! - time comes in through [`Engine::tick`],
//! - every call returns an [`Output`] batch of cells to transmit and
//!   events to act on,
//! - key agreement and layered encryption are supplied through the
//!   [`CryptoSuite`] seam, the relay directory through
//!   [`DirectoryProvider`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Instant;
//! use onion_engine::{Engine, EngineConfig, InMemoryDirectory};
//! use onion_engine::protocol::crypto::testing::NullSuite;
//! use onion_engine::protocol::circuit::CircuitPurpose;
//!
//! let directory = Arc::new(InMemoryDirectory::new(Vec::new()));
//! let mut engine = Engine::new(
//!     EngineConfig::default(),
//!     directory,
//!     Box::new(NullSuite::new()),
//! ).unwrap();
//!
//! let (circuit_id, output) = engine
//!     .build_circuit(CircuitPurpose::General, Instant::now())
//!     .unwrap();
//! for cell in &output.cells {
//!     // hand cell.to_bytes() to the transport
//! }
//! ```

use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;

pub mod cell_mux;
pub mod circuit_manager;
pub mod compress;
pub mod config;
pub mod directory;
mod error;
pub mod path_selector;
pub mod protocol;

pub use cell_mux::{EngineEvent, Output};
pub use circuit_manager::{CircuitManager, EngineStats};
pub use compress::{BombLimits, CompressError, CompressionMethod, Compressor, Decompressor};
pub use config::{AsIntersectionScope, DetachPolicy, EngineConfig};
pub use directory::{
    CountryCode, DirectoryProvider, DirectorySnapshot, Fingerprint, InMemoryDirectory,
    RelayDescriptor, RelayFlags, FINGERPRINT_LEN,
};
pub use error::{EngineError, Result, SelectionError};
pub use path_selector::PathConstraints;
pub use protocol::cell::{Cell, CellCommand, DestroyReason, RelayCell, RelayCommand};
pub use protocol::circuit::{CircuitPurpose, CircuitState, CloseReason};
pub use protocol::crypto::{CryptoSuite, HandshakeDriver, HopKeys, RelayCrypto};
pub use protocol::stream::{StreamState, StreamTarget};

use protocol::circuit::CircuitPurpose as Purpose;
use protocol::flow_control::StreamFlowControl;
use protocol::stream::Stream;

/// Outcome of [`Engine::request_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRequest {
    /// Attached to an already-open circuit; the begin cell is in the
    /// accompanying output.
    Opened { circuit_id: u32, stream_id: u16 },
    /// No open circuit qualified, so a build was launched. The stream
    /// waits in the orphan stash until [`Engine::reattach_orphaned`]
    /// lands it on the finished circuit.
    BuildLaunched { circuit_id: u32 },
}

/// The engine facade: owns the circuit table and wires the collaborator
/// seams together.
pub struct Engine {
    directory: Arc<dyn DirectoryProvider>,
    crypto: Box<dyn CryptoSuite>,
    manager: CircuitManager,
    rng: StdRng,
}

impl Engine {
    /// Validate `config` and construct the engine.
    pub fn new(
        config: EngineConfig,
        directory: Arc<dyn DirectoryProvider>,
        crypto: Box<dyn CryptoSuite>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            directory,
            crypto,
            manager: CircuitManager::new(config),
            rng: StdRng::from_entropy(),
        })
    }

    /// Same, with a fixed selection seed. Deterministic paths for tests.
    pub fn with_seed(
        config: EngineConfig,
        directory: Arc<dyn DirectoryProvider>,
        crypto: Box<dyn CryptoSuite>,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            directory,
            crypto,
            manager: CircuitManager::new(config),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        self.manager.config()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.manager.stats
    }

    pub fn manager(&self) -> &CircuitManager {
        &self.manager
    }

    /// Launch a circuit build with the configured constraints.
    pub fn build_circuit(&mut self, purpose: Purpose, now: Instant) -> Result<(u32, Output)> {
        let needs_exit = !matches!(purpose, Purpose::DirectoryFetch);
        let constraints = PathConstraints::from_config(self.manager.config(), needs_exit);
        self.build_circuit_with(purpose, &constraints, now)
    }

    /// Launch a circuit build with explicit constraints.
    pub fn build_circuit_with(
        &mut self,
        purpose: Purpose,
        constraints: &PathConstraints,
        now: Instant,
    ) -> Result<(u32, Output)> {
        let snapshot = self.directory.snapshot();
        let handshake = self.crypto.new_handshake();
        let (id, create) =
            self.manager
                .build_circuit(&snapshot, purpose, constraints, handshake, now, &mut self.rng)?;
        Ok((
            id,
            Output {
                cells: vec![create],
                events: Vec::new(),
            },
        ))
    }

    /// Open a stream to `host:port` on a circuit satisfying `constraints`.
    ///
    /// When no open circuit qualifies, a build with the same constraints
    /// is launched instead of failing: the create cell is in the returned
    /// output and the stream is parked in the orphan stash until
    /// [`Engine::reattach_orphaned`] attaches it to the new circuit.
    pub fn request_stream(
        &mut self,
        host: &str,
        port: u16,
        constraints: &PathConstraints,
        now: Instant,
    ) -> Result<(StreamRequest, Output)> {
        let target = StreamTarget {
            host: host.to_string(),
            port,
        };
        match self.manager.open_circuit_for(
            Purpose::General,
            true,
            constraints.required_exit.as_ref(),
        ) {
            Ok(circuit_id) => {
                let (stream_id, out) = cell_mux::open_stream(
                    &mut self.manager,
                    self.crypto.relay_crypto(),
                    circuit_id,
                    target,
                )?;
                Ok((
                    StreamRequest::Opened {
                        circuit_id,
                        stream_id,
                    },
                    out,
                ))
            }
            Err(EngineError::NoEligibleCircuit) => {
                let (circuit_id, out) =
                    self.build_circuit_with(Purpose::General, constraints, now)?;
                let flow = StreamFlowControl::new(
                    self.manager.config().stream_window_initial,
                    self.manager.config().stream_window_increment,
                );
                let mut stream = Stream::new(0, target, flow);
                stream.state = StreamState::Orphaned;
                self.manager.push_orphans(vec![stream]);
                Ok((StreamRequest::BuildLaunched { circuit_id }, out))
            }
            Err(e) => Err(e),
        }
    }

    /// Send application data on a stream.
    pub fn send(&mut self, circuit_id: u32, stream_id: u16, data: &[u8]) -> Result<Output> {
        cell_mux::send_data(
            &mut self.manager,
            self.crypto.relay_crypto(),
            circuit_id,
            stream_id,
            data,
        )
    }

    /// Close a stream locally.
    pub fn close_stream(&mut self, circuit_id: u32, stream_id: u16) -> Result<Output> {
        cell_mux::close_stream(
            &mut self.manager,
            self.crypto.relay_crypto(),
            circuit_id,
            stream_id,
        )
    }

    /// Tear a circuit down at the host's request.
    pub fn close_circuit(&mut self, circuit_id: u32) -> Output {
        cell_mux::teardown(&mut self.manager, circuit_id, CloseReason::Requested, true)
    }

    /// Process one inbound cell already parsed from the wire.
    pub fn handle_cell(&mut self, cell: Cell, now: Instant) -> Result<Output> {
        cell_mux::handle_cell(&mut self.manager, self.crypto.relay_crypto(), cell, now)
    }

    /// Parse and process one inbound cell from raw bytes.
    pub fn handle_inbound(&mut self, bytes: &[u8], now: Instant) -> Result<Output> {
        let cell = Cell::from_bytes(bytes)?;
        self.handle_cell(cell, now)
    }

    /// Advance deadlines. Circuits whose handshake timed out are torn
    /// down here.
    pub fn tick(&mut self, now: Instant) -> Output {
        let mut out = Output::default();
        for (id, reason) in self.manager.expired_circuits(now) {
            out.merge(cell_mux::teardown(&mut self.manager, id, reason, true));
        }
        out
    }

    /// Try to reattach orphaned streams to eligible open circuits.
    ///
    /// Streams with no eligible circuit go back to the stash; a stream
    /// whose adoption fails outright is dropped and counted closed.
    pub fn reattach_orphaned(&mut self) -> Output {
        let mut out = Output::default();
        let mut keep = Vec::new();

        for stream in self.manager.take_orphaned() {
            match self.manager.open_circuit_for(Purpose::General, true, None) {
                Ok(circuit_id) => {
                    match cell_mux::adopt_orphan(
                        &mut self.manager,
                        self.crypto.relay_crypto(),
                        circuit_id,
                        stream,
                    ) {
                        Ok((_, adopted)) => out.merge(adopted),
                        Err(e) => {
                            log::warn!("orphan reattachment failed: {}", e);
                            self.manager.stats.streams_closed += 1;
                        }
                    }
                }
                Err(_) => keep.push(stream),
            }
        }
        self.manager.push_orphans(keep);
        out
    }

    /// The connection to the first hop died. Every circuit goes with it;
    /// no destroy cells can be delivered.
    pub fn transport_lost(&mut self) -> Output {
        let mut out = Output::default();
        for id in self.manager.circuit_ids() {
            out.merge(cell_mux::teardown(
                &mut self.manager,
                id,
                CloseReason::TransportLost,
                false,
            ));
        }
        // Nothing to transmit on a dead transport.
        out.cells.clear();
        out
    }

    /// Synchronous shutdown: close every circuit and release key
    /// material. Returns the final destroy cells for a best-effort send.
    pub fn shutdown(&mut self) -> Output {
        let mut out = Output::default();
        for id in self.manager.circuit_ids() {
            out.merge(cell_mux::teardown(
                &mut self.manager,
                id,
                CloseReason::Finished,
                true,
            ));
        }
        out
    }

    /// Decompress a directory document with the configured bomb limits.
    /// The format (zlib or gzip) is sniffed from the data itself.
    pub fn decompress_document(&self, data: &[u8]) -> Result<Vec<u8>> {
        let limits = BombLimits {
            max_factor: self.manager.config().max_uncompression_factor,
            check_threshold: self.manager.config().bomb_check_threshold,
        };
        Ok(compress::decompress_all(data, &limits)?)
    }
}
