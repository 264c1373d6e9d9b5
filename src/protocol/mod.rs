//! Wire protocol and per-circuit state
//!
//! - Fixed-size link cells and the nested relay cells
//! - Crypto seams (handshake and layered relay encryption are pluggable)
//! - Sendme flow-control windows
//! - Streams and the circuit build state machine

pub mod cell;
pub mod circuit;
pub mod crypto;
pub mod flow_control;
pub mod stream;

pub use cell::{Cell, CellCommand, DestroyReason, RelayCell, RelayCommand};
pub use circuit::{
    BuildProgress, Circuit, CircuitPurpose, CircuitState, CloseReason, Hop, ReleasedStreams,
};
pub use crypto::{CryptoSuite, HandshakeDriver, HopKeys, RelayCrypto};
pub use flow_control::{CircuitFlowControl, StreamFlowControl, Window};
pub use stream::{Stream, StreamState, StreamTarget};
