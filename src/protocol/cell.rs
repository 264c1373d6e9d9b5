//! Link-layer cells
//!
//! Cells are the fixed-size unit of communication with the first hop.
//! Each carries a circuit identifier, a one-byte command, and a
//! zero-padded payload. Relay cells nest inside `Relay`-command cells and
//! address an individual stream.

use crate::error::{EngineError, Result};

/// Cell command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// Link padding; carries no circuit state.
    Padding = 0,
    /// Begin the handshake with the first hop.
    Create = 1,
    /// First hop's handshake acknowledgment.
    Created = 2,
    /// Layer-encrypted relay payload.
    Relay = 3,
    /// Tear the circuit down.
    Destroy = 4,
}

impl CellCommand {
    /// Parse command from its wire byte.
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            _ => None,
        }
    }
}

/// A fixed-size link cell.
#[derive(Debug, Clone)]
pub struct Cell {
    /// Circuit ID (4 bytes on the wire).
    pub circuit_id: u32,

    /// Command.
    pub command: CellCommand,

    /// Payload, at most [`Cell::PAYLOAD_SIZE`]; zero-padded on the wire.
    pub payload: Vec<u8>,
}

impl Cell {
    /// Cell size (514 bytes total: 4 circuit_id + 1 command + 509 payload).
    pub const SIZE: usize = 514;

    /// Payload size for fixed-length cells.
    pub const PAYLOAD_SIZE: usize = 509;

    /// Create a new cell.
    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Create a DESTROY cell carrying a reason byte.
    pub fn destroy(circuit_id: u32, reason: DestroyReason) -> Self {
        Self::new(circuit_id, CellCommand::Destroy, vec![reason as u8])
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.payload.len() > Self::PAYLOAD_SIZE {
            return Err(EngineError::Internal(format!(
                "cell payload too long: {}",
                self.payload.len()
            )));
        }
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.circuit_id.to_be_bytes());
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.payload);
        buf.resize(Self::SIZE, 0);
        Ok(buf)
    }

    /// Parse from wire bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(EngineError::ProtocolViolation("cell too short".into()));
        }

        let circuit_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let command = CellCommand::from_u8(data[4]).ok_or_else(|| {
            EngineError::ProtocolViolation(format!("unknown cell command: {}", data[4]))
        })?;
        let payload = data[5..Self::SIZE].to_vec();

        Ok(Self {
            circuit_id,
            command,
            payload,
        })
    }
}

/// Relay command types (inside a decrypted relay payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// Open a stream at the exit.
    Begin = 1,
    /// Application data.
    Data = 2,
    /// Close a stream.
    End = 3,
    /// Stream connected at the exit.
    Connected = 4,
    /// Flow-control credit.
    Sendme = 5,
    /// Extend the circuit by one hop.
    Extend = 6,
    /// Extension acknowledged.
    Extended = 7,
    /// Remove the last hop.
    Truncate = 8,
    /// Last hop removed.
    Truncated = 9,
    /// Long-range padding; dropped on receipt.
    Drop = 10,
}

impl RelayCommand {
    /// Parse relay command from its wire byte.
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            _ => None,
        }
    }
}

/// Reason byte carried by DESTROY cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DestroyReason {
    None = 0,
    Protocol = 1,
    Internal = 2,
    Requested = 3,
    Hibernating = 4,
    ResourceLimit = 5,
    ConnectFailed = 6,
    OrIdentity = 7,
    ChannelClosed = 8,
    Finished = 9,
    Timeout = 10,
    Destroyed = 11,
    NoSuchService = 12,
}

impl DestroyReason {
    pub fn from_u8(reason: u8) -> Self {
        match reason {
            1 => DestroyReason::Protocol,
            2 => DestroyReason::Internal,
            3 => DestroyReason::Requested,
            4 => DestroyReason::Hibernating,
            5 => DestroyReason::ResourceLimit,
            6 => DestroyReason::ConnectFailed,
            7 => DestroyReason::OrIdentity,
            8 => DestroyReason::ChannelClosed,
            9 => DestroyReason::Finished,
            10 => DestroyReason::Timeout,
            11 => DestroyReason::Destroyed,
            12 => DestroyReason::NoSuchService,
            _ => DestroyReason::None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DestroyReason::None => "NONE",
            DestroyReason::Protocol => "PROTOCOL",
            DestroyReason::Internal => "INTERNAL",
            DestroyReason::Requested => "REQUESTED",
            DestroyReason::Hibernating => "HIBERNATING",
            DestroyReason::ResourceLimit => "RESOURCELIMIT",
            DestroyReason::ConnectFailed => "CONNECTFAILED",
            DestroyReason::OrIdentity => "OR_IDENTITY",
            DestroyReason::ChannelClosed => "CHANNEL_CLOSED",
            DestroyReason::Finished => "FINISHED",
            DestroyReason::Timeout => "TIMEOUT",
            DestroyReason::Destroyed => "DESTROYED",
            DestroyReason::NoSuchService => "NOSUCHSERVICE",
        }
    }
}

/// Relay cell (payload within a `Relay` cell, after layer decryption).
#[derive(Debug, Clone)]
pub struct RelayCell {
    /// Relay command.
    pub command: RelayCommand,

    /// Recognized marker (zero once the cell is ours).
    pub recognized: u16,

    /// Stream ID; zero addresses the circuit itself.
    pub stream_id: u16,

    /// Integrity digest (filled by the crypto collaborator).
    pub digest: [u8; 4],

    /// Data, up to [`RelayCell::MAX_DATA_SIZE`].
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Relay header size: command + recognized + stream id + digest + length.
    pub const HEADER_SIZE: usize = 11;

    /// Maximum data bytes one relay cell can carry.
    pub const MAX_DATA_SIZE: usize = Cell::PAYLOAD_SIZE - Self::HEADER_SIZE;

    /// Create a new relay cell.
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// Serialize to a full zero-padded relay payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.data.len() > Self::MAX_DATA_SIZE {
            return Err(EngineError::Internal(format!(
                "relay data too long: {}",
                self.data.len()
            )));
        }
        let mut buf = Vec::with_capacity(Cell::PAYLOAD_SIZE);
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.recognized.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(Cell::PAYLOAD_SIZE, 0);
        Ok(buf)
    }

    /// Parse from a decrypted relay payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(EngineError::ProtocolViolation("relay cell too short".into()));
        }

        let command = RelayCommand::from_u8(data[0]).ok_or_else(|| {
            EngineError::ProtocolViolation(format!("unknown relay command: {}", data[0]))
        })?;
        let recognized = u16::from_be_bytes([data[1], data[2]]);
        let stream_id = u16::from_be_bytes([data[3], data[4]]);
        let digest = [data[5], data[6], data[7], data[8]];
        let length = u16::from_be_bytes([data[9], data[10]]) as usize;

        if length > Self::MAX_DATA_SIZE || Self::HEADER_SIZE + length > data.len() {
            return Err(EngineError::ProtocolViolation(
                "relay cell length out of range".into(),
            ));
        }
        let cell_data = data[Self::HEADER_SIZE..Self::HEADER_SIZE + length].to_vec();

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: cell_data,
        })
    }
}
