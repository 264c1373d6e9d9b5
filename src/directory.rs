//! Relay directory view
//!
//! Read-only snapshot of known relays with identity, country and AS
//! metadata. The snapshot is supplied by an external directory collaborator
//! and swapped wholesale; descriptors are never mutated in place while a
//! path selection is in progress against them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{EngineError, Result};

/// Length of a relay identity fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 20;

/// A relay identity fingerprint (hash of the identity key).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn new(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse from a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s)
            .map_err(|e| EngineError::Internal(format!("bad fingerprint hex: {}", e)))?;
        let bytes: [u8; FINGERPRINT_LEN] = raw
            .try_into()
            .map_err(|_| EngineError::Internal("fingerprint must be 20 bytes".into()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s).map_err(|e| D::Error::custom(e.to_string()))
    }
}

/// Two-letter country code, upper-cased ASCII.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CountryCode([u8; 2]);

impl CountryCode {
    pub fn new(code: &str) -> Self {
        let b = code.as_bytes();
        let a = b.first().copied().unwrap_or(b'?').to_ascii_uppercase();
        let c = b.get(1).copied().unwrap_or(b'?').to_ascii_uppercase();
        Self([a, c])
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("??")
    }
}

impl fmt::Debug for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay capability flags from the directory.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RelayFlags {
    /// Suitable as entry guard.
    pub guard: bool,

    /// Allows exit traffic.
    pub exit: bool,

    /// Known-bad exit; never use as last hop.
    pub bad_exit: bool,

    /// Fast relay.
    pub fast: bool,

    /// Stable relay.
    pub stable: bool,

    /// Currently running.
    pub running: bool,

    /// Valid descriptor.
    pub valid: bool,
}

impl RelayFlags {
    /// Parse flags from a space-separated directory string.
    pub fn from_string(flags: &str) -> Self {
        let mut relay_flags = RelayFlags::default();

        for flag in flags.split_whitespace() {
            match flag {
                "Guard" => relay_flags.guard = true,
                "Exit" => relay_flags.exit = true,
                "BadExit" => relay_flags.bad_exit = true,
                "Fast" => relay_flags.fast = true,
                "Stable" => relay_flags.stable = true,
                "Running" => relay_flags.running = true,
                "Valid" => relay_flags.valid = true,
                _ => {} // Ignore unknown flags
            }
        }

        relay_flags
    }
}

/// A relay known to the directory.
///
/// Immutable once published; a directory update replaces the whole
/// snapshot rather than editing descriptors in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayDescriptor {
    /// Identity fingerprint (unique).
    pub fingerprint: Fingerprint,

    /// Relay nickname (informational only).
    pub nickname: String,

    /// Network address of the onion-router port.
    pub address: SocketAddr,

    /// Public key material for the circuit-extension handshake.
    pub onion_key: [u8; 32],

    /// Advertised bandwidth (bytes/sec); weights selection.
    pub bandwidth: u64,

    /// Country the relay is located in.
    pub country: CountryCode,

    /// Autonomous-system number of the relay's network.
    pub as_number: u32,

    /// Capability flags.
    pub flags: RelayFlags,
}

impl RelayDescriptor {
    /// Eligible for the first (entry) position.
    pub fn guard_eligible(&self) -> bool {
        self.flags.guard && self.flags.running && self.flags.stable
    }

    /// Eligible for the last position of an exit-carrying circuit.
    pub fn exit_capable(&self) -> bool {
        self.flags.exit && !self.flags.bad_exit && self.flags.running
    }

    /// Usable at all.
    pub fn usable(&self) -> bool {
        self.flags.running && self.flags.valid
    }
}

/// A consistent, immutable view of the known relays.
#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    relays: Vec<RelayDescriptor>,
    by_fingerprint: HashMap<Fingerprint, usize>,
}

impl DirectorySnapshot {
    pub fn new(relays: Vec<RelayDescriptor>) -> Self {
        let by_fingerprint = relays
            .iter()
            .enumerate()
            .map(|(i, r)| (r.fingerprint, i))
            .collect();
        Self {
            relays,
            by_fingerprint,
        }
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<&RelayDescriptor> {
        self.by_fingerprint
            .get(fingerprint)
            .map(|&i| &self.relays[i])
    }

    pub fn relays(&self) -> &[RelayDescriptor] {
        &self.relays
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Number of distinct countries among usable relays.
    pub fn distinct_countries(&self) -> usize {
        self.relays
            .iter()
            .filter(|r| r.usable())
            .map(|r| r.country)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Number of distinct AS numbers among usable relays.
    pub fn distinct_as_numbers(&self) -> usize {
        self.relays
            .iter()
            .filter(|r| r.usable())
            .map(|r| r.as_number)
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Source of directory information.
///
/// The engine only ever reads; updates arrive as a wholesale snapshot swap
/// between builds. A path selection in progress keeps its own `Arc` and so
/// completes against a single consistent snapshot.
pub trait DirectoryProvider {
    /// Current snapshot. Cheap to call; the `Arc` pins consistency.
    fn snapshot(&self) -> Arc<DirectorySnapshot>;

    /// Look up a single relay in the current snapshot.
    fn lookup_relay(&self, fingerprint: &Fingerprint) -> Option<RelayDescriptor> {
        self.snapshot().lookup(fingerprint).cloned()
    }
}

/// In-memory directory with atomic snapshot replacement.
pub struct InMemoryDirectory {
    current: RwLock<Arc<DirectorySnapshot>>,
}

impl InMemoryDirectory {
    pub fn new(relays: Vec<RelayDescriptor>) -> Self {
        Self {
            current: RwLock::new(Arc::new(DirectorySnapshot::new(relays))),
        }
    }

    /// Replace the snapshot wholesale.
    pub fn publish(&self, relays: Vec<RelayDescriptor>) {
        let snapshot = Arc::new(DirectorySnapshot::new(relays));
        log::info!("directory snapshot replaced ({} relays)", snapshot.len());
        *self.current.write().expect("directory lock poisoned") = snapshot;
    }
}

impl DirectoryProvider for InMemoryDirectory {
    fn snapshot(&self) -> Arc<DirectorySnapshot> {
        self.current.read().expect("directory lock poisoned").clone()
    }
}
