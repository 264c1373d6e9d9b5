//! Cryptographic plug-in seams
//!
//! The engine decides *where* key agreement and layered relay encryption
//! happen, not *how* they compute. Concrete primitives (key agreement,
//! cipher, MAC) live in a collaborator crate implementing these traits.
//! The engine only handles opaque byte material and guarantees key
//! release on teardown.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::directory::RelayDescriptor;
use crate::error::Result;
use crate::protocol::cell::Cell;

/// Per-hop transport keys derived from a completed handshake.
///
/// Opaque to the engine; zeroized on drop so a hard shutdown releases key
/// material synchronously.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HopKeys {
    /// Keystream material for the outbound (away from us) direction.
    pub forward: [u8; 32],
    /// Keystream material for the inbound direction.
    pub backward: [u8; 32],
}

impl std::fmt::Debug for HopKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("HopKeys(..)")
    }
}

/// Drives the per-hop circuit-extension handshake for one circuit build.
pub trait HandshakeDriver {
    /// Produce the client-side handshake blob ("onionskin") for `relay`
    /// at hop position `hop`.
    fn onionskin(&mut self, hop: usize, relay: &RelayDescriptor) -> Result<Vec<u8>>;

    /// Complete hop `hop`'s handshake from the relay's reply, yielding the
    /// derived transport keys.
    fn complete(&mut self, hop: usize, reply: &[u8]) -> Result<HopKeys>;
}

/// Applies onion layers to relay payloads.
///
/// Outbound payloads get one layer per hop in hop order; inbound payloads
/// are peeled in reverse. `unwrap_inbound` reports which hop the cell was
/// recognized at, or an error if no hop recognizes it.
pub trait RelayCrypto {
    /// Layer-encrypt an outbound relay payload in place.
    fn wrap_outbound(&self, hops: &[HopKeys], payload: &mut [u8; Cell::PAYLOAD_SIZE])
        -> Result<()>;

    /// Peel layers off an inbound relay payload in place; returns the hop
    /// index the payload originated from.
    fn unwrap_inbound(&self, hops: &[HopKeys], payload: &mut [u8; Cell::PAYLOAD_SIZE])
        -> Result<usize>;
}

/// Factory handed to the engine at construction; one handshake driver per
/// circuit build, one shared relay-layer codec.
pub trait CryptoSuite {
    fn new_handshake(&self) -> Box<dyn HandshakeDriver>;
    fn relay_crypto(&self) -> &dyn RelayCrypto;
}

/// No-op crypto for tests and wiring checks. Payloads pass through
/// unchanged; keys are derived deterministically from the hop index.
pub mod testing {
    use super::*;

    /// Handshake driver that accepts any reply.
    pub struct NullHandshake;

    impl HandshakeDriver for NullHandshake {
        fn onionskin(&mut self, hop: usize, relay: &RelayDescriptor) -> Result<Vec<u8>> {
            let mut blob = vec![hop as u8];
            blob.extend_from_slice(relay.fingerprint.as_bytes());
            blob.extend_from_slice(&relay.onion_key);
            Ok(blob)
        }

        fn complete(&mut self, hop: usize, _reply: &[u8]) -> Result<HopKeys> {
            Ok(HopKeys {
                forward: [hop as u8; 32],
                backward: [hop as u8 ^ 0xff; 32],
            })
        }
    }

    /// Identity relay codec; inbound cells are attributed to the last hop.
    pub struct NullCrypto;

    impl RelayCrypto for NullCrypto {
        fn wrap_outbound(
            &self,
            _hops: &[HopKeys],
            _payload: &mut [u8; Cell::PAYLOAD_SIZE],
        ) -> Result<()> {
            Ok(())
        }

        fn unwrap_inbound(
            &self,
            hops: &[HopKeys],
            _payload: &mut [u8; Cell::PAYLOAD_SIZE],
        ) -> Result<usize> {
            Ok(hops.len().saturating_sub(1))
        }
    }

    /// Suite handing out the null implementations.
    pub struct NullSuite {
        relay: NullCrypto,
    }

    impl NullSuite {
        pub fn new() -> Self {
            Self { relay: NullCrypto }
        }
    }

    impl Default for NullSuite {
        fn default() -> Self {
            Self::new()
        }
    }

    impl CryptoSuite for NullSuite {
        fn new_handshake(&self) -> Box<dyn HandshakeDriver> {
            Box::new(NullHandshake)
        }

        fn relay_crypto(&self) -> &dyn RelayCrypto {
            &self.relay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_keys_debug_hides_material() {
        let keys = HopKeys {
            forward: [0xAA; 32],
            backward: [0xBB; 32],
        };
        assert_eq!(format!("{:?}", keys), "HopKeys(..)");
    }
}
