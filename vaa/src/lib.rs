//! Chain-agnostic primitives for the guardian network.
//!
//! This crate holds everything a guardian, relayer or verifier needs to agree on bytes:
//!
//! - The VAA wire format and its double-keccak digest.
//! - Guardian signing and signature recovery over that digest.
//! - Guardian sets, quorum arithmetic and full VAA verification.
//! - Token bridge payloads and the governance packets for the core and token bridge modules.
//!
//! Nothing in here performs I/O beyond reading and writing in-memory buffers.

#![deny(unused_results)]

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

mod arraystring;
pub mod core;
mod error;
pub mod governance;
pub mod guardian;
mod serde_array;
pub mod token;
pub mod vaa;

pub use error::{DecodeError, GovernanceError, PayloadError, SignatureError, VerifyError};
pub use guardian::{quorum, GuardianSet};
pub use guardian_supported_chains::{Chain, InvalidChainError};
pub use vaa::{
    digest, Body, Digest, Header, InvalidMessageId, MessageId, Signature, Vaa, SUPPORTED_VAA_VERSION,
};

/// The `GOVERNANCE_EMITTER` is the address guardians trust governance actions from. The value is
/// "0000000000000000000000000000000000000000000000000000000000000004", emitted on Solana.
pub const GOVERNANCE_EMITTER: Address = Address([
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04,
]);

/// Ethereum-style address of a guardian key: the last 20 bytes of the keccak of the public key.
#[derive(
    Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct GuardianAddress(pub [u8; 20]);

impl fmt::Display for GuardianAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for GuardianAddress {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 20];
        hex::decode_to_slice(s.trim_start_matches("0x"), &mut out)?;
        Ok(GuardianAddress(out))
    }
}

/// Addresses are 32 bytes on the wire. Shorter native addresses, for example 20 byte
/// Ethereum addresses, are left zero padded.
#[derive(
    Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct Address(pub [u8; 32]);

impl Address {
    /// Left pads a native address of at most 32 bytes.
    pub fn left_pad(native: &[u8]) -> Option<Address> {
        if native.len() > 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out[32 - native.len()..].copy_from_slice(native);
        Some(Address(out))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }

        Ok(())
    }
}

impl FromStr for Address {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s.trim_start_matches("0x"), &mut out)?;
        Ok(Address(out))
    }
}
