//! Governance packets are VAAs emitted by the governance emitter. Every packet starts with the
//! same header:
//!
//! ```markdown
//! module:32 (ASCII, left zero padded) | action:u8 | chain:u16 | action specific body
//! ```
//!
//! `chain` is the chain the action is meant for, `Chain::Any` meaning every chain.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};

use crate::{core, token, Body, Chain, GovernanceError};

/// Left pads a module name into its 32 byte wire form.
pub const fn module(name: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let offset = 32 - name.len();
    let mut i = 0;
    while i < name.len() {
        out[offset + i] = name[i];
        i += 1;
    }
    out
}

/// Reads the shared header, checks it targets `expected`, and returns the action, the target
/// chain and the action specific remainder.
pub(crate) fn read_header<'a>(
    expected: &[u8; 32],
    data: &'a [u8],
) -> Result<(u8, Chain, &'a [u8]), GovernanceError> {
    let mut rdr = Cursor::new(data);

    let mut module = [0u8; 32];
    rdr.read_exact(&mut module)?;
    if &module != expected {
        return Err(GovernanceError::InvalidModule);
    }

    let action = rdr.read_u8()?;
    let chain = Chain::from(rdr.read_u16::<BigEndian>()?);

    let rest = data
        .get(rdr.position() as usize..)
        .ok_or(GovernanceError::Truncated)?;
    Ok((action, chain, rest))
}

pub(crate) fn write_header(out: &mut Vec<u8>, module: &[u8; 32], action: u8, chain: Chain) {
    out.extend_from_slice(module);
    out.push(action);
    out.extend_from_slice(&u16::from(chain).to_be_bytes());
}

/// Any governance packet understood by a guardian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Core(core::GovernancePacket),
    TokenBridge(token::GovernancePacket),
}

impl Packet {
    /// Dispatches on the module name of `payload`.
    pub fn deserialize(payload: &[u8]) -> Result<Packet, GovernanceError> {
        let name = payload.get(..32).ok_or(GovernanceError::Truncated)?;

        if name == core::MODULE {
            core::GovernancePacket::deserialize(payload).map(Packet::Core)
        } else if name == token::MODULE {
            token::GovernancePacket::deserialize(payload).map(Packet::TokenBridge)
        } else {
            Err(GovernanceError::InvalidModule)
        }
    }

    /// Parses the governance packet carried by `body`, refusing bodies from any other emitter.
    pub fn from_body(body: &Body) -> Result<Packet, GovernanceError> {
        if !body.is_governance() {
            return Err(GovernanceError::InvalidEmitter);
        }
        Packet::deserialize(&body.payload)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, GovernanceError> {
        match self {
            Packet::Core(p) => p.to_bytes(),
            Packet::TokenBridge(p) => Ok(p.to_bytes()),
        }
    }
}
