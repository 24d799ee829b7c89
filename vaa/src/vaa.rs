//! VAA's represent a collection of guardian signatures combined with a message and its metadata.
//! A VAA is used as a form of proof: by submitting one to a target contract, the receiver can
//! make assumptions about the validity of state on the source chain.
//!
//! Wire layout, all integers big-endian:
//!
//! ```markdown
//! version:u8 | guardian_set_index:u32 | signature_count:u8 | (guardian_index:u8 | sig:65)*
//! timestamp:u32 | nonce:u32 | emitter_chain:u16 | emitter_address:32 | sequence:u64
//! consistency_level:u8 | payload (rest of buffer)
//! ```

use std::{
    fmt,
    io::{self, Cursor, Read, Write},
    str::FromStr,
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use sha3::{Digest as Sha3Digest, Keccak256};

use crate::{guardian, Address, Chain, DecodeError, SignatureError, GOVERNANCE_EMITTER};

pub const SUPPORTED_VAA_VERSION: u8 = 1;

/// Length of the fixed part of a body, everything before the payload.
pub const BODY_HEADER_LEN: usize = 4 + 4 + 2 + 32 + 8 + 1;

/// Signatures are recoverable ECDSA signatures prefixed with a guardian position:
/// ```markdown
/// 0  .. 64: Signature   (ECDSA r || s)
/// 64 .. 65: Recovery ID (ECDSA)
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature {
    pub index: u8,
    #[serde(with = "crate::serde_array")]
    pub signature: [u8; 65],
}

impl Default for Signature {
    fn default() -> Self {
        Self {
            index: 0,
            signature: [0; 65],
        }
    }
}

/// The part of a VAA guardians sign over.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Body {
    /// Seconds since UNIX epoch.
    pub timestamp: u32,
    pub nonce: u32,
    pub emitter_chain: Chain,
    pub emitter_address: Address,
    pub sequence: u64,
    pub consistency_level: u8,
    pub payload: Vec<u8>,
}

/// The header of a VAA: everything that precedes the body.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Header {
    pub version: u8,
    pub guardian_set_index: u32,
    pub signatures: Vec<Signature>,
}

/// A signed attestation. Signatures are kept in ascending guardian index order.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Vaa {
    pub header: Header,
    pub body: Body,
}

/// Digest data for the Body.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest {
    /// Keccak256 of the serialized body. This is the identifier of a VAA.
    pub hash: [u8; 32],

    /// Keccak256 of `hash`. secp256k1 signs a hash of its message, so guardians sign `hash`
    /// which means recovery has to run against this second hash.
    pub secp256k_hash: [u8; 32],
}

/// Calculates the digest of an already serialized body.
pub fn digest(body: &[u8]) -> Digest {
    let hash: [u8; 32] = Keccak256::digest(body).into();
    let secp256k_hash: [u8; 32] = Keccak256::digest(hash).into();

    Digest {
        hash,
        secp256k_hash,
    }
}

impl Digest {
    /// Rebuilds the full digest from a body hash received without its body.
    pub fn from_hash(hash: [u8; 32]) -> Digest {
        Digest {
            hash,
            secp256k_hash: Keccak256::digest(hash).into(),
        }
    }
}

/// Identity of a message: unique per emitter and stable across guardian sets.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId {
    pub emitter_chain: Chain,
    pub emitter_address: Address,
    pub sequence: u64,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            u16::from(self.emitter_chain),
            self.emitter_address,
            self.sequence
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid message id {0:?}, expected <chain>/<emitter hex>/<sequence>")]
pub struct InvalidMessageId(String);

impl FromStr for MessageId {
    type Err = InvalidMessageId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidMessageId(s.into());

        let mut parts = s.split('/');
        let (Some(chain), Some(emitter), Some(sequence), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(err());
        };

        Ok(MessageId {
            emitter_chain: chain.parse::<u16>().map_err(|_| err())?.into(),
            emitter_address: emitter.parse().map_err(|_| err())?,
            sequence: sequence.parse().map_err(|_| err())?,
        })
    }
}

impl Body {
    /// Serializes the body. This is the exact byte run guardians hash and sign.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(BODY_HEADER_LEN + self.payload.len());

        v.extend_from_slice(&self.timestamp.to_be_bytes());
        v.extend_from_slice(&self.nonce.to_be_bytes());
        v.extend_from_slice(&u16::from(self.emitter_chain).to_be_bytes());
        v.extend_from_slice(&self.emitter_address.0);
        v.extend_from_slice(&self.sequence.to_be_bytes());
        v.push(self.consistency_level);
        v.extend_from_slice(&self.payload);

        v
    }

    pub fn deserialize(data: &[u8]) -> Result<Body, DecodeError> {
        let mut rdr = Cursor::new(data);

        let timestamp = rdr.read_u32::<BigEndian>()?;
        let nonce = rdr.read_u32::<BigEndian>()?;
        let emitter_chain = Chain::from(rdr.read_u16::<BigEndian>()?);

        let mut emitter_address = Address::default();
        rdr.read_exact(&mut emitter_address.0)?;

        let sequence = rdr.read_u64::<BigEndian>()?;
        let consistency_level = rdr.read_u8()?;

        let mut payload = Vec::new();
        let _ = rdr.read_to_end(&mut payload)?;

        Ok(Body {
            timestamp,
            nonce,
            emitter_chain,
            emitter_address,
            sequence,
            consistency_level,
            payload,
        })
    }

    /// Body digest components. Signatures play no part in it.
    #[inline]
    pub fn digest(&self) -> Digest {
        digest(&self.to_bytes())
    }

    pub fn message_id(&self) -> MessageId {
        MessageId {
            emitter_chain: self.emitter_chain,
            emitter_address: self.emitter_address,
            sequence: self.sequence,
        }
    }

    /// Hex encoding of the body hash, the form used when referring to a VAA in logs.
    pub fn hex_digest(&self) -> String {
        hex::encode(self.digest().hash)
    }

    /// Check if the body was emitted by the governance emitter.
    pub fn is_governance(&self) -> bool {
        self.emitter_address == GOVERNANCE_EMITTER && self.emitter_chain == Chain::Solana
    }
}

impl Vaa {
    /// Creates an unsigned VAA for `body` under guardian set `guardian_set_index`.
    pub fn new(guardian_set_index: u32, body: Body) -> Vaa {
        Vaa {
            header: Header {
                version: SUPPORTED_VAA_VERSION,
                guardian_set_index,
                signatures: Vec::new(),
            },
            body,
        }
    }

    pub fn serialize(&self) -> io::Result<Vec<u8>> {
        let count = u8::try_from(self.header.signatures.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "more than 255 signatures")
        })?;

        let mut v = Cursor::new(Vec::with_capacity(
            6 + 66 * self.header.signatures.len() + BODY_HEADER_LEN + self.body.payload.len(),
        ));

        v.write_u8(self.header.version)?;
        v.write_u32::<BigEndian>(self.header.guardian_set_index)?;
        v.write_u8(count)?;
        for sig in &self.header.signatures {
            v.write_u8(sig.index)?;
            v.write_all(&sig.signature)?;
        }
        v.write_all(&self.body.to_bytes())?;

        Ok(v.into_inner())
    }

    pub fn deserialize(data: &[u8]) -> Result<Vaa, DecodeError> {
        let mut rdr = Cursor::new(data);

        let version = rdr.read_u8()?;
        if version != SUPPORTED_VAA_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let guardian_set_index = rdr.read_u32::<BigEndian>()?;

        let count = rdr.read_u8()?;
        let mut signatures = Vec::with_capacity(count.into());
        for _ in 0..count {
            let index = rdr.read_u8()?;
            let mut signature = [0u8; 65];
            rdr.read_exact(&mut signature)?;
            signatures.push(Signature { index, signature });
        }

        let rest = data
            .get(rdr.position() as usize..)
            .ok_or(DecodeError::TruncatedInput)?;
        let body = Body::deserialize(rest)?;

        Ok(Vaa {
            header: Header {
                version,
                guardian_set_index,
                signatures,
            },
            body,
        })
    }

    #[inline]
    pub fn digest(&self) -> Digest {
        self.body.digest()
    }

    pub fn message_id(&self) -> MessageId {
        self.body.message_id()
    }

    /// Check if the VAA is a governance VAA.
    pub fn is_governance(&self) -> bool {
        self.body.is_governance()
    }

    /// Signs the body digest with `key` and inserts the signature at `index`, keeping the
    /// signatures sorted. An index that already signed is rejected.
    pub fn add_signature(&mut self, key: &SigningKey, index: u8) -> Result<(), SignatureError> {
        let signature = guardian::sign(key, &self.digest())?;
        self.insert_signature(Signature { index, signature })
    }

    /// Inserts an already computed signature, keeping ascending index order.
    pub fn insert_signature(&mut self, sig: Signature) -> Result<(), SignatureError> {
        let sigs = &mut self.header.signatures;
        match sigs.binary_search_by_key(&sig.index, |s| s.index) {
            Ok(_) => Err(SignatureError::Duplicate(sig.index)),
            Err(pos) => {
                sigs.insert(pos, sig);
                Ok(())
            }
        }
    }
}

impl From<(Header, Body)> for Vaa {
    fn from((header, body): (Header, Body)) -> Self {
        Vaa { header, body }
    }
}
