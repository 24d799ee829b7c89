//! Token bridge payloads and governance.
//!
//! Token bridging relies on VAAs that announce custody/lockup/burn events on a sending chain so
//! that the receiving chain can mint or release the matching amount. Every token bridge payload
//! starts with a one byte id:
//!
//! | id | message               |
//! |----|-----------------------|
//! | 1  | `Transfer`            |
//! | 2  | `AssetMeta`           |
//! | 3  | `TransferWithPayload` |

use std::io::{self, Cursor, Read, Write};

use bstr::BString;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use primitive_types::U256;

use crate::{arraystring, governance, Address, Chain, GovernanceError, PayloadError};

/// Module name of the token bridge in governance packets.
pub const MODULE: [u8; 32] = governance::module(b"TokenBridge");

pub const TRANSFER_PAYLOAD_ID: u8 = 1;
pub const ASSET_META_PAYLOAD_ID: u8 = 2;
pub const TRANSFER_WITH_PAYLOAD_PAYLOAD_ID: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A token lock up on the sending chain. `fee` is what the sender is willing to pay a
    /// relayer and must not exceed `amount`.
    Transfer {
        amount: U256,
        /// Address of the token on its origin chain. Left-zero-padded if shorter than 32 bytes.
        token_address: Address,
        token_chain: Chain,
        recipient: Address,
        recipient_chain: Chain,
        fee: U256,
    },

    /// Announces a token so it can be wrapped on other chains.
    AssetMeta {
        token_address: Address,
        token_chain: Chain,
        decimals: u8,
        /// At most 32 bytes. Trailing zero padding is stripped when decoding.
        symbol: BString,
        name: BString,
    },

    /// A transfer carrying an arbitrary payload for the redeemer, which is a contract on
    /// `redeemer_chain`.
    TransferWithPayload {
        amount: U256,
        token_address: Address,
        token_chain: Chain,
        redeemer: Address,
        redeemer_chain: Chain,
        sender_address: Address,
        payload: Vec<u8>,
    },
}

fn read_u256<R: Read>(r: &mut R) -> io::Result<U256> {
    let mut buf = [0u8; 32];
    r.read_exact(&mut buf)?;
    Ok(U256::from_big_endian(&buf))
}

fn write_u256<W: Write>(w: &mut W, v: U256) -> io::Result<()> {
    let mut buf = [0u8; 32];
    v.to_big_endian(&mut buf);
    w.write_all(&buf)
}

fn read_address<R: Read>(r: &mut R) -> io::Result<Address> {
    let mut a = Address::default();
    r.read_exact(&mut a.0)?;
    Ok(a)
}

fn read_chain<R: Read>(r: &mut R) -> io::Result<Chain> {
    r.read_u16::<BigEndian>().map(Chain::from)
}

impl Message {
    pub fn payload_id(&self) -> u8 {
        match self {
            Message::Transfer { .. } => TRANSFER_PAYLOAD_ID,
            Message::AssetMeta { .. } => ASSET_META_PAYLOAD_ID,
            Message::TransferWithPayload { .. } => TRANSFER_WITH_PAYLOAD_PAYLOAD_ID,
        }
    }

    /// Decodes a token bridge payload, dispatching on its leading id. Bytes after the last
    /// fixed field of `Transfer` and `AssetMeta` are ignored.
    pub fn deserialize(data: &[u8]) -> Result<Message, PayloadError> {
        let mut v = Cursor::new(data);

        let msg = match v.read_u8()? {
            TRANSFER_PAYLOAD_ID => Message::Transfer {
                amount: read_u256(&mut v)?,
                token_address: read_address(&mut v)?,
                token_chain: read_chain(&mut v)?,
                recipient: read_address(&mut v)?,
                recipient_chain: read_chain(&mut v)?,
                fee: read_u256(&mut v)?,
            },
            ASSET_META_PAYLOAD_ID => Message::AssetMeta {
                token_address: read_address(&mut v)?,
                token_chain: read_chain(&mut v)?,
                decimals: v.read_u8()?,
                symbol: arraystring::read(&mut v)?,
                name: arraystring::read(&mut v)?,
            },
            TRANSFER_WITH_PAYLOAD_PAYLOAD_ID => {
                let amount = read_u256(&mut v)?;
                let token_address = read_address(&mut v)?;
                let token_chain = read_chain(&mut v)?;
                let redeemer = read_address(&mut v)?;
                let redeemer_chain = read_chain(&mut v)?;
                let sender_address = read_address(&mut v)?;

                let mut payload = Vec::new();
                let _ = v.read_to_end(&mut payload)?;

                Message::TransferWithPayload {
                    amount,
                    token_address,
                    token_chain,
                    redeemer,
                    redeemer_chain,
                    sender_address,
                    payload,
                }
            }
            other => return Err(PayloadError::UnknownPayloadId(other)),
        };

        Ok(msg)
    }

    /// Fails only when `symbol` or `name` exceed 32 bytes.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u8(self.payload_id())?;

        match self {
            Message::Transfer {
                amount,
                token_address,
                token_chain,
                recipient,
                recipient_chain,
                fee,
            } => {
                write_u256(writer, *amount)?;
                writer.write_all(&token_address.0)?;
                writer.write_u16::<BigEndian>((*token_chain).into())?;
                writer.write_all(&recipient.0)?;
                writer.write_u16::<BigEndian>((*recipient_chain).into())?;
                write_u256(writer, *fee)?;
            }
            Message::AssetMeta {
                token_address,
                token_chain,
                decimals,
                symbol,
                name,
            } => {
                writer.write_all(&token_address.0)?;
                writer.write_u16::<BigEndian>((*token_chain).into())?;
                writer.write_u8(*decimals)?;
                arraystring::write(writer, symbol)?;
                arraystring::write(writer, name)?;
            }
            Message::TransferWithPayload {
                amount,
                token_address,
                token_chain,
                redeemer,
                redeemer_chain,
                sender_address,
                payload,
            } => {
                write_u256(writer, *amount)?;
                writer.write_all(&token_address.0)?;
                writer.write_u16::<BigEndian>((*token_chain).into())?;
                writer.write_all(&redeemer.0)?;
                writer.write_u16::<BigEndian>((*redeemer_chain).into())?;
                writer.write_all(&sender_address.0)?;
                writer.write_all(payload)?;
            }
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.serialize(&mut buf)?;
        Ok(buf)
    }
}

/// Token bridge governance actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Registers the token bridge emitter of another chain.
    RegisterChain {
        chain: Chain,
        emitter_address: Address,
    },
    ContractUpgrade { new_contract: Address },
}

impl Action {
    fn id(&self) -> u8 {
        match self {
            Action::RegisterChain { .. } => 1,
            Action::ContractUpgrade { .. } => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernancePacket {
    pub chain: Chain,
    pub action: Action,
}

impl GovernancePacket {
    pub fn deserialize(data: &[u8]) -> Result<GovernancePacket, GovernanceError> {
        let (action, chain, mut rest) = governance::read_header(&MODULE, data)?;

        let action = match action {
            1 => Action::RegisterChain {
                chain: read_chain(&mut rest)?,
                emitter_address: read_address(&mut rest)?,
            },
            2 => Action::ContractUpgrade {
                new_contract: read_address(&mut rest)?,
            },
            other => return Err(GovernanceError::UnknownAction(other)),
        };

        Ok(GovernancePacket { chain, action })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(35 + 34);
        governance::write_header(&mut v, &MODULE, self.action.id(), self.chain);

        match &self.action {
            Action::RegisterChain {
                chain,
                emitter_address,
            } => {
                v.extend_from_slice(&u16::from(*chain).to_be_bytes());
                v.extend_from_slice(&emitter_address.0);
            }
            Action::ContractUpgrade { new_contract } => v.extend_from_slice(&new_contract.0),
        }

        v
    }
}
