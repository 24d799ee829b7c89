//! Governance of the core bridge: contract upgrades and guardian set rotation.

use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt};

use crate::{governance, Address, Chain, GovernanceError, GuardianAddress};

/// Module name of the core bridge in governance packets.
pub const MODULE: [u8; 32] = governance::module(b"Core");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ContractUpgrade {
        new_contract: Address,
    },

    /// Replaces the active guardian set. `new_guardian_set_index` must be exactly one more than
    /// the index of the set being replaced.
    GuardianSetUpgrade {
        new_guardian_set_index: u32,
        new_guardian_set: Vec<GuardianAddress>,
    },
}

impl Action {
    fn id(&self) -> u8 {
        match self {
            Action::ContractUpgrade { .. } => 1,
            Action::GuardianSetUpgrade { .. } => 2,
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
            1 => {
                let mut new_contract = Address::default();
                rest.read_exact(&mut new_contract.0)?;
                Action::ContractUpgrade { new_contract }
            }
            2 => {
                let new_guardian_set_index = rest.read_u32::<BigEndian>()?;
                let count = rest.read_u8()?;

                let mut new_guardian_set = Vec::with_capacity(count.into());
                for _ in 0..count {
                    let mut addr = GuardianAddress::default();
                    rest.read_exact(&mut addr.0)?;
                    new_guardian_set.push(addr);
                }

                Action::GuardianSetUpgrade {
                    new_guardian_set_index,
                    new_guardian_set,
                }
            }
            other => return Err(GovernanceError::UnknownAction(other)),
        };

        Ok(GovernancePacket { chain, action })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, GovernanceError> {
        let mut v = Vec::new();
        governance::write_header(&mut v, &MODULE, self.action.id(), self.chain);

        match &self.action {
            Action::ContractUpgrade { new_contract } => v.extend_from_slice(&new_contract.0),
            Action::GuardianSetUpgrade {
                new_guardian_set_index,
                new_guardian_set,
            } => {
                let count = u8::try_from(new_guardian_set.len())
                    .map_err(|_| GovernanceError::TooManyGuardians)?;

                v.extend_from_slice(&new_guardian_set_index.to_be_bytes());
                v.push(count);
                for addr in new_guardian_set {
                    v.extend_from_slice(&addr.0);
                }
            }
        }

        Ok(v)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn guardian_set_upgrade() {
        let packet = GovernancePacket {
            chain: Chain::Any,
            action: Action::GuardianSetUpgrade {
                new_guardian_set_index: 4,
                new_guardian_set: (0..7).map(|i| GuardianAddress([i; 20])).collect(),
            },
        };

        let buf = packet.to_bytes().unwrap();
        assert_eq!(35 + 4 + 1 + 7 * 20, buf.len());
        assert_eq!(packet, GovernancePacket::deserialize(&buf).unwrap());

        // One guardian address short.
        assert_eq!(
            Err(GovernanceError::Truncated),
            GovernancePacket::deserialize(&buf[..buf.len() - 20])
        );
    }

    #[test]
    fn too_many_guardians() {
        let packet = GovernancePacket {
            chain: Chain::Any,
            action: Action::GuardianSetUpgrade {
                new_guardian_set_index: 1,
                new_guardian_set: vec![GuardianAddress::default(); 256],
            },
        };
        assert_eq!(Err(GovernanceError::TooManyGuardians), packet.to_bytes());
    }

    #[test]
    fn wrong_module() {
        let packet = crate::token::GovernancePacket {
            chain: Chain::Any,
            action: crate::token::Action::ContractUpgrade {
                new_contract: Address([3; 32]),
            },
        };
        assert_eq!(
            Err(GovernanceError::InvalidModule),
            GovernancePacket::deserialize(&packet.to_bytes())
        );
    }
}
