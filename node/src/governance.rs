//! Governance messages originate from the guardians themselves rather than from a watched
//! chain. The injector wraps a governance packet into an observation from the governance
//! emitter so it goes through the same signing and quorum path as any other message.

use guardian_vaa::{governance::Packet, Chain, GovernanceError, MessageId, GOVERNANCE_EMITTER};
use log::*;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::common::MessagePublication;

pub const GOVERNANCE_CONSISTENCY_LEVEL: u8 = 32;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("invalid governance payload")]
    Governance(#[from] GovernanceError),

    #[error("observation channel closed")]
    ChannelClosed,
}

/// Builds the observation for a governance payload. The payload must parse as a known
/// governance packet.
pub fn governance_publication(
    payload: Vec<u8>,
    sequence: u64,
    nonce: u32,
    timestamp: u32,
) -> Result<MessagePublication, GovernanceError> {
    let _ = Packet::deserialize(&payload)?;

    Ok(MessagePublication {
        tx_hash: vec![0; 32],
        timestamp,
        nonce,
        sequence,
        consistency_level: GOVERNANCE_CONSISTENCY_LEVEL,
        emitter_chain: Chain::Solana,
        emitter_address: GOVERNANCE_EMITTER,
        payload,
    })
}

#[derive(Debug, Clone)]
pub struct GovernanceInjector {
    observations: mpsc::Sender<MessagePublication>,
}

impl GovernanceInjector {
    pub fn new(observations: mpsc::Sender<MessagePublication>) -> GovernanceInjector {
        GovernanceInjector { observations }
    }

    pub async fn inject(
        &self,
        payload: Vec<u8>,
        sequence: u64,
        nonce: u32,
        timestamp: u32,
    ) -> Result<MessageId, InjectError> {
        let msg = governance_publication(payload, sequence, nonce, timestamp)?;
        let id = msg.message_id();

        self.observations
            .send(msg)
            .await
            .map_err(|_| InjectError::ChannelClosed)?;
        info!("injected governance message {}", id);
        Ok(id)
    }
}
