use guardian_vaa::{Address, Body, Chain, MessageId, Signature};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

/// A bridge event seen by exactly one watcher on a source chain.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct MessagePublication {
    /// Transaction that emitted the event. Length depends on the source chain.
    pub tx_hash: Vec<u8>,
    /// Block time in unix seconds.
    pub timestamp: u32,
    pub nonce: u32,
    pub sequence: u64,
    pub consistency_level: u8,
    pub emitter_chain: Chain,
    pub emitter_address: Address,
    pub payload: Vec<u8>,
}

impl MessagePublication {
    pub fn message_id(&self) -> MessageId {
        MessageId {
            emitter_chain: self.emitter_chain,
            emitter_address: self.emitter_address,
            sequence: self.sequence,
        }
    }

    /// The VAA body guardians sign for this observation.
    pub fn to_body(&self) -> Body {
        Body {
            timestamp: self.timestamp,
            nonce: self.nonce,
            emitter_chain: self.emitter_chain,
            emitter_address: self.emitter_address,
            sequence: self.sequence,
            consistency_level: self.consistency_level,
            payload: self.payload.clone(),
        }
    }
}

/// One guardian's signature over an observation, as exchanged over gossip.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignedObservation {
    pub message_id: MessageId,
    /// Body hash the signature covers.
    pub hash: [u8; 32],
    pub guardian_set_index: u32,
    pub signature: Signature,
    /// Source transaction, so peers missing the observation can ask their watcher for it.
    pub tx_hash: Vec<u8>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReobservationError {
    #[error("reobservation is not supported on {0}")]
    Unsupported(Chain),

    #[error("no watcher is registered for {0}")]
    UnknownChain(Chain),

    #[error("watcher for {0} is not accepting requests")]
    Unavailable(Chain),
}

/// Asks the watcher of `chain` to look up `tx_hash` again and re-emit what it finds.
#[derive(Debug)]
pub struct ReobservationRequest {
    pub chain: Chain,
    pub tx_hash: Vec<u8>,
    /// Receives the number of observations emitted, or why the request failed.
    pub reply: Option<oneshot::Sender<Result<usize, ReobservationError>>>,
}

impl ReobservationRequest {
    pub fn new(chain: Chain, tx_hash: Vec<u8>) -> ReobservationRequest {
        ReobservationRequest {
            chain,
            tx_hash,
            reply: None,
        }
    }

    /// Creates a request along with the receiver its outcome is sent to.
    pub fn with_reply(
        chain: Chain,
        tx_hash: Vec<u8>,
    ) -> (
        ReobservationRequest,
        oneshot::Receiver<Result<usize, ReobservationError>>,
    ) {
        let (tx, rx) = oneshot::channel();
        let req = ReobservationRequest {
            chain,
            tx_hash,
            reply: Some(tx),
        };
        (req, rx)
    }

    /// Sends `outcome` to the requester, if anyone is waiting for it.
    pub fn respond(self, outcome: Result<usize, ReobservationError>) {
        if let Some(reply) = self.reply {
            let _ = reply.send(outcome);
        }
    }
}
