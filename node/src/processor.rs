//! Signature aggregation.
//!
//! The processor owns every in-flight observation. Local observations are signed with the
//! guardian key and broadcast; signatures from other guardians are verified against the
//! guardian set they claim. Once a body has collected a quorum of signatures from one
//! accepted set it becomes a VAA, exactly once per message id.
//!
//! Entries are keyed by body hash rather than message id, so a peer signing a different body
//! for the same message can never mix its signature into ours.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use guardian_vaa::{
    core, governance::Packet, guardian, Body, Digest, GuardianAddress, GuardianSet, Header,
    MessageId, Signature, SignatureError, Vaa, VerifyError, SUPPORTED_VAA_VERSION,
};
use k256::ecdsa::SigningKey;
use log::*;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    time::MissedTickBehavior,
};

use crate::{
    common::{MessagePublication, ReobservationRequest, SignedObservation},
    guardian_set::{GuardianSetState, SetUpdateError},
    reporter::AttestationEventReporter,
    stats::NetworkStats,
    store::VaaStore,
    unix_now,
    watcher::RequestRouter,
};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Why a signature was discarded. None of these change any state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error(transparent)]
    GuardianSet(#[from] VerifyError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("signature claims message {claimed} but the body belongs to {actual}")]
    MessageMismatch {
        claimed: MessageId,
        actual: MessageId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Still collecting. `signatures` counts the set closest to quorum.
    Pending { signatures: usize, quorum: usize },
    Finalized(Vaa),
    /// The message already has a VAA. Nothing was recorded.
    AlreadyFinalized,
    Rejected(ProtocolViolation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub observation_timeout: u32,
    pub pending_expiry: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            observation_timeout: 300,
            pending_expiry: 86400,
        }
    }
}

/// What a cleanup pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Housekeeping {
    pub expired: usize,
    pub retransmitted: usize,
    pub reobservations: usize,
}

#[derive(Debug)]
struct Entry {
    message_id: MessageId,
    /// Known once the local watcher has seen the message.
    body: Option<Body>,
    tx_hash: Vec<u8>,
    first_seen: u32,
    last_retry: u32,
    ours: Option<SignedObservation>,
    /// Guardian set index -> guardian index -> signature.
    signatures: BTreeMap<u32, BTreeMap<u8, [u8; 65]>>,
}

impl Entry {
    fn new(message_id: MessageId, tx_hash: Vec<u8>, now: u32) -> Entry {
        Entry {
            message_id,
            body: None,
            tx_hash,
            first_seen: now,
            last_retry: now,
            ours: None,
            signatures: BTreeMap::new(),
        }
    }

    fn has_signature(&self, set: u32, index: u8) -> bool {
        self.signatures
            .get(&set)
            .map_or(false, |sigs| sigs.contains_key(&index))
    }
}

/// Channels the processor consumes.
#[derive(Debug)]
pub struct Inputs {
    pub observations: mpsc::Receiver<MessagePublication>,
    pub signatures: mpsc::Receiver<SignedObservation>,
    pub set_updates: mpsc::Receiver<GuardianSet>,
}

pub struct Processor {
    key: SigningKey,
    address: GuardianAddress,
    sets: GuardianSetState,
    settings: Settings,
    pending: HashMap<[u8; 32], Entry>,
    /// Message id -> time its VAA was finalized.
    finalized: HashMap<MessageId, u32>,
    store: VaaStore,
    reporter: Arc<AttestationEventReporter>,
    stats: Arc<NetworkStats>,
    gossip: Option<mpsc::Sender<SignedObservation>>,
    router: RequestRouter,
}

impl Processor {
    pub fn new(
        key: SigningKey,
        sets: GuardianSetState,
        settings: Settings,
        store: VaaStore,
        reporter: Arc<AttestationEventReporter>,
        stats: Arc<NetworkStats>,
    ) -> Processor {
        let address = guardian::guardian_address(key.verifying_key());
        Processor {
            key,
            address,
            sets,
            settings,
            pending: HashMap::new(),
            finalized: HashMap::new(),
            store,
            reporter,
            stats,
            gossip: None,
            router: RequestRouter::new(),
        }
    }

    /// Sends every local signature to `gossip` for broadcast.
    pub fn with_gossip(mut self, gossip: mpsc::Sender<SignedObservation>) -> Processor {
        self.gossip = Some(gossip);
        self
    }

    /// Routes reobservation requests for stale entries through `router`.
    pub fn with_router(mut self, router: RequestRouter) -> Processor {
        self.router = router;
        self
    }

    pub fn address(&self) -> GuardianAddress {
        self.address
    }

    pub fn guardian_sets(&self) -> &GuardianSetState {
        &self.sets
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Checks the recent map first, then the store, which outlives both cleanup and restarts.
    pub fn is_finalized(&self, id: &MessageId) -> bool {
        if self.finalized.contains_key(id) {
            return true;
        }
        match self.store.contains(id) {
            Ok(found) => found,
            Err(e) => {
                warn!("failed to look up {} in the VAA store: {}", id, e);
                false
            }
        }
    }

    /// Signs an observation from a local watcher and records it.
    pub fn handle_observation(&mut self, msg: MessagePublication, now: u32) -> Outcome {
        let id = msg.message_id();
        if self.is_finalized(&id) {
            debug!("ignoring observation of {}, already finalized", id);
            return Outcome::AlreadyFinalized;
        }

        let body = msg.to_body();
        let digest = body.digest();
        let current = self.sets.current();
        let set_index = current.index;
        let local_index = current.position(&self.address);

        self.reporter
            .report_message_publication(&Vaa::new(set_index, body.clone()), &msg.tx_hash);

        let entry = self
            .pending
            .entry(digest.hash)
            .or_insert_with(|| Entry::new(id, msg.tx_hash.clone(), now));
        // The body is the authority on which message this is.
        entry.message_id = id;
        entry.body = Some(body);
        if entry.tx_hash.is_empty() {
            entry.tx_hash = msg.tx_hash.clone();
        }

        match local_index {
            Some(index) => match guardian::sign(&self.key, &digest) {
                Ok(signature) => {
                    let _ = entry
                        .signatures
                        .entry(set_index)
                        .or_default()
                        .insert(index, signature);

                    let ours = SignedObservation {
                        message_id: id,
                        hash: digest.hash,
                        guardian_set_index: set_index,
                        signature: Signature { index, signature },
                        tx_hash: msg.tx_hash,
                    };
                    entry.ours = Some(ours.clone());
                    broadcast(&self.gossip, ours);
                    debug!("signed observation of {} ({})", id, hex::encode(digest.hash));
                }
                Err(e) => error!("failed to sign observation of {}: {}", id, e),
            },
            None => debug!(
                "{} is not in guardian set {}, not signing {}",
                self.address, set_index, id
            ),
        }

        self.store.mark_pending(id);
        self.try_finalize(digest.hash, now)
    }

    /// Verifies and records a signature from another guardian.
    pub fn handle_signature(&mut self, obs: SignedObservation, now: u32) -> Outcome {
        if self.is_finalized(&obs.message_id) {
            return Outcome::AlreadyFinalized;
        }

        let set_index = obs.guardian_set_index;
        let index = obs.signature.index;

        let set = match self.sets.get(set_index, now) {
            Ok(set) => set,
            Err(e) => return rejected(&obs, e.into()),
        };

        if let Some(entry) = self.pending.get(&obs.hash) {
            if entry.message_id != obs.message_id {
                let violation = ProtocolViolation::MessageMismatch {
                    claimed: obs.message_id,
                    actual: entry.message_id,
                };
                return rejected(&obs, violation);
            }
            if entry.has_signature(set_index, index) {
                return rejected(&obs, SignatureError::Duplicate(index).into());
            }
        }

        if let Err(e) = set.verify_signature(&obs.signature, &Digest::from_hash(obs.hash)) {
            return rejected(&obs, e.into());
        }

        let entry = self
            .pending
            .entry(obs.hash)
            .or_insert_with(|| Entry::new(obs.message_id, obs.tx_hash.clone(), now));
        let _ = entry
            .signatures
            .entry(set_index)
            .or_default()
            .insert(index, obs.signature.signature);

        self.store.mark_pending(obs.message_id);
        self.try_finalize(obs.hash, now)
    }

    /// Replaces the active guardian set, for example after an upgrade seen on chain.
    pub fn handle_set_update(&mut self, set: GuardianSet, now: u32) -> Result<(), SetUpdateError> {
        self.sets.update(set, now)
    }

    fn try_finalize(&mut self, hash: [u8; 32], now: u32) -> Outcome {
        let current_quorum = self.sets.current().quorum();
        let Some(entry) = self.pending.get(&hash) else {
            return Outcome::Pending {
                signatures: 0,
                quorum: current_quorum,
            };
        };

        let mut progress = (0, current_quorum);
        let mut ready = None;
        for set in self.sets.valid_sets(now) {
            let have = entry.signatures.get(&set.index).map_or(0, BTreeMap::len);
            let need = set.quorum();
            if have >= need && entry.body.is_some() {
                ready = Some(set.index);
                break;
            }
            if have > progress.0 {
                progress = (have, need);
            }
        }

        let Some(set_index) = ready else {
            return Outcome::Pending {
                signatures: progress.0,
                quorum: progress.1,
            };
        };
        let Some(Entry {
            body: Some(body),
            mut signatures,
            ..
        }) = self.pending.remove(&hash)
        else {
            return Outcome::Pending {
                signatures: progress.0,
                quorum: progress.1,
            };
        };

        let signatures = signatures
            .remove(&set_index)
            .unwrap_or_default()
            .into_iter()
            .map(|(index, signature)| Signature { index, signature })
            .collect();
        let vaa = Vaa {
            header: Header {
                version: SUPPORTED_VAA_VERSION,
                guardian_set_index: set_index,
                signatures,
            },
            body,
        };
        self.finalize(vaa, now)
    }

    fn finalize(&mut self, vaa: Vaa, now: u32) -> Outcome {
        let id = vaa.message_id();
        let signed = match vaa.serialize() {
            Ok(signed) => signed,
            Err(e) => {
                error!("failed to serialize VAA for {}: {}", id, e);
                return Outcome::Pending {
                    signatures: vaa.header.signatures.len(),
                    quorum: self.sets.current().quorum(),
                };
            }
        };

        if let Err(e) = self.store.store(id, signed.clone()) {
            error!("failed to persist VAA for {}: {}", id, e);
        }
        let _ = self.finalized.insert(id, now);
        self.stats.inc_confirmed(id.emitter_chain);
        self.reporter.report_quorum(&vaa, &signed);

        info!(
            "VAA for {} finalized with {} signatures from guardian set {} ({})",
            id,
            vaa.header.signatures.len(),
            vaa.header.guardian_set_index,
            vaa.body.hex_digest()
        );

        if vaa.is_governance() {
            self.apply_governance(&vaa, now);
        }

        Outcome::Finalized(vaa)
    }

    fn apply_governance(&mut self, vaa: &Vaa, now: u32) {
        let id = vaa.message_id();
        match Packet::from_body(&vaa.body) {
            Ok(Packet::Core(core::GovernancePacket {
                action:
                    core::Action::GuardianSetUpgrade {
                        new_guardian_set_index,
                        new_guardian_set,
                    },
                ..
            })) => {
                let next = GuardianSet::new(new_guardian_set_index, new_guardian_set);
                if let Err(e) = self.sets.update(next, now) {
                    warn!("ignoring guardian set upgrade in {}: {}", id, e);
                }
            }
            Ok(_) => debug!("governance VAA {} requires no action from the node", id),
            Err(e) => warn!("failed to parse governance VAA {}: {}", id, e),
        }
    }

    /// Drops expired entries, retransmits our stale signatures and asks watchers to reobserve
    /// messages we only know about from peers.
    pub fn cleanup(&mut self, now: u32) -> Housekeeping {
        let Settings {
            observation_timeout,
            pending_expiry,
        } = self.settings;

        let mut report = Housekeeping::default();
        let mut expired = Vec::new();
        let mut resend = Vec::new();
        let mut requests = Vec::new();

        let finalized = &self.finalized;
        self.pending.retain(|_, entry| {
            // Another body for the same message won.
            if finalized.contains_key(&entry.message_id) {
                return false;
            }

            if now.saturating_sub(entry.first_seen) >= pending_expiry {
                expired.push(entry.message_id);
                return false;
            }

            if now.saturating_sub(entry.last_retry) >= observation_timeout {
                entry.last_retry = now;
                match &entry.ours {
                    Some(ours) => resend.push(ours.clone()),
                    None if !entry.tx_hash.is_empty() => requests.push(ReobservationRequest::new(
                        entry.message_id.emitter_chain,
                        entry.tx_hash.clone(),
                    )),
                    None => {}
                }
            }
            true
        });

        self.finalized
            .retain(|_, at| now.saturating_sub(*at) < pending_expiry);

        for id in expired {
            warn!("giving up on {}, no quorum within {}s", id, pending_expiry);
            self.store.forget_pending(&id);
            report.expired += 1;
        }

        for ours in resend {
            debug!("retransmitting signature for {}", ours.message_id);
            broadcast(&self.gossip, ours);
            report.retransmitted += 1;
        }

        for req in requests {
            let tx = hex::encode(&req.tx_hash);
            match self.router.route(req) {
                Ok(()) => {
                    debug!("requested reobservation of {}", tx);
                    report.reobservations += 1;
                }
                Err(e) => warn!("failed to request reobservation of {}: {}", tx, e),
            }
        }

        report
    }

    /// Processes inputs until shutdown is signalled.
    pub async fn run(mut self, mut inputs: Inputs, mut shutdown: watch::Receiver<bool>) {
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "processor started as {} in guardian set {}",
            self.address,
            self.sets.current().index
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(msg) = inputs.observations.recv() => {
                    let _ = self.handle_observation(msg, unix_now());
                }
                Some(obs) = inputs.signatures.recv() => {
                    let _ = self.handle_signature(obs, unix_now());
                }
                Some(set) = inputs.set_updates.recv() => {
                    if let Err(e) = self.handle_set_update(set, unix_now()) {
                        warn!("ignoring guardian set update: {}", e);
                    }
                }
                _ = cleanup.tick() => {
                    let report = self.cleanup(unix_now());
                    if report != Housekeeping::default() {
                        debug!("cleanup: {:?}", report);
                    }
                }
            }
        }

        info!("processor stopped with {} pending entries", self.pending.len());
    }
}

fn rejected(obs: &SignedObservation, violation: ProtocolViolation) -> Outcome {
    debug!(
        "rejected signature of guardian {} in set {} for {}: {}",
        obs.signature.index, obs.guardian_set_index, obs.message_id, violation
    );
    Outcome::Rejected(violation)
}

fn broadcast(gossip: &Option<mpsc::Sender<SignedObservation>>, obs: SignedObservation) {
    if let Some(tx) = gossip {
        if let Err(e) = tx.try_send(obs) {
            warn!("failed to queue signed observation for gossip: {}", e);
        }
    }
}
