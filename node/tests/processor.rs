use std::sync::Arc;

use guardian_vaa::{
    core, guardian, token, Address, Body, Chain, GuardianAddress, GuardianSet, Signature,
    SignatureError, Vaa, VerifyError,
};
use bstr::BString;
use guardiand::{
    common::{MessagePublication, SignedObservation},
    config::GovernanceInjection,
    governance::governance_publication,
    guardian_set::GuardianSetState,
    processor::{Housekeeping, Outcome, Processor, ProtocolViolation, Settings},
    reporter::{
        AttestationEventReporter, DecodedPayload, MessagePublicationRecord, PersistedValue,
        QuorumStateRecord,
    },
    stats::NetworkStats,
    store::{Lookup, VaaStore},
    watcher::RequestRouter,
};
use k256::ecdsa::SigningKey;
use sha3::{Digest as _, Keccak256};
use tokio::sync::mpsc;

const GRACE: u32 = 100;

fn key(seed: u8) -> SigningKey {
    SigningKey::from_slice(&Keccak256::digest([seed])).unwrap()
}

fn address(seed: u8) -> GuardianAddress {
    guardian::guardian_address(key(seed).verifying_key())
}

/// Guardian set `index` whose member at position `i` holds `key(seeds[i])`.
fn set(index: u32, seeds: &[u8]) -> GuardianSet {
    GuardianSet::new(index, seeds.iter().copied().map(address).collect())
}

struct Node {
    processor: Processor,
    store: VaaStore,
    reporter: Arc<AttestationEventReporter>,
    stats: Arc<NetworkStats>,
}

fn node(local: u8, guardians: GuardianSet) -> Node {
    node_with_store(local, guardians, VaaStore::in_memory())
}

fn node_with_store(local: u8, guardians: GuardianSet, store: VaaStore) -> Node {
    let reporter = Arc::new(AttestationEventReporter::new());
    let stats = Arc::new(NetworkStats::new());
    let processor = Processor::new(
        key(local),
        GuardianSetState::new(guardians, GRACE),
        Settings {
            observation_timeout: 10,
            pending_expiry: 50,
        },
        store.clone(),
        reporter.clone(),
        stats.clone(),
    );

    Node {
        processor,
        store,
        reporter,
        stats,
    }
}

fn message(sequence: u64) -> MessagePublication {
    MessagePublication {
        tx_hash: vec![0xab; 32],
        timestamp: 1_650_000_000,
        nonce: 7,
        sequence,
        consistency_level: 0,
        emitter_chain: Chain::Near,
        emitter_address: Address([0x11; 32]),
        payload: b"transfer".to_vec(),
    }
}

/// The signature guardian `seed` would gossip for `body`, claiming position `index`.
fn peer(seed: u8, index: u8, set_index: u32, body: &Body) -> SignedObservation {
    let digest = body.digest();
    SignedObservation {
        message_id: body.message_id(),
        hash: digest.hash,
        guardian_set_index: set_index,
        signature: Signature {
            index,
            signature: guardian::sign(&key(seed), &digest).unwrap(),
        },
        tx_hash: vec![0xab; 32],
    }
}

fn pending(signatures: usize, quorum: usize) -> Outcome {
    Outcome::Pending { signatures, quorum }
}

fn finalized(outcome: Outcome) -> Vaa {
    match outcome {
        Outcome::Finalized(vaa) => vaa,
        other => panic!("expected a VAA, got {other:?}"),
    }
}

fn upgrade(new_guardian_set_index: u32, seeds: &[u8]) -> Vec<u8> {
    core::GovernancePacket {
        chain: Chain::Any,
        action: core::Action::GuardianSetUpgrade {
            new_guardian_set_index,
            new_guardian_set: seeds.iter().copied().map(address).collect(),
        },
    }
    .to_bytes()
    .unwrap()
}

#[test]
fn quorum_of_seven() {
    let seeds = [1, 2, 3, 4, 5, 6, 7];
    let mut n = node(1, set(0, &seeds));
    let mut sub = n.reporter.subscribe(8);
    let msg = message(1);
    let body = msg.to_body();
    let id = msg.message_id();

    assert_eq!(pending(1, 5), n.processor.handle_observation(msg, 0));
    assert_eq!(Lookup::Pending, n.store.lookup(&id).unwrap());

    let published = sub.messages.try_recv().unwrap();
    assert_eq!(body, published.vaa.body);
    assert_eq!(vec![0xab; 32], published.initiating_tx);

    assert_eq!(pending(2, 5), n.processor.handle_signature(peer(3, 2, 0, &body), 1));
    assert_eq!(pending(3, 5), n.processor.handle_signature(peer(6, 5, 0, &body), 1));
    assert_eq!(pending(4, 5), n.processor.handle_signature(peer(2, 1, 0, &body), 2));
    assert!(sub.quorums.try_recv().is_err());

    let vaa = finalized(n.processor.handle_signature(peer(4, 3, 0, &body), 3));
    assert_eq!(
        vec![0, 1, 2, 3, 5],
        vaa.header
            .signatures
            .iter()
            .map(|s| s.index)
            .collect::<Vec<_>>()
    );
    assert_eq!(body, vaa.body);
    assert_eq!(
        body.digest(),
        n.processor
            .guardian_sets()
            .current()
            .verify_vaa(&vaa, 3)
            .unwrap()
    );

    let signed = vaa.serialize().unwrap();
    assert_eq!(Lookup::Found(signed.clone()), n.store.lookup(&id).unwrap());
    let quorum = sub.quorums.try_recv().unwrap();
    assert_eq!(vaa, quorum.vaa);
    assert_eq!(signed, quorum.signed);

    assert!(n.processor.is_finalized(&id));
    assert_eq!(0, n.processor.pending_count());
    assert_eq!(1, n.stats.get(Chain::Near).unwrap().messages_confirmed);

    // Late signatures and repeated observations change nothing.
    assert_eq!(
        Outcome::AlreadyFinalized,
        n.processor.handle_signature(peer(7, 6, 0, &body), 4)
    );
    assert_eq!(
        Outcome::AlreadyFinalized,
        n.processor.handle_observation(message(1), 4)
    );
    assert!(sub.quorums.try_recv().is_err());
}

#[test]
fn invalid_signatures_leave_no_trace() {
    let mut n = node(1, set(0, &[1, 2, 3, 4, 5, 6, 7]));
    let body = message(2).to_body();

    let _ = n.processor.handle_observation(message(2), 0);
    assert_eq!(pending(2, 5), n.processor.handle_signature(peer(3, 2, 0, &body), 0));

    let reject = |v: ProtocolViolation| Outcome::Rejected(v);

    assert_eq!(
        reject(SignatureError::Duplicate(2).into()),
        n.processor.handle_signature(peer(3, 2, 0, &body), 0)
    );
    // Our own index coming back from gossip counts as a duplicate too.
    assert_eq!(
        reject(SignatureError::Duplicate(0).into()),
        n.processor.handle_signature(peer(1, 0, 0, &body), 0)
    );
    assert_eq!(
        reject(SignatureError::InvalidSignature(3).into()),
        n.processor.handle_signature(peer(9, 3, 0, &body), 0)
    );
    assert_eq!(
        reject(SignatureError::UnknownGuardian(7).into()),
        n.processor.handle_signature(peer(9, 7, 0, &body), 0)
    );
    assert_eq!(
        reject(
            VerifyError::WrongGuardianSet {
                expected: 0,
                found: 4
            }
            .into()
        ),
        n.processor.handle_signature(peer(4, 3, 4, &body), 0)
    );

    let mut corrupt = peer(4, 3, 0, &body);
    corrupt.signature.signature[64] = 9;
    assert_eq!(
        reject(SignatureError::InvalidSignature(3).into()),
        n.processor.handle_signature(corrupt, 0)
    );

    let mut mislabeled = peer(4, 3, 0, &body);
    mislabeled.message_id.sequence = 99;
    assert_eq!(
        reject(ProtocolViolation::MessageMismatch {
            claimed: mislabeled.message_id,
            actual: body.message_id(),
        }),
        n.processor.handle_signature(mislabeled, 0)
    );

    assert_eq!(1, n.processor.pending_count());
    assert_eq!(pending(3, 5), n.processor.handle_signature(peer(4, 3, 0, &body), 0));
}

#[test]
fn conflicting_bodies_do_not_mix() {
    let mut n = node(1, set(0, &[1, 2, 3, 4]));
    let ours = message(3);
    let mut theirs = message(3);
    theirs.payload = b"forged".to_vec();
    let theirs = theirs.to_body();

    assert_eq!(pending(1, 3), n.processor.handle_observation(ours.clone(), 0));

    // Enough signatures for quorum, but over a body we never observed.
    for (seed, index) in [(2, 1), (3, 2), (4, 3)] {
        let _ = n.processor.handle_signature(peer(seed, index, 0, &theirs), 0);
    }
    assert!(!n.processor.is_finalized(&ours.message_id()));
    assert_eq!(2, n.processor.pending_count());

    let body = ours.to_body();
    assert_eq!(pending(2, 3), n.processor.handle_signature(peer(2, 1, 0, &body), 1));
    let vaa = finalized(n.processor.handle_signature(peer(3, 2, 0, &body), 1));
    assert_eq!(body, vaa.body);
    assert_eq!(vec![0, 1, 2], vaa.header.signatures.iter().map(|s| s.index).collect::<Vec<_>>());

    // The losing body is dropped on the next pass.
    assert_eq!(1, n.processor.pending_count());
    let _ = n.processor.cleanup(2);
    assert_eq!(0, n.processor.pending_count());
}

#[test]
fn signatures_before_observation() {
    let mut n = node(1, set(0, &[1, 2, 3, 4]));
    let (requests_tx, mut requests) = mpsc::channel(4);
    let mut router = RequestRouter::new();
    router.register(Chain::Near, requests_tx);
    n.processor = n.processor.with_router(router);

    let msg = message(4);
    let body = msg.to_body();

    assert_eq!(pending(1, 3), n.processor.handle_signature(peer(2, 1, 0, &body), 0));
    assert_eq!(pending(2, 3), n.processor.handle_signature(peer(3, 2, 0, &body), 0));
    // Quorum is there but the body is not, so nothing can be emitted yet.
    assert_eq!(pending(3, 3), n.processor.handle_signature(peer(4, 3, 0, &body), 0));
    assert_eq!(Lookup::Pending, n.store.lookup(&msg.message_id()).unwrap());

    // The watcher is asked for the transaction the peers named.
    assert_eq!(
        Housekeeping {
            reobservations: 1,
            ..Default::default()
        },
        n.processor.cleanup(10)
    );
    let req = requests.try_recv().unwrap();
    assert_eq!(Chain::Near, req.chain);
    assert_eq!(vec![0xab; 32], req.tx_hash);

    let vaa = finalized(n.processor.handle_observation(msg, 11));
    assert_eq!(4, vaa.header.signatures.len());
    assert!(n
        .processor
        .guardian_sets()
        .current()
        .verify_vaa(&vaa, 11)
        .is_ok());
}

#[test]
fn stale_entries_expire() {
    let mut n = node(1, set(0, &[1, 2, 3]));
    let msg = message(5);
    let id = msg.message_id();

    let _ = n.processor.handle_observation(msg, 0);
    assert_eq!(Lookup::Pending, n.store.lookup(&id).unwrap());

    let report = n.processor.cleanup(50);
    assert_eq!(1, report.expired);
    assert_eq!(0, n.processor.pending_count());
    assert_eq!(Lookup::NotFound, n.store.lookup(&id).unwrap());
}

#[test]
fn guardian_set_upgrade() {
    let mut n = node(1, set(0, &[1]));

    let upgrade = governance_publication(upgrade(1, &[2, 3]), 1, 0, 1000).unwrap();
    let vaa = finalized(n.processor.handle_observation(upgrade, 1000));
    assert!(vaa.is_governance());

    let sets = n.processor.guardian_sets();
    assert_eq!(set(1, &[2, 3]).addresses, sets.current().addresses);
    assert_eq!(1, sets.current().index);
    assert_eq!(Some(1000 + GRACE), sets.previous().map(|s| s.expiration_time));

    // No longer a member: observations are recorded but not signed.
    let body = message(6).to_body();
    assert_eq!(pending(0, 2), n.processor.handle_observation(message(6), 1050));

    // The old set still counts inside its grace window.
    let vaa = finalized(n.processor.handle_signature(peer(1, 0, 0, &body), 1050));
    assert_eq!(0, vaa.header.guardian_set_index);

    // And not after it.
    let late = message(7).to_body();
    let _ = n.processor.handle_observation(message(7), 1100);
    assert_eq!(
        Outcome::Rejected(VerifyError::GuardianSetExpired(0).into()),
        n.processor.handle_signature(peer(1, 0, 0, &late), 1100)
    );

    assert_eq!(pending(1, 2), n.processor.handle_signature(peer(2, 0, 1, &late), 1100));
    let vaa = finalized(n.processor.handle_signature(peer(3, 1, 1, &late), 1101));
    assert_eq!(1, vaa.header.guardian_set_index);
    assert!(n
        .processor
        .guardian_sets()
        .current()
        .verify_vaa(&vaa, 1101)
        .is_ok());
}

#[test]
fn out_of_order_upgrade_is_ignored() {
    let mut n = node(1, set(0, &[1]));

    let skip = governance_publication(upgrade(2, &[2]), 1, 0, 0).unwrap();
    let _ = finalized(n.processor.handle_observation(skip, 0));
    assert_eq!(0, n.processor.guardian_sets().current().index);

    assert!(n.processor.handle_set_update(set(1, &[2]), 0).is_ok());
    assert_eq!(1, n.processor.guardian_sets().current().index);
    assert!(n.processor.handle_set_update(set(1, &[3]), 0).is_err());
}

#[test]
fn finalized_survives_cleanup() {
    let mut n = node(1, set(0, &[1, 2]));
    let mut sub = n.reporter.subscribe(8);
    let body = message(9).to_body();
    let id = body.message_id();

    let _ = n.processor.handle_observation(message(9), 0);
    let _ = finalized(n.processor.handle_signature(peer(2, 1, 0, &body), 1));
    assert!(sub.messages.try_recv().is_ok());
    assert!(sub.quorums.try_recv().is_ok());

    // Long past the pending expiry, so the recent finalizations have been pruned.
    let _ = n.processor.cleanup(1000);
    assert!(n.processor.is_finalized(&id));

    assert_eq!(
        Outcome::AlreadyFinalized,
        n.processor.handle_observation(message(9), 1001)
    );
    assert_eq!(
        Outcome::AlreadyFinalized,
        n.processor.handle_signature(peer(2, 1, 0, &body), 1001)
    );
    assert_eq!(0, n.processor.pending_count());
    assert!(sub.messages.try_recv().is_err());
    assert!(sub.quorums.try_recv().is_err());
}

#[test]
fn finalized_survives_restart() {
    let dir = std::env::temp_dir().join(format!("guardiand-restart-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);

    let mut n = node_with_store(1, set(0, &[1]), VaaStore::with_dir(&dir).unwrap());
    let _ = finalized(n.processor.handle_observation(message(10), 0));

    let mut restarted = node_with_store(1, set(0, &[1]), VaaStore::with_dir(&dir).unwrap());
    let mut sub = restarted.reporter.subscribe(8);
    assert_eq!(
        Outcome::AlreadyFinalized,
        restarted.processor.handle_observation(message(10), 5)
    );
    assert!(sub.quorums.try_recv().is_err());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn injected_upgrade_reaches_quorum() {
    // Both guardians load the same configuration, which leaves the timestamp unset.
    let injection: GovernanceInjection = serde_yaml::from_str(&format!(
        "sequence: 5\nnonce: 0\npayload: \"{}\"\n",
        hex::encode(upgrade(1, &[2, 3]))
    ))
    .unwrap();
    let publication = |timestamp| {
        governance_publication(
            injection.payload.clone(),
            injection.sequence,
            injection.nonce,
            timestamp,
        )
        .unwrap()
    };

    let mut a = node(1, set(0, &[1, 2]));
    let mut b = node(2, set(0, &[1, 2]));

    let msg = publication(injection.timestamp);
    let body = msg.to_body();
    assert_eq!(pending(1, 2), a.processor.handle_observation(msg.clone(), 1000));
    assert_eq!(pending(1, 2), b.processor.handle_observation(msg, 1003));

    // A guardian that stamped its own clock signs a different body, which never combines.
    let skewed = publication(1003).to_body();
    assert_ne!(body.digest().hash, skewed.digest().hash);
    assert_eq!(pending(1, 2), a.processor.handle_signature(peer(2, 1, 0, &skewed), 1003));
    assert!(!a.processor.is_finalized(&body.message_id()));

    let vaa = finalized(a.processor.handle_signature(peer(2, 1, 0, &body), 1004));
    assert!(vaa.is_governance());
    assert_eq!(0, vaa.body.timestamp);
    assert_eq!(1, a.processor.guardian_sets().current().index);

    let theirs = finalized(b.processor.handle_signature(peer(1, 0, 0, &body), 1004));
    assert_eq!(vaa, theirs);
    assert_eq!(
        set(1, &[2, 3]).addresses,
        b.processor.guardian_sets().current().addresses
    );
}

#[test]
fn asset_meta_end_to_end() {
    let mut n = node(1, set(0, &[1, 2, 3, 4, 5, 6, 7]));
    let mut sub = n.reporter.subscribe(8);

    let msg = MessagePublication {
        tx_hash: vec![0x5e; 32],
        timestamp: 1_650_000_000,
        nonce: 0,
        sequence: 7,
        consistency_level: 15,
        emitter_chain: Chain::Ethereum,
        emitter_address: Address([0xaa; 32]),
        payload: token::Message::AssetMeta {
            token_address: Address([0x33; 32]),
            token_chain: Chain::Ethereum,
            decimals: 6,
            symbol: BString::from("MCK"),
            name: BString::from("MOCK"),
        }
        .to_bytes()
        .unwrap(),
    };
    let body = msg.to_body();

    assert_eq!(pending(1, 5), n.processor.handle_observation(msg, 0));
    assert_eq!(pending(2, 5), n.processor.handle_signature(peer(3, 2, 0, &body), 1));
    assert_eq!(pending(3, 5), n.processor.handle_signature(peer(6, 5, 0, &body), 1));
    assert!(sub.quorums.try_recv().is_err());

    assert_eq!(pending(4, 5), n.processor.handle_signature(peer(2, 1, 0, &body), 2));
    let vaa = finalized(n.processor.handle_signature(peer(4, 3, 0, &body), 2));
    assert_eq!(
        vec![0, 1, 2, 3, 5],
        vaa.header
            .signatures
            .iter()
            .map(|s| s.index)
            .collect::<Vec<_>>()
    );

    let record = MessagePublicationRecord::from(&sub.messages.try_recv().unwrap());
    assert_eq!(2, record.emitter_chain);
    assert_eq!("aa".repeat(32), record.emitter_address);
    assert_eq!(PersistedValue::Int(7), record.sequence);
    assert_eq!("5e".repeat(32), record.initiating_tx_id);
    match record.decoded_payload {
        Some(DecodedPayload::AssetMeta(meta)) => {
            assert_eq!("33".repeat(32), meta.token_address);
            assert_eq!(2, meta.token_chain);
            assert_eq!(6, meta.decimals);
            assert_eq!("MCK", meta.symbol);
            assert_eq!("MOCK", meta.name);
        }
        other => panic!("expected asset metadata, got {other:?}"),
    }

    let quorum = sub.quorums.try_recv().unwrap();
    assert_eq!(vaa, quorum.vaa);
    let record = QuorumStateRecord::from(&quorum);
    assert_eq!(2, record.emitter_chain);
    assert_eq!("aa".repeat(32), record.emitter_address);
    assert_eq!(PersistedValue::Int(7), record.sequence);
    assert_eq!(
        Lookup::Found(quorum.signed.clone()),
        n.store.lookup(&body.message_id()).unwrap()
    );
}
