//! Guardian sets, quorum arithmetic and signature recovery.

use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest as Sha3Digest, Keccak256};

use crate::{Digest, GuardianAddress, Signature, SignatureError, Vaa, VerifyError};

/// Number of distinct guardian signatures needed out of `guardians`: more than two thirds.
pub fn quorum(guardians: usize) -> usize {
    (guardians * 2) / 3 + 1
}

/// A versioned set of guardian keys. A guardian's position in `addresses` is the index it signs
/// with.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct GuardianSet {
    pub index: u32,
    pub addresses: Vec<GuardianAddress>,
    /// Unix seconds after which signatures from this set are no longer accepted. Zero while the
    /// set is active.
    pub expiration_time: u32,
}

impl GuardianSet {
    pub fn new(index: u32, addresses: Vec<GuardianAddress>) -> GuardianSet {
        GuardianSet {
            index,
            addresses,
            expiration_time: 0,
        }
    }

    pub fn quorum(&self) -> usize {
        quorum(self.addresses.len())
    }

    pub fn is_expired(&self, now: u32) -> bool {
        self.expiration_time != 0 && now >= self.expiration_time
    }

    /// Signing index of `addr` in this set.
    pub fn position(&self, addr: &GuardianAddress) -> Option<u8> {
        self.addresses
            .iter()
            .position(|a| a == addr)
            .and_then(|p| u8::try_from(p).ok())
    }

    /// Checks that `sig` was produced over `digest` by the guardian at `sig.index`.
    pub fn verify_signature(
        &self,
        sig: &Signature,
        digest: &Digest,
    ) -> Result<GuardianAddress, SignatureError> {
        let expected = self
            .addresses
            .get(usize::from(sig.index))
            .ok_or(SignatureError::UnknownGuardian(sig.index))?;

        let recovered =
            recover(&sig.signature, digest).map_err(|_| SignatureError::InvalidSignature(sig.index))?;
        if &recovered != expected {
            return Err(SignatureError::InvalidSignature(sig.index));
        }

        Ok(recovered)
    }

    /// Full verification of a VAA against this set at time `now`.
    pub fn verify_vaa(&self, vaa: &Vaa, now: u32) -> Result<Digest, VerifyError> {
        if vaa.header.guardian_set_index != self.index {
            return Err(VerifyError::WrongGuardianSet {
                expected: self.index,
                found: vaa.header.guardian_set_index,
            });
        }

        if self.is_expired(now) {
            return Err(VerifyError::GuardianSetExpired(self.index));
        }

        let sigs = &vaa.header.signatures;
        if sigs.windows(2).any(|w| w[0].index >= w[1].index) {
            return Err(VerifyError::UnsortedSignatures);
        }

        let need = self.quorum();
        if sigs.len() < need {
            return Err(VerifyError::QuorumNotMet {
                have: sigs.len(),
                need,
            });
        }

        let digest = vaa.digest();
        for sig in sigs {
            let _ = self.verify_signature(sig, &digest)?;
        }

        Ok(digest)
    }
}

/// Address of a guardian key: the last 20 bytes of the keccak of the uncompressed public key.
pub fn guardian_address(key: &VerifyingKey) -> GuardianAddress {
    let point = key.to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);

    let mut out = [0u8; 20];
    out.copy_from_slice(&hash[12..]);
    GuardianAddress(out)
}

/// Signs `digest` the way guardians do: a recoverable signature over the second hash, laid out
/// as r || s || v with v in {0, 1}.
pub fn sign(key: &SigningKey, digest: &Digest) -> Result<[u8; 65], SignatureError> {
    let (sig, recid) = key
        .sign_prehash_recoverable(&digest.secp256k_hash)
        .map_err(|_| SignatureError::SigningFailed)?;

    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&sig.to_bytes());
    out[64] = recid.to_byte();
    Ok(out)
}

/// Recovers the guardian address that produced `signature` over `digest`. Ethereum style
/// recovery ids of 27 and 28 are accepted as well.
pub fn recover(signature: &[u8; 65], digest: &Digest) -> Result<GuardianAddress, SignatureError> {
    let sig = EcdsaSignature::from_slice(&signature[..64]).map_err(|_| SignatureError::Malformed)?;

    let v = match signature[64] {
        v @ (0 | 1) => v,
        v @ (27 | 28) => v - 27,
        _ => return Err(SignatureError::Malformed),
    };
    let recid = RecoveryId::from_byte(v).ok_or(SignatureError::Malformed)?;

    let key = VerifyingKey::recover_from_prehash(&digest.secp256k_hash, &sig, recid)
        .map_err(|_| SignatureError::Malformed)?;

    Ok(guardian_address(&key))
}
