use std::io;

use thiserror::Error;

/// Failure to decode a VAA from its wire format.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("input ended before a fixed-width field could be read")]
    TruncatedInput,
    #[error("unsupported VAA version {0}")]
    UnsupportedVersion(u8),
}

// Reads from an in-memory slice only fail when the slice runs out.
impl From<io::Error> for DecodeError {
    fn from(_: io::Error) -> Self {
        DecodeError::TruncatedInput
    }
}

/// Failure to decode a token bridge payload.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload ended before a fixed-width field could be read")]
    TruncatedPayload,
    #[error("unknown payload id {0}")]
    UnknownPayloadId(u8),
}

impl From<io::Error> for PayloadError {
    fn from(_: io::Error) -> Self {
        PayloadError::TruncatedPayload
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GovernanceError {
    #[error("message was not emitted by the governance emitter")]
    InvalidEmitter,
    #[error("governance packet is for a different module")]
    InvalidModule,
    #[error("unknown governance action {0}")]
    UnknownAction(u8),
    #[error("governance packet is truncated")]
    Truncated,
    #[error("too many guardians for a single set")]
    TooManyGuardians,
}

impl From<io::Error> for GovernanceError {
    fn from(_: io::Error) -> Self {
        GovernanceError::Truncated
    }
}

/// A single guardian signature could not be attributed to the index it claims.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    #[error("guardian index {0} is not part of the guardian set")]
    UnknownGuardian(u8),
    #[error("signature bytes are malformed")]
    Malformed,
    #[error("guardian {0} already signed")]
    Duplicate(u8),
    #[error("signature by guardian {0} does not match its key")]
    InvalidSignature(u8),
    #[error("failed to produce a signature")]
    SigningFailed,
}

/// Full VAA verification failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    #[error("VAA was signed by guardian set {found}, expected {expected}")]
    WrongGuardianSet { expected: u32, found: u32 },
    #[error("guardian set {0} has expired")]
    GuardianSetExpired(u32),
    #[error("signatures are not in strictly ascending guardian order")]
    UnsortedSignatures,
    #[error("only {have} signatures, {need} required")]
    QuorumNotMet { have: usize, need: usize },
    #[error(transparent)]
    Signature(#[from] SignatureError),
}
