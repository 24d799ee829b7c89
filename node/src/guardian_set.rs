//! The guardian sets a node accepts signatures from: the active set, and the set it replaced
//! for as long as that one is inside its grace window.

use guardian_vaa::{GuardianSet, VerifyError};
use log::*;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SetUpdateError {
    #[error("guardian set {new} does not follow the active set {current}")]
    NonSequential { current: u32, new: u32 },

    #[error("guardian set {0} has no members")]
    Empty(u32),
}

#[derive(Debug, Clone)]
pub struct GuardianSetState {
    current: GuardianSet,
    previous: Option<GuardianSet>,
    /// Seconds a replaced set keeps being accepted.
    grace: u32,
}

impl GuardianSetState {
    pub fn new(current: GuardianSet, grace: u32) -> GuardianSetState {
        GuardianSetState {
            current,
            previous: None,
            grace,
        }
    }

    pub fn current(&self) -> &GuardianSet {
        &self.current
    }

    pub fn previous(&self) -> Option<&GuardianSet> {
        self.previous.as_ref()
    }

    /// The set with `index`, provided it may still vouch for messages at `now`.
    pub fn get(&self, index: u32, now: u32) -> Result<&GuardianSet, VerifyError> {
        if index == self.current.index {
            return Ok(&self.current);
        }

        match &self.previous {
            Some(prev) if prev.index == index => {
                if prev.is_expired(now) {
                    Err(VerifyError::GuardianSetExpired(index))
                } else {
                    Ok(prev)
                }
            }
            _ => Err(VerifyError::WrongGuardianSet {
                expected: self.current.index,
                found: index,
            }),
        }
    }

    /// Every set accepted at `now`, the active one first.
    pub fn valid_sets(&self, now: u32) -> impl Iterator<Item = &GuardianSet> {
        std::iter::once(&self.current)
            .chain(self.previous.iter().filter(move |p| !p.is_expired(now)))
    }

    /// Makes `next` the active set. The replaced set expires `grace` seconds after `now`.
    pub fn update(&mut self, mut next: GuardianSet, now: u32) -> Result<(), SetUpdateError> {
        if next.index != self.current.index.wrapping_add(1) {
            return Err(SetUpdateError::NonSequential {
                current: self.current.index,
                new: next.index,
            });
        }
        if next.addresses.is_empty() {
            return Err(SetUpdateError::Empty(next.index));
        }

        next.expiration_time = 0;
        let mut replaced = std::mem::replace(&mut self.current, next);
        replaced.expiration_time = now.saturating_add(self.grace);

        info!(
            "guardian set {} is active with {} members, set {} expires at {}",
            self.current.index,
            self.current.addresses.len(),
            replaced.index,
            replaced.expiration_time
        );
        self.previous = Some(replaced);
        Ok(())
    }
}
