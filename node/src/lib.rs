//! Guardian node internals.
//!
//! Chain watchers turn source chain events into [`common::MessagePublication`]s. The
//! [`processor::Processor`] signs them, collects signatures from the rest of the guardian set
//! and finalizes VAAs once quorum is reached. Finalized VAAs land in the [`store::VaaStore`]
//! and are fanned out to subscribers through the [`reporter::AttestationEventReporter`].

pub mod common;
pub mod config;
pub mod governance;
pub mod guardian_set;
pub mod processor;
pub mod reporter;
pub mod stats;
pub mod store;
pub mod watcher;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds, saturating at the bounds of `u32`.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}
