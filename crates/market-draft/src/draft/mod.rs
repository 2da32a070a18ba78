// Live draft engine: selection channels, completion rules, and the per-league
// turn loop.

pub mod completion;
pub mod coordinator;
pub mod registry;

use thiserror::Error;

use crate::league::LeagueId;

/// Failures surfaced to callers of the draft engine.
#[derive(Debug, Error)]
pub enum DraftError {
    #[error("no active draft for league {league_id}")]
    NoActiveDraft { league_id: LeagueId },

    #[error("a draft is already running for league {league_id}")]
    AlreadyRunning { league_id: LeagueId },

    #[error("a selection is already pending for league {league_id}")]
    SelectionPending { league_id: LeagueId },

    #[error("persistence error: {0}")]
    Store(#[source] anyhow::Error),
}
