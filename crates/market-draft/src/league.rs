// League-level domain types shared by the draft engine, the hub, and the store.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type LeagueId = u64;
pub type UserId = u64;
pub type StockId = u64;

/// Lifecycle of a league as seen by the draft engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeagueState {
    #[serde(rename = "pre_draft")]
    PreDraft,
    #[serde(rename = "draft")]
    InDraft,
    #[serde(rename = "post_draft")]
    PostDraft,
}

impl LeagueState {
    /// Storage representation, identical to the wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeagueState::PreDraft => "pre_draft",
            LeagueState::InDraft => "draft",
            LeagueState::PostDraft => "post_draft",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pre_draft" => Some(LeagueState::PreDraft),
            "draft" => Some(LeagueState::InDraft),
            "post_draft" => Some(LeagueState::PostDraft),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_transition_to(&self, next: LeagueState) -> bool {
        matches!(
            (self, next),
            (LeagueState::PreDraft, LeagueState::InDraft)
                | (LeagueState::InDraft, LeagueState::PostDraft)
        )
    }
}

impl fmt::Display for LeagueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue status of a player waiting for the draft to begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Ready,
    NotReady,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Ready => "ready",
            DraftStatus::NotReady => "not_ready",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(DraftStatus::Ready),
            "not_ready" => Some(DraftStatus::NotReady),
            _ => None,
        }
    }
}

/// A player's membership row inside a league snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaguePlayer {
    pub player_id: UserId,
    pub draft_status: DraftStatus,
}

/// Point-in-time view of a league, broadcast on every state transition and
/// sent to clients that subscribe mid-draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeagueSnapshot {
    pub id: LeagueId,
    pub league_name: String,
    pub league_state: LeagueState,
    pub max_players: u32,
    /// Players in draft rotation order.
    pub league_players: Vec<LeaguePlayer>,
}

/// A stock that can be drafted out of a league's pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stock {
    pub id: StockId,
    pub ticker_symbol: String,
    pub company_name: String,
}

/// The stocks one player holds in a league.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portfolio {
    pub user_id: UserId,
    pub league_id: LeagueId,
    pub stocks: Vec<Stock>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn league_state_wire_names() {
        assert_eq!(
            serde_json::to_string(&LeagueState::InDraft).unwrap(),
            "\"draft\""
        );
        assert_eq!(
            serde_json::from_str::<LeagueState>("\"post_draft\"").unwrap(),
            LeagueState::PostDraft
        );
        for state in [
            LeagueState::PreDraft,
            LeagueState::InDraft,
            LeagueState::PostDraft,
        ] {
            assert_eq!(LeagueState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn only_forward_transitions_allowed() {
        assert!(LeagueState::PreDraft.can_transition_to(LeagueState::InDraft));
        assert!(LeagueState::InDraft.can_transition_to(LeagueState::PostDraft));
        assert!(!LeagueState::PostDraft.can_transition_to(LeagueState::InDraft));
        assert!(!LeagueState::PreDraft.can_transition_to(LeagueState::PostDraft));
        assert!(!LeagueState::InDraft.can_transition_to(LeagueState::PreDraft));
    }

    #[test]
    fn draft_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&DraftStatus::NotReady).unwrap(),
            "\"not_ready\""
        );
        assert_eq!(DraftStatus::parse("ready"), Some(DraftStatus::Ready));
        assert_eq!(DraftStatus::parse("bogus"), None);
    }
}
