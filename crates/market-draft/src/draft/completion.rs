// Rules for deciding when a league's draft is over.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::league::{LeagueId, UserId};
use crate::store::PortfolioReader;

/// Decides whether a draft has finished. Evaluated before every turn.
#[async_trait]
pub trait CompletionPredicate: Send + Sync {
    async fn is_complete(&self, league_id: LeagueId, players: &[UserId]) -> Result<bool>;
}

/// Complete once every player in the rotation holds at least `target`
/// drafted stocks.
///
/// Counts are re-read from the store on every call instead of being tracked
/// by the loop, so picks applied out of band are still counted.
pub struct HoldingsTarget {
    reader: Arc<dyn PortfolioReader>,
    target: usize,
}

impl HoldingsTarget {
    pub fn new(reader: Arc<dyn PortfolioReader>, target: usize) -> Self {
        Self { reader, target }
    }
}

#[async_trait]
impl CompletionPredicate for HoldingsTarget {
    async fn is_complete(&self, league_id: LeagueId, players: &[UserId]) -> Result<bool> {
        if players.is_empty() {
            return Ok(false);
        }
        let counts = self.reader.drafted_counts(league_id).await?;
        Ok(players
            .iter()
            .all(|p| counts.get(p).copied().unwrap_or(0) >= self.target))
    }
}
