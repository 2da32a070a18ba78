// Narrow interfaces to the persistence layer consumed by the draft engine.
//
// The engine never touches storage directly; it goes through these traits so
// that the SQLite store in `db` can be swapped for any other backend.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::league::{LeagueId, LeagueSnapshot, LeagueState, Portfolio, Stock, StockId, UserId};

/// Moves a stock from a league's pool into a player's holdings.
#[async_trait]
pub trait PortfolioMutator: Send + Sync {
    async fn draft_stock(&self, league_id: LeagueId, user_id: UserId, stock_id: StockId)
        -> Result<()>;
}

/// Lists the stocks still available to draft in a league.
#[async_trait]
pub trait LeaguePoolProvider: Send + Sync {
    async fn available_stocks(&self, league_id: LeagueId) -> Result<Vec<Stock>>;
}

/// Tracks which players have queued up for the draft.
#[async_trait]
pub trait ReadinessProvider: Send + Sync {
    async fn mark_ready(&self, league_id: LeagueId, user_id: UserId) -> Result<()>;

    /// `false` for a league with no players.
    async fn all_ready(&self, league_id: LeagueId) -> Result<bool>;
}

/// League membership and lifecycle state.
#[async_trait]
pub trait LeagueStateStore: Send + Sync {
    /// Player IDs in draft rotation order.
    async fn ordered_players(&self, league_id: LeagueId) -> Result<Vec<UserId>>;

    async fn update_state(&self, league_id: LeagueId, state: LeagueState) -> Result<()>;

    async fn league_snapshot(&self, league_id: LeagueId) -> Result<LeagueSnapshot>;
}

/// Read side of the portfolios: completion checks and post-pick broadcasts.
#[async_trait]
pub trait PortfolioReader: Send + Sync {
    /// Number of drafted stocks per player. Players without holdings may be
    /// absent from the map.
    async fn drafted_counts(&self, league_id: LeagueId) -> Result<HashMap<UserId, usize>>;

    /// One portfolio per league player, in rotation order.
    async fn portfolios(&self, league_id: LeagueId) -> Result<Vec<Portfolio>>;
}

/// Every collaborator the engine needs, bundled for injection.
#[derive(Clone)]
pub struct Collaborators {
    pub portfolios: Arc<dyn PortfolioMutator>,
    pub pool: Arc<dyn LeaguePoolProvider>,
    pub readiness: Arc<dyn ReadinessProvider>,
    pub leagues: Arc<dyn LeagueStateStore>,
    pub holdings: Arc<dyn PortfolioReader>,
}

impl Collaborators {
    /// Build the bundle from one backend that implements every interface.
    pub fn shared<B>(backend: Arc<B>) -> Self
    where
        B: PortfolioMutator
            + LeaguePoolProvider
            + ReadinessProvider
            + LeagueStateStore
            + PortfolioReader
            + 'static,
    {
        Self {
            portfolios: backend.clone(),
            pool: backend.clone(),
            readiness: backend.clone(),
            leagues: backend.clone(),
            holdings: backend,
        }
    }
}
