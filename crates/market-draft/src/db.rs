// SQLite persistence layer for leagues, stock pools, and drafted holdings.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::league::{
    DraftStatus, LeagueId, LeaguePlayer, LeagueSnapshot, LeagueState, Portfolio, Stock, StockId,
    UserId,
};
use crate::store::{
    LeaguePoolProvider, LeagueStateStore, PortfolioMutator, PortfolioReader, ReadinessProvider,
};

/// SQLite-backed implementation of every collaborator the draft engine
/// consumes.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database (useful
    /// for tests).
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS leagues (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                league_name  TEXT NOT NULL,
                league_state TEXT NOT NULL DEFAULT 'pre_draft',
                max_players  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS league_players (
                league_id    INTEGER NOT NULL REFERENCES leagues(id) ON DELETE CASCADE,
                user_id      INTEGER NOT NULL,
                join_order   INTEGER NOT NULL,
                draft_status TEXT NOT NULL DEFAULT 'not_ready',
                PRIMARY KEY (league_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS stocks (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                ticker_symbol TEXT NOT NULL UNIQUE,
                company_name  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS league_pool (
                league_id INTEGER NOT NULL REFERENCES leagues(id) ON DELETE CASCADE,
                stock_id  INTEGER NOT NULL REFERENCES stocks(id),
                PRIMARY KEY (league_id, stock_id)
            );

            CREATE TABLE IF NOT EXISTS holdings (
                league_id  INTEGER NOT NULL REFERENCES leagues(id) ON DELETE CASCADE,
                user_id    INTEGER NOT NULL,
                stock_id   INTEGER NOT NULL REFERENCES stocks(id),
                drafted_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (league_id, stock_id)
            );

            CREATE INDEX IF NOT EXISTS idx_holdings_league_user ON holdings(league_id, user_id);
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection, recovering from a poisoned lock.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a league in `PreDraft` and return its ID.
    pub fn create_league(&self, name: &str, max_players: u32) -> Result<LeagueId> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO leagues (league_name, max_players) VALUES (?1, ?2)",
            params![name, max_players],
        )
        .context("failed to create league")?;
        Ok(conn.last_insert_rowid() as LeagueId)
    }

    /// Delete a league and everything scoped to it.
    pub fn delete_league(&self, league_id: LeagueId) -> Result<bool> {
        let conn = self.conn();
        let removed = conn
            .execute("DELETE FROM leagues WHERE id = ?1", params![league_id])
            .context("failed to delete league")?;
        Ok(removed > 0)
    }

    /// Append a player to the league's rotation. Fails once the league is
    /// full or if the player already joined.
    pub fn add_player(&self, league_id: LeagueId, user_id: UserId) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;

        let max_players: u32 = tx
            .query_row(
                "SELECT max_players FROM leagues WHERE id = ?1",
                params![league_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up league")?
            .with_context(|| format!("league {league_id} not found"))?;

        let (count, next_order): (u32, i64) = tx
            .query_row(
                "SELECT COUNT(*), COALESCE(MAX(join_order) + 1, 0)
                 FROM league_players WHERE league_id = ?1",
                params![league_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("failed to count league players")?;
        if count >= max_players {
            bail!("league {league_id} is full ({max_players} players)");
        }

        tx.execute(
            "INSERT INTO league_players (league_id, user_id, join_order) VALUES (?1, ?2, ?3)",
            params![league_id, user_id, next_order],
        )
        .with_context(|| format!("failed to add player {user_id} to league {league_id}"))?;

        tx.commit().context("failed to commit player insert")?;
        Ok(())
    }

    /// Take a player out of the league along with their holdings. Returns
    /// `false` if they were not a member.
    pub fn remove_player(&self, league_id: LeagueId, user_id: UserId) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        tx.execute(
            "DELETE FROM holdings WHERE league_id = ?1 AND user_id = ?2",
            params![league_id, user_id],
        )
        .context("failed to delete holdings")?;
        let removed = tx
            .execute(
                "DELETE FROM league_players WHERE league_id = ?1 AND user_id = ?2",
                params![league_id, user_id],
            )
            .with_context(|| format!("failed to remove player {user_id} from league {league_id}"))?;
        tx.commit().context("failed to commit player removal")?;
        Ok(removed > 0)
    }

    /// Insert a stock into the global catalogue and return its ID.
    pub fn insert_stock(&self, ticker_symbol: &str, company_name: &str) -> Result<StockId> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO stocks (ticker_symbol, company_name) VALUES (?1, ?2)",
            params![ticker_symbol, company_name],
        )
        .with_context(|| format!("failed to insert stock {ticker_symbol}"))?;
        Ok(conn.last_insert_rowid() as StockId)
    }

    /// Make a catalogue stock draftable in a league.
    pub fn add_to_pool(&self, league_id: LeagueId, stock_id: StockId) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO league_pool (league_id, stock_id) VALUES (?1, ?2)",
            params![league_id, stock_id],
        )
        .context("failed to add stock to league pool")?;
        Ok(())
    }

    /// Stocks drafted by a player in a league, in draft order.
    pub fn holdings(&self, league_id: LeagueId, user_id: UserId) -> Result<Vec<StockId>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT stock_id FROM holdings
                 WHERE league_id = ?1 AND user_id = ?2 ORDER BY rowid",
            )
            .context("failed to prepare holdings query")?;
        let rows = stmt
            .query_map(params![league_id, user_id], |row| row.get(0))
            .context("failed to query holdings")?
            .collect::<rusqlite::Result<Vec<StockId>>>()
            .context("failed to read holdings row")?;
        Ok(rows)
    }

    pub fn league_state(&self, league_id: LeagueId) -> Result<LeagueState> {
        let conn = self.conn();
        let raw: String = conn
            .query_row(
                "SELECT league_state FROM leagues WHERE id = ?1",
                params![league_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query league state")?
            .with_context(|| format!("league {league_id} not found"))?;
        LeagueState::parse(&raw).with_context(|| format!("unknown league state '{raw}'"))
    }

    fn move_stock_to_holdings(
        &self,
        league_id: LeagueId,
        user_id: UserId,
        stock_id: StockId,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;

        let is_member: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM league_players WHERE league_id = ?1 AND user_id = ?2)",
                params![league_id, user_id],
                |row| row.get(0),
            )
            .context("failed to check league membership")?;
        if !is_member {
            bail!("user {user_id} is not a member of league {league_id}");
        }

        let removed = tx
            .execute(
                "DELETE FROM league_pool WHERE league_id = ?1 AND stock_id = ?2",
                params![league_id, stock_id],
            )
            .context("failed to remove stock from league pool")?;
        if removed == 0 {
            bail!("stock {stock_id} is not available in league {league_id}");
        }

        tx.execute(
            "INSERT INTO holdings (league_id, user_id, stock_id) VALUES (?1, ?2, ?3)",
            params![league_id, user_id, stock_id],
        )
        .context("failed to record holding")?;

        tx.commit().context("failed to commit draft pick")?;
        Ok(())
    }

    fn pool(&self, league_id: LeagueId) -> Result<Vec<Stock>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT s.id, s.ticker_symbol, s.company_name
                 FROM league_pool p JOIN stocks s ON s.id = p.stock_id
                 WHERE p.league_id = ?1 ORDER BY s.id",
            )
            .context("failed to prepare pool query")?;
        let stocks = stmt
            .query_map(params![league_id], |row| {
                Ok(Stock {
                    id: row.get(0)?,
                    ticker_symbol: row.get(1)?,
                    company_name: row.get(2)?,
                })
            })
            .context("failed to query league pool")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read pool row")?;
        Ok(stocks)
    }

    fn set_ready(&self, league_id: LeagueId, user_id: UserId) -> Result<()> {
        let conn = self.conn();
        let updated = conn
            .execute(
                "UPDATE league_players SET draft_status = ?3 WHERE league_id = ?1 AND user_id = ?2",
                params![league_id, user_id, DraftStatus::Ready.as_str()],
            )
            .context("failed to update draft status")?;
        if updated == 0 {
            bail!("user {user_id} is not a member of league {league_id}");
        }
        Ok(())
    }

    fn everyone_ready(&self, league_id: LeagueId) -> Result<bool> {
        let conn = self.conn();
        let (total, ready): (u32, u32) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(draft_status = 'ready'), 0)
                 FROM league_players WHERE league_id = ?1",
                params![league_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("failed to count ready players")?;
        Ok(total > 0 && total == ready)
    }

    fn rotation(&self, league_id: LeagueId) -> Result<Vec<UserId>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT user_id FROM league_players WHERE league_id = ?1 ORDER BY join_order",
            )
            .context("failed to prepare rotation query")?;
        let players = stmt
            .query_map(params![league_id], |row| row.get(0))
            .context("failed to query league players")?
            .collect::<rusqlite::Result<Vec<UserId>>>()
            .context("failed to read league player row")?;
        Ok(players)
    }

    fn transition(&self, league_id: LeagueId, next: LeagueState) -> Result<()> {
        let current = self.league_state(league_id)?;
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            bail!("league {league_id} cannot move from {current} to {next}");
        }
        let conn = self.conn();
        conn.execute(
            "UPDATE leagues SET league_state = ?2 WHERE id = ?1",
            params![league_id, next.as_str()],
        )
        .context("failed to update league state")?;
        Ok(())
    }

    fn snapshot(&self, league_id: LeagueId) -> Result<LeagueSnapshot> {
        let conn = self.conn();
        let (league_name, raw_state, max_players): (String, String, u32) = conn
            .query_row(
                "SELECT league_name, league_state, max_players FROM leagues WHERE id = ?1",
                params![league_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("failed to query league")?
            .with_context(|| format!("league {league_id} not found"))?;
        let league_state = LeagueState::parse(&raw_state)
            .with_context(|| format!("unknown league state '{raw_state}'"))?;

        let mut stmt = conn
            .prepare(
                "SELECT user_id, draft_status FROM league_players
                 WHERE league_id = ?1 ORDER BY join_order",
            )
            .context("failed to prepare league players query")?;
        let rows = stmt
            .query_map(params![league_id], |row| {
                Ok((row.get::<_, UserId>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to query league players")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read league player row")?;

        let league_players = rows
            .into_iter()
            .map(|(player_id, status)| {
                let draft_status = DraftStatus::parse(&status)
                    .with_context(|| format!("unknown draft status '{status}'"))?;
                Ok(LeaguePlayer {
                    player_id,
                    draft_status,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(LeagueSnapshot {
            id: league_id,
            league_name,
            league_state,
            max_players,
            league_players,
        })
    }

    fn counts(&self, league_id: LeagueId) -> Result<HashMap<UserId, usize>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT user_id, COUNT(*) FROM holdings WHERE league_id = ?1 GROUP BY user_id",
            )
            .context("failed to prepare holdings count query")?;
        let counts = stmt
            .query_map(params![league_id], |row| {
                Ok((row.get::<_, UserId>(0)?, row.get::<_, i64>(1)? as usize))
            })
            .context("failed to count holdings")?
            .collect::<rusqlite::Result<HashMap<_, _>>>()
            .context("failed to read holdings count row")?;
        Ok(counts)
    }

    fn portfolio_list(&self, league_id: LeagueId) -> Result<Vec<Portfolio>> {
        let players = self.rotation(league_id)?;
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT s.id, s.ticker_symbol, s.company_name
                 FROM holdings h JOIN stocks s ON s.id = h.stock_id
                 WHERE h.league_id = ?1 AND h.user_id = ?2 ORDER BY h.rowid",
            )
            .context("failed to prepare portfolio query")?;

        let mut portfolios = Vec::with_capacity(players.len());
        for user_id in players {
            let stocks = stmt
                .query_map(params![league_id, user_id], |row| {
                    Ok(Stock {
                        id: row.get(0)?,
                        ticker_symbol: row.get(1)?,
                        company_name: row.get(2)?,
                    })
                })
                .context("failed to query portfolio")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read portfolio row")?;
            portfolios.push(Portfolio {
                user_id,
                league_id,
                stocks,
            });
        }
        Ok(portfolios)
    }
}

#[async_trait]
impl PortfolioMutator for Database {
    async fn draft_stock(
        &self,
        league_id: LeagueId,
        user_id: UserId,
        stock_id: StockId,
    ) -> Result<()> {
        self.move_stock_to_holdings(league_id, user_id, stock_id)
    }
}

#[async_trait]
impl LeaguePoolProvider for Database {
    async fn available_stocks(&self, league_id: LeagueId) -> Result<Vec<Stock>> {
        self.pool(league_id)
    }
}

#[async_trait]
impl ReadinessProvider for Database {
    async fn mark_ready(&self, league_id: LeagueId, user_id: UserId) -> Result<()> {
        self.set_ready(league_id, user_id)
    }

    async fn all_ready(&self, league_id: LeagueId) -> Result<bool> {
        self.everyone_ready(league_id)
    }
}

#[async_trait]
impl LeagueStateStore for Database {
    async fn ordered_players(&self, league_id: LeagueId) -> Result<Vec<UserId>> {
        self.rotation(league_id)
    }

    async fn update_state(&self, league_id: LeagueId, state: LeagueState) -> Result<()> {
        self.transition(league_id, state)
    }

    async fn league_snapshot(&self, league_id: LeagueId) -> Result<LeagueSnapshot> {
        self.snapshot(league_id)
    }
}

#[async_trait]
impl PortfolioReader for Database {
    async fn drafted_counts(&self, league_id: LeagueId) -> Result<HashMap<UserId, usize>> {
        self.counts(league_id)
    }

    async fn portfolios(&self, league_id: LeagueId) -> Result<Vec<Portfolio>> {
        self.portfolio_list(league_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
