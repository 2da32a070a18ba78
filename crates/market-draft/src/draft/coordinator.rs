// Draft coordinator: one task per live league draft, owning turn order,
// the per-turn pick/timeout race, pick application, and completion.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::completion::{CompletionPredicate, HoldingsTarget};
use super::registry::{Registration, Selection, SelectionChannelRegistry};
use super::DraftError;
use crate::hub::SubscriptionHub;
use crate::league::{LeagueId, LeagueState, StockId, UserId};
use crate::protocol::{DraftPickEvent, DraftUpdate, LeaguePool, LeaguePortfolios, ServerEvent};
use crate::store::Collaborators;

/// Time a player has to make a pick before the auto-pick fires.
pub const DEFAULT_TURN_DURATION: Duration = Duration::from_secs(30);

/// Stocks each player must hold for the draft to finish.
pub const DEFAULT_PICKS_PER_PLAYER: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftSettings {
    pub turn_duration: Duration,
    pub picks_per_player: usize,
}

impl Default for DraftSettings {
    fn default() -> Self {
        Self {
            turn_duration: DEFAULT_TURN_DURATION,
            picks_per_player: DEFAULT_PICKS_PER_PLAYER,
        }
    }
}

/// How a draft loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftOutcome {
    /// The completion rule held; the league is now `PostDraft`.
    Completed { picks_applied: usize, turns: usize },
    /// Stopped through the cancellation token. League state is left as is.
    Cancelled { picks_applied: usize, turns: usize },
}

/// Handle to a spawned draft loop.
pub struct DraftHandle {
    league_id: LeagueId,
    cancel: CancellationToken,
    join: JoinHandle<DraftOutcome>,
}

impl DraftHandle {
    pub fn league_id(&self) -> LeagueId {
        self.league_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the loop to exit.
    pub async fn wait(self) -> Result<DraftOutcome, JoinError> {
        self.join.await
    }
}

struct Shared {
    registry: Arc<SelectionChannelRegistry>,
    hub: Arc<SubscriptionHub>,
    store: Collaborators,
    completion: Arc<dyn CompletionPredicate>,
    settings: DraftSettings,
}

impl Shared {
    async fn broadcast_league_state(&self, league_id: LeagueId) {
        match self.store.leagues.league_snapshot(league_id).await {
            Ok(snapshot) => {
                self.hub
                    .broadcast_to_league(league_id, &ServerEvent::LeagueState(snapshot))
                    .await;
            }
            Err(e) => warn!("Failed to load league {league_id} for broadcast: {e:#}"),
        }
    }
}

/// Starts and steers league drafts. Cheap to clone.
#[derive(Clone)]
pub struct DraftCoordinator {
    shared: Arc<Shared>,
}

impl DraftCoordinator {
    /// Build a coordinator whose drafts finish once every player holds
    /// `settings.picks_per_player` stocks.
    pub fn new(
        registry: Arc<SelectionChannelRegistry>,
        hub: Arc<SubscriptionHub>,
        store: Collaborators,
        settings: DraftSettings,
    ) -> Self {
        let completion = Arc::new(HoldingsTarget::new(
            Arc::clone(&store.holdings),
            settings.picks_per_player,
        ));
        Self::with_completion(registry, hub, store, settings, completion)
    }

    pub fn with_completion(
        registry: Arc<SelectionChannelRegistry>,
        hub: Arc<SubscriptionHub>,
        store: Collaborators,
        settings: DraftSettings,
        completion: Arc<dyn CompletionPredicate>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                hub,
                store,
                completion,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &DraftSettings {
        &self.shared.settings
    }

    pub fn hub(&self) -> &Arc<SubscriptionHub> {
        &self.shared.hub
    }

    pub fn store(&self) -> &Collaborators {
        &self.shared.store
    }

    pub fn is_running(&self, league_id: LeagueId) -> bool {
        self.shared.registry.is_active(league_id)
    }

    pub fn active_drafts(&self) -> Vec<LeagueId> {
        self.shared.registry.active_leagues()
    }

    /// Begin the draft for `league_id`: register its selection channel, move
    /// the league to `InDraft`, broadcast the new state, and spawn the turn
    /// loop.
    ///
    /// Fails with [`DraftError::AlreadyRunning`] if the league's draft is
    /// already live. If the state update fails the channel is released again.
    pub async fn start_draft(&self, league_id: LeagueId) -> Result<DraftHandle, DraftError> {
        let cancel = CancellationToken::new();
        let (registration, selections) = self.shared.registry.register(league_id, cancel.clone())?;

        self.shared
            .store
            .leagues
            .update_state(league_id, LeagueState::InDraft)
            .await
            .map_err(DraftError::Store)?;
        info!("Draft started for league {league_id}");
        self.shared.broadcast_league_state(league_id).await;

        let task = DraftTask {
            shared: Arc::clone(&self.shared),
            league_id,
            selections,
            cancel: cancel.clone(),
            _registration: registration,
        };
        let join = tokio::spawn(task.run());

        Ok(DraftHandle {
            league_id,
            cancel,
            join,
        })
    }

    /// Hand a player's pick to the league's running draft.
    pub fn submit_pick(
        &self,
        league_id: LeagueId,
        user_id: UserId,
        stock_id: StockId,
    ) -> Result<(), DraftError> {
        self.shared
            .registry
            .submit(league_id, Selection { user_id, stock_id })
    }

    /// Stop a running draft, e.g. because its league was deleted. Returns
    /// whether one was running.
    pub fn cancel_draft(&self, league_id: LeagueId) -> bool {
        let cancelled = self.shared.registry.cancel(league_id);
        if cancelled {
            info!("Cancellation requested for draft in league {league_id}");
        }
        cancelled
    }
}

// ---------------------------------------------------------------------------
// Turn loop
// ---------------------------------------------------------------------------

/// What ended the wait for a pick.
#[derive(Debug, PartialEq, Eq)]
enum TurnResolution {
    Picked(StockId),
    TimedOut,
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
enum TurnResult {
    Applied,
    Skipped,
    Cancelled,
}

struct DraftTask {
    shared: Arc<Shared>,
    league_id: LeagueId,
    selections: mpsc::Receiver<Selection>,
    cancel: CancellationToken,
    /// Deregisters the selection channel when the task ends, however it ends.
    _registration: Registration,
}

impl DraftTask {
    async fn run(mut self) -> DraftOutcome {
        let league_id = self.league_id;
        let mut picks_applied = 0;
        let mut turns = 0;

        let Some(mut players) = self.initial_rotation(&mut turns).await else {
            info!("Draft in league {league_id} cancelled before the first pick");
            return DraftOutcome::Cancelled {
                picks_applied,
                turns,
            };
        };
        let mut index = 0;

        loop {
            if self.cancel.is_cancelled() {
                info!("Draft in league {league_id} cancelled after {turns} turns");
                return DraftOutcome::Cancelled {
                    picks_applied,
                    turns,
                };
            }

            match self.shared.completion.is_complete(league_id, &players).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!("Completion check failed for league {league_id}: {e:#}"),
            }

            let player = players[index];
            turns += 1;
            match self.play_turn(player).await {
                TurnResult::Applied => picks_applied += 1,
                TurnResult::Skipped => {}
                TurnResult::Cancelled => {
                    info!("Draft in league {league_id} cancelled during turn {turns}");
                    return DraftOutcome::Cancelled {
                        picks_applied,
                        turns,
                    };
                }
            }

            index = (index + 1) % players.len();
            self.refresh_rotation(&mut players, &mut index).await;
        }

        self.finish().await;
        info!("Draft in league {league_id} complete: {picks_applied} picks over {turns} turns");
        DraftOutcome::Completed {
            picks_applied,
            turns,
        }
    }

    /// Load the rotation, idling one turn per failed or empty read. `None`
    /// once cancelled.
    async fn initial_rotation(&self, turns: &mut usize) -> Option<Vec<UserId>> {
        let league_id = self.league_id;
        loop {
            match self.shared.store.leagues.ordered_players(league_id).await {
                Ok(players) if !players.is_empty() => return Some(players),
                Ok(_) => warn!("No players to draft in league {league_id} yet; skipping turn"),
                Err(e) => {
                    warn!("Failed to load players for league {league_id}, skipping turn: {e:#}")
                }
            }
            *turns += 1;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.shared.settings.turn_duration) => {}
            }
        }
    }

    async fn play_turn(&mut self, player: UserId) -> TurnResult {
        let league_id = self.league_id;
        self.discard_stale_selections();

        info!("Player {player} on the clock in league {league_id}");
        let update = ServerEvent::DraftUpdate(DraftUpdate {
            league_id,
            player_id: player,
            remaining_time: self.shared.settings.turn_duration.as_secs(),
        });
        self.shared.hub.broadcast_to_league(league_id, &update).await;

        match self.await_selection(player).await {
            TurnResolution::Cancelled => TurnResult::Cancelled,
            TurnResolution::Picked(stock_id) => self.apply(player, stock_id, false).await,
            TurnResolution::TimedOut => {
                info!("Timer expired for player {player} in league {league_id}");
                match self.auto_select().await {
                    Some(stock_id) => self.apply(player, stock_id, true).await,
                    None => TurnResult::Skipped,
                }
            }
        }
    }

    /// Picks left over from an earlier turn never count for this one.
    fn discard_stale_selections(&mut self) {
        while let Ok(stale) = self.selections.try_recv() {
            debug!(
                "Discarding stale pick of stock {} by player {} in league {}",
                stale.stock_id, stale.user_id, self.league_id
            );
        }
    }

    /// Race the player's pick against the turn timer. Exactly one of pick,
    /// timeout, or cancellation resolves the turn.
    async fn await_selection(&mut self, player: UserId) -> TurnResolution {
        let deadline = Instant::now() + self.shared.settings.turn_duration;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return TurnResolution::Cancelled,
                received = self.selections.recv() => match received {
                    Some(selection) if selection.user_id == player => {
                        return TurnResolution::Picked(selection.stock_id);
                    }
                    Some(selection) => {
                        warn!(
                            "Ignoring out-of-turn pick by player {} in league {} (player {player} is on the clock)",
                            selection.user_id, self.league_id
                        );
                    }
                    None => {
                        // Every sender is gone; nothing more can arrive.
                        return tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => TurnResolution::Cancelled,
                            _ = tokio::time::sleep_until(deadline) => TurnResolution::TimedOut,
                        };
                    }
                },
                _ = tokio::time::sleep_until(deadline) => return TurnResolution::TimedOut,
            }
        }
    }

    /// Choose uniformly among the stocks still in the league's pool.
    async fn auto_select(&self) -> Option<StockId> {
        let league_id = self.league_id;
        let stocks = match self.shared.store.pool.available_stocks(league_id).await {
            Ok(stocks) => stocks,
            Err(e) => {
                warn!("Auto-pick failed to load pool for league {league_id}: {e:#}");
                return None;
            }
        };
        let choice = stocks.choose(&mut rand::thread_rng()).map(|s| s.id);
        if choice.is_none() {
            warn!("Auto-pick skipped: league {league_id} has no stocks left");
        }
        choice
    }

    async fn apply(&self, player: UserId, stock_id: StockId, auto: bool) -> TurnResult {
        let league_id = self.league_id;
        if let Err(e) = self
            .shared
            .store
            .portfolios
            .draft_stock(league_id, player, stock_id)
            .await
        {
            warn!("Pick of stock {stock_id} by player {player} in league {league_id} failed, turn lost: {e:#}");
            return TurnResult::Skipped;
        }

        info!(
            "Player {player} drafted stock {stock_id} in league {league_id}{}",
            if auto { " (auto)" } else { "" }
        );
        let pick = ServerEvent::DraftPick(DraftPickEvent {
            league_id,
            player_id: player,
            stock_id,
            auto,
        });
        self.shared.hub.broadcast_to_league(league_id, &pick).await;
        self.broadcast_holdings().await;
        TurnResult::Applied
    }

    /// Follow an applied pick with every portfolio and the remaining pool.
    /// A failed read only drops that broadcast.
    async fn broadcast_holdings(&self) {
        let league_id = self.league_id;
        let store = &self.shared.store;

        match store.holdings.portfolios(league_id).await {
            Ok(portfolios) => {
                let event = ServerEvent::LeaguePortfolios(LeaguePortfolios {
                    league_id,
                    portfolios,
                });
                self.shared.hub.broadcast_to_league(league_id, &event).await;
            }
            Err(e) => warn!("Failed to load portfolios for league {league_id}: {e:#}"),
        }

        match store.pool.available_stocks(league_id).await {
            Ok(stocks) => {
                let event = ServerEvent::LeaguePool(LeaguePool { league_id, stocks });
                self.shared.hub.broadcast_to_league(league_id, &event).await;
            }
            Err(e) => warn!("Failed to load pool for league {league_id}: {e:#}"),
        }
    }

    /// Pick up players that joined or left between turns. On failure the
    /// previous rotation is kept.
    ///
    /// `index` points at the next player in the old rotation; it is shifted
    /// back by the players removed ahead of it so nobody is skipped.
    async fn refresh_rotation(&self, players: &mut Vec<UserId>, index: &mut usize) {
        let league_id = self.league_id;
        match self.shared.store.leagues.ordered_players(league_id).await {
            Ok(fresh) if fresh.is_empty() => {
                warn!("League {league_id} reported no players; keeping previous rotation");
            }
            Ok(fresh) => {
                if fresh != *players {
                    info!("Rotation for league {league_id} changed: {fresh:?}");
                    let removed_ahead = players[..*index]
                        .iter()
                        .filter(|p| !fresh.contains(p))
                        .count();
                    *index = (*index - removed_ahead) % fresh.len();
                    *players = fresh;
                }
            }
            Err(e) => warn!("Failed to refresh players for league {league_id}: {e:#}"),
        }
    }

    async fn finish(&self) {
        let league_id = self.league_id;
        if let Err(e) = self
            .shared
            .store
            .leagues
            .update_state(league_id, LeagueState::PostDraft)
            .await
        {
            error!("Failed to move league {league_id} to post-draft: {e:#}");
        }
        self.shared.broadcast_league_state(league_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::hub::ChannelSink;
    use crate::league::{LeagueSnapshot, Stock};
    use crate::store::{LeaguePoolProvider, LeagueStateStore, PortfolioMutator};
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        db: Arc<Database>,
        coordinator: DraftCoordinator,
        registry: Arc<SelectionChannelRegistry>,
        league: LeagueId,
        stocks: Vec<StockId>,
        frames: UnboundedReceiver<String>,
    }

    fn settings(picks_per_player: usize) -> DraftSettings {
        DraftSettings {
            turn_duration: Duration::from_secs(30),
            picks_per_player,
        }
    }

    fn seed(db: &Database, players: &[UserId], pool_size: usize) -> (LeagueId, Vec<StockId>) {
        let league = db.create_league("Test League", 8).unwrap();
        for p in players {
            db.add_player(league, *p).unwrap();
        }
        let stocks = (0..pool_size)
            .map(|i| {
                let id = db
                    .insert_stock(&format!("TCK{i}"), &format!("Company {i}"))
                    .unwrap();
                db.add_to_pool(league, id).unwrap();
                id
            })
            .collect();
        (league, stocks)
    }

    fn fixture(players: &[UserId], pool_size: usize, picks_per_player: usize) -> Fixture {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let (league, stocks) = seed(&db, players, pool_size);
        build(db, league, stocks, Collaborators::shared, picks_per_player)
    }

    fn build(
        db: Arc<Database>,
        league: LeagueId,
        stocks: Vec<StockId>,
        collaborators: impl FnOnce(Arc<Database>) -> Collaborators,
        picks_per_player: usize,
    ) -> Fixture {
        let registry = Arc::new(SelectionChannelRegistry::new());
        let hub = Arc::new(SubscriptionHub::new());
        let (sink, frames) = ChannelSink::pair();
        let conn = hub.register(Box::new(sink));
        hub.subscribe(&conn, league);
        let coordinator = DraftCoordinator::new(
            Arc::clone(&registry),
            hub,
            collaborators(Arc::clone(&db)),
            settings(picks_per_player),
        );
        Fixture {
            db,
            coordinator,
            registry,
            league,
            stocks,
            frames,
        }
    }

    async fn next_of_type(frames: &mut UnboundedReceiver<String>, kind: &str) -> Value {
        loop {
            let frame = frames.recv().await.expect("frame stream ended");
            let value: Value = serde_json::from_str(&frame).unwrap();
            if value["type"] == kind {
                return value;
            }
        }
    }

    fn drain(frames: &mut UnboundedReceiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    fn of_type<'a>(frames: &'a [Value], kind: &str) -> Vec<&'a Value> {
        frames.iter().filter(|f| f["type"] == kind).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn all_auto_picks_complete_draft() {
        let mut fx = fixture(&[1, 2], 6, 2);
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();

        let outcome = handle.wait().await.unwrap();
        assert_eq!(
            outcome,
            DraftOutcome::Completed {
                picks_applied: 4,
                turns: 4
            }
        );
        assert_eq!(fx.db.holdings(fx.league, 1).unwrap().len(), 2);
        assert_eq!(fx.db.holdings(fx.league, 2).unwrap().len(), 2);
        assert_eq!(fx.db.league_state(fx.league).unwrap(), LeagueState::PostDraft);
        assert!(!fx.registry.is_active(fx.league));

        let frames = drain(&mut fx.frames);
        let picks = of_type(&frames, "DraftPick");
        assert_eq!(picks.len(), 4);
        assert!(picks.iter().all(|p| p["data"]["auto"] == true));
        assert_eq!(of_type(&frames, "LeaguePortfolios").len(), 4);
        let pools = of_type(&frames, "LeaguePool");
        assert_eq!(pools.len(), 4);
        assert_eq!(pools[3]["data"]["stocks"].as_array().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn applied_pick_is_followed_by_portfolios_then_pool() {
        let mut fx = fixture(&[1, 2], 3, 1);
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();

        next_of_type(&mut fx.frames, "DraftUpdate").await;
        fx.coordinator
            .submit_pick(fx.league, 1, fx.stocks[1])
            .unwrap();
        next_of_type(&mut fx.frames, "DraftPick").await;

        let next: Value = serde_json::from_str(&fx.frames.recv().await.unwrap()).unwrap();
        assert_eq!(next["type"], "LeaguePortfolios");
        assert_eq!(next["data"]["league_id"], fx.league);
        let portfolios = next["data"]["portfolios"].as_array().unwrap();
        assert_eq!(portfolios.len(), 2);
        assert_eq!(portfolios[0]["user_id"], 1);
        assert_eq!(portfolios[0]["stocks"][0]["id"], fx.stocks[1]);
        assert_eq!(portfolios[1]["user_id"], 2);
        assert!(portfolios[1]["stocks"].as_array().unwrap().is_empty());

        let next: Value = serde_json::from_str(&fx.frames.recv().await.unwrap()).unwrap();
        assert_eq!(next["type"], "LeaguePool");
        let remaining: Vec<u64> = next["data"]["stocks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["id"].as_u64().unwrap())
            .collect();
        assert_eq!(remaining, vec![fx.stocks[0], fx.stocks[2]]);

        handle.cancel();
        handle.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn manual_pick_is_applied_and_broadcast() {
        let mut fx = fixture(&[1, 2], 4, 1);
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();

        let update = next_of_type(&mut fx.frames, "DraftUpdate").await;
        assert_eq!(update["data"]["player_id"], 1);
        assert_eq!(update["data"]["remaining_time"], 30);
        fx.coordinator
            .submit_pick(fx.league, 1, fx.stocks[2])
            .unwrap();

        let pick = next_of_type(&mut fx.frames, "DraftPick").await;
        assert_eq!(pick["data"]["player_id"], 1);
        assert_eq!(pick["data"]["stock_id"], fx.stocks[2]);
        assert_eq!(pick["data"]["auto"], false);

        let outcome = handle.wait().await.unwrap();
        assert!(matches!(outcome, DraftOutcome::Completed { picks_applied: 2, .. }));
        assert_eq!(fx.db.holdings(fx.league, 1).unwrap(), vec![fx.stocks[2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_advances_modulo_player_count() {
        let mut fx = fixture(&[10, 20, 30], 9, 2);
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();
        handle.wait().await.unwrap();

        let frames = drain(&mut fx.frames);
        let order: Vec<u64> = of_type(&frames, "DraftUpdate")
            .iter()
            .map(|f| f["data"]["player_id"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![10, 20, 30, 10, 20, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_turn_pick_is_ignored() {
        let mut fx = fixture(&[1, 2], 4, 1);
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();

        next_of_type(&mut fx.frames, "DraftUpdate").await;
        // Player 2 tries to pick during player 1's turn.
        fx.coordinator
            .submit_pick(fx.league, 2, fx.stocks[0])
            .unwrap();

        let first = next_of_type(&mut fx.frames, "DraftPick").await;
        assert_eq!(first["data"]["player_id"], 1);
        assert_eq!(first["data"]["auto"], true);

        handle.wait().await.unwrap();
        assert_eq!(fx.db.holdings(fx.league, 2).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pick_after_timer_does_not_count_for_next_turn() {
        let mut fx = fixture(&[1, 2], 4, 1);
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();

        next_of_type(&mut fx.frames, "DraftUpdate").await;
        let second_turn = next_of_type(&mut fx.frames, "DraftUpdate").await;
        assert_eq!(second_turn["data"]["player_id"], 2);

        // Player 1's window has closed; this pick must not be applied.
        fx.coordinator
            .submit_pick(fx.league, 1, fx.stocks[3])
            .unwrap();

        handle.wait().await.unwrap();
        let frames = drain(&mut fx.frames);
        let picks = of_type(&frames, "DraftPick");
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0]["data"]["player_id"], 2);
        assert_eq!(picks[0]["data"]["auto"], true);
        assert_eq!(fx.db.holdings(fx.league, 1).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pick_loses_the_turn() {
        let mut fx = fixture(&[1, 2], 4, 1);
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();

        next_of_type(&mut fx.frames, "DraftUpdate").await;
        // Stock 999 is not in the pool.
        fx.coordinator.submit_pick(fx.league, 1, 999).unwrap();

        let outcome = handle.wait().await.unwrap();
        assert_eq!(
            outcome,
            DraftOutcome::Completed {
                picks_applied: 2,
                turns: 3
            }
        );
        let frames = drain(&mut fx.frames);
        let order: Vec<u64> = of_type(&frames, "DraftUpdate")
            .iter()
            .map(|f| f["data"]["player_id"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected() {
        let fx = fixture(&[1, 2], 4, 1);
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();
        let err = fx.coordinator.start_draft(fx.league).await.err().unwrap();
        assert!(matches!(err, DraftError::AlreadyRunning { .. }));
        handle.cancel();
        handle.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_loop_and_releases_channel() {
        let mut fx = fixture(&[1, 2], 4, 5);
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();
        next_of_type(&mut fx.frames, "DraftUpdate").await;

        assert!(fx.coordinator.cancel_draft(fx.league));
        let outcome = handle.wait().await.unwrap();
        assert_eq!(
            outcome,
            DraftOutcome::Cancelled {
                picks_applied: 0,
                turns: 1
            }
        );
        assert!(!fx.registry.is_active(fx.league));
        assert_eq!(fx.db.league_state(fx.league).unwrap(), LeagueState::InDraft);
        assert!(matches!(
            fx.coordinator.submit_pick(fx.league, 1, fx.stocks[0]),
            Err(DraftError::NoActiveDraft { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pool_skips_turns_without_picks() {
        let mut fx = fixture(&[1, 2], 0, 1);
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();

        for _ in 0..3 {
            next_of_type(&mut fx.frames, "DraftUpdate").await;
        }
        handle.cancel();
        let outcome = handle.wait().await.unwrap();
        assert!(matches!(
            outcome,
            DraftOutcome::Cancelled {
                picks_applied: 0,
                ..
            }
        ));
        assert!(of_type(&drain(&mut fx.frames), "DraftPick").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn league_without_players_idles_until_cancelled() {
        let mut fx = fixture(&[], 2, 1);
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(fx.registry.is_active(fx.league));
        assert!(drain(&mut fx.frames)
            .iter()
            .all(|f| f["type"] == "LeagueState"));

        handle.cancel();
        assert_eq!(
            handle.wait().await.unwrap(),
            DraftOutcome::Cancelled {
                picks_applied: 0,
                turns: 4
            }
        );
        assert!(!fx.registry.is_active(fx.league));
    }

    #[tokio::test(start_paused = true)]
    async fn players_joining_an_idle_draft_are_picked_up() {
        let mut fx = fixture(&[], 2, 1);
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        fx.db.add_player(fx.league, 5).unwrap();

        let update = next_of_type(&mut fx.frames, "DraftUpdate").await;
        assert_eq!(update["data"]["player_id"], 5);
        assert_eq!(
            handle.wait().await.unwrap(),
            DraftOutcome::Completed {
                picks_applied: 1,
                turns: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn departed_player_does_not_skip_the_next_one() {
        let mut fx = fixture(&[1, 2, 3], 6, 1);
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();

        next_of_type(&mut fx.frames, "DraftUpdate").await;
        // Player 1 leaves while on the clock; their auto-pick then fails.
        assert!(fx.db.remove_player(fx.league, 1).unwrap());

        let outcome = handle.wait().await.unwrap();
        assert_eq!(
            outcome,
            DraftOutcome::Completed {
                picks_applied: 2,
                turns: 3
            }
        );
        let frames = drain(&mut fx.frames);
        let order: Vec<u64> = of_type(&frames, "DraftUpdate")
            .iter()
            .map(|f| f["data"]["player_id"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn departed_next_player_hands_turn_to_the_one_after() {
        let mut fx = fixture(&[1, 2, 3], 6, 1);
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();

        next_of_type(&mut fx.frames, "DraftUpdate").await;
        assert!(fx.db.remove_player(fx.league, 2).unwrap());

        let next = next_of_type(&mut fx.frames, "DraftUpdate").await;
        assert_eq!(next["data"]["player_id"], 3);
        assert_eq!(
            handle.wait().await.unwrap(),
            DraftOutcome::Completed {
                picks_applied: 2,
                turns: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_state_update_releases_channel() {
        let fx = fixture(&[1], 2, 1);
        // 404 does not exist, so the InDraft transition fails.
        let err = fx.coordinator.start_draft(404).await.err().unwrap();
        assert!(matches!(err, DraftError::Store(_)));
        assert!(!fx.registry.is_active(404));
    }

    /// Fails the first `n` pick applications, then delegates to the store.
    struct Flaky {
        db: Arc<Database>,
        failures_left: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl PortfolioMutator for Flaky {
        async fn draft_stock(&self, league: LeagueId, user: UserId, stock: StockId) -> Result<()> {
            {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    anyhow::bail!("connection reset");
                }
            }
            self.db.draft_stock(league, user, stock).await
        }
    }

    /// Fails the listed `ordered_players` calls (1-based), otherwise
    /// delegates to the store.
    struct FlakyRotation {
        db: Arc<Database>,
        calls: AtomicUsize,
        failing: Vec<usize>,
    }

    #[async_trait]
    impl LeagueStateStore for FlakyRotation {
        async fn ordered_players(&self, league: LeagueId) -> Result<Vec<UserId>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing.contains(&call) {
                anyhow::bail!("read timed out");
            }
            self.db.ordered_players(league).await
        }

        async fn update_state(&self, league: LeagueId, state: LeagueState) -> Result<()> {
            self.db.update_state(league, state).await
        }

        async fn league_snapshot(&self, league: LeagueId) -> Result<LeagueSnapshot> {
            self.db.league_snapshot(league).await
        }
    }

    fn flaky_rotation(players: &[UserId], failing: Vec<usize>) -> Fixture {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let (league, stocks) = seed(&db, players, 6);
        build(
            db,
            league,
            stocks,
            |db| {
                let mut c = Collaborators::shared(Arc::clone(&db));
                c.leagues = Arc::new(FlakyRotation {
                    db,
                    calls: AtomicUsize::new(0),
                    failing,
                });
                c
            },
            1,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initial_rotation_idles_one_turn_then_drafts() {
        let mut fx = flaky_rotation(&[1, 2], vec![1]);
        let started = Instant::now();
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();

        let first = next_of_type(&mut fx.frames, "DraftUpdate").await;
        assert_eq!(first["data"]["player_id"], 1);
        assert!(started.elapsed() >= Duration::from_secs(30));

        assert_eq!(
            handle.wait().await.unwrap(),
            DraftOutcome::Completed {
                picks_applied: 2,
                turns: 3
            }
        );
        assert_eq!(fx.db.league_state(fx.league).unwrap(), LeagueState::PostDraft);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rotation_refresh_keeps_previous_rotation() {
        let mut fx = flaky_rotation(&[1, 2], vec![2]);
        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();

        next_of_type(&mut fx.frames, "DraftUpdate").await;
        // The refresh after this turn fails, so player 3 waits one more lap.
        fx.db.add_player(fx.league, 3).unwrap();

        let outcome = handle.wait().await.unwrap();
        assert_eq!(
            outcome,
            DraftOutcome::Completed {
                picks_applied: 5,
                turns: 5
            }
        );
        let frames = drain(&mut fx.frames);
        let order: Vec<u64> = of_type(&frames, "DraftUpdate")
            .iter()
            .map(|f| f["data"]["player_id"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![2, 1, 2, 3]);
    }

    /// Fails the first `n` pool reads, then delegates to the store.
    struct FlakyPool {
        db: Arc<Database>,
        failures_left: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl LeaguePoolProvider for FlakyPool {
        async fn available_stocks(&self, league: LeagueId) -> Result<Vec<Stock>> {
            {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    anyhow::bail!("pool unavailable");
                }
            }
            self.db.available_stocks(league).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pool_read_failure_skips_the_auto_pick() {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let (league, stocks) = seed(&db, &[1, 2], 4);
        let mut fx = build(
            db,
            league,
            stocks,
            |db| {
                let mut c = Collaborators::shared(Arc::clone(&db));
                c.pool = Arc::new(FlakyPool {
                    db,
                    failures_left: std::sync::Mutex::new(1),
                });
                c
            },
            1,
        );

        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(
            outcome,
            DraftOutcome::Completed {
                picks_applied: 2,
                turns: 3
            }
        );
        let frames = drain(&mut fx.frames);
        let pickers: Vec<u64> = of_type(&frames, "DraftPick")
            .iter()
            .map(|f| f["data"]["player_id"].as_u64().unwrap())
            .collect();
        assert_eq!(pickers, vec![2, 1]);
        assert_eq!(of_type(&frames, "DraftUpdate").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failures_do_not_stall_draft() {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let (league, stocks) = seed(&db, &[1, 2], 5);
        let mut fx = build(
            db,
            league,
            stocks,
            |db| {
                let mut c = Collaborators::shared(Arc::clone(&db));
                c.portfolios = Arc::new(Flaky {
                    db,
                    failures_left: std::sync::Mutex::new(2),
                });
                c
            },
            1,
        );

        let handle = fx.coordinator.start_draft(fx.league).await.unwrap();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(
            outcome,
            DraftOutcome::Completed {
                picks_applied: 2,
                turns: 4
            }
        );
        assert_eq!(of_type(&drain(&mut fx.frames), "DraftPick").len(), 2);
    }
}
