// Per-league selection channels: the path a player's pick takes into the
// running draft loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::DraftError;
use crate::league::{LeagueId, StockId, UserId};

/// A pick submitted by a player, waiting to be consumed by the draft loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub user_id: UserId,
    pub stock_id: StockId,
}

/// Single-slot: a second pick while one is pending is rejected, not queued.
const SELECTION_CAPACITY: usize = 1;

struct ActiveDraft {
    tx: mpsc::Sender<Selection>,
    cancel: CancellationToken,
    generation: u64,
}

/// Thread-safe map from league ID to the selection channel of its running
/// draft. A league has an entry exactly while its draft loop is running.
#[derive(Default)]
pub struct SelectionChannelRegistry {
    drafts: Mutex<HashMap<LeagueId, ActiveDraft>>,
    next_generation: AtomicU64,
}

impl SelectionChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn drafts(&self) -> MutexGuard<'_, HashMap<LeagueId, ActiveDraft>> {
        self.drafts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create and register the selection channel for `league_id`.
    ///
    /// Fails with [`DraftError::AlreadyRunning`] if the league already has one.
    /// The returned [`Registration`] deregisters the channel when dropped.
    pub fn register(
        self: &Arc<Self>,
        league_id: LeagueId,
        cancel: CancellationToken,
    ) -> Result<(Registration, mpsc::Receiver<Selection>), DraftError> {
        let mut drafts = self.drafts();
        if drafts.contains_key(&league_id) {
            return Err(DraftError::AlreadyRunning { league_id });
        }

        let (tx, rx) = mpsc::channel(SELECTION_CAPACITY);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        drafts.insert(
            league_id,
            ActiveDraft {
                tx,
                cancel,
                generation,
            },
        );
        debug!("Registered selection channel for league {league_id}");

        Ok((
            Registration {
                registry: Arc::clone(self),
                league_id,
                generation,
            },
            rx,
        ))
    }

    /// Remove the channel for `league_id`. Returns whether one was registered.
    pub fn unregister(&self, league_id: LeagueId) -> bool {
        let removed = self.drafts().remove(&league_id).is_some();
        if removed {
            debug!("Unregistered selection channel for league {league_id}");
        }
        removed
    }

    fn unregister_generation(&self, league_id: LeagueId, generation: u64) {
        let mut drafts = self.drafts();
        if drafts
            .get(&league_id)
            .is_some_and(|d| d.generation == generation)
        {
            drafts.remove(&league_id);
            debug!("Unregistered selection channel for league {league_id}");
        }
    }

    /// The sender for the league's running draft, if any.
    pub fn get(&self, league_id: LeagueId) -> Option<mpsc::Sender<Selection>> {
        self.drafts().get(&league_id).map(|d| d.tx.clone())
    }

    pub fn is_active(&self, league_id: LeagueId) -> bool {
        self.drafts().contains_key(&league_id)
    }

    pub fn active_leagues(&self) -> Vec<LeagueId> {
        let mut leagues: Vec<LeagueId> = self.drafts().keys().copied().collect();
        leagues.sort_unstable();
        leagues
    }

    /// Deliver a pick to the league's draft loop without blocking.
    pub fn submit(&self, league_id: LeagueId, selection: Selection) -> Result<(), DraftError> {
        let tx = self
            .get(league_id)
            .ok_or(DraftError::NoActiveDraft { league_id })?;
        match tx.try_send(selection) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DraftError::SelectionPending { league_id }),
            Err(TrySendError::Closed(_)) => Err(DraftError::NoActiveDraft { league_id }),
        }
    }

    /// Signal the league's draft loop to stop. Returns whether a draft was
    /// running.
    pub fn cancel(&self, league_id: LeagueId) -> bool {
        match self.drafts().get(&league_id) {
            Some(draft) => {
                draft.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

/// Keeps a league's selection channel registered for as long as it lives.
pub struct Registration {
    registry: Arc<SelectionChannelRegistry>,
    league_id: LeagueId,
    generation: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry
            .unregister_generation(self.league_id, self.generation);
    }
}
