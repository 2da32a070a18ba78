// Inbound message routing.
//
// Every live connection's read task hands its text frames to `App`, which
// decodes the `{type, data}` envelope, applies the command against the hub
// and draft engine, and replies to the sender with an ack or an error.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::draft::coordinator::{DraftCoordinator, DraftHandle, DraftOutcome};
use crate::draft::DraftError;
use crate::hub::{Connection, SubscriptionHub};
use crate::league::{LeagueId, LeagueState};
use crate::protocol::{
    parse_client_message, ClientMessage, DraftStock, QueueUp, ServerEvent, SubscribeLeagues,
    UnsubscribeToLeague,
};

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

/// Shared router state. Cheap to clone; one clone per connection task.
#[derive(Clone)]
pub struct App {
    hub: Arc<SubscriptionHub>,
    coordinator: DraftCoordinator,
}

impl App {
    pub fn new(coordinator: DraftCoordinator) -> Self {
        Self {
            hub: Arc::clone(coordinator.hub()),
            coordinator,
        }
    }

    pub fn hub(&self) -> &Arc<SubscriptionHub> {
        &self.hub
    }

    pub fn coordinator(&self) -> &DraftCoordinator {
        &self.coordinator
    }

    /// Handle one raw text frame from `conn`.
    pub async fn handle_text(&self, conn: &Arc<Connection>, text: &str) {
        let msg = match parse_client_message(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Rejected message from connection {}: {}", conn.id(), e);
                self.reply(conn, &ServerEvent::error(e.to_string())).await;
                return;
            }
        };
        self.handle_message(conn, msg).await;
    }

    /// Apply a decoded message and reply to the sender.
    pub async fn handle_message(&self, conn: &Arc<Connection>, msg: ClientMessage) {
        let kind = msg.kind();
        debug!("Connection {} sent {}", conn.id(), kind);

        let result = match msg {
            ClientMessage::QueueUp(m) => self.handle_queue_up(conn, m).await,
            ClientMessage::DraftStock(m) => self.handle_draft_stock(m),
            ClientMessage::SubscribeLeagues(m) => self.handle_subscribe(conn, m).await,
            ClientMessage::UnsubscribeToLeague(m) => Ok(self.handle_unsubscribe(conn, m)),
        };

        let reply = match result {
            Ok(message) => ServerEvent::ack(kind, message),
            Err(e) => {
                warn!("{} from connection {} failed: {}", kind, conn.id(), e);
                ServerEvent::error(e.to_string())
            }
        };
        self.reply(conn, &reply).await;
    }

    /// Drop a single league subscription for a connection.
    pub fn handle_disconnect(&self, league_id: LeagueId, conn: &Connection) {
        self.hub.handle_disconnect(league_id, conn);
    }

    /// The transport for `conn` is gone: forget it and all its subscriptions.
    pub async fn connection_closed(&self, conn: &Connection) {
        self.hub.unregister(conn).await;
    }

    /// Cancel every running draft.
    pub fn shutdown(&self) {
        for league_id in self.coordinator.active_drafts() {
            self.coordinator.cancel_draft(league_id);
        }
    }

    async fn reply(&self, conn: &Connection, event: &ServerEvent) {
        if let Err(e) = self.hub.send_to(conn, event).await {
            debug!("Reply to connection {} dropped: {}", conn.id(), e);
        }
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    async fn handle_queue_up(
        &self,
        conn: &Arc<Connection>,
        QueueUp {
            league_id,
            player_id,
        }: QueueUp,
    ) -> Result<String, DraftError> {
        let store = self.coordinator.store();
        store
            .readiness
            .mark_ready(league_id, player_id)
            .await
            .map_err(DraftError::Store)?;
        self.hub.subscribe(conn, league_id);
        info!("Player {player_id} queued up in league {league_id}");

        let snapshot = store
            .leagues
            .league_snapshot(league_id)
            .await
            .map_err(DraftError::Store)?;
        let state = snapshot.league_state;
        self.hub
            .broadcast_to_league(league_id, &ServerEvent::LeagueState(snapshot))
            .await;

        // An InDraft league without a live loop (cancelled or lost on
        // restart) is resumed the same way a fresh one is started.
        if matches!(state, LeagueState::PreDraft | LeagueState::InDraft)
            && !self.coordinator.is_running(league_id)
            && store
                .readiness
                .all_ready(league_id)
                .await
                .map_err(DraftError::Store)?
        {
            match self.coordinator.start_draft(league_id).await {
                Ok(handle) => watch(handle),
                // Another connection's QueueUp won the race.
                Err(DraftError::AlreadyRunning { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(format!("player {player_id} is ready in league {league_id}"))
    }

    fn handle_draft_stock(
        &self,
        DraftStock {
            league_id,
            user_id,
            stock_id,
        }: DraftStock,
    ) -> Result<String, DraftError> {
        self.coordinator.submit_pick(league_id, user_id, stock_id)?;
        Ok(format!(
            "pick of stock {stock_id} by player {user_id} received for league {league_id}"
        ))
    }

    async fn handle_subscribe(
        &self,
        conn: &Arc<Connection>,
        SubscribeLeagues { league_ids }: SubscribeLeagues,
    ) -> Result<String, DraftError> {
        let leagues = self.coordinator.store().leagues.clone();
        for &league_id in &league_ids {
            self.hub.subscribe(conn, league_id);
            // Clients that join mid-draft need the current state.
            let event = match leagues.league_snapshot(league_id).await {
                Ok(snapshot) => ServerEvent::LeagueState(snapshot),
                Err(e) => {
                    warn!("No snapshot for league {league_id}: {e:#}");
                    ServerEvent::error(format!("league {league_id} is unavailable"))
                }
            };
            self.reply(conn, &event).await;
        }
        Ok(format!("subscribed to {} leagues", league_ids.len()))
    }

    fn handle_unsubscribe(
        &self,
        conn: &Connection,
        UnsubscribeToLeague { league_id }: UnsubscribeToLeague,
    ) -> String {
        self.hub.unsubscribe(conn, league_id);
        format!("unsubscribed from league {league_id}")
    }
}

/// Log how a detached draft task ends.
fn watch(handle: DraftHandle) {
    let league_id = handle.league_id();
    tokio::spawn(async move {
        match handle.wait().await {
            Ok(DraftOutcome::Completed {
                picks_applied,
                turns,
            }) => {
                info!("League {league_id} draft finished: {picks_applied} picks in {turns} turns")
            }
            Ok(DraftOutcome::Cancelled { .. }) => info!("League {league_id} draft cancelled"),
            Err(e) => error!("League {league_id} draft task failed: {e}"),
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
