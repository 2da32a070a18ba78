// Wire protocol for the client WebSocket: a `{type, data}` envelope in both
// directions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::league::{LeagueId, LeagueSnapshot, Portfolio, Stock, StockId, UserId};

// ---------------------------------------------------------------------------
// Message type names
// ---------------------------------------------------------------------------

pub const TYPE_QUEUE_UP: &str = "QueueUp";
pub const TYPE_DRAFT_STOCK: &str = "DraftStock";
pub const TYPE_SUBSCRIBE_LEAGUES: &str = "SubscribeLeagues";
pub const TYPE_UNSUBSCRIBE_TO_LEAGUE: &str = "UnsubscribeToLeague";

pub const TYPE_DRAFT_UPDATE: &str = "DraftUpdate";
pub const TYPE_DRAFT_PICK: &str = "DraftPick";
pub const TYPE_LEAGUE_STATE: &str = "LeagueState";
pub const TYPE_LEAGUE_PORTFOLIOS: &str = "LeaguePortfolios";
pub const TYPE_LEAGUE_POOL: &str = "LeaguePool";
pub const TYPE_ERROR: &str = "Error";

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Raw inbound envelope. `data` is decoded once the type is known.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueUp {
    pub league_id: LeagueId,
    pub player_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DraftStock {
    pub league_id: LeagueId,
    pub user_id: UserId,
    pub stock_id: StockId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscribeLeagues {
    pub league_ids: Vec<LeagueId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnsubscribeToLeague {
    pub league_id: LeagueId,
}

/// Messages from clients that the draft engine handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    QueueUp(QueueUp),
    DraftStock(DraftStock),
    SubscribeLeagues(SubscribeLeagues),
    UnsubscribeToLeague(UnsubscribeToLeague),
}

impl ClientMessage {
    /// The envelope type this message arrived under.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::QueueUp(_) => TYPE_QUEUE_UP,
            ClientMessage::DraftStock(_) => TYPE_DRAFT_STOCK,
            ClientMessage::SubscribeLeagues(_) => TYPE_SUBSCRIBE_LEAGUES,
            ClientMessage::UnsubscribeToLeague(_) => TYPE_UNSUBSCRIBE_TO_LEAGUE,
        }
    }
}

/// A malformed inbound message. Reported back to the sender; never changes
/// state.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("invalid JSON envelope: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {source}")]
    InvalidData {
        kind: String,
        source: serde_json::Error,
    },
}

/// Decode a raw text frame into a typed client message.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, InputError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(InputError::InvalidJson)?;

    fn data<T: for<'de> Deserialize<'de>>(kind: &str, value: Value) -> Result<T, InputError> {
        serde_json::from_value(value).map_err(|source| InputError::InvalidData {
            kind: kind.to_string(),
            source,
        })
    }

    let kind = envelope.kind.as_str();
    match kind {
        TYPE_QUEUE_UP => Ok(ClientMessage::QueueUp(data(kind, envelope.data)?)),
        TYPE_DRAFT_STOCK => Ok(ClientMessage::DraftStock(data(kind, envelope.data)?)),
        TYPE_SUBSCRIBE_LEAGUES => Ok(ClientMessage::SubscribeLeagues(data(kind, envelope.data)?)),
        TYPE_UNSUBSCRIBE_TO_LEAGUE => {
            Ok(ClientMessage::UnsubscribeToLeague(data(kind, envelope.data)?))
        }
        other => Err(InputError::UnknownType(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Sent to league subscribers when a player goes on the clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftUpdate {
    pub league_id: LeagueId,
    pub player_id: UserId,
    /// Seconds the player has to submit a pick.
    pub remaining_time: u64,
}

/// Sent to league subscribers after every applied pick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftPickEvent {
    pub league_id: LeagueId,
    pub player_id: UserId,
    pub stock_id: StockId,
    /// `true` when the pick was made by the timer rather than the player.
    pub auto: bool,
}

/// Every player's holdings, sent after each applied pick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaguePortfolios {
    pub league_id: LeagueId,
    pub portfolios: Vec<Portfolio>,
}

/// Stocks still undrafted, sent after each applied pick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaguePool {
    pub league_id: LeagueId,
    pub stocks: Vec<Stock>,
}

/// Everything the server pushes to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    DraftUpdate(DraftUpdate),
    DraftPick(DraftPickEvent),
    LeagueState(LeagueSnapshot),
    LeaguePortfolios(LeaguePortfolios),
    LeaguePool(LeaguePool),
    /// Acknowledges a successfully handled inbound message of type `kind`.
    Ack { kind: &'static str, message: String },
    Error { message: String },
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: Value,
}

#[derive(Serialize)]
struct MessageBody<'a> {
    message: &'a str,
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::DraftUpdate(_) => TYPE_DRAFT_UPDATE,
            ServerEvent::DraftPick(_) => TYPE_DRAFT_PICK,
            ServerEvent::LeagueState(_) => TYPE_LEAGUE_STATE,
            ServerEvent::LeaguePortfolios(_) => TYPE_LEAGUE_PORTFOLIOS,
            ServerEvent::LeaguePool(_) => TYPE_LEAGUE_POOL,
            ServerEvent::Ack { kind, .. } => *kind,
            ServerEvent::Error { .. } => TYPE_ERROR,
        }
    }

    /// Serialize to the `{type, data}` text frame sent over the socket.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let data = match self {
            ServerEvent::DraftUpdate(update) => serde_json::to_value(update)?,
            ServerEvent::DraftPick(pick) => serde_json::to_value(pick)?,
            ServerEvent::LeagueState(snapshot) => serde_json::to_value(snapshot)?,
            ServerEvent::LeaguePortfolios(portfolios) => serde_json::to_value(portfolios)?,
            ServerEvent::LeaguePool(pool) => serde_json::to_value(pool)?,
            ServerEvent::Ack { message, .. } | ServerEvent::Error { message } => {
                serde_json::to_value(MessageBody { message })?
            }
        };
        serde_json::to_string(&OutboundEnvelope {
            kind: self.kind(),
            data,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn ack(kind: &'static str, message: impl Into<String>) -> Self {
        ServerEvent::Ack {
            kind,
            message: message.into(),
        }
    }
}
