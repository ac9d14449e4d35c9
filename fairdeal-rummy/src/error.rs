use fairdeal_core::{Card, CoreError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RummyError>;

#[derive(Error, Debug)]
pub enum RummyError {
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Not your turn: waiting for {0}")]
    NotYourTurn(String),

    #[error("Already drew this turn")]
    AlreadyDrawn,

    #[error("Draw a card before discarding")]
    MustDrawFirst,

    #[error("Deck is empty")]
    DeckEmpty,

    #[error("Pile is empty")]
    PileEmpty,

    #[error("Deck still holds {0} cards")]
    DeckNotEmpty(usize),

    #[error("Card not in hand: {0}")]
    CardNotInHand(Card),

    #[error("A set needs at least 3 cards")]
    NeedThreeCards,

    #[error("Cards do not form a valid set")]
    InvalidSet,

    #[error("Place a set of your own first")]
    PlaceOwnSetFirst,

    #[error("No set of {0} can take these cards")]
    NoMatchingSet(String),

    #[error("Player not found: {0}")]
    PlayerNotFound(String),

    #[error("Game is over")]
    GameOver,

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Stale table: turn {received} is behind turn {current}")]
    StaleTable { received: u64, current: u64 },

    #[error("Unexpected keys from {0}")]
    UnexpectedKeys(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RummyError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Errors caused by a local player breaking the rules; never broadcast.
    pub fn is_game_rule(&self) -> bool {
        matches!(
            self,
            Self::NotYourTurn(_)
                | Self::AlreadyDrawn
                | Self::MustDrawFirst
                | Self::DeckEmpty
                | Self::PileEmpty
                | Self::DeckNotEmpty(_)
                | Self::CardNotInHand(_)
                | Self::NeedThreeCards
                | Self::InvalidSet
                | Self::PlaceOwnSetFirst
                | Self::NoMatchingSet(_)
        )
    }

    /// Errors caused by an inbound message; the message is dropped.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::StaleTable { .. }
                | Self::UnexpectedKeys(_)
                | Self::Malformed(_)
                | Self::Protocol(_)
                | Self::PlayerNotFound(_)
        )
    }
}
