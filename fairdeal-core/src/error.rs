use crate::types::LayerId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed for layer {layer_id}: wrong key or tampered ciphertext")]
    Decryption { layer_id: LayerId },

    #[error("Missing key for layer {0}")]
    MissingKey(LayerId),

    #[error("Invalid card: {0}")]
    InvalidCard(String),

    #[error("Table holds {found} cards, expected {expected}")]
    CardCount { found: usize, expected: usize },

    #[error("Card appears more than once: {0}")]
    DuplicateCard(String),

    #[error("Sealed data could not be opened: {0}")]
    Sealing(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Session not found: {game_id} for {player}")]
    SessionNotFound { game_id: String, player: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn encryption(msg: impl Into<String>) -> Self {
        Self::Encryption(msg.into())
    }

    pub fn invalid_card(msg: impl Into<String>) -> Self {
        Self::InvalidCard(msg.into())
    }

    pub fn sealing(msg: impl Into<String>) -> Self {
        Self::Sealing(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for authenticated-decryption failures, the signal that a key was wrong.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Decryption { .. })
    }
}
