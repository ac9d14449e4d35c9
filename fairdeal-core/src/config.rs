use crate::error::{CoreError, Result};
use crate::types::DECK_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Opening hand per player.
    pub hand_size: usize,
    pub min_players: usize,
    pub max_players: usize,
    /// How long a lost peer may stay away before the game is abandoned.
    pub disconnect_grace: Duration,
    /// Age after which an unanswered key request is reported as stalled.
    pub key_request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hand_size: 7,
            min_players: 2,
            max_players: 6,
            disconnect_grace: Duration::from_secs(30),
            key_request_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    pub fn new(hand_size: usize) -> Self {
        Self {
            hand_size,
            ..Self::default()
        }
    }

    pub fn with_timeouts(mut self, disconnect_grace: Duration, key_request_timeout: Duration) -> Self {
        self.disconnect_grace = disconnect_grace;
        self.key_request_timeout = key_request_timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.hand_size == 0 {
            return Err(CoreError::config("Hand size must be greater than 0"));
        }

        if self.min_players < 2 {
            return Err(CoreError::config("A game needs at least 2 players"));
        }

        if self.max_players < self.min_players {
            return Err(CoreError::config(
                "Max players cannot be below min players",
            ));
        }

        // leave at least one card in the deck after the opening deal
        if self.max_players * self.hand_size >= DECK_SIZE {
            return Err(CoreError::config(format!(
                "{} players with {} cards each exhaust the deck",
                self.max_players, self.hand_size
            )));
        }

        if self.disconnect_grace.is_zero() || self.key_request_timeout.is_zero() {
            return Err(CoreError::config("Timeouts must be greater than 0"));
        }

        Ok(())
    }

    pub fn validate_players(&self, players: usize) -> Result<()> {
        if players < self.min_players || players > self.max_players {
            return Err(CoreError::config(format!(
                "{} players requested, allowed {}..={}",
                players, self.min_players, self.max_players
            )));
        }
        Ok(())
    }
}
