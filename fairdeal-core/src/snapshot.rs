use crate::types::{Card, Fingerprint, SecretRound, Table};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Everything a peer needs to resume a game after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub game_id: Uuid,
    pub player: String,
    pub players: Vec<String>,
    pub table: Option<Table>,
    pub history: Vec<Table>,
    pub disclosures: BTreeMap<String, Vec<SecretRound>>,
    pub keys: KeyRing,
    pub saved_at: DateTime<Utc>,
}

/// Private material: never broadcast before game end, never stored unsealed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRing {
    /// Indexed by encryption round.
    pub secrets: Vec<SecretRound>,
    /// Locally decrypted cards of this player's hand.
    pub decrypted: BTreeMap<Fingerprint, Card>,
}
