//! Messages exchanged between peers, JSON-encoded with a `type` tag.

use crate::error::{Result, RummyError};
use fairdeal_core::{EncryptedCard, LayerId, LayerKey, SecretRound, Table};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Full table snapshot after a table-mutating action.
    Table { table: Table },
    /// One hop of the encryption chain.
    Deal(DealHop),
    KeyRequest(KeyRequest),
    Keys(KeyResponse),
    /// Every secret round of the sender, released when the game ends.
    EndOfGame(Disclosure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealKind {
    /// New game: the last encrypter deals opening hands.
    Fresh,
    /// Discard pile turned into a new deck mid-game.
    Reshuffle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealHop {
    pub to: String,
    /// Encryption order for this round; the hop travels along it.
    pub player_order: Vec<String>,
    pub cards: Vec<EncryptedCard>,
    pub round: u32,
    pub kind: DealKind,
}

/// Asks `to` for its keys of the listed layers. Carries no ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRequest {
    pub from: String,
    pub to: String,
    pub round: u32,
    pub ids: Vec<LayerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyResponse {
    pub from: String,
    pub to: String,
    pub round: u32,
    #[serde(with = "fairdeal_core::types::layer_key_map")]
    pub keys: BTreeMap<LayerId, LayerKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disclosure {
    pub from: String,
    pub secret_maps: Vec<SecretRound>,
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| RummyError::Malformed(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Table { .. } => "table",
            Message::Deal(_) => "deal",
            Message::KeyRequest(_) => "key_request",
            Message::Keys(_) => "keys",
            Message::EndOfGame(_) => "end_of_game",
        }
    }
}
