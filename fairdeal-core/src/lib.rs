//! fairdeal core - card model and layered card encryption
//!
//! This library holds everything that needs no networking: the card and table
//! model, the per-card layered encryption primitives used to deal without a
//! trusted dealer, and sealed persistence of a player's session.

pub mod config;
pub mod crypto;
pub mod error;
pub mod snapshot;
pub mod storage;
pub mod types;

pub use config::SessionConfig;
pub use crypto::{decrypt_one_layer, encrypt_deck, reencrypt_layer, Layer};
pub use error::{CoreError, Result};
pub use snapshot::{KeyRing, SessionSnapshot};
pub use storage::{SessionStore, SessionSummary, Storage};
pub use types::{
    Card, EncryptedCard, Fingerprint, LayerId, LayerKey, PlayerHand, SecretRound, Table, DECK_SIZE,
};
