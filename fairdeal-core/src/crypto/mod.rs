//! Layered per-card encryption.
//!
//! Every card gets its own freshly generated key on every pass, so a player can
//! later hand out the key for one layer of one card without exposing any other.
//! A pass over an already encrypted deck first permutes the blobs and re-issues
//! layer ids, which is what stops anyone tracking a position across passes.

pub mod sealing;

use crate::error::{CoreError, Result};
use crate::types::{Card, EncryptedCard, LayerId, LayerKey, SecretRound};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::RngCore;

// ChaCha20Poly1305 for authenticated encryption
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

/// Result of peeling one layer off a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    /// Another layer lies underneath.
    Wrapped(EncryptedCard),
    /// The innermost layer has been removed.
    Card(Card),
}

impl Layer {
    pub fn is_card(&self) -> bool {
        matches!(self, Layer::Card(_))
    }
}

/// Fresh random key from the OS generator.
pub fn generate_key() -> LayerKey {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    LayerKey::from_bytes(key)
}

/// First pass: encrypt each card identity under its own key. Layer ids are the
/// positions `1..=N`.
pub fn encrypt_deck(cards: &[Card]) -> Result<(SecretRound, Vec<EncryptedCard>)> {
    let mut secrets = SecretRound::new();
    let mut encrypted = Vec::with_capacity(cards.len());

    for (i, card) in cards.iter().enumerate() {
        let layer_id = (i + 1) as LayerId;
        let key = generate_key();
        encrypted.push(seal_layer(card.id().as_bytes(), &key, layer_id)?);
        secrets.insert(layer_id, key);
    }

    tracing::debug!("Encrypted deck of {} cards", encrypted.len());
    Ok((secrets, encrypted))
}

/// Later passes: permute the blobs, then wrap each serialized blob whole under a
/// brand-new key with a new layer id.
pub fn reencrypt_layer(cards: &[EncryptedCard]) -> Result<(SecretRound, Vec<EncryptedCard>)> {
    let mut shuffled = cards.to_vec();
    shuffled.shuffle(&mut OsRng);

    let mut secrets = SecretRound::new();
    let mut encrypted = Vec::with_capacity(shuffled.len());

    for (i, layer) in shuffled.iter().enumerate() {
        let layer_id = (i + 1) as LayerId;
        let key = generate_key();
        let plaintext = serde_json::to_vec(layer)?;
        encrypted.push(seal_layer(&plaintext, &key, layer_id)?);
        secrets.insert(layer_id, key);
    }

    tracing::debug!("Re-encrypted {} blobs under a new layer", encrypted.len());
    Ok((secrets, encrypted))
}

/// Remove exactly one layer. Fails with [`CoreError::Decryption`] when the key
/// or IV does not authenticate the ciphertext; it never returns wrong data.
pub fn decrypt_one_layer(card: &EncryptedCard, key: &LayerKey) -> Result<Layer> {
    if card.iv.len() != NONCE_SIZE {
        return Err(CoreError::Decryption {
            layer_id: card.layer_id,
        });
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(&card.iv);
    let plaintext = cipher
        .decrypt(nonce, card.ciphertext.as_ref())
        .map_err(|_| CoreError::Decryption {
            layer_id: card.layer_id,
        })?;

    if let Ok(inner) = serde_json::from_slice::<EncryptedCard>(&plaintext) {
        return Ok(Layer::Wrapped(inner));
    }

    let id = std::str::from_utf8(&plaintext)
        .map_err(|_| CoreError::invalid_card("layer plaintext is not a card identity"))?;
    Ok(Layer::Card(Card::from_id(id)?))
}

/// Look up the key for `card` in `round`, then peel one layer.
pub fn decrypt_with_round(card: &EncryptedCard, round: &SecretRound) -> Result<Layer> {
    let key = round
        .get(card.layer_id)
        .ok_or(CoreError::MissingKey(card.layer_id))?;
    decrypt_one_layer(card, key)
}

/// Peel a blob to its card given every round that wrapped it, outermost first.
pub fn peel_all<'a, I>(card: &EncryptedCard, rounds_outermost_first: I) -> Result<Card>
where
    I: IntoIterator<Item = &'a SecretRound>,
{
    let mut current = card.clone();
    for round in rounds_outermost_first {
        match decrypt_with_round(&current, round)? {
            Layer::Wrapped(inner) => current = inner,
            Layer::Card(card) => return Ok(card),
        }
    }
    Err(CoreError::internal(format!(
        "layer {} still wrapped after all rounds",
        current.layer_id
    )))
}

fn seal_layer(plaintext: &[u8], key: &LayerKey, layer_id: LayerId) -> Result<EncryptedCard> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut iv = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| CoreError::encryption(format!("layer {}: {}", layer_id, e)))?;

    Ok(EncryptedCard {
        ciphertext,
        iv: iv.to_vec(),
        layer_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn layered_deck(layers: usize) -> (Vec<SecretRound>, Vec<EncryptedCard>) {
        let (first, mut blobs) = encrypt_deck(&Card::full_deck()).unwrap();
        let mut rounds = vec![first];
        for _ in 0..layers {
            let (secrets, next) = reencrypt_layer(&blobs).unwrap();
            rounds.push(secrets);
            blobs = next;
        }
        (rounds, blobs)
    }

    #[test]
    fn test_encrypt_deck_uses_positional_ids_and_distinct_keys() {
        let (secrets, blobs) = encrypt_deck(&Card::full_deck()).unwrap();
        let ids: Vec<_> = blobs.iter().map(|b| b.layer_id).collect();
        assert_eq!(ids, (1..=52).collect::<Vec<_>>());

        let keys: BTreeSet<_> = secrets
            .layer_ids()
            .map(|id| *secrets.get(id).unwrap().as_bytes())
            .collect();
        assert_eq!(keys.len(), 52);
    }

    #[test]
    fn test_round_trip_through_layers() {
        for layers in 0..=3 {
            let (rounds, blobs) = layered_deck(layers);
            let cards: BTreeSet<Card> = blobs
                .iter()
                .map(|blob| peel_all(blob, rounds.iter().rev()).unwrap())
                .collect();
            assert_eq!(cards.len(), 52, "{} extra layers", layers);
        }
    }

    #[test]
    fn test_single_layer_yields_card() {
        let card = Card::new(1, 5).unwrap();
        let (secrets, blobs) = encrypt_deck(&[card]).unwrap();
        let layer = decrypt_with_round(&blobs[0], &secrets).unwrap();
        assert_eq!(layer, Layer::Card(card));
    }

    #[test]
    fn test_outer_layer_yields_wrapped_blob() {
        let (rounds, blobs) = layered_deck(1);
        let layer = decrypt_with_round(&blobs[0], &rounds[1]).unwrap();
        assert!(matches!(layer, Layer::Wrapped(_)));
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let (rounds, blobs) = layered_deck(2);
        let wrong = generate_key();
        let err = decrypt_one_layer(&blobs[0], &wrong).unwrap_err();
        assert!(err.is_integrity_failure());

        // correct outer key, wrong middle key
        let inner = match decrypt_with_round(&blobs[0], &rounds[2]).unwrap() {
            Layer::Wrapped(inner) => inner,
            Layer::Card(_) => panic!("expected another layer"),
        };
        assert!(decrypt_one_layer(&inner, &wrong)
            .unwrap_err()
            .is_integrity_failure());
    }

    #[test]
    fn test_tampered_iv_fails_authentication() {
        let (secrets, mut blobs) = encrypt_deck(&Card::full_deck()[..1]).unwrap();
        blobs[0].iv[0] ^= 0xff;
        assert!(decrypt_with_round(&blobs[0], &secrets)
            .unwrap_err()
            .is_integrity_failure());

        blobs[0].iv.truncate(4);
        assert!(decrypt_with_round(&blobs[0], &secrets).is_err());
    }

    #[test]
    fn test_reencrypt_permutes_and_reissues_ids() {
        let (_, blobs) = encrypt_deck(&Card::full_deck()).unwrap();
        let (secrets, wrapped) = reencrypt_layer(&blobs).unwrap();
        assert_eq!(wrapped.len(), 52);
        assert_eq!(secrets.len(), 52);
        let ids: Vec<_> = wrapped.iter().map(|b| b.layer_id).collect();
        assert_eq!(ids, (1..=52).collect::<Vec<_>>());

        let before: BTreeSet<_> = blobs.iter().map(|b| b.fingerprint()).collect();
        let after: BTreeSet<_> = wrapped.iter().map(|b| b.fingerprint()).collect();
        assert!(before.is_disjoint(&after));
    }
}
