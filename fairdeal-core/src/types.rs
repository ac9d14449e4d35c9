use crate::error::{CoreError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub const DECK_SIZE: usize = 52;
pub const SUITS: u8 = 4;
pub const RANKS: u8 = 13;

/// Positional tag of an encrypted blob, re-issued on every encryption pass.
pub type LayerId = u32;

const SYMBOLS: [&str; 4] = ["♠", "♥", "♣", "♦"];
const RANK_NAMES: [&str; 13] = [
    "A", "2", "3", "4", "5", "6", "7", "8", "9", "10", "J", "Q", "K",
];

/// A playing card. On the wire it is its identity string `"{suit}-{rank}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Card {
    suit: u8,
    rank: u8,
}

impl Card {
    pub fn new(suit: u8, rank: u8) -> Result<Self> {
        if !(1..=SUITS).contains(&suit) || !(1..=RANKS).contains(&rank) {
            return Err(CoreError::invalid_card(format!("{}-{}", suit, rank)));
        }
        Ok(Self { suit, rank })
    }

    /// Parse an identity string such as `"3-12"`.
    pub fn from_id(id: &str) -> Result<Self> {
        let (suit, rank) = id
            .split_once('-')
            .ok_or_else(|| CoreError::invalid_card(id.to_string()))?;
        let suit = suit
            .parse::<u8>()
            .map_err(|_| CoreError::invalid_card(id.to_string()))?;
        let rank = rank
            .parse::<u8>()
            .map_err(|_| CoreError::invalid_card(id.to_string()))?;
        Self::new(suit, rank)
    }

    pub fn id(&self) -> String {
        format!("{}-{}", self.suit, self.rank)
    }

    pub fn suit(&self) -> u8 {
        self.suit
    }

    pub fn rank(&self) -> u8 {
        self.rank
    }

    /// Numeric value used for set comparisons.
    pub fn value(&self) -> u8 {
        self.rank
    }

    /// All 52 identities, ordered by suit then rank.
    pub fn full_deck() -> Vec<Card> {
        (1..=SUITS)
            .flat_map(|suit| (1..=RANKS).map(move |rank| Card { suit, rank }))
            .collect()
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            RANK_NAMES[(self.rank - 1) as usize],
            SYMBOLS[(self.suit - 1) as usize]
        )
    }
}

impl From<Card> for String {
    fn from(card: Card) -> Self {
        card.id()
    }
}

impl TryFrom<String> for Card {
    type Error = CoreError;

    fn try_from(id: String) -> Result<Self> {
        Card::from_id(&id)
    }
}

/// Symmetric key for a single layer of a single card.
#[derive(Clone, PartialEq, Eq)]
pub struct LayerKey([u8; 32]);

impl LayerKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for LayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LayerKey(..)")
    }
}

impl Serialize for LayerKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for LayerKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("layer key must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// SHA-256 over IV and ciphertext; identifies one blob independent of its layer id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..12])
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("fingerprint must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Opaque ciphertext of one card under one or more layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedCard {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    pub layer_id: LayerId,
}

impl EncryptedCard {
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(&self.iv);
        hasher.update(&self.ciphertext);
        Fingerprint(hasher.finalize().into())
    }
}

/// `layerId -> key` maps with the ids written as decimal strings. Integer map
/// keys are rejected once serde buffers a message for its `type` tag.
pub mod layer_key_map {
    use super::{LayerId, LayerKey};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        keys: &BTreeMap<LayerId, LayerKey>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(keys.iter().map(|(id, key)| (id.to_string(), key)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<LayerId, LayerKey>, D::Error> {
        BTreeMap::<String, LayerKey>::deserialize(deserializer)?
            .into_iter()
            .map(|(id, key)| {
                id.parse::<LayerId>()
                    .map(|id| (id, key))
                    .map_err(|_| D::Error::custom(format!("invalid layer id {:?}", id)))
            })
            .collect()
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

/// One player's `layerId -> key` map from one encryption pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRound {
    #[serde(with = "layer_key_map")]
    keys: BTreeMap<LayerId, LayerKey>,
}

impl SecretRound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, layer_id: LayerId, key: LayerKey) {
        self.keys.insert(layer_id, key);
    }

    pub fn get(&self, layer_id: LayerId) -> Option<&LayerKey> {
        self.keys.get(&layer_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn layer_ids(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.keys.keys().copied()
    }

    /// Select the keys for `ids`, failing on the first id this round never issued.
    pub fn keys_for(&self, ids: &[LayerId]) -> Result<BTreeMap<LayerId, LayerKey>> {
        ids.iter()
            .map(|id| {
                self.keys
                    .get(id)
                    .cloned()
                    .map(|key| (*id, key))
                    .ok_or(CoreError::MissingKey(*id))
            })
            .collect()
    }
}

impl From<BTreeMap<LayerId, LayerKey>> for SecretRound {
    fn from(keys: BTreeMap<LayerId, LayerKey>) -> Self {
        Self { keys }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerHand {
    /// Cards still under encryption on the public table.
    pub encrypted_cards: Vec<EncryptedCard>,
    /// Face-up cards in this player's possession, e.g. taken from the pile.
    pub cards: Vec<Card>,
    pub sets: Vec<Vec<Card>>,
    pub connected: bool,
}

impl Default for PlayerHand {
    fn default() -> Self {
        Self {
            encrypted_cards: Vec::new(),
            cards: Vec::new(),
            sets: Vec::new(),
            connected: true,
        }
    }
}

impl PlayerHand {
    /// Cards held in hand, encrypted or not. Melded cards are excluded.
    pub fn card_count(&self) -> usize {
        self.encrypted_cards.len() + self.cards.len()
    }

    pub fn set_card_count(&self) -> usize {
        self.sets.iter().map(Vec::len).sum()
    }

    pub fn holds_blob(&self, fingerprint: &Fingerprint) -> bool {
        self.encrypted_cards
            .iter()
            .any(|c| c.fingerprint() == *fingerprint)
    }
}

/// The shared game state snapshot broadcast after every table-mutating action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub players: BTreeMap<String, PlayerHand>,
    pub player_order: Vec<String>,
    pub whose_turn: String,
    /// Top of the deck is the last element.
    pub deck: Vec<EncryptedCard>,
    pub pile: Vec<Card>,
    pub has_drawn: bool,
    pub turn: u64,
    /// Encryption round the deck belongs to.
    pub round: u32,
}

impl Table {
    /// Empty hands, first player to act, turn zero.
    pub fn new(player_order: Vec<String>, deck: Vec<EncryptedCard>, round: u32) -> Self {
        let players = player_order
            .iter()
            .map(|name| (name.clone(), PlayerHand::default()))
            .collect();
        let whose_turn = player_order.first().cloned().unwrap_or_default();

        Self {
            players,
            player_order,
            whose_turn,
            deck,
            pile: Vec::new(),
            has_drawn: false,
            turn: 0,
            round,
        }
    }

    pub fn hand(&self, player: &str) -> Option<&PlayerHand> {
        self.players.get(player)
    }

    pub fn hand_mut(&mut self, player: &str) -> Option<&mut PlayerHand> {
        self.players.get_mut(player)
    }

    pub fn position_of(&self, player: &str) -> Option<usize> {
        self.player_order.iter().position(|p| p == player)
    }

    /// The player after `player` in turn order, wrapping around.
    pub fn next_player(&self, player: &str) -> Option<&str> {
        let position = self.position_of(player)?;
        let next = (position + 1) % self.player_order.len();
        Some(self.player_order[next].as_str())
    }

    /// deck + pile + every hand, encrypted or not, + every set.
    pub fn total_cards(&self) -> usize {
        self.deck.len()
            + self.pile.len()
            + self
                .players
                .values()
                .map(|hand| hand.card_count() + hand.set_card_count())
                .sum::<usize>()
    }

    /// Check the 52-card invariant as far as the public state allows: the total
    /// count, and no duplicate among face-up cards or among blobs.
    pub fn check_conservation(&self) -> Result<()> {
        let found = self.total_cards();
        if found != DECK_SIZE {
            return Err(CoreError::CardCount {
                found,
                expected: DECK_SIZE,
            });
        }

        let mut face_up = BTreeSet::new();
        let visible = self.pile.iter().chain(self.players.values().flat_map(|hand| {
            hand.cards.iter().chain(hand.sets.iter().flatten())
        }));
        for card in visible {
            if !face_up.insert(*card) {
                return Err(CoreError::DuplicateCard(card.id()));
            }
        }

        let mut blobs = BTreeSet::new();
        let encrypted = self
            .deck
            .iter()
            .chain(self.players.values().flat_map(|hand| hand.encrypted_cards.iter()));
        for blob in encrypted {
            let fingerprint = blob.fingerprint();
            if !blobs.insert(fingerprint) {
                return Err(CoreError::DuplicateCard(format!("blob {}", fingerprint)));
            }
        }

        Ok(())
    }

    /// First player in turn order holding no cards.
    pub fn winner(&self) -> Option<&str> {
        self.player_order
            .iter()
            .find(|name| {
                self.players
                    .get(name.as_str())
                    .map_or(false, |hand| hand.card_count() == 0)
            })
            .map(String::as_str)
    }

    /// Every encrypted blob on the table: deck first, then hands in turn order.
    pub fn encrypted_blobs(&self) -> Vec<&EncryptedCard> {
        let mut blobs: Vec<&EncryptedCard> = self.deck.iter().collect();
        for name in &self.player_order {
            if let Some(hand) = self.players.get(name) {
                blobs.extend(hand.encrypted_cards.iter());
            }
        }
        blobs
    }
}
