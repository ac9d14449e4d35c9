//! Post-game audit.
//!
//! Once every player has disclosed their secret rounds, every historical
//! table can be fully decrypted and checked: 52 cards, each exactly once, and
//! nothing but valid sets on the table. A key that fails to authenticate
//! pins the failure on whoever disclosed it.

pub mod cheat;

pub use cheat::Cheat;

use crate::rules::is_valid_set;
use fairdeal_core::{
    decrypt_one_layer, Card, EncryptedCard, Fingerprint, Layer, LayerId, SecretRound, Table,
    DECK_SIZE,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// History plus disclosures: everything needed to audit a finished game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    pub game_id: Uuid,
    pub players: Vec<String>,
    pub history: Vec<Table>,
    pub disclosures: BTreeMap<String, Vec<SecretRound>>,
}

impl GameRecord {
    pub fn audit(&self) -> AuditReport {
        audit(&self.history, &self.disclosures)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptedHand {
    pub cards: Vec<Card>,
    pub sets: Vec<Vec<Card>>,
    /// Blobs the disclosed keys could not open.
    pub unresolved: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptedTable {
    pub players: BTreeMap<String, DecryptedHand>,
    pub player_order: Vec<String>,
    pub whose_turn: String,
    pub deck: Vec<Card>,
    pub pile: Vec<Card>,
    pub has_drawn: bool,
    pub turn: u64,
    pub round: u32,
    pub unresolved: usize,
}

impl DecryptedTable {
    fn cards(&self) -> impl Iterator<Item = &Card> {
        self.deck.iter().chain(self.pile.iter()).chain(
            self.players
                .values()
                .flat_map(|hand| hand.cards.iter().chain(hand.sets.iter().flatten())),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Infraction {
    WrongAmountOfTotalCards { found: usize },
    NotAllCardsAreUnique { duplicates: Vec<Card>, missing: Vec<Card> },
    ThereIsAnInvalidSet { player: String, set: Vec<Card> },
    Undecryptable { count: usize },
}

/// A round's key stack failed: either `player` never disclosed this round, or
/// one of their keys did not open a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundFailure {
    pub round: u32,
    pub player: String,
    pub layer_id: Option<LayerId>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundDecryption {
    pub round: u32,
    /// History index the round was decrypted at.
    pub boundary: usize,
    /// Outermost layer id of each blob resolved here.
    pub cards: BTreeMap<LayerId, Card>,
    pub failures: Vec<RoundFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptedHistory {
    pub rounds: Vec<RoundDecryption>,
    pub tables: Vec<DecryptedTable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnAudit {
    pub index: usize,
    pub turn: u64,
    pub round: u32,
    pub infractions: Vec<Infraction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub turns: Vec<TurnAudit>,
    pub decrypted_history: Vec<DecryptedTable>,
    pub round_failures: Vec<RoundFailure>,
}

impl AuditReport {
    pub fn infraction_count(&self) -> usize {
        self.turns.iter().map(|t| t.infractions.len()).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.infraction_count() == 0 && self.round_failures.is_empty()
    }

    /// Players whose disclosed keys failed to open a blob.
    pub fn blamed_players(&self) -> BTreeSet<&str> {
        self.round_failures
            .iter()
            .filter(|f| f.layer_id.is_some())
            .map(|f| f.player.as_str())
            .collect()
    }
}

/// Decrypt every snapshot in `history` with the disclosed rounds.
///
/// A round is decrypted at its first snapshot, and again whenever the deck
/// grows, peeling in reverse encryption order. Blobs are remembered by
/// fingerprint, so hands carried over a reshuffle stay resolved.
pub fn decrypt_history(
    history: &[Table],
    secrets: &BTreeMap<String, Vec<SecretRound>>,
) -> DecryptedHistory {
    let mut resolved: BTreeMap<Fingerprint, Card> = BTreeMap::new();
    let mut rounds = Vec::new();

    for (index, table) in history.iter().enumerate() {
        let boundary = match index.checked_sub(1).map(|i| &history[i]) {
            None => true,
            Some(prev) => table.round != prev.round || table.deck.len() > prev.deck.len(),
        };
        if !boundary {
            continue;
        }

        let mut round = RoundDecryption {
            round: table.round,
            boundary: index,
            cards: BTreeMap::new(),
            failures: Vec::new(),
        };

        let mut stack = Vec::with_capacity(table.player_order.len());
        for player in table.player_order.iter().rev() {
            match secrets
                .get(player)
                .and_then(|rounds| rounds.get(table.round as usize))
            {
                Some(keys) => stack.push((player.as_str(), keys)),
                None => round.failures.push(RoundFailure {
                    round: table.round,
                    player: player.clone(),
                    layer_id: None,
                    reason: "no disclosure for this round".to_string(),
                }),
            }
        }

        if round.failures.is_empty() {
            for blob in table.encrypted_blobs() {
                let fingerprint = blob.fingerprint();
                if resolved.contains_key(&fingerprint) {
                    continue;
                }
                match peel(blob, table.round, &stack) {
                    Ok(card) => {
                        resolved.insert(fingerprint, card);
                        round.cards.insert(blob.layer_id, card);
                    }
                    Err(failure) => round.failures.push(failure),
                }
            }
        }

        tracing::debug!(
            "Audit: round {} at snapshot {} resolved {} blobs, {} failures",
            round.round,
            index,
            round.cards.len(),
            round.failures.len()
        );
        rounds.push(round);
    }

    let tables = history.iter().map(|t| project(t, &resolved)).collect();
    DecryptedHistory { rounds, tables }
}

/// Problems with one fully decrypted snapshot.
pub fn validate(table: &DecryptedTable) -> Vec<Infraction> {
    let mut infractions = Vec::new();

    let cards: Vec<&Card> = table.cards().collect();
    let found = cards.len() + table.unresolved;
    if found != DECK_SIZE {
        infractions.push(Infraction::WrongAmountOfTotalCards { found });
    }
    if table.unresolved > 0 {
        infractions.push(Infraction::Undecryptable {
            count: table.unresolved,
        });
    }

    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for card in cards {
        if !seen.insert(*card) {
            duplicates.insert(*card);
        }
    }
    let missing: Vec<Card> = if table.unresolved == 0 {
        Card::full_deck()
            .into_iter()
            .filter(|c| !seen.contains(c))
            .collect()
    } else {
        Vec::new()
    };
    if !duplicates.is_empty() || (found == DECK_SIZE && !missing.is_empty()) {
        infractions.push(Infraction::NotAllCardsAreUnique {
            duplicates: duplicates.into_iter().collect(),
            missing,
        });
    }

    for player in &table.player_order {
        let Some(hand) = table.players.get(player) else {
            continue;
        };
        for set in hand.sets.iter().filter(|set| !is_valid_set(set)) {
            infractions.push(Infraction::ThereIsAnInvalidSet {
                player: player.clone(),
                set: set.clone(),
            });
        }
    }

    infractions
}

/// Decrypt and validate a whole game.
pub fn audit(history: &[Table], secrets: &BTreeMap<String, Vec<SecretRound>>) -> AuditReport {
    let decrypted = decrypt_history(history, secrets);
    let turns: Vec<TurnAudit> = decrypted
        .tables
        .iter()
        .enumerate()
        .map(|(index, table)| TurnAudit {
            index,
            turn: table.turn,
            round: table.round,
            infractions: validate(table),
        })
        .collect();
    let round_failures: Vec<RoundFailure> = decrypted
        .rounds
        .into_iter()
        .flat_map(|round| round.failures)
        .collect();

    let report = AuditReport {
        turns,
        decrypted_history: decrypted.tables,
        round_failures,
    };
    if report.is_clean() {
        tracing::info!("Audit of {} snapshots is clean", history.len());
    } else {
        tracing::warn!(
            "Audit of {} snapshots found {} infractions and {} key failures",
            history.len(),
            report.infraction_count(),
            report.round_failures.len()
        );
    }
    report
}

/// Peel `blob` with one player's keys per layer, outermost first.
fn peel(
    blob: &EncryptedCard,
    round: u32,
    stack: &[(&str, &SecretRound)],
) -> Result<Card, RoundFailure> {
    let fail = |player: &str, layer_id: LayerId, reason: String| RoundFailure {
        round,
        player: player.to_string(),
        layer_id: Some(layer_id),
        reason,
    };

    let mut current = blob.clone();
    for (depth, (player, keys)) in stack.iter().enumerate() {
        let innermost = depth + 1 == stack.len();
        let key = keys
            .get(current.layer_id)
            .ok_or_else(|| fail(player, current.layer_id, "key missing".to_string()))?;
        match decrypt_one_layer(&current, key) {
            Ok(Layer::Wrapped(inner)) if !innermost => current = inner,
            Ok(Layer::Card(card)) if innermost => return Ok(card),
            Ok(_) => {
                return Err(fail(
                    player,
                    current.layer_id,
                    "layer count does not match the player order".to_string(),
                ))
            }
            Err(e) => return Err(fail(player, current.layer_id, e.to_string())),
        }
    }

    Err(RoundFailure {
        round,
        player: String::new(),
        layer_id: None,
        reason: "nobody encrypted this round".to_string(),
    })
}

fn project(table: &Table, resolved: &BTreeMap<Fingerprint, Card>) -> DecryptedTable {
    let mut unresolved = 0;
    let mut open = |blobs: &[EncryptedCard]| -> (Vec<Card>, usize) {
        let mut cards = Vec::with_capacity(blobs.len());
        let mut missing = 0;
        for blob in blobs {
            match resolved.get(&blob.fingerprint()) {
                Some(card) => cards.push(*card),
                None => missing += 1,
            }
        }
        unresolved += missing;
        (cards, missing)
    };

    let (deck, _) = open(&table.deck);
    let players = table
        .players
        .iter()
        .map(|(name, hand)| {
            let (opened, missing) = open(&hand.encrypted_cards);
            let cards = hand.cards.iter().copied().chain(opened).collect();
            (
                name.clone(),
                DecryptedHand {
                    cards,
                    sets: hand.sets.clone(),
                    unresolved: missing,
                },
            )
        })
        .collect();

    DecryptedTable {
        players,
        player_order: table.player_order.clone(),
        whose_turn: table.whose_turn.clone(),
        deck,
        pile: table.pile.clone(),
        has_drawn: table.has_drawn,
        turn: table.turn,
        round: table.round,
        unresolved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules;
    use fairdeal_core::{encrypt_deck, reencrypt_layer};

    struct Dealt {
        table: Table,
        secrets: BTreeMap<String, Vec<SecretRound>>,
    }

    /// Two-player chain over the full deck, opening hands dealt.
    fn dealt() -> Dealt {
        let (a0, blobs) = encrypt_deck(&rules::shuffled_deck()).unwrap();
        let (b0, blobs) = reencrypt_layer(&blobs).unwrap();
        let mut table = Table::new(vec!["a".into(), "b".into()], blobs, 0);
        rules::deal_opening_hands(&mut table, 7).unwrap();

        let mut secrets = BTreeMap::new();
        secrets.insert("a".to_string(), vec![a0]);
        secrets.insert("b".to_string(), vec![b0]);
        Dealt { table, secrets }
    }

    #[test]
    fn test_honest_history_is_clean() {
        let Dealt { table, secrets } = dealt();
        let report = audit(&[table.clone()], &secrets);
        assert!(report.is_clean(), "{:?}", report.turns);
        assert_eq!(report.decrypted_history[0].deck.len(), 38);
        assert_eq!(report.decrypted_history[0].players["a"].cards.len(), 7);
    }

    #[test]
    fn test_lying_key_is_attributed() {
        let Dealt { table, mut secrets } = dealt();
        let liar = secrets.get_mut("b").unwrap();
        let mut forged = liar[0].clone();
        forged.insert(1, fairdeal_core::crypto::generate_key());
        liar[0] = forged;

        let report = audit(&[table.clone()], &secrets);
        assert!(!report.is_clean());
        assert_eq!(report.blamed_players(), BTreeSet::from(["b"]));
        assert!(report.turns[0]
            .infractions
            .iter()
            .any(|i| matches!(i, Infraction::Undecryptable { count: 1 })));
    }

    #[test]
    fn test_missing_disclosure() {
        let Dealt { table, mut secrets } = dealt();
        secrets.remove("a");
        let report = audit(&[table], &secrets);
        assert_eq!(report.round_failures.len(), 1);
        assert_eq!(report.round_failures[0].player, "a");
        assert!(report.blamed_players().is_empty());
        assert!(report.turns[0]
            .infractions
            .iter()
            .any(|i| matches!(i, Infraction::Undecryptable { count: 52 })));
    }

    #[test]
    fn test_validate_flags_duplicates_and_sets() {
        let Dealt { table, secrets } = dealt();
        let mut decrypted = decrypt_history(&[table], &secrets).tables.remove(0);
        assert!(validate(&decrypted).is_empty());

        // move three unrelated cards into a meld of player a
        let bogus = vec![
            Card::new(1, 2).unwrap(),
            Card::new(3, 7).unwrap(),
            Card::new(4, 11).unwrap(),
        ];
        for card in &bogus {
            decrypted.deck.retain(|c| c != card);
            for hand in decrypted.players.values_mut() {
                hand.cards.retain(|c| c != card);
            }
        }
        decrypted.players.get_mut("a").unwrap().sets.push(bogus.clone());
        assert!(validate(&decrypted)
            .iter()
            .all(|i| matches!(i, Infraction::ThereIsAnInvalidSet { .. })));

        let copy = decrypted.deck[0];
        decrypted.deck[1] = copy;

        let infractions = validate(&decrypted);
        assert!(infractions
            .iter()
            .any(|i| matches!(i, Infraction::NotAllCardsAreUnique { duplicates, .. } if duplicates == &vec![copy])));
        assert!(infractions.iter().any(|i| matches!(
            i,
            Infraction::ThereIsAnInvalidSet { player, set } if player == "a" && set == &bogus
        )));
    }

    #[test]
    fn test_wrong_total() {
        let Dealt { table, secrets } = dealt();
        let mut decrypted = decrypt_history(&[table], &secrets).tables.remove(0);
        decrypted.deck.pop();
        assert_eq!(
            validate(&decrypted),
            vec![Infraction::WrongAmountOfTotalCards { found: 51 }]
        );
    }
}
