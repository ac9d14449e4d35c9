//! Rummy rules applied to the shared table.
//!
//! Every action mutates a table in place and assumes the caller works on a
//! copy: a failed action leaves garbage behind, a successful one is only
//! committed after the conservation check passes.

use crate::error::{Result, RummyError};
use fairdeal_core::{Card, EncryptedCard, Fingerprint, Table};
use rand::seq::SliceRandom;
use std::collections::BTreeMap;

pub const MIN_SET_SIZE: usize = 3;

/// What this peer knows about its own blobs.
pub type DecryptedCards = BTreeMap<Fingerprint, Card>;

/// Three or more cards, either all of one rank or a same-suit run of
/// distinct, contiguous ranks.
pub fn is_valid_set(cards: &[Card]) -> bool {
    if cards.len() < MIN_SET_SIZE {
        return false;
    }

    let rank = cards[0].value();
    if cards.iter().all(|c| c.value() == rank) {
        return true;
    }

    let suit = cards[0].suit();
    if cards.iter().any(|c| c.suit() != suit) {
        return false;
    }

    let mut values: Vec<u8> = cards.iter().map(Card::value).collect();
    values.sort_unstable();
    values.windows(2).all(|w| w[1] == w[0] + 1)
}

/// Orders a set for display: by rank, then suit.
pub fn sort_set(cards: &mut [Card]) {
    cards.sort_by_key(|c| (c.value(), c.suit()));
}

pub fn shuffled_deck() -> Vec<Card> {
    let mut deck = Card::full_deck();
    deck.shuffle(&mut rand::thread_rng());
    deck
}

/// Hand out `hand_size` blobs per player from the top of the deck, one at a
/// time in turn order.
pub fn deal_opening_hands(table: &mut Table, hand_size: usize) -> Result<()> {
    let order = table.player_order.clone();
    for _ in 0..hand_size {
        for player in &order {
            let blob = table.deck.pop().ok_or(RummyError::DeckEmpty)?;
            hand_of(table, player)?.encrypted_cards.push(blob);
        }
    }
    Ok(())
}

/// Take the top deck blob into `player`'s hand.
pub fn draw_from_deck(table: &mut Table, player: &str) -> Result<EncryptedCard> {
    ensure_can_draw(table, player)?;
    let blob = table.deck.pop().ok_or(RummyError::DeckEmpty)?;
    hand_of(table, player)?.encrypted_cards.push(blob.clone());
    table.has_drawn = true;
    Ok(blob)
}

/// Take the whole discard pile face-up into `player`'s hand.
pub fn draw_from_pile(table: &mut Table, player: &str) -> Result<Vec<Card>> {
    ensure_can_draw(table, player)?;
    if table.pile.is_empty() {
        return Err(RummyError::PileEmpty);
    }
    let taken = std::mem::take(&mut table.pile);
    hand_of(table, player)?.cards.extend(taken.iter().copied());
    table.has_drawn = true;
    Ok(taken)
}

/// Meld `cards` from `player`'s hand.
///
/// With no target (or the player themselves) the cards form a new set when
/// they are valid on their own, otherwise they extend one of the player's
/// sets. A foreign target can only be extended once the player has melded a
/// set of their own.
pub fn place_set(
    table: &mut Table,
    player: &str,
    cards: &[Card],
    target: Option<&str>,
    decrypted: &DecryptedCards,
) -> Result<()> {
    ensure_turn(table, player)?;

    let mut placed = cards.to_vec();
    placed.sort();
    placed.dedup();
    if placed.len() != cards.len() {
        return Err(RummyError::InvalidSet);
    }
    if placed.is_empty() {
        return Err(RummyError::NeedThreeCards);
    }

    let target = target.unwrap_or(player);
    let own_sets = hand_of(table, player)?.sets.len();

    if target == player && placed.len() >= MIN_SET_SIZE && is_valid_set(&placed) {
        take_from_hand(table, player, &placed, decrypted)?;
        sort_set(&mut placed);
        hand_of(table, player)?.sets.push(placed);
        return Ok(());
    }

    if target != player && own_sets == 0 {
        return Err(RummyError::PlaceOwnSetFirst);
    }

    let target_sets = &table
        .hand(target)
        .ok_or_else(|| RummyError::PlayerNotFound(target.to_string()))?
        .sets;
    if target_sets.is_empty() && target == player {
        return Err(if placed.len() < MIN_SET_SIZE {
            RummyError::NeedThreeCards
        } else {
            RummyError::InvalidSet
        });
    }

    let (index, mut extended) = target_sets
        .iter()
        .enumerate()
        .find_map(|(i, set)| {
            let mut combined: Vec<Card> = set.iter().chain(placed.iter()).copied().collect();
            is_valid_set(&combined).then(|| {
                sort_set(&mut combined);
                (i, combined)
            })
        })
        .ok_or_else(|| RummyError::NoMatchingSet(target.to_string()))?;

    take_from_hand(table, player, &placed, decrypted)?;
    sort_set(&mut extended);
    hand_of(table, target)?.sets[index] = extended;
    Ok(())
}

/// Put `card` on the pile and pass the turn on.
pub fn discard(
    table: &mut Table,
    player: &str,
    card: Card,
    decrypted: &DecryptedCards,
) -> Result<()> {
    ensure_turn(table, player)?;
    if !table.has_drawn {
        return Err(RummyError::MustDrawFirst);
    }

    take_from_hand(table, player, &[card], decrypted)?;
    table.pile.push(card);
    table.has_drawn = false;
    table.turn += 1;
    table.whose_turn = table
        .next_player(player)
        .ok_or_else(|| RummyError::PlayerNotFound(player.to_string()))?
        .to_string();
    Ok(())
}

/// A pile may be turned into a new deck only by the player to act, before they
/// draw, once the deck has run out.
pub fn check_can_flip(table: &Table, player: &str) -> Result<()> {
    ensure_can_draw(table, player)?;
    if !table.deck.is_empty() {
        return Err(RummyError::DeckNotEmpty(table.deck.len()));
    }
    if table.pile.is_empty() {
        return Err(RummyError::PileEmpty);
    }
    Ok(())
}

/// Face-up cards plus the blobs this peer has decrypted, in hand order.
pub fn known_hand(table: &Table, player: &str, decrypted: &DecryptedCards) -> Vec<Card> {
    let Some(hand) = table.hand(player) else {
        return Vec::new();
    };
    hand.cards
        .iter()
        .copied()
        .chain(
            hand.encrypted_cards
                .iter()
                .filter_map(|blob| decrypted.get(&blob.fingerprint()).copied()),
        )
        .collect()
}

fn ensure_turn(table: &Table, player: &str) -> Result<()> {
    if table.whose_turn != player {
        return Err(RummyError::NotYourTurn(table.whose_turn.clone()));
    }
    Ok(())
}

fn ensure_can_draw(table: &Table, player: &str) -> Result<()> {
    ensure_turn(table, player)?;
    if table.has_drawn {
        return Err(RummyError::AlreadyDrawn);
    }
    Ok(())
}

fn hand_of<'a>(table: &'a mut Table, player: &str) -> Result<&'a mut fairdeal_core::PlayerHand> {
    table
        .hand_mut(player)
        .ok_or_else(|| RummyError::PlayerNotFound(player.to_string()))
}

/// Remove `cards` from the player's face-up cards or decrypted blobs.
fn take_from_hand(
    table: &mut Table,
    player: &str,
    cards: &[Card],
    decrypted: &DecryptedCards,
) -> Result<()> {
    let hand = hand_of(table, player)?;
    for card in cards {
        if let Some(i) = hand.cards.iter().position(|c| c == card) {
            hand.cards.remove(i);
            continue;
        }
        let blob = hand
            .encrypted_cards
            .iter()
            .position(|blob| decrypted.get(&blob.fingerprint()) == Some(card))
            .ok_or(RummyError::CardNotInHand(*card))?;
        hand.encrypted_cards.remove(blob);
    }
    Ok(())
}
