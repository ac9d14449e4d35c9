//! Live check of an incoming table against the last accepted one.

use crate::rules::is_valid_set;
use fairdeal_core::Table;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cheat {
    /// The tables cannot be compared at all.
    UnableToCheatDetect,
    OutOfOrderTurns,
    PlayerTurnOrderChanged,
    WrongPlayersTurn,
    CardsTakenFromPileAndDeck,
    SetsNotValid,
    OtherPlayersHandsChanged,
}

impl fmt::Display for Cheat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Cheat::UnableToCheatDetect => "tables cannot be compared",
            Cheat::OutOfOrderTurns => "turn counter skipped or went back",
            Cheat::PlayerTurnOrderChanged => "player order changed",
            Cheat::WrongPlayersTurn => "wrong player to act",
            Cheat::CardsTakenFromPileAndDeck => "deck or pile changed illegally",
            Cheat::SetsNotValid => "a placed set is not valid",
            Cheat::OtherPlayersHandsChanged => "a hand changed out of turn",
        };
        f.write_str(text)
    }
}

/// First rule `next` breaks as a successor of `previous`, or `None`.
///
/// Only the player whose turn it was in `previous` may have changed anything.
/// A change of round is a reshuffle: the old deck must be empty and the new
/// one is built from the old pile, less at most the card just drawn from it.
pub fn detect(previous: &Table, next: &Table) -> Option<Cheat> {
    if !comparable(previous) || !comparable(next) {
        return Some(Cheat::UnableToCheatDetect);
    }
    let acting = previous.whose_turn.as_str();

    let same_turn = next.turn == previous.turn;
    if !same_turn && next.turn != previous.turn + 1 {
        return Some(Cheat::OutOfOrderTurns);
    }

    let reshuffled = next.round != previous.round;
    let order_ok = if reshuffled {
        is_rotation(&previous.player_order, &next.player_order)
    } else {
        previous.player_order == next.player_order
    };
    if !order_ok {
        return Some(Cheat::PlayerTurnOrderChanged);
    }

    let expected = if same_turn {
        Some(acting)
    } else {
        previous.next_player(acting)
    };
    if expected != Some(next.whose_turn.as_str()) {
        return Some(Cheat::WrongPlayersTurn);
    }

    let deck_ok = if reshuffled {
        next.round == previous.round + 1
            && previous.deck.is_empty()
            && next.pile.is_empty()
            && next.deck.len() <= previous.pile.len()
            && next.deck.len() + 1 >= previous.pile.len()
    } else {
        deck_follows(previous, next)
    };
    if !deck_ok {
        return Some(Cheat::CardsTakenFromPileAndDeck);
    }

    let others_unchanged = previous
        .player_order
        .iter()
        .filter(|p| p.as_str() != acting)
        .all(|p| match (previous.hand(p), next.hand(p)) {
            (Some(before), Some(after)) => {
                before.encrypted_cards == after.encrypted_cards && before.cards == after.cards
            }
            _ => false,
        });
    if !others_unchanged {
        return Some(Cheat::OtherPlayersHandsChanged);
    }

    if next
        .players
        .values()
        .any(|hand| hand.sets.iter().any(|set| !is_valid_set(set)))
    {
        return Some(Cheat::SetsNotValid);
    }

    None
}

fn comparable(table: &Table) -> bool {
    table.position_of(&table.whose_turn).is_some()
        && table.player_order.len() == table.players.len()
        && table
            .player_order
            .iter()
            .all(|p| table.players.contains_key(p))
}

/// Within a round the deck only loses its top card, and only when the pile
/// was left alone.
fn deck_follows(previous: &Table, next: &Table) -> bool {
    let (before, after) = (previous.deck.len(), next.deck.len());
    if after > before || before - after > 1 || previous.deck[..after] != next.deck[..] {
        return false;
    }
    let drew_from_deck = before - after == 1;
    let pile_kept = next.pile.starts_with(&previous.pile);
    !(drew_from_deck && !pile_kept)
}

fn is_rotation(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    if a.is_empty() {
        return true;
    }
    (0..a.len()).any(|shift| a.iter().cycle().skip(shift).take(a.len()).eq(b.iter()))
}
