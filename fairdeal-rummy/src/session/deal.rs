//! Encryption chain: every player in order adds a layer, the last one builds
//! the table.

use super::{GamePhase, PeerSession};
use crate::error::{Result, RummyError};
use crate::protocol::{DealHop, DealKind, Message};
use crate::rules;
use crate::transport::Transport;
use fairdeal_core::{encrypt_deck, reencrypt_layer, Card, EncryptedCard, SecretRound, Table, DECK_SIZE};
use rand::seq::SliceRandom;
use std::collections::BTreeSet;

impl<T: Transport> PeerSession<T> {
    /// Start a new game along `player_order`, which must begin with this
    /// player. Sent automatically by the first lobby player once every link is
    /// open.
    pub async fn deal(&mut self, player_order: Vec<String>) -> Result<()> {
        if player_order.first() != Some(&self.me) {
            return Err(RummyError::invalid_state("only the first player in order deals"));
        }
        self.check_order(&player_order)?;
        if self.table.is_some() && self.end.is_none() {
            return Err(RummyError::invalid_state("a game is already in progress"));
        }

        self.deal_started = true;
        let round = self.next_round();
        tracing::info!(
            "{}: dealing game {} round {} to {:?}",
            self.me,
            self.game_id,
            round,
            player_order
        );
        self.start_chain(player_order, rules::shuffled_deck(), round, DealKind::Fresh)
            .await
    }

    /// Play again with the same players once the game has ended. Turn order
    /// starts with this player.
    pub async fn rematch(&mut self) -> Result<()> {
        if self.phase() != GamePhase::Ended {
            return Err(RummyError::invalid_state("the current game has not ended"));
        }
        let order = self
            .table
            .as_ref()
            .map(|t| rotate_to(&t.player_order, &self.me))
            .unwrap_or_else(|| rotate_to(&self.players, &self.me));
        self.deal(order).await
    }

    /// Turn the discard pile into a fresh deck under a new round of
    /// encryption. The chain starts with the acting player.
    pub async fn flip_pile(&mut self) -> Result<()> {
        let table = self.playable_table()?;
        rules::check_can_flip(&table, &self.me)?;

        let round = self.next_round();
        if round != table.round + 1 {
            return Err(RummyError::invalid_state(format!(
                "holding {} secret rounds at table round {}",
                round, table.round
            )));
        }

        let mut cards = table.pile.clone();
        cards.shuffle(&mut rand::thread_rng());
        let order = rotate_to(&table.player_order, &self.me);
        tracing::info!(
            "{}: turning {} pile cards into a new deck, round {}",
            self.me,
            cards.len(),
            round
        );
        self.start_chain(order, cards, round, DealKind::Reshuffle).await
    }

    pub(super) async fn receive_deal(&mut self, from: &str, hop: DealHop) -> Result<()> {
        if hop.to != self.me {
            return Err(RummyError::protocol(format!("deal hop addressed to {}", hop.to)));
        }
        self.check_order(&hop.player_order)?;
        let position = hop
            .player_order
            .iter()
            .position(|p| *p == self.me)
            .ok_or_else(|| RummyError::protocol("not part of the encryption order"))?;
        if position == 0 || hop.player_order[position - 1] != from {
            return Err(RummyError::protocol(format!(
                "{} is not the previous encrypter",
                from
            )));
        }
        if hop.round != self.next_round() {
            return Err(RummyError::protocol(format!(
                "deal for round {} while expecting round {}",
                hop.round,
                self.next_round()
            )));
        }

        let expected = match hop.kind {
            DealKind::Fresh => DECK_SIZE,
            DealKind::Reshuffle => self
                .table
                .as_ref()
                .map(|t| t.pile.len())
                .ok_or_else(|| RummyError::protocol("reshuffle before any table"))?,
        };
        if hop.cards.len() != expected {
            return Err(RummyError::protocol(format!(
                "deal hop carries {} cards, expected {}",
                hop.cards.len(),
                expected
            )));
        }
        if hop.kind == DealKind::Fresh {
            self.deal_started = true;
        }

        let (secrets, cards) = reencrypt_layer(&hop.cards)?;
        self.store_round(hop.round, secrets)?;
        tracing::debug!(
            "{}: added layer {} of {} for round {}",
            self.me,
            position + 1,
            hop.player_order.len(),
            hop.round
        );

        if position + 1 < hop.player_order.len() {
            self.forward_hop(hop.player_order, cards, hop.round, hop.kind, position + 1)
                .await
        } else {
            self.finish_chain(hop.player_order, cards, hop.round, hop.kind)
                .await
        }
    }

    async fn start_chain(
        &mut self,
        order: Vec<String>,
        cards: Vec<Card>,
        round: u32,
        kind: DealKind,
    ) -> Result<()> {
        let (secrets, encrypted) = encrypt_deck(&cards)?;
        self.store_round(round, secrets)?;
        if order.len() == 1 {
            return self.finish_chain(order, encrypted, round, kind).await;
        }
        self.forward_hop(order, encrypted, round, kind, 1).await
    }

    async fn forward_hop(
        &self,
        order: Vec<String>,
        cards: Vec<EncryptedCard>,
        round: u32,
        kind: DealKind,
        next: usize,
    ) -> Result<()> {
        let to = order[next].clone();
        self.send(
            &to,
            Message::Deal(DealHop {
                to: to.clone(),
                player_order: order,
                cards,
                round,
                kind,
            }),
        )
        .await
    }

    /// Last encrypter: the deck is complete, so build and publish the table.
    async fn finish_chain(
        &mut self,
        order: Vec<String>,
        deck: Vec<EncryptedCard>,
        round: u32,
        kind: DealKind,
    ) -> Result<()> {
        let table = match kind {
            DealKind::Fresh => {
                let mut table = Table::new(order, deck, round);
                rules::deal_opening_hands(&mut table, self.config.hand_size)?;
                table
            }
            DealKind::Reshuffle => {
                let mut table = self
                    .table
                    .clone()
                    .ok_or_else(|| RummyError::invalid_state("reshuffle without a table"))?;
                table.deck = deck;
                table.pile.clear();
                table.player_order = order;
                table.round = round;
                table
            }
        };

        tracing::info!(
            "{}: encryption chain for round {} complete, {} cards in the deck",
            self.me,
            round,
            table.deck.len()
        );
        self.commit(table).await
    }

    /// Round index of the next encryption pass.
    fn next_round(&self) -> u32 {
        self.keys.secrets.len() as u32
    }

    fn store_round(&mut self, round: u32, secrets: SecretRound) -> Result<()> {
        if round != self.next_round() {
            return Err(RummyError::protocol(format!(
                "round {} out of sequence, holding {} rounds",
                round,
                self.keys.secrets.len()
            )));
        }
        self.keys.secrets.push(secrets);
        Ok(())
    }

    fn check_order(&self, order: &[String]) -> Result<()> {
        let expected: BTreeSet<&String> = self.players.iter().collect();
        let given: BTreeSet<&String> = order.iter().collect();
        if given != expected || order.len() != self.players.len() {
            return Err(RummyError::protocol(format!(
                "order {:?} does not seat {:?}",
                order, self.players
            )));
        }
        Ok(())
    }
}

/// `order` rotated so that `first` leads; unchanged when `first` is absent.
pub(crate) fn rotate_to(order: &[String], first: &str) -> Vec<String> {
    let mut rotated = order.to_vec();
    if let Some(position) = order.iter().position(|p| p == first) {
        rotated.rotate_left(position);
    }
    rotated
}
