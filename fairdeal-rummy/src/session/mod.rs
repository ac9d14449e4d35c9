//! One player's side of a game.
//!
//! A [`PeerSession`] owns the local copy of the table, this player's secret
//! rounds and the cards it has decrypted. It reacts to [`Inbound`] events one
//! at a time; every table it accepts from a peer has passed the conservation
//! check and cheat detection first.

mod deal;
mod draw;

use crate::audit::{self, cheat, AuditReport, Cheat, GameRecord};
use crate::error::{Result, RummyError};
use crate::protocol::{Disclosure, Message};
use crate::rules::{self, DecryptedCards};
use crate::transport::{Inbound, Transport};
use chrono::{DateTime, Utc};
use fairdeal_core::{
    Card, EncryptedCard, KeyRing, LayerId, SecretRound, SessionConfig, SessionSnapshot, Table,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tokio::sync::broadcast;
use uuid::Uuid;

use draw::{DrawJob, PendingDraw};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    AwaitingDeal,
    Dealt,
    InProgress,
    Ended,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameEnd {
    Winner(String),
    Cheat { by: String, cheat: Cheat },
    /// A peer disclosed its keys, or this player asked to stop.
    Disclosed(String),
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    TableUpdated(Table),
    ConnectionChanged {
        player: String,
        state: ConnectionState,
    },
    CardsDecrypted {
        encrypted: Vec<EncryptedCard>,
        cards: Vec<Card>,
    },
    EndOfGameDisclosed {
        from: String,
        rounds: usize,
        /// Every player has now disclosed.
        complete: bool,
    },
    CheatDetected {
        by: String,
        cheat: Cheat,
    },
    DrawFailed {
        reason: String,
    },
    KeyRequestStalled {
        peer: String,
        ids: Vec<LayerId>,
    },
    Abandoned {
        reason: String,
    },
}

pub struct PeerSession<T: Transport> {
    game_id: Uuid,
    me: String,
    /// Lobby order; the first player deals the opening round.
    players: Vec<String>,
    config: SessionConfig,
    transport: T,
    connections: BTreeMap<String, ConnectionState>,
    table: Option<Table>,
    history: Vec<Table>,
    keys: KeyRing,
    draw: Option<PendingDraw>,
    draw_queue: VecDeque<DrawJob>,
    disclosures: BTreeMap<String, Vec<SecretRound>>,
    deal_started: bool,
    end: Option<GameEnd>,
    abandoned: bool,
    abandon_deadline: Option<DateTime<Utc>>,
    events: broadcast::Sender<SessionEvent>,
}

impl<T: Transport> PeerSession<T> {
    pub fn new(
        game_id: Uuid,
        me: impl Into<String>,
        players: Vec<String>,
        config: SessionConfig,
        transport: T,
    ) -> Result<Self> {
        let me = me.into();
        config.validate()?;
        config.validate_players(players.len())?;

        let unique: BTreeSet<&String> = players.iter().collect();
        if unique.len() != players.len() {
            return Err(RummyError::invalid_state("player names must be unique"));
        }
        if !players.contains(&me) {
            return Err(RummyError::PlayerNotFound(me));
        }

        let connections = players
            .iter()
            .filter(|p| **p != me)
            .map(|p| (p.clone(), ConnectionState::Disconnected))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tracing::info!("Session {} opened for {} ({} players)", game_id, me, players.len());

        Ok(Self {
            game_id,
            me,
            players,
            config,
            transport,
            connections,
            table: None,
            history: Vec::new(),
            keys: KeyRing::default(),
            draw: None,
            draw_queue: VecDeque::new(),
            disclosures: BTreeMap::new(),
            deal_started: false,
            end: None,
            abandoned: false,
            abandon_deadline: None,
            events,
        })
    }

    /// Rebuild a session from a saved snapshot. Links start closed; blobs that
    /// were mid-draw are requested again once a peer connects.
    pub fn restore(snapshot: SessionSnapshot, config: SessionConfig, transport: T) -> Result<Self> {
        let mut session = Self::new(
            snapshot.game_id,
            snapshot.player,
            snapshot.players,
            config,
            transport,
        )?;

        session.end = snapshot
            .table
            .as_ref()
            .and_then(|t| t.winner().map(|w| GameEnd::Winner(w.to_string())))
            .or_else(|| {
                snapshot
                    .disclosures
                    .keys()
                    .next()
                    .map(|p| GameEnd::Disclosed(p.clone()))
            });
        session.deal_started = snapshot.table.is_some();
        session.table = snapshot.table;
        session.history = snapshot.history;
        session.disclosures = snapshot.disclosures;
        session.keys = snapshot.keys;

        tracing::info!(
            "Restored session {} for {} at turn {:?}",
            session.game_id,
            session.me,
            session.table.as_ref().map(|t| t.turn)
        );
        Ok(session)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            game_id: self.game_id,
            player: self.me.clone(),
            players: self.players.clone(),
            table: self.table.clone(),
            history: self.history.clone(),
            disclosures: self.disclosures.clone(),
            keys: self.keys.clone(),
            saved_at: Utc::now(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn game_id(&self) -> Uuid {
        self.game_id
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn players(&self) -> &[String] {
        &self.players
    }

    pub fn table(&self) -> Option<&Table> {
        self.table.as_ref()
    }

    pub fn history(&self) -> &[Table] {
        &self.history
    }

    pub fn secret_rounds(&self) -> &[SecretRound] {
        &self.keys.secrets
    }

    pub fn disclosures(&self) -> &BTreeMap<String, Vec<SecretRound>> {
        &self.disclosures
    }

    pub fn end(&self) -> Option<&GameEnd> {
        self.end.as_ref()
    }

    pub fn connection(&self, player: &str) -> ConnectionState {
        self.connections
            .get(player)
            .copied()
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn phase(&self) -> GamePhase {
        if self.abandoned {
            return GamePhase::Abandoned;
        }
        if self.end.is_some() {
            return GamePhase::Ended;
        }
        match &self.table {
            None => GamePhase::AwaitingDeal,
            Some(t) if t.turn == 0 && !t.has_drawn && t.pile.is_empty() => GamePhase::Dealt,
            Some(_) => GamePhase::InProgress,
        }
    }

    pub fn is_my_turn(&self) -> bool {
        self.table.as_ref().map_or(false, |t| t.whose_turn == self.me)
    }

    /// Draws in flight or queued.
    pub fn is_drawing(&self) -> bool {
        self.draw.is_some() || !self.draw_queue.is_empty()
    }

    /// My cards as far as I know them: face-up cards plus decrypted blobs.
    pub fn my_hand(&self) -> Vec<Card> {
        self.table
            .as_ref()
            .map(|t| rules::known_hand(t, &self.me, &self.keys.decrypted))
            .unwrap_or_default()
    }

    pub fn decrypted(&self) -> &DecryptedCards {
        &self.keys.decrypted
    }

    /// Everything an auditor needs once every player has disclosed.
    pub fn game_record(&self) -> GameRecord {
        GameRecord {
            game_id: self.game_id,
            players: self.players.clone(),
            history: self.history.clone(),
            disclosures: self.disclosures.clone(),
        }
    }

    pub fn audit(&self) -> Result<AuditReport> {
        let missing: Vec<&String> = self
            .players
            .iter()
            .filter(|p| !self.disclosures.contains_key(*p))
            .collect();
        if !missing.is_empty() {
            return Err(RummyError::invalid_state(format!(
                "still waiting for disclosures from {:?}",
                missing
            )));
        }
        Ok(audit::audit(&self.history, &self.disclosures))
    }

    pub async fn handle_inbound(&mut self, inbound: Inbound) -> Result<()> {
        match inbound {
            Inbound::Connecting(player) => {
                self.set_connection(&player, ConnectionState::Connecting);
                Ok(())
            }
            Inbound::Connected(player) => self.peer_connected(&player).await,
            Inbound::Disconnected(player) => {
                self.peer_disconnected(&player);
                Ok(())
            }
            Inbound::Message { from, message } => self.handle_message(&from, message).await,
        }
    }

    /// Dispatch one message. Messages that break the protocol are logged and
    /// dropped; local failures are returned.
    pub async fn handle_message(&mut self, from: &str, message: Message) -> Result<()> {
        if !self.players.iter().any(|p| p == from) || from == self.me {
            tracing::warn!("{}: ignoring {} from stranger {}", self.me, message.kind(), from);
            return Ok(());
        }

        let kind = message.kind();
        let result = match message {
            Message::Table { table } => self.receive_table(from, table).await,
            Message::Deal(hop) => self.receive_deal(from, hop).await,
            Message::KeyRequest(request) => self.receive_key_request(from, request).await,
            Message::Keys(response) => self.receive_keys(from, response).await,
            Message::EndOfGame(disclosure) => self.receive_disclosure(from, disclosure).await,
        };

        match result {
            Err(e) if e.is_protocol() => {
                tracing::warn!("{}: dropped {} from {}: {}", self.me, kind, from, e);
                Ok(())
            }
            other => other,
        }
    }

    pub async fn draw_from_deck(&mut self) -> Result<()> {
        let mut next = self.playable_table()?;
        let blob = rules::draw_from_deck(&mut next, &self.me)?;
        tracing::debug!("{} drew blob {} from the deck", self.me, blob.fingerprint());
        self.commit(next).await
    }

    pub async fn draw_from_pile(&mut self) -> Result<Vec<Card>> {
        let mut next = self.playable_table()?;
        let taken = rules::draw_from_pile(&mut next, &self.me)?;
        tracing::debug!("{} took {} cards from the pile", self.me, taken.len());
        self.commit(next).await?;
        Ok(taken)
    }

    /// Meld `cards`, or lay them off on `target`'s sets.
    pub async fn place_set(&mut self, cards: &[Card], target: Option<&str>) -> Result<()> {
        let mut next = self.playable_table()?;
        rules::place_set(&mut next, &self.me, cards, target, &self.keys.decrypted)?;
        tracing::debug!(
            "{} placed {} cards on {}",
            self.me,
            cards.len(),
            target.unwrap_or(&self.me)
        );
        self.commit(next).await
    }

    pub async fn discard(&mut self, card: Card) -> Result<()> {
        let mut next = self.playable_table()?;
        rules::discard(&mut next, &self.me, card, &self.keys.decrypted)?;
        tracing::debug!("{} discarded {}", self.me, card);
        self.commit(next).await
    }

    /// Release every secret round to all peers. Idempotent.
    pub async fn disclose(&mut self) -> Result<()> {
        if self.disclosures.contains_key(&self.me) {
            return Ok(());
        }
        if self.end.is_none() {
            self.end = Some(GameEnd::Disclosed(self.me.clone()));
        }

        let secret_maps = self.keys.secrets.clone();
        self.disclosures
            .insert(self.me.clone(), secret_maps.clone());
        tracing::info!(
            "{} disclosed {} secret rounds for game {}",
            self.me,
            secret_maps.len(),
            self.game_id
        );

        let rounds = secret_maps.len();
        self.broadcast(Message::EndOfGame(Disclosure {
            from: self.me.clone(),
            secret_maps,
        }))
        .await;
        self.emit(SessionEvent::EndOfGameDisclosed {
            from: self.me.clone(),
            rounds,
            complete: self.disclosures.len() == self.players.len(),
        });
        Ok(())
    }

    /// Close every link. The game cannot continue without them.
    pub async fn disconnect(&mut self) {
        self.transport.close().await;
        let peers: Vec<String> = self.connections.keys().cloned().collect();
        for peer in peers {
            self.set_connection(&peer, ConnectionState::Disconnected);
        }
        tracing::info!("{} disconnected from game {}", self.me, self.game_id);
    }

    /// Fire timers that are due at `now`: abandonment after the disconnect
    /// grace, and stalled key requests.
    pub fn check_timeouts(&mut self, now: DateTime<Utc>) {
        if let Some(deadline) = self.abandon_deadline {
            if now >= deadline && !self.abandoned {
                let gone: Vec<&String> = self
                    .connections
                    .iter()
                    .filter(|(_, state)| **state != ConnectionState::Open)
                    .map(|(p, _)| p)
                    .collect();
                let reason = format!("{:?} did not come back in time", gone);
                tracing::warn!("Game {} abandoned: {}", self.game_id, reason);
                self.abandoned = true;
                self.abandon_deadline = None;
                self.emit(SessionEvent::Abandoned { reason });
            }
        }

        let timeout = to_chrono(self.config.key_request_timeout);
        let stalled = self.draw.as_mut().and_then(|draw| draw.stall(now, timeout));
        if let Some((peer, ids)) = stalled {
            tracing::warn!("{}: key request to {} is stalled", self.me, peer);
            self.emit(SessionEvent::KeyRequestStalled { peer, ids });
        }
    }

    async fn peer_connected(&mut self, player: &str) -> Result<()> {
        if !self.connections.contains_key(player) {
            tracing::warn!("{}: link from unknown peer {}", self.me, player);
            return Ok(());
        }
        self.set_connection(player, ConnectionState::Open);

        let all_open = self
            .connections
            .values()
            .all(|state| *state == ConnectionState::Open);
        if all_open && self.abandon_deadline.take().is_some() {
            tracing::info!("{}: all peers back, game {} resumes", self.me, self.game_id);
        }

        if let Some(mut table) = self.table.clone() {
            self.apply_connection_flags(&mut table);
            self.table = Some(table.clone());
            // bring the peer up to date
            if let Err(e) = self.transport.send(player, Message::Table { table }).await {
                tracing::warn!("{}: resync to {} failed: {}", self.me, player, e);
            }
        }

        if self.draw.as_ref().map_or(false, |d| d.is_waiting_on(player)) {
            self.resend_key_request().await;
        } else if self.draw.is_none() {
            self.after_table_change().await?;
        }

        if all_open && !self.deal_started && self.table.is_none() && self.players[0] == self.me {
            let order = self.players.clone();
            self.deal(order).await?;
        }
        Ok(())
    }

    fn peer_disconnected(&mut self, player: &str) {
        if !self.connections.contains_key(player) {
            return;
        }
        self.set_connection(player, ConnectionState::Disconnected);
        if let Some(table) = self.table.as_mut() {
            if let Some(hand) = table.hand_mut(player) {
                hand.connected = false;
            }
        }

        let still_playing = match &self.table {
            None => true,
            Some(table) => table.hand(player).map_or(false, |h| h.card_count() > 0),
        };
        if still_playing && self.end.is_none() && self.abandon_deadline.is_none() {
            let deadline = Utc::now() + to_chrono(self.config.disconnect_grace);
            tracing::warn!(
                "{}: lost {}, abandoning game {} at {} unless they return",
                self.me,
                player,
                self.game_id,
                deadline
            );
            self.abandon_deadline = Some(deadline);
        }
    }

    async fn receive_table(&mut self, from: &str, table: Table) -> Result<()> {
        if self.abandoned {
            return Ok(());
        }

        table
            .check_conservation()
            .map_err(|e| RummyError::protocol(format!("table from {} rejected: {}", from, e)))?;
        self.check_membership(&table)?;

        let Some(current) = &self.table else {
            if table.turn != 0 {
                return Err(RummyError::protocol(format!(
                    "first table from {} is at turn {}",
                    from, table.turn
                )));
            }
            self.check_layered(&table)?;
            return self.install_table(table, false).await;
        };

        if table.round > current.round {
            self.check_layered(&table)?;
        }
        if self.end.is_some() && is_fresh_deal(current, &table) {
            return self.install_table(table, false).await;
        }

        if table.round < current.round
            || (table.round == current.round && table.turn < current.turn)
        {
            return Err(RummyError::StaleTable {
                received: table.turn,
                current: current.turn,
            });
        }
        if same_state(current, &table) {
            return Ok(());
        }
        // an older checkpoint of this round sent again
        if self.history.iter().any(|old| same_state(old, &table)) {
            return Err(RummyError::StaleTable {
                received: table.turn,
                current: current.turn,
            });
        }
        if self.end.is_some() {
            return Err(RummyError::protocol("game is over"));
        }

        match cheat::detect(current, &table) {
            None => self.install_table(table, false).await,
            Some(Cheat::UnableToCheatDetect) => Err(RummyError::protocol(format!(
                "cannot compare table from {} with the current one",
                from
            ))),
            Some(cheat) => self.cheat_detected(from, cheat).await,
        }
    }

    /// A deck of a new round is only trusted once I have added my own layer
    /// to it.
    fn check_layered(&self, table: &Table) -> Result<()> {
        if self.keys.secrets.len() != table.round as usize + 1 {
            return Err(RummyError::protocol(format!(
                "round {} deck without my layer, holding {} secret rounds",
                table.round,
                self.keys.secrets.len()
            )));
        }
        Ok(())
    }

    async fn receive_disclosure(&mut self, from: &str, disclosure: Disclosure) -> Result<()> {
        if disclosure.from != from {
            return Err(RummyError::protocol(format!(
                "{} relayed a disclosure for {}",
                from, disclosure.from
            )));
        }
        if self.disclosures.contains_key(from) {
            return Ok(());
        }

        let rounds = disclosure.secret_maps.len();
        self.disclosures
            .insert(from.to_string(), disclosure.secret_maps);
        tracing::info!("{}: {} disclosed {} secret rounds", self.me, from, rounds);
        self.emit(SessionEvent::EndOfGameDisclosed {
            from: from.to_string(),
            rounds,
            complete: self.disclosures.len() == self.players.len(),
        });

        if self.end.is_none() {
            self.end = Some(GameEnd::Disclosed(from.to_string()));
        }
        self.disclose().await
    }

    async fn cheat_detected(&mut self, by: &str, cheat: Cheat) -> Result<()> {
        tracing::warn!(
            "{}: rejected table from {} in game {}: {}",
            self.me,
            by,
            self.game_id,
            cheat
        );
        self.end = Some(GameEnd::Cheat {
            by: by.to_string(),
            cheat,
        });
        self.emit(SessionEvent::CheatDetected {
            by: by.to_string(),
            cheat,
        });
        self.disclose().await
    }

    /// Commit a locally produced table and broadcast it.
    async fn commit(&mut self, table: Table) -> Result<()> {
        table.check_conservation()?;
        self.install_table(table, true).await
    }

    async fn install_table(&mut self, mut table: Table, broadcast: bool) -> Result<()> {
        let fresh = match &self.table {
            None => table.turn == 0,
            Some(current) => self.end.is_some() && is_fresh_deal(current, &table),
        };
        if fresh {
            self.reset_for_new_game();
            tracing::info!(
                "{}: game {} dealt, round {}, {} cards left in the deck",
                self.me,
                self.game_id,
                table.round,
                table.deck.len()
            );
        }

        self.apply_connection_flags(&mut table);
        self.record_history(&table);
        self.table = Some(table.clone());

        if broadcast {
            self.broadcast(Message::Table {
                table: table.clone(),
            })
            .await;
        }
        self.emit(SessionEvent::TableUpdated(table));
        self.after_table_change().await
    }

    /// Start decrypting my new blobs, and end the game once somebody is out.
    async fn after_table_change(&mut self) -> Result<()> {
        let Some(table) = &self.table else {
            return Ok(());
        };

        if self.end.is_none() {
            if let Some(winner) = table.winner() {
                let winner = winner.to_string();
                tracing::info!("{}: {} won game {}", self.me, winner, self.game_id);
                self.end = Some(GameEnd::Winner(winner));
                return self.disclose().await;
            }
        }
        if self.end.is_some() {
            return Ok(());
        }

        let in_flight = self.blobs_in_flight();
        let unknown: Vec<EncryptedCard> = table
            .hand(&self.me)
            .map(|hand| {
                hand.encrypted_cards
                    .iter()
                    .filter(|blob| {
                        let fingerprint = blob.fingerprint();
                        !self.keys.decrypted.contains_key(&fingerprint)
                            && !in_flight.contains(&fingerprint)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if unknown.is_empty() {
            return Ok(());
        }
        self.request_draw(unknown).await
    }

    fn reset_for_new_game(&mut self) {
        self.history.clear();
        self.disclosures.clear();
        self.end = None;
        self.draw = None;
        self.draw_queue.clear();
    }

    /// Keep one snapshot per turn boundary and per round, plus the final one.
    fn record_history(&mut self, table: &Table) {
        let checkpoint = match self.history.last() {
            None => true,
            Some(last) => {
                last.turn != table.turn
                    || last.round != table.round
                    || (table.winner().is_some() && last.winner().is_none())
            }
        };
        if checkpoint {
            self.history.push(table.clone());
        }
    }

    fn playable_table(&self) -> Result<Table> {
        if self.abandoned {
            return Err(RummyError::invalid_state("game was abandoned"));
        }
        if self.end.is_some() {
            return Err(RummyError::GameOver);
        }
        // a peer that misses a turn could no longer check the next one
        if let Some((peer, _)) = self
            .connections
            .iter()
            .find(|(_, state)| **state != ConnectionState::Open)
        {
            return Err(RummyError::invalid_state(format!(
                "waiting for {} to connect",
                peer
            )));
        }
        self.table
            .clone()
            .ok_or_else(|| RummyError::invalid_state("no cards have been dealt"))
    }

    fn check_membership(&self, table: &Table) -> Result<()> {
        let expected: BTreeSet<&String> = self.players.iter().collect();
        let order: BTreeSet<&String> = table.player_order.iter().collect();
        let hands: BTreeSet<&String> = table.players.keys().collect();
        if order != expected || hands != expected || table.player_order.len() != expected.len() {
            return Err(RummyError::protocol("table seats the wrong players"));
        }
        Ok(())
    }

    fn apply_connection_flags(&self, table: &mut Table) {
        for (player, hand) in table.players.iter_mut() {
            hand.connected = *player == self.me || self.connection(player) == ConnectionState::Open;
        }
    }

    fn set_connection(&mut self, player: &str, state: ConnectionState) {
        let Some(current) = self.connections.get_mut(player) else {
            return;
        };
        if *current == state {
            return;
        }
        *current = state;
        tracing::debug!("{}: link to {} is {:?}", self.me, player, state);
        self.emit(SessionEvent::ConnectionChanged {
            player: player.to_string(),
            state,
        });
    }

    async fn send(&self, to: &str, message: Message) -> Result<()> {
        self.transport.send(to, message).await
    }

    /// Send to every open peer. Failures are logged; the peer resyncs on
    /// reconnect.
    async fn broadcast(&self, message: Message) {
        for (peer, state) in &self.connections {
            if *state != ConnectionState::Open {
                continue;
            }
            if let Err(e) = self.transport.send(peer, message.clone()).await {
                tracing::warn!("{}: {} to {} failed: {}", self.me, message.kind(), peer, e);
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// A new game's opening table: later round, turn zero, nothing melded or
/// face-up anywhere. Only valid once the current game has ended.
fn is_fresh_deal(current: &Table, next: &Table) -> bool {
    next.turn == 0
        && next.round > current.round
        && next.pile.is_empty()
        && next
            .players
            .values()
            .all(|hand| hand.sets.is_empty() && hand.cards.is_empty())
}

/// Equal apart from the locally maintained connection flags.
fn same_state(a: &Table, b: &Table) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    for hand in a.players.values_mut().chain(b.players.values_mut()) {
        hand.connected = true;
    }
    a == b
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52))
}

#[cfg(test)]
mod tests;
