//! In-process games over a [`MemoryNetwork`], driven by a simple bot.

use crate::error::{Result, RummyError};
use crate::rules::{self, is_valid_set};
use crate::session::{GamePhase, PeerSession};
use crate::transport::{coalesce, Inbound, MemoryNetwork, MemoryTransport};
use fairdeal_core::{Card, SessionConfig, Table};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct MemoryPeer {
    pub session: PeerSession<MemoryTransport>,
    pub(crate) inbox: mpsc::UnboundedReceiver<Inbound>,
}

impl MemoryPeer {
    pub fn join(
        network: &MemoryNetwork,
        game_id: Uuid,
        name: &str,
        players: Vec<String>,
        config: SessionConfig,
    ) -> Result<Self> {
        let (transport, inbox) = network.join(name);
        let session = PeerSession::new(game_id, name, players, config, transport)?;
        Ok(Self { session, inbox })
    }

    /// Handle everything queued so far. Returns how many events were handled.
    pub async fn pump(&mut self) -> usize {
        let mut batch = Vec::new();
        while let Ok(inbound) = self.inbox.try_recv() {
            batch.push(inbound);
        }

        let handled = batch.len();
        for inbound in coalesce(batch) {
            if let Err(e) = self.session.handle_inbound(inbound).await {
                tracing::warn!("{}: {}", self.session.me(), e);
            }
        }
        handled
    }
}

/// Create one peer per name on a fresh network and connect them all. The
/// first name deals.
pub fn table_of(names: &[&str], config: SessionConfig) -> Result<(MemoryNetwork, Vec<MemoryPeer>)> {
    let network = MemoryNetwork::new();
    let game_id = Uuid::new_v4();
    let players: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let peers = names
        .iter()
        .map(|name| MemoryPeer::join(&network, game_id, name, players.clone(), config.clone()))
        .collect::<Result<Vec<_>>>()?;
    network.connect_all();
    Ok((network, peers))
}

/// Deliver messages until no peer has anything left to handle.
pub async fn drive_until_idle(peers: &mut [MemoryPeer]) -> usize {
    let mut total = 0;
    loop {
        let mut handled = 0;
        for peer in peers.iter_mut() {
            handled += peer.pump().await;
        }
        if handled == 0 {
            return total;
        }
        total += handled;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Meld whatever is possible, discard the highest loose card.
    Greedy,
    /// Never meld; throw the drawn card straight back.
    Passive,
}

#[derive(Debug, Clone)]
pub struct SimulationOutcome {
    pub winner: Option<String>,
    pub turns: u64,
    pub rounds: u32,
}

/// Play until someone wins or `max_turns` is reached, then have everyone
/// disclose.
pub async fn run_game(
    peers: &mut [MemoryPeer],
    strategy: Strategy,
    max_turns: u64,
) -> Result<SimulationOutcome> {
    drive_until_idle(peers).await;
    if peers.iter().any(|p| p.session.table().is_none()) {
        return Err(RummyError::invalid_state("the deal did not complete"));
    }

    loop {
        let Some(table) = peers[0].session.table().cloned() else {
            break;
        };
        let playing = peers
            .iter()
            .all(|p| matches!(p.session.phase(), GamePhase::Dealt | GamePhase::InProgress));
        if !playing || table.turn >= max_turns {
            break;
        }
        play_turn(peers, strategy).await?;
    }

    if peers[0].session.end().is_none() {
        peers[0].session.disclose().await?;
    }
    drive_until_idle(peers).await;

    let table = peers[0]
        .session
        .table()
        .ok_or_else(|| RummyError::invalid_state("no table"))?;
    Ok(SimulationOutcome {
        winner: table.winner().map(str::to_string),
        turns: table.turn,
        rounds: table.round + 1,
    })
}

/// One full turn for whoever is to act.
pub async fn play_turn(peers: &mut [MemoryPeer], strategy: Strategy) -> Result<()> {
    let actor = acting_peer(peers)?;

    let needs_flip = peers[actor]
        .session
        .table()
        .map_or(false, |t| t.deck.is_empty() && !t.has_drawn);
    if needs_flip {
        peers[actor].session.flip_pile().await?;
        drive_until_idle(peers).await;
    }

    let before = peers[actor].session.my_hand();
    peers[actor].session.draw_from_deck().await?;
    drive_until_idle(peers).await;

    if peers[actor].session.is_drawing() {
        return Err(RummyError::invalid_state("drawn card was not decrypted"));
    }
    let drawn = peers[actor]
        .session
        .my_hand()
        .into_iter()
        .find(|c| !before.contains(c));

    if strategy == Strategy::Greedy {
        meld_everything(&mut peers[actor].session).await?;
        drive_until_idle(peers).await;
    }
    if peers[actor].session.end().is_some() {
        return Ok(());
    }

    let hand = peers[actor].session.my_hand();
    let discard = match strategy {
        Strategy::Passive => drawn.or_else(|| hand.first().copied()),
        Strategy::Greedy => hand.iter().max_by_key(|c| (c.value(), c.suit())).copied(),
    }
    .ok_or_else(|| RummyError::invalid_state("nothing to discard"))?;

    peers[actor].session.discard(discard).await?;
    drive_until_idle(peers).await;
    Ok(())
}

fn acting_peer(peers: &[MemoryPeer]) -> Result<usize> {
    let table = peers
        .first()
        .and_then(|p| p.session.table())
        .ok_or_else(|| RummyError::invalid_state("no table"))?;
    peers
        .iter()
        .position(|p| p.session.me() == table.whose_turn)
        .ok_or_else(|| RummyError::PlayerNotFound(table.whose_turn.clone()))
}

async fn meld_everything(session: &mut PeerSession<MemoryTransport>) -> Result<()> {
    while let Some(set) = find_set(&session.my_hand()) {
        session.place_set(&set, None).await?;
    }

    let has_own_set = session
        .table()
        .and_then(|t| t.hand(session.me()))
        .map_or(false, |h| !h.sets.is_empty());
    if !has_own_set {
        return Ok(());
    }

    loop {
        let Some(table) = session.table() else {
            return Ok(());
        };
        let Some((card, target)) = find_lay_off(&session.my_hand(), table) else {
            return Ok(());
        };
        // keep one card back for the discard
        if session.my_hand().len() <= 1 {
            return Ok(());
        }
        session.place_set(&[card], Some(&target)).await?;
    }
}

/// A group of one rank, or the longest same-suit run, of at least 3 cards.
pub fn find_set(hand: &[Card]) -> Option<Vec<Card>> {
    let mut by_rank: BTreeMap<u8, Vec<Card>> = BTreeMap::new();
    let mut by_suit: BTreeMap<u8, Vec<Card>> = BTreeMap::new();
    for card in hand {
        by_rank.entry(card.value()).or_default().push(*card);
        by_suit.entry(card.suit()).or_default().push(*card);
    }

    if let Some(group) = by_rank.into_values().find(|g| g.len() >= rules::MIN_SET_SIZE) {
        return Some(group);
    }

    for mut suited in by_suit.into_values() {
        suited.sort_by_key(Card::value);
        suited.dedup();
        let mut run = vec![suited[0]];
        for card in suited.into_iter().skip(1) {
            if run.last().map_or(false, |last| card.value() == last.value() + 1) {
                run.push(card);
            } else if run.len() >= rules::MIN_SET_SIZE {
                break;
            } else {
                run = vec![card];
            }
        }
        if run.len() >= rules::MIN_SET_SIZE && is_valid_set(&run) {
            return Some(run);
        }
    }
    None
}

/// A card from `hand` that extends any set on the table.
fn find_lay_off(hand: &[Card], table: &Table) -> Option<(Card, String)> {
    for card in hand {
        for player in &table.player_order {
            let Some(target) = table.hand(player) else {
                continue;
            };
            let fits = target.sets.iter().any(|set| {
                let mut extended = set.clone();
                extended.push(*card);
                is_valid_set(&extended)
            });
            if fits {
                return Some((*card, player.clone()));
            }
        }
    }
    None
}
