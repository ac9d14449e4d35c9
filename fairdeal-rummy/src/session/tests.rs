use super::*;
use crate::protocol::KeyResponse;
use crate::sim::{drive_until_idle, play_turn, table_of, MemoryPeer, Strategy};
use crate::transport::MemoryNetwork;
use fairdeal_core::crypto::generate_key;
use fairdeal_core::encrypt_deck;

fn events(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

async fn dealt_pair() -> (MemoryNetwork, Vec<MemoryPeer>) {
    let (network, mut peers) = table_of(&["alice", "bob"], SessionConfig::default()).unwrap();
    drive_until_idle(&mut peers).await;
    (network, peers)
}

#[test]
fn test_new_checks_players() {
    let network = MemoryNetwork::new();
    let (transport, _rx) = network.join("mallory");
    let players = vec!["alice".to_string(), "bob".to_string()];
    assert!(matches!(
        PeerSession::new(Uuid::new_v4(), "mallory", players, SessionConfig::default(), transport),
        Err(RummyError::PlayerNotFound(_))
    ));

    let (transport, _rx) = network.join("alice");
    assert!(PeerSession::new(
        Uuid::new_v4(),
        "alice",
        vec!["alice".to_string()],
        SessionConfig::default(),
        transport
    )
    .is_err());
}

#[tokio::test]
async fn test_two_player_deal() {
    let (_network, peers) = dealt_pair().await;

    for peer in &peers {
        let session = &peer.session;
        assert_eq!(session.phase(), GamePhase::Dealt);
        assert_eq!(session.secret_rounds().len(), 1);
        assert_eq!(session.history().len(), 1);
        assert!(!session.is_drawing());

        let table = session.table().unwrap();
        assert_eq!(table.deck.len(), 52 - 14);
        assert_eq!(session.my_hand().len(), 7);
    }

    let alice = peers[0].session.my_hand();
    let bob = peers[1].session.my_hand();
    assert!(alice.iter().all(|c| !bob.contains(c)));
    assert!(peers[0].session.is_my_turn());
}

#[tokio::test]
async fn test_rule_violations_leave_table_alone() {
    let (_network, mut peers) = dealt_pair().await;
    let before = peers[1].session.table().cloned();

    assert!(matches!(
        peers[1].session.draw_from_deck().await,
        Err(RummyError::NotYourTurn(_))
    ));
    let card = peers[0].session.my_hand()[0];
    assert!(matches!(
        peers[0].session.discard(card).await,
        Err(RummyError::MustDrawFirst)
    ));

    drive_until_idle(&mut peers).await;
    assert_eq!(peers[1].session.table().cloned(), before);
}

#[tokio::test]
async fn test_stale_table_is_dropped() {
    let (_network, mut peers) = dealt_pair().await;
    peers[0].session.draw_from_deck().await.unwrap();
    drive_until_idle(&mut peers).await;
    let card = peers[0].session.my_hand()[0];
    peers[0].session.discard(card).await.unwrap();
    drive_until_idle(&mut peers).await;

    let current = peers[1].session.table().cloned().unwrap();
    assert_eq!(current.turn, 1);
    let old = peers[1].session.history()[0].clone();
    peers[1]
        .session
        .handle_message("alice", Message::Table { table: old })
        .await
        .unwrap();
    assert_eq!(peers[1].session.table(), Some(&current));
    assert_eq!(peers[1].session.end(), None);
}

#[tokio::test]
async fn test_replayed_opening_table_is_dropped() {
    let (_network, mut peers) = dealt_pair().await;
    peers[0].session.draw_from_deck().await.unwrap();
    drive_until_idle(&mut peers).await;

    // still turn 0, but the opening table was already accepted once
    let current = peers[1].session.table().cloned().unwrap();
    assert_eq!(current.turn, 0);
    let opening = peers[1].session.history()[0].clone();
    assert_ne!(opening.deck.len(), current.deck.len());

    peers[1]
        .session
        .handle_message("alice", Message::Table { table: opening })
        .await
        .unwrap();
    assert_eq!(peers[1].session.table(), Some(&current));
    assert_eq!(peers[1].session.end(), None);
}

#[tokio::test]
async fn test_fresh_deal_mid_game_is_rejected() {
    let (_network, mut peers) = dealt_pair().await;
    peers[0].session.draw_from_deck().await.unwrap();
    drive_until_idle(&mut peers).await;
    let current = peers[0].session.table().cloned();
    let history = peers[0].session.history().to_vec();

    // a new game's table over a deck only bob encrypted
    let (_, deck) = encrypt_deck(&rules::shuffled_deck()).unwrap();
    let mut forged = Table::new(vec!["bob".into(), "alice".into()], deck, 1);
    rules::deal_opening_hands(&mut forged, 7).unwrap();

    peers[0]
        .session
        .handle_message("bob", Message::Table { table: forged })
        .await
        .unwrap();
    assert_eq!(peers[0].session.table().cloned(), current);
    assert_eq!(peers[0].session.history(), &history[..]);
    assert_eq!(peers[0].session.end(), None);
    assert_eq!(peers[0].session.phase(), GamePhase::InProgress);
}

#[tokio::test]
async fn test_first_table_must_be_opening() {
    let (_network, mut peers) = dealt_pair().await;
    let card = {
        peers[0].session.draw_from_deck().await.unwrap();
        drive_until_idle(&mut peers).await;
        peers[0].session.my_hand()[0]
    };
    peers[0].session.discard(card).await.unwrap();
    drive_until_idle(&mut peers).await;
    let later = peers[1].session.table().cloned().unwrap();
    assert_eq!(later.turn, 1);

    let network = MemoryNetwork::new();
    let (transport, _rx) = network.join("bob");
    let mut newcomer = PeerSession::new(
        Uuid::new_v4(),
        "bob",
        vec!["alice".to_string(), "bob".to_string()],
        SessionConfig::default(),
        transport,
    )
    .unwrap();
    newcomer
        .handle_message("alice", Message::Table { table: later })
        .await
        .unwrap();
    assert!(newcomer.table().is_none());
    assert_eq!(newcomer.phase(), GamePhase::AwaitingDeal);
}

#[tokio::test]
async fn test_blobs_from_before_a_reshuffle_decrypt_with_their_round() {
    let (network, mut peers) = table_of(&["ann", "ben"], SessionConfig::default()).unwrap();
    drive_until_idle(&mut peers).await;
    for _ in 0..41 {
        play_turn(&mut peers, Strategy::Passive).await.unwrap();
    }
    assert_eq!(peers[1].session.table().unwrap().round, 1);
    let hand: BTreeSet<Card> = peers[1].session.my_hand().into_iter().collect();
    assert_eq!(hand.len(), 7);

    // ben comes back having lost what it decrypted, opening hand included
    network.drop_peer("ben");
    drive_until_idle(&mut peers).await;
    let mut snapshot = peers[1].session.snapshot();
    snapshot.keys.decrypted.clear();
    let (transport, inbox) = network.join("ben");
    peers[1] = MemoryPeer {
        session: PeerSession::restore(snapshot, SessionConfig::default(), transport).unwrap(),
        inbox,
    };
    network.connect("ben");
    drive_until_idle(&mut peers).await;

    assert!(!peers[1].session.is_drawing());
    let again: BTreeSet<Card> = peers[1].session.my_hand().into_iter().collect();
    assert_eq!(again, hand);
}

#[tokio::test]
async fn test_abandoned_after_grace() {
    let (network, mut peers) = dealt_pair().await;
    let mut rx = peers[0].session.subscribe();

    network.drop_peer("bob");
    drive_until_idle(&mut peers).await;
    assert_eq!(peers[0].session.connection("bob"), ConnectionState::Disconnected);
    assert!(!peers[0].session.table().unwrap().players["bob"].connected);

    // nobody may act while a link is down
    assert!(matches!(
        peers[0].session.draw_from_deck().await,
        Err(RummyError::InvalidState(_))
    ));

    peers[0].session.check_timeouts(Utc::now());
    assert_ne!(peers[0].session.phase(), GamePhase::Abandoned);

    peers[0]
        .session
        .check_timeouts(Utc::now() + chrono::Duration::seconds(31));
    assert_eq!(peers[0].session.phase(), GamePhase::Abandoned);
    assert!(events(&mut rx)
        .iter()
        .any(|e| matches!(e, SessionEvent::Abandoned { .. })));
}

#[tokio::test]
async fn test_reconnect_cancels_abandonment() {
    let (network, mut peers) = dealt_pair().await;
    network.drop_peer("bob");
    drive_until_idle(&mut peers).await;

    let (transport, inbox) = network.join("bob");
    let snapshot = peers[1].session.snapshot();
    peers[1] = MemoryPeer {
        session: PeerSession::restore(snapshot, SessionConfig::default(), transport).unwrap(),
        inbox,
    };
    network.connect("bob");
    drive_until_idle(&mut peers).await;

    peers[0]
        .session
        .check_timeouts(Utc::now() + chrono::Duration::seconds(60));
    assert_eq!(peers[0].session.phase(), GamePhase::Dealt);
    assert_eq!(peers[1].session.my_hand().len(), 7);
    assert!(peers[0].session.draw_from_deck().await.is_ok());
}

#[tokio::test]
async fn test_snapshot_restore_keeps_keys() {
    let (_network, peers) = dealt_pair().await;
    let snapshot = peers[0].session.snapshot();
    let network = MemoryNetwork::new();
    let (transport, _rx) = network.join("alice");
    let restored = PeerSession::restore(snapshot, SessionConfig::default(), transport).unwrap();

    assert_eq!(restored.my_hand(), peers[0].session.my_hand());
    assert_eq!(restored.secret_rounds(), peers[0].session.secret_rounds());
    assert_eq!(restored.history(), peers[0].session.history());
    assert_eq!(restored.connection("bob"), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_stalled_key_request() {
    let (_network, mut peers) = dealt_pair().await;
    let mut rx = peers[0].session.subscribe();

    // bob never answers
    peers[0].session.draw_from_deck().await.unwrap();
    assert!(peers[0].session.is_drawing());

    peers[0].session.check_timeouts(Utc::now());
    assert!(!events(&mut rx)
        .iter()
        .any(|e| matches!(e, SessionEvent::KeyRequestStalled { .. })));

    peers[0]
        .session
        .check_timeouts(Utc::now() + chrono::Duration::seconds(11));
    let stalled: Vec<_> = events(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::KeyRequestStalled { peer, ids } => Some((peer, ids)),
            _ => None,
        })
        .collect();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].0, "bob");
    assert_eq!(stalled[0].1.len(), 1);

    // answering late still completes the draw
    drive_until_idle(&mut peers).await;
    assert!(!peers[0].session.is_drawing());
    assert_eq!(peers[0].session.my_hand().len(), 8);
}

#[tokio::test]
async fn test_forged_keys_fail_the_draw() {
    let (_network, mut peers) = dealt_pair().await;
    let mut rx = peers[0].session.subscribe();
    peers[0].session.draw_from_deck().await.unwrap();

    let ids = match peers[0].session.draw.as_ref() {
        Some(draw) => draw.working_ids(),
        None => panic!("draw should be waiting on bob"),
    };
    let keys = ids.into_iter().map(|id| (id, generate_key())).collect();
    let forged = Message::Keys(KeyResponse {
        from: "bob".into(),
        to: "alice".into(),
        round: 0,
        keys,
    });

    let result = peers[0].session.handle_message("bob", forged).await;
    assert!(matches!(result, Err(RummyError::Core(ref e)) if e.is_integrity_failure()));
    assert!(!peers[0].session.is_drawing());
    assert!(events(&mut rx)
        .iter()
        .any(|e| matches!(e, SessionEvent::DrawFailed { .. })));
}

#[tokio::test]
async fn test_unsolicited_keys_are_dropped() {
    let (_network, mut peers) = dealt_pair().await;
    let stray = Message::Keys(KeyResponse {
        from: "bob".into(),
        to: "alice".into(),
        round: 0,
        keys: BTreeMap::new(),
    });
    assert!(peers[0].session.handle_message("bob", stray).await.is_ok());
    assert_eq!(peers[0].session.my_hand().len(), 7);
}

#[tokio::test]
async fn test_disclosure_ends_game_for_everyone() {
    let (_network, mut peers) = dealt_pair().await;
    peers[1].session.disclose().await.unwrap();
    drive_until_idle(&mut peers).await;

    for peer in &peers {
        assert_eq!(peer.session.phase(), GamePhase::Ended);
        assert_eq!(peer.session.disclosures().len(), 2);
    }
    assert_eq!(
        peers[0].session.end(),
        Some(&GameEnd::Disclosed("bob".into()))
    );
    assert!(matches!(
        peers[0].session.draw_from_deck().await,
        Err(RummyError::GameOver)
    ));

    let report = peers[0].session.audit().unwrap();
    assert!(report.is_clean(), "{:?}", report.turns);
}

#[tokio::test]
async fn test_rematch_deals_a_new_round() {
    let (_network, mut peers) = dealt_pair().await;
    peers[0].session.disclose().await.unwrap();
    drive_until_idle(&mut peers).await;

    peers[1].session.rematch().await.unwrap();
    drive_until_idle(&mut peers).await;

    for peer in &peers {
        let table = peer.session.table().unwrap();
        assert_eq!(table.round, 1);
        assert_eq!(table.player_order, vec!["bob".to_string(), "alice".to_string()]);
        assert_eq!(peer.session.phase(), GamePhase::Dealt);
        assert_eq!(peer.session.history().len(), 1);
        assert!(peer.session.disclosures().is_empty());
        assert_eq!(peer.session.my_hand().len(), 7);
    }
    assert!(peers[1].session.is_my_turn());
}
