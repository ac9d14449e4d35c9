use fairdeal_core::crypto::peel_all;
use fairdeal_core::{Card, SessionConfig, DECK_SIZE};
use fairdeal_rummy::audit::cheat;
use fairdeal_rummy::sim::{drive_until_idle, play_turn, run_game, table_of, MemoryPeer, Strategy};
use fairdeal_rummy::{Cheat, GameEnd, GamePhase, Message, RummyError, SessionEvent};
use std::collections::BTreeSet;

const NAMES: [&str; 3] = ["alice", "bob", "carol"];

async fn dealt_game() -> (fairdeal_rummy::MemoryNetwork, Vec<MemoryPeer>) {
    let (network, mut peers) = table_of(&NAMES, SessionConfig::default()).unwrap();
    drive_until_idle(&mut peers).await;
    (network, peers)
}

#[tokio::test]
async fn test_three_player_deal() {
    let (_network, peers) = dealt_game().await;

    let table = peers[0].session.table().unwrap().clone();
    assert_eq!(table.deck.len(), 31);
    assert_eq!(table.turn, 0);
    assert_eq!(table.whose_turn, "alice");
    for peer in &peers {
        let mut theirs = peer.session.table().unwrap().clone();
        for hand in theirs.players.values_mut() {
            hand.connected = true;
        }
        assert_eq!(theirs, table);
        assert_eq!(table.hand(peer.session.me()).unwrap().encrypted_cards.len(), 7);
    }

    // every blob carries one layer per player, peeled last encrypter first
    let rounds: Vec<_> = peers
        .iter()
        .rev()
        .map(|p| &p.session.secret_rounds()[0])
        .collect();
    let deck_cards: BTreeSet<Card> = table
        .deck
        .iter()
        .map(|blob| peel_all(blob, rounds.iter().copied()).unwrap())
        .collect();
    assert_eq!(deck_cards.len(), 31);
    assert!(peel_all(&table.deck[0], rounds[..2].iter().copied()).is_err());

    let mut dealt = BTreeSet::new();
    for peer in &peers {
        let hand = peer.session.my_hand();
        assert_eq!(hand.len(), 7);
        dealt.extend(hand);
    }
    assert_eq!(dealt.len(), 21);
    assert!(dealt.is_disjoint(&deck_cards));
    assert_eq!(dealt.len() + deck_cards.len(), DECK_SIZE);
}

#[tokio::test]
async fn test_key_requests_carry_no_ciphertext() {
    let (network, peers) = dealt_game().await;
    let table = peers[0].session.table().unwrap();

    let hand_ciphertexts: Vec<Vec<u8>> = table
        .players
        .values()
        .flat_map(|hand| hand.encrypted_cards.iter().map(|b| b.ciphertext.clone()))
        .collect();

    let mut requests = 0;
    let mut responses = 0;
    for sent in network.transcript() {
        let json = String::from_utf8(sent.message.encode().unwrap()).unwrap();
        match &sent.message {
            Message::KeyRequest(request) => {
                requests += 1;
                assert_eq!(request.ids.len(), 7);
                assert!(!json.contains("ciphertext"));
                assert!(!json.contains("\"iv\""));
            }
            Message::Keys(response) => {
                responses += 1;
                assert_eq!(response.keys.len(), 7);
                assert_eq!(sent.to, response.to);
                assert!(!json.contains("ciphertext"));
                assert!(!json.contains("\"iv\""));
                let value: serde_json::Value = serde_json::from_str(&json).unwrap();
                let fields: BTreeSet<&str> =
                    value.as_object().unwrap().keys().map(String::as_str).collect();
                assert_eq!(fields, BTreeSet::from(["type", "from", "to", "round", "keys"]));
            }
            _ => {}
        }
    }
    // each player asks the two others once, and every request is answered
    assert_eq!(requests, 6);
    assert_eq!(responses, 6);
    assert!(!hand_ciphertexts.is_empty());
    for peer in &peers {
        assert!(!peer.session.is_drawing());
        assert_eq!(peer.session.my_hand().len(), 7);
    }
}

#[tokio::test]
async fn test_three_player_game_with_cheat_and_audit() {
    let (_network, mut peers) = dealt_game().await;
    let mut alice_events = peers[0].session.subscribe();

    // A draws from the deck and decrypts it with B's and C's keys
    peers[0].session.draw_from_deck().await.unwrap();
    drive_until_idle(&mut peers).await;
    assert_eq!(peers[0].session.my_hand().len(), 8);
    assert_eq!(peers[1].session.table().unwrap().deck.len(), 30);

    // discarding a card A does not hold is refused and nothing changes
    let before = peers[0].session.table().cloned();
    let foreign = peers[1].session.my_hand()[0];
    assert!(matches!(
        peers[0].session.discard(foreign).await,
        Err(RummyError::CardNotInHand(card)) if card == foreign
    ));
    assert_eq!(peers[0].session.table().cloned(), before);

    let card = peers[0].session.my_hand()[0];
    peers[0].session.discard(card).await.unwrap();
    drive_until_idle(&mut peers).await;
    for peer in &peers {
        let table = peer.session.table().unwrap();
        assert_eq!(table.turn, 1);
        assert_eq!(table.whose_turn, "bob");
        assert_eq!(table.pile, vec![card]);
    }

    // B claims it is C's turn without finishing its own
    let current = peers[0].session.table().unwrap().clone();
    let mut forged = current.clone();
    forged.whose_turn = "carol".into();
    assert_eq!(cheat::detect(&current, &forged), Some(Cheat::WrongPlayersTurn));

    peers[0]
        .session
        .handle_message("bob", Message::Table { table: forged })
        .await
        .unwrap();
    assert_eq!(peers[0].session.table(), Some(&current));
    assert_eq!(
        peers[0].session.end(),
        Some(&GameEnd::Cheat {
            by: "bob".into(),
            cheat: Cheat::WrongPlayersTurn
        })
    );
    let mut flagged = false;
    while let Ok(event) = alice_events.try_recv() {
        if let SessionEvent::CheatDetected { by, cheat } = event {
            assert_eq!(by, "bob");
            assert_eq!(cheat, Cheat::WrongPlayersTurn);
            flagged = true;
        }
    }
    assert!(flagged);

    // A's disclosure ends the game everywhere and the honest history audits clean
    drive_until_idle(&mut peers).await;
    for peer in &peers {
        assert_eq!(peer.session.phase(), GamePhase::Ended);
        assert_eq!(peer.session.disclosures().len(), 3);

        let report = peer.session.audit().unwrap();
        assert!(report.is_clean(), "{:?}", report.turns);
        assert_eq!(report.decrypted_history.len(), peer.session.history().len());
        for table in &report.decrypted_history {
            assert_eq!(table.unresolved, 0);
        }
    }
}

#[tokio::test]
async fn test_lying_disclosure_is_caught_by_audit() {
    let (_network, mut peers) = dealt_game().await;
    peers[0].session.draw_from_deck().await.unwrap();
    drive_until_idle(&mut peers).await;
    peers[0].session.disclose().await.unwrap();
    drive_until_idle(&mut peers).await;

    let mut record = peers[2].session.game_record();
    let carol = record.disclosures.get_mut("carol").unwrap();
    let mut forged = carol[0].clone();
    for id in forged.layer_ids().collect::<Vec<_>>() {
        forged.insert(id, fairdeal_core::crypto::generate_key());
    }
    carol[0] = forged;

    let report = record.audit();
    assert!(!report.is_clean());
    assert_eq!(report.blamed_players(), BTreeSet::from(["carol"]));
}

#[tokio::test]
async fn test_reshuffle_when_deck_runs_out() {
    let (_network, mut peers) = table_of(&["ann", "ben"], SessionConfig::default()).unwrap();
    drive_until_idle(&mut peers).await;

    // 38 cards in the deck; a passive game empties it and then flips the pile
    for _ in 0..41 {
        play_turn(&mut peers, Strategy::Passive).await.unwrap();
    }

    for peer in &peers {
        let table = peer.session.table().unwrap();
        assert_eq!(table.round, 1);
        assert_eq!(peer.session.secret_rounds().len(), 2);
        assert!(peer.session.end().is_none());
        assert!(peer
            .session
            .history()
            .windows(2)
            .any(|w| w[0].round == 0 && w[1].round == 1));
    }

    peers[1].session.disclose().await.unwrap();
    drive_until_idle(&mut peers).await;
    for peer in &peers {
        let report = peer.session.audit().unwrap();
        assert!(report.is_clean(), "{:?}", report.turns);
    }
}

#[tokio::test]
async fn test_simulated_game_ends_and_audits() {
    let (_network, mut peers) = table_of(&NAMES, SessionConfig::default()).unwrap();
    let outcome = run_game(&mut peers, Strategy::Greedy, 90).await.unwrap();

    for peer in &peers {
        assert_eq!(peer.session.phase(), GamePhase::Ended);
        let report = peer.session.audit().unwrap();
        assert!(report.is_clean(), "{:?}", report.turns);
    }
    if let Some(winner) = outcome.winner {
        assert!(NAMES.contains(&winner.as_str()));
    }
}
