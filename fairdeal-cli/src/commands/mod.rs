use anyhow::{bail, Context, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use fairdeal_core::{Card, SessionConfig, SessionStore, Storage};
use fairdeal_rummy::audit::DecryptedTable;
use fairdeal_rummy::rules::known_hand;
use fairdeal_rummy::sim::{run_game, table_of, Strategy};
use fairdeal_rummy::{AuditReport, GameRecord, Infraction};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct SimulateOptions {
    pub players: Vec<String>,
    pub max_turns: u64,
    pub hand_size: usize,
    pub passive: bool,
    pub out: Option<PathBuf>,
}

pub fn parse_players(list: &str) -> Result<Vec<String>> {
    let players: Vec<String> = list
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    if players.len() < 2 {
        bail!("Need at least two players, got '{}'", list);
    }
    Ok(players)
}

pub async fn simulate(storage: &Storage, options: SimulateOptions, save: bool) -> Result<()> {
    let config = SessionConfig::new(options.hand_size);
    config.validate()?;
    config.validate_players(options.players.len())?;

    let names: Vec<&str> = options.players.iter().map(String::as_str).collect();
    let strategy = if options.passive {
        Strategy::Passive
    } else {
        Strategy::Greedy
    };

    println!("🃏 Dealing for {}...", names.join(", "));
    let (_network, mut peers) = table_of(&names, config)?;
    let outcome = run_game(&mut peers, strategy, options.max_turns).await?;

    println!();
    match &outcome.winner {
        Some(winner) => println!("🏆 {} went out after {} turns", winner, outcome.turns),
        None => println!("⏹️  Stopped after {} turns without a winner", outcome.turns),
    }
    println!("   Deck rounds: {}", outcome.rounds);

    let record = peers
        .first()
        .map(|peer| peer.session.game_record())
        .context("No players in the game")?;
    println!("   Game ID: {}", record.game_id);
    println!();
    print_report(&record, &record.audit(), false);

    if let Some(path) = &options.out {
        write_record(path, &record).await?;
        println!();
        println!("💾 Game record written to {}", path.display());
    }

    if save {
        let passphrase = dialoguer::Password::new()
            .with_prompt("Passphrase for the saved sessions")
            .with_confirmation("Confirm passphrase", "Passphrases don't match")
            .interact()?;

        let store = SessionStore::new(storage);
        for peer in &peers {
            store.save_session(&peer.session.snapshot(), &passphrase).await?;
            tracing::debug!("Saved session of {} in {}", peer.session.me(), record.game_id);
        }
        println!("🔐 Saved {} sessions", peers.len());
    }

    Ok(())
}

pub async fn audit_file(path: &Path, tables: bool) -> Result<()> {
    let record = read_record(path).await?;
    let report = record.audit();
    println!("🔍 Auditing game {} ({} snapshots)", record.game_id, record.history.len());
    println!();
    print_report(&record, &report, tables);

    if !report.is_clean() {
        bail!("Audit found {} infractions", report.infraction_count());
    }
    Ok(())
}

pub async fn list_sessions(storage: &Storage) -> Result<()> {
    let sessions = SessionStore::new(storage).list_sessions().await?;
    if sessions.is_empty() {
        println!("No saved sessions");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Game ID", "Player", "Players", "Turn", "Round", "Snapshots", "Saved"]);
    for session in sessions {
        table.add_row(vec![
            session.game_id.to_string(),
            session.player,
            session.players.join(", "),
            session.turn.map_or("-".to_string(), |t| t.to_string()),
            session.round.map_or("-".to_string(), |r| r.to_string()),
            session.history_len.to_string(),
            session.saved_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{}", table);
    Ok(())
}

pub async fn show_session(storage: &Storage, game_id: &str, player: &str) -> Result<()> {
    let game_id = Uuid::parse_str(game_id).context("Invalid game ID")?;
    let passphrase = dialoguer::Password::new()
        .with_prompt(format!("Passphrase for {}", player))
        .interact()?;

    let snapshot = SessionStore::new(storage)
        .load_session(&game_id, player, &passphrase)
        .await?;

    println!("🎮 Game {} as {}", snapshot.game_id, snapshot.player);
    println!("   Players: {}", snapshot.players.join(", "));
    println!("   Key rounds held: {}", snapshot.keys.secrets.len());
    println!("   Disclosures received: {}", snapshot.disclosures.len());

    let Some(current) = &snapshot.table else {
        println!("   No table dealt yet");
        return Ok(());
    };
    println!(
        "   Turn {} (round {}), {} to play{}",
        current.turn,
        current.round,
        current.whose_turn,
        if current.has_drawn { ", has drawn" } else { "" }
    );
    println!("   Deck: {} cards, pile: {}", current.deck.len(), cards(&current.pile));
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Player", "Hand", "Sets"]);
    for name in &current.player_order {
        let Some(hand) = current.hand(name) else {
            continue;
        };
        let shown = if *name == snapshot.player {
            cards(&known_hand(current, name, &snapshot.keys.decrypted))
        } else {
            format!("{} hidden, {}", hand.encrypted_cards.len(), cards(&hand.cards))
        };
        let sets: Vec<String> = hand.sets.iter().map(|set| cards(set)).collect();
        table.add_row(vec![name.clone(), shown, sets.join(" | ")]);
    }
    println!("{}", table);

    if snapshot.players.iter().all(|p| snapshot.disclosures.contains_key(p)) {
        let record = GameRecord {
            game_id: snapshot.game_id,
            players: snapshot.players.clone(),
            history: snapshot.history.clone(),
            disclosures: snapshot.disclosures.clone(),
        };
        println!();
        print_report(&record, &record.audit(), false);
    }
    Ok(())
}

pub async fn forget_session(storage: &Storage, game_id: &str, player: &str) -> Result<()> {
    let game_id = Uuid::parse_str(game_id).context("Invalid game ID")?;
    let confirmed = dialoguer::Confirm::new()
        .with_prompt(format!("Delete the keys {} holds for {}?", player, game_id))
        .default(false)
        .interact()?;
    if !confirmed {
        println!("Kept");
        return Ok(());
    }

    SessionStore::new(storage).delete_session(&game_id, player).await?;
    println!("🗑️  Deleted session of {} in {}", player, game_id);
    Ok(())
}

fn print_report(record: &GameRecord, report: &AuditReport, tables: bool) {
    if report.is_clean() {
        println!("✅ Audit clean: {} snapshots checked", report.turns.len());
    } else {
        println!(
            "❌ Audit found {} infractions, blamed: {}",
            report.infraction_count(),
            report
                .blamed_players()
                .into_iter()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let missing: Vec<&str> = record
        .players
        .iter()
        .filter(|p| !record.disclosures.contains_key(*p))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        println!("⚠️  No disclosure from: {}", missing.join(", "));
    }

    if !report.round_failures.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Round", "Player", "Layer", "Reason"]);
        for failure in &report.round_failures {
            table.add_row(vec![
                failure.round.to_string(),
                failure.player.clone(),
                failure.layer_id.map_or("-".to_string(), |id| id.to_string()),
                failure.reason.clone(),
            ]);
        }
        println!("{}", table);
    }

    let flagged: Vec<_> = report
        .turns
        .iter()
        .filter(|turn| !turn.infractions.is_empty())
        .collect();
    if !flagged.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Snapshot", "Turn", "Round", "Infraction"]);
        for turn in flagged {
            for infraction in &turn.infractions {
                table.add_row(vec![
                    turn.index.to_string(),
                    turn.turn.to_string(),
                    turn.round.to_string(),
                    describe(infraction),
                ]);
            }
        }
        println!("{}", table);
    }

    if tables {
        for (index, decrypted) in report.decrypted_history.iter().enumerate() {
            println!();
            print_decrypted(index, decrypted);
        }
    }
}

fn print_decrypted(index: usize, decrypted: &DecryptedTable) {
    println!(
        "#{} turn {} round {}: {} to play, deck {} cards, pile {}",
        index,
        decrypted.turn,
        decrypted.round,
        decrypted.whose_turn,
        decrypted.deck.len(),
        cards(&decrypted.pile)
    );

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Player", "Hand", "Sets"]);
    for name in &decrypted.player_order {
        let Some(hand) = decrypted.players.get(name) else {
            continue;
        };
        let sets: Vec<String> = hand.sets.iter().map(|set| cards(set)).collect();
        table.add_row(vec![name.clone(), cards(&hand.cards), sets.join(" | ")]);
    }
    println!("{}", table);
}

fn describe(infraction: &Infraction) -> String {
    match infraction {
        Infraction::WrongAmountOfTotalCards { found } => {
            format!("{} cards on the table", found)
        }
        Infraction::NotAllCardsAreUnique { duplicates, missing } => format!(
            "duplicated [{}], missing [{}]",
            cards(duplicates),
            cards(missing)
        ),
        Infraction::ThereIsAnInvalidSet { player, set } => {
            format!("{} holds invalid set [{}]", player, cards(set))
        }
        Infraction::Undecryptable { count } => format!("{} blobs did not decrypt", count),
    }
}

fn cards(cards: &[Card]) -> String {
    if cards.is_empty() {
        return "-".to_string();
    }
    cards
        .iter()
        .map(Card::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

async fn write_record(path: &Path, record: &GameRecord) -> Result<()> {
    let json = serde_json::to_string_pretty(record)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

async fn read_record(path: &Path) -> Result<GameRecord> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("{} is not a game record", path.display()))
}
