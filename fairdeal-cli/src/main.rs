mod commands;

use clap::{Parser, Subcommand};
use fairdeal_core::Storage;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fairdeal")]
#[command(about = "Peer-to-peer rummy without a trusted dealer")]
#[command(version)]
struct Cli {
    /// Data directory for saved sessions
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a game between in-process bots, then audit it
    Simulate {
        /// Comma separated player names; the first one deals
        #[arg(short, long, default_value = "alice,bob,carol")]
        players: String,
        /// Stop after this many turns when nobody has won
        #[arg(short, long, default_value_t = 120)]
        max_turns: u64,
        /// Opening hand size
        #[arg(long, default_value_t = 7)]
        hand_size: usize,
        /// Bots never meld, so the deck runs out and gets reshuffled
        #[arg(long)]
        passive: bool,
        /// Write the game record (history and disclosures) here
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Save every player's session, keys sealed under a passphrase
        #[arg(long)]
        save: bool,
    },
    /// Audit a game record written by `simulate --out`
    Audit {
        /// Game record file
        file: PathBuf,
        /// Print every decrypted snapshot
        #[arg(long)]
        tables: bool,
    },
    /// List saved sessions
    Sessions,
    /// Open a saved session and show that player's view
    Show {
        /// Game ID
        game_id: String,
        /// Player name
        player: String,
    },
    /// Delete a saved session
    Forget {
        /// Game ID
        game_id: String,
        /// Player name
        player: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "fairdeal={},fairdeal_core={},fairdeal_rummy={}",
            log_level, log_level, log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Get data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fairdeal")
    });
    tokio::fs::create_dir_all(&data_dir).await?;
    tracing::debug!("Using data directory {}", data_dir.display());

    let storage = Storage::new(&data_dir.join("fairdeal.db")).await?;

    let result = match cli.command {
        Commands::Simulate {
            players,
            max_turns,
            hand_size,
            passive,
            out,
            save,
        } => {
            let options = commands::SimulateOptions {
                players: commands::parse_players(&players)?,
                max_turns,
                hand_size,
                passive,
                out,
            };
            commands::simulate(&storage, options, save).await
        }
        Commands::Audit { file, tables } => commands::audit_file(&file, tables).await,
        Commands::Sessions => commands::list_sessions(&storage).await,
        Commands::Show { game_id, player } => {
            commands::show_session(&storage, &game_id, &player).await
        }
        Commands::Forget { game_id, player } => {
            commands::forget_session(&storage, &game_id, &player).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
