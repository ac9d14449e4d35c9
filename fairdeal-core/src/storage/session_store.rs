use crate::crypto::sealing::{self, SealedData};
use crate::error::{CoreError, Result};
use crate::snapshot::{KeyRing, SessionSnapshot};
use crate::storage::Storage;
use crate::types::Table;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub game_id: Uuid,
    pub player: String,
    pub players: Vec<String>,
    pub turn: Option<u64>,
    pub round: Option<u32>,
    pub history_len: usize,
    pub saved_at: DateTime<Utc>,
}

struct SessionRow {
    game_id: String,
    player: String,
    players: String,
    table_state: Option<String>,
    history: String,
    disclosures: String,
    sealed_keys: String,
    saved_at: i64,
}

pub struct SessionStore<'a> {
    storage: &'a Storage,
}

impl<'a> SessionStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Persist a snapshot. The key ring is sealed under `passphrase`.
    pub async fn save_session(&self, snapshot: &SessionSnapshot, passphrase: &str) -> Result<()> {
        let keys = serde_json::to_vec(&snapshot.keys)?;
        let sealed = sealing::seal(&keys, passphrase)?;

        let table_state = snapshot
            .table
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.storage.get_connection().await;
        conn.execute(
            "INSERT OR REPLACE INTO sessions
                (game_id, player, players, table_state, history, disclosures, sealed_keys, saved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot.game_id.to_string(),
                snapshot.player,
                serde_json::to_string(&snapshot.players)?,
                table_state,
                serde_json::to_string(&snapshot.history)?,
                serde_json::to_string(&snapshot.disclosures)?,
                serde_json::to_string(&sealed)?,
                snapshot.saved_at.timestamp(),
            ],
        )?;

        tracing::info!(
            "Saved session {} for {} ({} history entries)",
            snapshot.game_id,
            snapshot.player,
            snapshot.history.len()
        );
        Ok(())
    }

    pub async fn load_session(
        &self,
        game_id: &Uuid,
        player: &str,
        passphrase: &str,
    ) -> Result<SessionSnapshot> {
        let row = {
            let conn = self.storage.get_connection().await;
            let mut stmt = conn.prepare(
                "SELECT game_id, player, players, table_state, history, disclosures, sealed_keys, saved_at
                 FROM sessions WHERE game_id = ?1 AND player = ?2",
            )?;

            let result = stmt.query_row(params![game_id.to_string(), player], read_row);
            match result {
                Ok(row) => row,
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    return Err(CoreError::SessionNotFound {
                        game_id: game_id.to_string(),
                        player: player.to_string(),
                    })
                }
                Err(e) => return Err(CoreError::Storage(e)),
            }
        };

        let sealed: SealedData = serde_json::from_str(&row.sealed_keys)?;
        let keys: KeyRing = serde_json::from_slice(&sealing::open(&sealed, passphrase)?)?;

        Ok(SessionSnapshot {
            game_id: *game_id,
            player: row.player,
            players: serde_json::from_str(&row.players)?,
            table: row
                .table_state
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            history: serde_json::from_str(&row.history)?,
            disclosures: serde_json::from_str(&row.disclosures)?,
            keys,
            saved_at: DateTime::from_timestamp(row.saved_at, 0).unwrap_or_else(Utc::now),
        })
    }

    /// Summaries of every saved session, newest first. Key rings stay sealed.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let rows = {
            let conn = self.storage.get_connection().await;
            let mut stmt = conn.prepare(
                "SELECT game_id, player, players, table_state, history, disclosures, sealed_keys, saved_at
                 FROM sessions ORDER BY saved_at DESC",
            )?;
            let iter = stmt.query_map([], read_row)?;

            let mut rows = Vec::new();
            for row in iter {
                rows.push(row?);
            }
            rows
        };

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let table: Option<Table> = row
                .table_state
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?;
            let history: Vec<Table> = serde_json::from_str(&row.history)?;

            summaries.push(SessionSummary {
                game_id: Uuid::parse_str(&row.game_id)
                    .map_err(|e| CoreError::internal(format!("bad game id: {}", e)))?,
                player: row.player,
                players: serde_json::from_str(&row.players)?,
                turn: table.as_ref().map(|t| t.turn),
                round: table.as_ref().map(|t| t.round),
                history_len: history.len(),
                saved_at: DateTime::from_timestamp(row.saved_at, 0).unwrap_or_else(Utc::now),
            });
        }

        Ok(summaries)
    }

    pub async fn delete_session(&self, game_id: &Uuid, player: &str) -> Result<()> {
        let conn = self.storage.get_connection().await;
        conn.execute(
            "DELETE FROM sessions WHERE game_id = ?1 AND player = ?2",
            params![game_id.to_string(), player],
        )?;
        Ok(())
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        game_id: row.get(0)?,
        player: row.get(1)?,
        players: row.get(2)?,
        table_state: row.get(3)?,
        history: row.get(4)?,
        disclosures: row.get(5)?,
        sealed_keys: row.get(6)?,
        saved_at: row.get(7)?,
    })
}
