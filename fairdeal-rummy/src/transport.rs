//! Peer links. A session only needs ordered, reliable delivery to each peer;
//! [`MemoryNetwork`] provides that in-process for tests and simulation.

use crate::error::{Result, RummyError};
use crate::protocol::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, to: &str, message: Message) -> Result<()>;

    /// Drop every link held by this peer.
    async fn close(&self) {}
}

/// Everything a session can receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Connecting(String),
    Connected(String),
    Disconnected(String),
    Message { from: String, message: Message },
}

/// Collapse consecutive table snapshots from one sender within one turn into
/// the last of them. Anything between them keeps the two apart.
pub fn coalesce(batch: Vec<Inbound>) -> Vec<Inbound> {
    let mut out: Vec<Inbound> = Vec::with_capacity(batch.len());
    for inbound in batch {
        if let (
            Some(Inbound::Message {
                from: last_from,
                message: Message::Table { table: last },
            }),
            Inbound::Message {
                from,
                message: Message::Table { table },
            },
        ) = (out.last(), &inbound)
        {
            if last_from == from && last.turn == table.turn && last.round == table.round {
                out.pop();
            }
        }
        out.push(inbound);
    }
    out
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub from: String,
    pub to: String,
    pub message: Message,
}

/// In-process mesh. Every message is encoded and decoded on the way through
/// so peers never share memory.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Inbound>>>>,
    transcript: Arc<Mutex<Vec<Sent>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`, replacing any earlier registration.
    pub fn join(&self, name: &str) -> (MemoryTransport, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().insert(name.to_string(), tx);
        let transport = MemoryTransport {
            name: name.to_string(),
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Open a link between every pair of registered peers.
    pub fn connect_all(&self) {
        let peers = self.peers.lock();
        for (name, tx) in peers.iter() {
            for other in peers.keys().filter(|other| *other != name) {
                let _ = tx.send(Inbound::Connecting(other.clone()));
                let _ = tx.send(Inbound::Connected(other.clone()));
            }
        }
    }

    /// Open links between `name` and every other registered peer.
    pub fn connect(&self, name: &str) {
        let peers = self.peers.lock();
        let Some(own) = peers.get(name) else {
            return;
        };
        for (other, tx) in peers.iter().filter(|(other, _)| *other != name) {
            let _ = own.send(Inbound::Connected(other.clone()));
            let _ = tx.send(Inbound::Connected(name.to_string()));
        }
    }

    /// Remove `name` and tell everyone else its links are gone.
    pub fn drop_peer(&self, name: &str) {
        let mut peers = self.peers.lock();
        if peers.remove(name).is_none() {
            return;
        }
        for tx in peers.values() {
            let _ = tx.send(Inbound::Disconnected(name.to_string()));
        }
        tracing::debug!("{} left the network", name);
    }

    /// Every message delivered so far, in send order.
    pub fn transcript(&self) -> Vec<Sent> {
        self.transcript.lock().clone()
    }
}

pub struct MemoryTransport {
    name: String,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &str, message: Message) -> Result<()> {
        let message = Message::decode(&message.encode()?)?;

        let peers = self.network.peers.lock();
        if !peers.contains_key(&self.name) {
            return Err(RummyError::transport(format!("{} is offline", self.name)));
        }
        let tx = peers
            .get(to)
            .ok_or_else(|| RummyError::transport(format!("no link to {}", to)))?;

        self.network.transcript.lock().push(Sent {
            from: self.name.clone(),
            to: to.to_string(),
            message: message.clone(),
        });
        tx.send(Inbound::Message {
            from: self.name.clone(),
            message,
        })
        .map_err(|_| RummyError::transport(format!("{} hung up", to)))
    }

    async fn close(&self) {
        self.network.drop_peer(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fairdeal_core::Table;

    fn table_msg(from: &str, turn: u64) -> Inbound {
        let mut table = Table::new(vec!["a".into(), "b".into()], Vec::new(), 0);
        table.turn = turn;
        Inbound::Message {
            from: from.into(),
            message: Message::Table { table },
        }
    }

    #[test]
    fn test_coalesce_keeps_last_of_a_turn() {
        let batch = vec![
            table_msg("a", 3),
            table_msg("a", 3),
            table_msg("a", 4),
            table_msg("b", 4),
            Inbound::Connected("c".into()),
            table_msg("b", 4),
        ];
        let out = coalesce(batch.clone());
        assert_eq!(out.len(), 5);
        assert_eq!(out[0], batch[1]);
        assert_eq!(out[1], batch[2]);
    }

    #[tokio::test]
    async fn test_memory_network_delivery() {
        let network = MemoryNetwork::new();
        let (alice, _alice_rx) = network.join("alice");
        let (_bob, mut bob_rx) = network.join("bob");

        alice.send("bob", table_msg("alice", 0).into_message()).await.unwrap();
        match bob_rx.recv().await.unwrap() {
            Inbound::Message { from, message } => {
                assert_eq!(from, "alice");
                assert_eq!(message.kind(), "table");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(network.transcript().len(), 1);

        assert!(alice.send("carol", table_msg("alice", 0).into_message()).await.is_err());

        network.drop_peer("alice");
        assert_eq!(bob_rx.recv().await.unwrap(), Inbound::Disconnected("alice".into()));
        assert!(alice.send("bob", table_msg("alice", 0).into_message()).await.is_err());
    }

    impl Inbound {
        fn into_message(self) -> Message {
            match self {
                Inbound::Message { message, .. } => message,
                _ => panic!("not a message"),
            }
        }
    }
}
