//! fairdeal rummy - peer-to-peer rummy without a trusted dealer
//!
//! Players build the deck together: each adds a layer of per-card encryption
//! and shuffles, so no single player knows the order. Drawing a card means
//! collecting one key per layer from the other players, who never see which
//! blob they helped open. At the end everyone discloses their keys and the
//! whole game can be replayed and audited.

pub mod audit;
pub mod error;
pub mod protocol;
pub mod rules;
pub mod session;
pub mod sim;
pub mod transport;

pub use audit::{audit, AuditReport, Cheat, GameRecord, Infraction};
pub use error::{Result, RummyError};
pub use protocol::{DealHop, DealKind, Disclosure, KeyRequest, KeyResponse, Message};
pub use session::{ConnectionState, GameEnd, GamePhase, PeerSession, SessionEvent};
pub use transport::{Inbound, MemoryNetwork, MemoryTransport, Transport};

pub use fairdeal_core::{Card, SessionConfig, Table};
