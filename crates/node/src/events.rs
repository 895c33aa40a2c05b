//! Structured events flowing from peer connections to the supervisor. One
//! closed enum, one consumer: all shared-state mutation funnels through the
//! supervisor's event loop.

use specterd_primitives::hash::Hash256;
use specterd_wire::{MasternodeBroadcast, MasternodePing, PeerAddress};

/// Identity of a managed connection: remote address and port.
pub type PeerKey = (String, u16);

pub enum NodeEvent {
    NewBlock(Hash256),
    NewAddr(PeerAddress),
    NewBroadcast(Box<MasternodeBroadcast>),
    NewPingSample(Box<MasternodePing>),
    PeerDisconnect(PeerKey),
}
