//! Collaborator interfaces the node relies on but does not implement.
//!
//! The poll loop that owns the actual `mio::Poll`/`Registry`, and the
//! key-space index that maps stored-object ids to the peer responsible for
//! them, both live outside this crate. These traits are the seam: the node
//! drives them with `arm_*`/`disarm_*` calls and route lookups, and the
//! orchestrator drives the node back with `on_readable`/`on_writable`.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::Result;
use crate::peer::Peer;
use crate::wire::{CommandHeader, RawId};

/// Registers and unregisters a peer's interest in read/write readiness.
/// Implemented by whatever owns the `mio::Poll` instance driving the
/// process; the node never touches a `Registry` directly.
pub trait Scheduler: Send + Sync {
    fn arm_read(&self, peer: &Arc<Peer>);
    fn arm_write(&self, peer: &Arc<Peer>);
    fn disarm_read(&self, peer: &Arc<Peer>);
    fn disarm_write(&self, peer: &Arc<Peer>);
}

/// The key-space index mapping object/peer ids and addresses to the peer
/// responsible for them. Lookup is read-mostly and shared across the whole
/// node; insert/remove happen only on peer join and peer reset.
pub trait RouteTable: Send + Sync {
    fn lookup(&self, id: &RawId) -> Option<Arc<Peer>>;
    fn lookup_by_addr(&self, addr: SocketAddr) -> Option<Arc<Peer>>;
    /// Registers `peer` under `addr` and, if non-empty, under each id in
    /// `ids`. Fails with `AlreadyExists` if `addr` is already registered.
    fn insert(&self, peer: Arc<Peer>, ids: &[RawId]) -> Result<()>;
    fn remove(&self, peer: &Arc<Peer>);
}

/// Handles a fully-framed, non-reply command that this node must process
/// locally (as opposed to a reply to an outstanding transaction, which the
/// node dispatches itself via the transaction table).
pub trait CommandDispatcher: Send + Sync {
    fn dispatch(&self, peer: &Arc<Peer>, cmd: &CommandHeader, body: &[u8]);
}
