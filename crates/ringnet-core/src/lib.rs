//! Non-blocking peer networking and transaction routing for a distributed
//! content-addressed storage node.
//!
//! This crate owns socket lifecycle, wire framing, outbound backpressure,
//! and request/reply correlation (including relaying a reply back to
//! whichever peer originally asked for it). It does not own the `mio::Poll`
//! event loop or the id-to-peer routing index — those are injected through
//! the traits in [`traits`] so this crate can be driven by, rather than own,
//! the process's single poll loop.

pub mod error;
#[macro_use]
pub mod macros;
pub mod node;
pub mod peer;
pub mod send_queue;
pub mod socket;
pub mod testing;
pub mod traits;
pub mod transaction;
pub mod wire;

pub use error::{Error, Result};
pub use node::{Node, NodeConfig};
pub use peer::Peer;
pub use send_queue::{DrainOutcome, FileRegion, IoRequest};
pub use traits::{CommandDispatcher, RouteTable, Scheduler};
pub use transaction::{Completion, Transaction, TransactionTable};
pub use wire::{AttrHeader, CommandFlags, CommandHeader, RawId, REPLY_BIT};
