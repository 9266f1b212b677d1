//! Outstanding-request bookkeeping.
//!
//! The original implementation kept two structures per peer: an id-keyed
//! tree for reply lookup and a timestamp-ordered list for the timeout
//! sweep. An `IndexMap` collapses both into one: lookup by id is its normal
//! map access, and the timeout sweep walks it front-to-back as long as
//! every insert and every fragment touch moves its entry to the back —
//! which `TransactionTable::insert` and `take_for_reply` both do. Every
//! entry gets the same configured wait, so "moved to the back most
//! recently" and "expires soonest last" coincide.
//!
//! The original's transaction carried a manually incremented `refcnt`, put
//! back twice on a terminal reply and once on a fragment, plus a
//! self-referential `priv` pointer used only by the forwarding path to find
//! its way back to the original requester. Neither survives here: an
//! `Arc<Transaction>` is the table's only strong reference, so there is
//! nothing to double-release, and `Completion::Forward` names the
//! requester explicitly instead of smuggling it through a `void *`.

use std::sync::Arc;

use indexmap::IndexMap;
use ringnet_timing::{Duration, Instant};

use crate::error::Error;
use crate::peer::Peer;
use crate::wire::{self, CommandHeader};

/// What happens when a transaction's reply (or synthetic timeout/reset)
/// arrives.
pub enum Completion {
    /// Relay the reply back to whoever made the original request, rewriting
    /// the transaction id to the one they are waiting on.
    Forward { requester: Arc<Peer>, remote_trans: u64 },
    /// Hand the reply to a caller-supplied callback.
    UserSupplied(Box<dyn Fn(&Arc<Peer>, &CommandHeader, &[u8]) + Send + Sync>),
}

pub struct Transaction {
    pub local_trans: u64,
    pub cmd: CommandHeader,
    pub target: Arc<Peer>,
    completion: Completion,
}

impl Transaction {
    #[must_use]
    pub fn new(local_trans: u64, cmd: CommandHeader, target: Arc<Peer>, completion: Completion) -> Arc<Self> {
        Arc::new(Self { local_trans, cmd, target, completion })
    }

    /// Invokes the completion with a real reply observed on the wire.
    pub fn complete(&self, reply: &CommandHeader, body: &[u8]) {
        match &self.completion {
            Completion::Forward { requester, remote_trans } => {
                let mut rewritten = *reply;
                rewritten.trans = wire::make_reply(*remote_trans);
                if let Err(e) = requester.send_reply_raw(&rewritten, body) {
                    tracing::warn!(peer = %requester.addr, error = %e, "forwarding reply failed");
                }
            }
            Completion::UserSupplied(f) => f(&self.target, reply, body),
        }
    }

    /// Invokes the completion with a synthetic reply carrying `err`, used
    /// for timeout sweeps and peer reset.
    pub fn fail(&self, err: &Error) {
        let synthetic = CommandHeader {
            id: self.cmd.id,
            status: err.as_status(),
            flags: crate::wire::CommandFlags::empty(),
            size: 0,
            trans: wire::make_reply(self.local_trans),
        };
        self.complete(&synthetic, &[]);
    }
}

struct Entry {
    trans: Arc<Transaction>,
    deadline: Instant,
}

/// Outstanding transactions for one peer, ordered by when they will expire.
#[derive(Default)]
pub struct TransactionTable {
    by_id: IndexMap<u64, Entry>,
}

impl TransactionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn insert(&mut self, trans: Arc<Transaction>, wait: Duration) -> Result<(), Error> {
        let id = trans.local_trans;
        if self.by_id.contains_key(&id) {
            return Err(Error::AlreadyExists);
        }
        self.by_id.insert(id, Entry { trans, deadline: Instant::now() + wait });
        Ok(())
    }

    /// Looks up the transaction for a reply's id. On a fragment (`more`
    /// set) the entry stays in the table with a refreshed deadline and is
    /// moved to the back; on a terminal reply it is removed outright.
    pub fn take_for_reply(&mut self, id: u64, more: bool, wait: Duration) -> Option<Arc<Transaction>> {
        if more {
            let idx = self.by_id.get_index_of(&id)?;
            let (_, entry) = self.by_id.get_index_mut(idx)?;
            entry.deadline = Instant::now() + wait;
            let trans = entry.trans.clone();
            let last = self.by_id.len() - 1;
            self.by_id.move_index(idx, last);
            Some(trans)
        } else {
            self.by_id.shift_remove(&id).map(|e| e.trans)
        }
    }

    /// Removes and returns every transaction whose deadline has passed as
    /// of `now`. Stops at the first still-live entry, relying on the
    /// head-first ordering the struct doc describes.
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<Arc<Transaction>> {
        let mut expired = Vec::new();
        loop {
            match self.by_id.get_index(0) {
                Some((_, entry)) if entry.deadline.has_elapsed(now) => {
                    let (_, entry) = self.by_id.shift_remove_index(0).expect("index 0 just observed present");
                    expired.push(entry.trans);
                }
                _ => break,
            }
        }
        expired
    }

    /// Removes a single transaction by id, regardless of reply semantics.
    /// Used to roll back an insertion whose matching enqueue failed.
    pub fn remove(&mut self, id: u64) -> Option<Arc<Transaction>> {
        self.by_id.shift_remove(&id).map(|e| e.trans)
    }

    /// Drains every remaining transaction, in insertion order, for peer
    /// teardown.
    pub fn drain_all(&mut self) -> Vec<Arc<Transaction>> {
        self.by_id.drain(..).map(|(_, e)| e.trans).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{CommandFlags, RawId};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn test_peer() -> Arc<Peer> {
        crate::peer::Peer::new_for_test(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000))
    }

    fn header(trans: u64) -> CommandHeader {
        CommandHeader { id: RawId::ZERO, status: 0, flags: CommandFlags::empty(), size: 0, trans }
    }

    fn noop_transaction(id: u64, target: Arc<Peer>) -> Arc<Transaction> {
        Transaction::new(id, header(id), target, Completion::UserSupplied(Box::new(|_, _, _| {})))
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let mut table = TransactionTable::new();
        let peer = test_peer();
        table.insert(noop_transaction(1, peer.clone()), Duration::from_secs(5)).unwrap();
        let err = table.insert(noop_transaction(1, peer), Duration::from_secs(5)).unwrap_err();
        assert_eq!(err, Error::AlreadyExists);
    }

    #[test]
    fn fragment_reply_keeps_entry_terminal_reply_removes_it() {
        let mut table = TransactionTable::new();
        let peer = test_peer();
        table.insert(noop_transaction(7, peer), Duration::from_secs(5)).unwrap();

        let fragment = table.take_for_reply(7, true, Duration::from_secs(5));
        assert!(fragment.is_some());
        assert_eq!(table.len(), 1);

        let terminal = table.take_for_reply(7, false, Duration::from_secs(5));
        assert!(terminal.is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn sweep_only_removes_expired_head_entries() {
        let mut table = TransactionTable::new();
        let peer = test_peer();
        table.insert(noop_transaction(1, peer.clone()), Duration::ZERO).unwrap();
        table.insert(noop_transaction(2, peer), Duration::from_secs(3600)).unwrap();

        let expired = table.sweep_timeouts(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].local_trans, 1);
        assert_eq!(table.len(), 1);
    }
}
