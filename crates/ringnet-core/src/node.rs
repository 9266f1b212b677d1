//! Node-level orchestration: peer lifecycle, transaction forwarding, and the
//! reconnect backlog.
//!
//! `Node` owns no socket directly — `RouteTable` and `Scheduler` are
//! injected collaborators (see `traits`) — but it is the one place that
//! knows how to create, forward through, and tear down a peer, matching the
//! original's `dnet_node` as the hub those operations hung off of.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ringnet_timing::{Duration, Instant, Repeater};

use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::send_queue::IoRequest;
use crate::traits::{CommandDispatcher, RouteTable, Scheduler};
use crate::transaction::{Completion, Transaction};
use crate::wire::{CommandFlags, CommandHeader, RawId};

#[derive(Clone, Copy, Debug)]
pub struct NodeConfig {
    /// How long an outstanding transaction waits for a reply before the
    /// timeout sweep fails it.
    pub trans_wait: Duration,
    /// How long `join_peer`'s synchronous handshake blocks before giving up.
    pub join_timeout: Duration,
    /// Minimum spacing between reconnect attempts to the same address.
    pub reconnect_backoff: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            trans_wait: Duration::from_secs(60),
            join_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(3),
        }
    }
}

struct ReconnectEntry {
    addr: SocketAddr,
    repeater: Repeater,
}

pub struct Node {
    pub config: NodeConfig,
    scheduler: Arc<dyn Scheduler>,
    route: Arc<dyn RouteTable>,
    peers: Mutex<Vec<Arc<Peer>>>,
    reconnect: Mutex<Vec<ReconnectEntry>>,
    trans_counter: AtomicU64,
}

impl Node {
    #[must_use]
    pub fn new(config: NodeConfig, scheduler: Arc<dyn Scheduler>, route: Arc<dyn RouteTable>) -> Arc<Self> {
        Arc::new(Self {
            config,
            scheduler,
            route,
            peers: Mutex::new(Vec::new()),
            reconnect: Mutex::new(Vec::new()),
            trans_counter: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    fn next_trans_id(&self) -> u64 {
        self.trans_counter.fetch_add(1, Ordering::Relaxed) & !crate::wire::REPLY_BIT
    }

    /// Registers a newly-accepted or newly-connected socket as a peer,
    /// rejecting a duplicate address. Arms read-readiness on success.
    pub fn create_peer(
        self: &Arc<Self>,
        addr: SocketAddr,
        stream: std::net::TcpStream,
        ids: &[RawId],
    ) -> Result<Arc<Peer>> {
        if self.route.lookup_by_addr(addr).is_some() {
            return Err(Error::AlreadyExists);
        }
        let peer = Peer::new(addr, stream, self.scheduler.clone())
            .map_err(|e| Error::Fatal(format!("peer setup failed: {e}")))?;
        self.route.insert(peer.clone(), ids)?;
        self.peers.lock().unwrap().push(peer.clone());
        peer.mark_joined();
        self.scheduler.arm_read(&peer);
        tracing::info!(peer = %addr, "peer joined");
        Ok(peer)
    }

    /// Tears a peer down: removes it from routing and the peer list, stops
    /// scheduling it, queues a reconnect attempt, and fails every
    /// outstanding transaction with `ConnectionReset`.
    pub fn reset_peer(self: &Arc<Self>, peer: &Arc<Peer>) {
        self.route.remove(peer);
        self.peers.lock().unwrap().retain(|p| !Arc::ptr_eq(p, peer));

        if peer.mark_need_exit(Error::ConnectionReset) {
            self.scheduler.disarm_write(peer);
        }
        self.scheduler.disarm_read(peer);

        self.queue_reconnect(peer.addr);

        let expired = peer.transactions().drain_all();
        tracing::info!(peer = %peer.addr, pending = expired.len(), "peer reset");
        for trans in expired {
            trans.fail(&Error::ConnectionReset);
        }
    }

    fn queue_reconnect(&self, addr: SocketAddr) {
        let mut reconnect = self.reconnect.lock().unwrap();
        if !reconnect.iter().any(|e| e.addr == addr) {
            reconnect.push(ReconnectEntry { addr, repeater: Repeater::every(self.config.reconnect_backoff) });
        }
    }

    /// Returns addresses due for a reconnect attempt, respecting the
    /// configured backoff, and stamps them as attempted.
    pub fn due_reconnects(&self) -> Vec<SocketAddr> {
        let mut reconnect = self.reconnect.lock().unwrap();
        reconnect.iter_mut().filter(|entry| entry.repeater.fired()).map(|entry| entry.addr).collect()
    }

    /// Drops a pending reconnect entry once it succeeds.
    pub fn cancel_reconnect(&self, addr: SocketAddr) {
        self.reconnect.lock().unwrap().retain(|e| e.addr != addr);
    }

    /// Allocates a transaction id, lets `build` construct the header and
    /// outbound request around that id, inserts the transaction into
    /// `target`'s table, and enqueues the request. Rolls the insertion back
    /// if the enqueue itself fails (e.g. the peer just went terminal).
    ///
    /// The id has to be threaded through `build` rather than assigned
    /// afterwards: the wire header's `trans` field and the table's lookup
    /// key must be the same value, and that value isn't known until this
    /// call allocates it.
    pub fn trans_send(
        self: &Arc<Self>,
        target: &Arc<Peer>,
        completion: Completion,
        build: impl FnOnce(u64) -> (CommandHeader, IoRequest),
    ) -> Result<u64> {
        let local_trans = self.next_trans_id();
        let (cmd, req) = build(local_trans);
        let trans = Transaction::new(local_trans, cmd, target.clone(), completion);
        target.transactions().insert(trans, self.config.trans_wait)?;
        if let Err(e) = target.enqueue(req) {
            target.transactions().remove(local_trans);
            return Err(e);
        }
        Ok(local_trans)
    }

    /// Relays a request to another peer on behalf of `requester`, so that
    /// the eventual reply is rewritten back onto `requester`'s transaction
    /// id instead of the new one allocated here.
    pub fn forward(
        self: &Arc<Self>,
        requester: &Arc<Peer>,
        remote_trans: u64,
        target: &Arc<Peer>,
        cmd: CommandHeader,
        body: &[u8],
    ) -> Result<u64> {
        let body = body.to_vec();
        self.trans_send(target, Completion::Forward { requester: requester.clone(), remote_trans }, move |local_trans| {
            let mut forwarded = cmd;
            forwarded.trans = local_trans;
            let req = IoRequest {
                header: Some(forwarded.to_wire().into()),
                data: Some(body.into_boxed_slice()),
                file: None,
            };
            (forwarded, req)
        })
    }

    /// Sweeps every known peer's transaction table for expired entries and
    /// fails them with `Timeout`. Call this periodically from the poll
    /// loop's idle tick.
    pub fn sweep_timeouts(&self) {
        let now = Instant::now();
        let peers: Vec<Arc<Peer>> = self.peers.lock().unwrap().clone();
        for peer in peers {
            let expired = peer.transactions().sweep_timeouts(now);
            for trans in expired {
                trans.fail(&Error::Timeout);
            }
        }
    }

    /// Reads whatever is available on `peer` without blocking, routing each
    /// request frame per §4.5 and resetting the peer on any fatal error.
    pub fn on_readable(self: &Arc<Self>, peer: &Arc<Peer>, dispatcher: &dyn CommandDispatcher) {
        match peer.on_readable(self.config.trans_wait) {
            Ok(requests) => {
                for (cmd, body) in requests {
                    self.route_request(peer, cmd, body, dispatcher);
                }
            }
            Err(e) => {
                tracing::warn!(peer = %peer.addr, error = %e, "receive failed, resetting peer");
                self.reset_peer(peer);
            }
        }
    }

    /// Decides whether a received request is handled locally or relayed to
    /// the peer that owns `cmd.id`, mirroring the original's
    /// `dnet_process_recv`: no known owner, the `DIRECT` flag, or the owner
    /// being the very peer that sent the request all fall through to local
    /// dispatch, so a request never bounces back to where it came from.
    fn route_request(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        cmd: CommandHeader,
        body: Vec<u8>,
        dispatcher: &dyn CommandDispatcher,
    ) {
        let direct = cmd.flags.contains(CommandFlags::DIRECT);
        let owner = if direct { None } else { self.route.lookup(&cmd.id) };
        let owner = owner.filter(|target| !Arc::ptr_eq(target, peer));
        match owner {
            Some(target) => {
                let remote_trans = cmd.trans;
                if let Err(e) = self.forward(peer, remote_trans, &target, cmd, &body) {
                    tracing::warn!(peer = %peer.addr, trans = remote_trans, error = %e, "forward submission failed, dropping request");
                }
            }
            None => dispatcher.dispatch(peer, &cmd, &body),
        }
    }

    /// Drains `peer`'s outbound queue, resetting the peer on any fatal
    /// error.
    pub fn on_writable(self: &Arc<Self>, peer: &Arc<Peer>) {
        if let Err(e) = peer.drain_send() {
            tracing::warn!(peer = %peer.addr, error = %e, "send failed, resetting peer");
            self.reset_peer(peer);
        }
    }
}
