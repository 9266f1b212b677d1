//! In-memory stand-ins for the injected [`RouteTable`] and [`Scheduler`]
//! collaborators, for this crate's own tests and for anyone exercising
//! [`Node`](crate::Node) without a real poll loop or key-space index.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::traits::{RouteTable, Scheduler};
use crate::wire::RawId;

#[derive(Default)]
struct Inner {
    by_addr: HashMap<SocketAddr, Arc<Peer>>,
    by_id: HashMap<RawId, Arc<Peer>>,
}

/// A `RouteTable` backed by two plain hash maps. No sharding, no
/// consistent-hash placement: purely for driving `Node` in tests.
#[derive(Default)]
pub struct InMemoryRouteTable {
    inner: Mutex<Inner>,
}

impl InMemoryRouteTable {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl RouteTable for InMemoryRouteTable {
    fn lookup(&self, id: &RawId) -> Option<Arc<Peer>> {
        self.inner.lock().unwrap().by_id.get(id).cloned()
    }

    fn lookup_by_addr(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.inner.lock().unwrap().by_addr.get(&addr).cloned()
    }

    fn insert(&self, peer: Arc<Peer>, ids: &[RawId]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.by_addr.contains_key(&peer.addr) {
            return Err(Error::AlreadyExists);
        }
        inner.by_addr.insert(peer.addr, peer.clone());
        for id in ids {
            inner.by_id.insert(*id, peer.clone());
        }
        Ok(())
    }

    fn remove(&self, peer: &Arc<Peer>) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_addr.remove(&peer.addr);
        inner.by_id.retain(|_, v| !Arc::ptr_eq(v, peer));
    }
}

/// A `Scheduler` that just counts arm/disarm calls, for asserting a peer's
/// readiness registration ended up in the expected state.
#[derive(Default)]
pub struct CountingScheduler {
    pub reads_armed: AtomicUsize,
    pub writes_armed: AtomicUsize,
    pub reads_disarmed: AtomicUsize,
    pub writes_disarmed: AtomicUsize,
}

impl CountingScheduler {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Scheduler for CountingScheduler {
    fn arm_read(&self, _peer: &Arc<Peer>) {
        self.reads_armed.fetch_add(1, Ordering::Relaxed);
    }
    fn arm_write(&self, _peer: &Arc<Peer>) {
        self.writes_armed.fetch_add(1, Ordering::Relaxed);
    }
    fn disarm_read(&self, _peer: &Arc<Peer>) {
        self.reads_disarmed.fetch_add(1, Ordering::Relaxed);
    }
    fn disarm_write(&self, _peer: &Arc<Peer>) {
        self.writes_disarmed.fetch_add(1, Ordering::Relaxed);
    }
}
