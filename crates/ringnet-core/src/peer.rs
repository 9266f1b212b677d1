//! A single peer connection: its duplicated sockets, outbound queue, and
//! outstanding-transaction table.
//!
//! The original kept one fd per peer and reused it for both directions,
//! guarded by two separate locks (`send_lock`, implicit on the receive
//! path) that nonetheless raced on the same file description under
//! concurrent epoll callbacks. Duplicating the fd at peer-creation time
//! (`socket::dup_stream`) turns that implicit sharing into two genuinely
//! independent `TcpStream`s — one under `recv`'s lock, one under `send`'s —
//! so the mutexes below guard disjoint state instead of approximating it.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use ringnet_timing::Duration;

use crate::error::{Error, Result};
use crate::send_queue::{DrainOutcome, FileRegion, IoRequest, SendQueue};
use crate::socket;
use crate::traits::Scheduler;
use crate::transaction::TransactionTable;
use crate::wire::{self, AttrHeader, CommandFlags, CommandHeader};

enum RxState {
    Header { buf: [u8; CommandHeader::WIRE_LEN], have: usize },
    Body { header: CommandHeader, buf: Vec<u8>, have: usize },
}

impl RxState {
    fn header() -> Self {
        RxState::Header { buf: [0u8; CommandHeader::WIRE_LEN], have: 0 }
    }
}

struct RecvSide {
    stream: TcpStream,
    state: RxState,
}

struct SendSide {
    stream: TcpStream,
    queue: SendQueue,
}

pub struct Peer {
    pub addr: SocketAddr,
    recv: Mutex<RecvSide>,
    send: Mutex<SendSide>,
    trans: Mutex<TransactionTable>,
    need_exit: Mutex<Option<Error>>,
    joined: AtomicBool,
    scheduler: Arc<dyn Scheduler>,
}

impl Peer {
    pub(crate) fn new(addr: SocketAddr, stream: TcpStream, scheduler: Arc<dyn Scheduler>) -> io::Result<Arc<Self>> {
        let write_dup = socket::dup_stream(&stream)?;
        Ok(Arc::new(Self {
            addr,
            recv: Mutex::new(RecvSide { stream, state: RxState::header() }),
            send: Mutex::new(SendSide { stream: write_dup, queue: SendQueue::new() }),
            trans: Mutex::new(TransactionTable::new()),
            need_exit: Mutex::new(None),
            joined: AtomicBool::new(false),
            scheduler,
        }))
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(addr: SocketAddr) -> Arc<Self> {
        use std::net::TcpListener;
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
        let local = listener.local_addr().unwrap();
        let client = TcpStream::connect(local).expect("connect loopback");
        let (server, _) = listener.accept().expect("accept loopback");
        drop(server);
        struct NoopScheduler;
        impl Scheduler for NoopScheduler {
            fn arm_read(&self, _: &Arc<Peer>) {}
            fn arm_write(&self, _: &Arc<Peer>) {}
            fn disarm_read(&self, _: &Arc<Peer>) {}
            fn disarm_write(&self, _: &Arc<Peer>) {}
        }
        Self::new(addr, client, Arc::new(NoopScheduler)).expect("construct test peer")
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.need_exit.lock().unwrap().is_some()
    }

    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::Acquire)
    }

    pub(crate) fn mark_joined(&self) {
        self.joined.store(true, Ordering::Release);
    }

    /// Registers the receive-side fd for read-readiness under `token`. A
    /// real [`Scheduler`](crate::traits::Scheduler) backed by `mio::Poll`
    /// calls this from its `arm_read`; the peer exposes the raw fd rather
    /// than the `TcpStream` itself because `recv`/`send` each own an
    /// independent duplicate and neither can be handed away without
    /// breaking the other side's access.
    pub fn register_read(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let fd = self.recv.lock().unwrap().stream.as_raw_fd();
        registry.register(&mut SourceFd(&fd), token, Interest::READABLE)
    }

    /// Registers the send-side fd for write-readiness under `token`.
    pub fn register_write(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let fd = self.send.lock().unwrap().stream.as_raw_fd();
        registry.register(&mut SourceFd(&fd), token, Interest::WRITABLE)
    }

    /// Drops the receive-side fd's registration. A no-op error from an
    /// already-deregistered or closed fd is the caller's to ignore; reset
    /// tears the peer down regardless.
    pub fn deregister_read(&self, registry: &Registry) -> io::Result<()> {
        let fd = self.recv.lock().unwrap().stream.as_raw_fd();
        registry.deregister(&mut SourceFd(&fd))
    }

    /// Drops the send-side fd's registration.
    pub fn deregister_write(&self, registry: &Registry) -> io::Result<()> {
        let fd = self.send.lock().unwrap().stream.as_raw_fd();
        registry.deregister(&mut SourceFd(&fd))
    }

    /// Records the first fatal condition observed for this peer. Returns
    /// `true` if this call set it (the caller is then responsible for
    /// driving the reset), `false` if a reset is already under way.
    pub(crate) fn mark_need_exit(&self, err: Error) -> bool {
        let mut guard = self.need_exit.lock().unwrap();
        if guard.is_none() {
            *guard = Some(err);
            true
        } else {
            false
        }
    }

    pub(crate) fn transactions(&self) -> std::sync::MutexGuard<'_, TransactionTable> {
        self.trans.lock().unwrap()
    }

    /// Number of transactions this peer currently has outstanding.
    #[must_use]
    pub fn pending_transaction_count(&self) -> usize {
        self.trans.lock().unwrap().len()
    }

    /// Queues a request for transmission, arming write-readiness. Rejects
    /// new sends once the peer has a terminal condition recorded.
    pub fn enqueue(self: &Arc<Self>, req: IoRequest) -> Result<()> {
        let mut guard = self.need_exit.lock().unwrap();
        if let Some(err) = guard.as_ref() {
            return Err(err.clone());
        }
        drop(guard);
        let mut send = self.send.lock().unwrap();
        send.queue.push_back(req);
        drop(send);
        self.scheduler.arm_write(self);
        Ok(())
    }

    pub fn send(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        self.enqueue(IoRequest { header: None, data: Some(bytes.into()), file: None })
    }

    pub fn send_data(self: &Arc<Self>, header: &[u8], data: &[u8]) -> Result<()> {
        self.enqueue(IoRequest { header: Some(header.into()), data: Some(data.into()), file: None })
    }

    pub fn send_fd(self: &Arc<Self>, header: &[u8], fd: std::os::fd::RawFd, offset: u64, size: u64) -> Result<()> {
        let owned = socket::dup_owned_fd(fd).map_err(|e| Error::Fatal(format!("dup(): {e}")))?;
        self.enqueue(IoRequest {
            header: Some(header.into()),
            data: None,
            file: Some(FileRegion { fd: owned, offset, len: size }),
        })
    }

    /// Sends a command header followed by an attribute header and body,
    /// setting `MORE` when the caller has further fragments queued.
    pub fn send_reply(self: &Arc<Self>, cmd: &CommandHeader, attr: &AttrHeader, body: &[u8], more: bool) -> Result<()> {
        let mut cmd = *cmd;
        cmd.flags = if more { cmd.flags | CommandFlags::MORE } else { cmd.flags - CommandFlags::MORE };
        cmd.size = (AttrHeader::WIRE_LEN + body.len()) as u64;
        let mut payload = Vec::with_capacity(AttrHeader::WIRE_LEN + body.len());
        payload.extend_from_slice(&attr.to_wire());
        payload.extend_from_slice(body);
        self.send_data(&cmd.to_wire(), &payload)
    }

    /// Enqueues a reply whose header has already been fully prepared
    /// (no attribute framing), used when relaying a forwarded reply.
    pub(crate) fn send_reply_raw(self: &Arc<Self>, cmd: &CommandHeader, body: &[u8]) -> Result<()> {
        let mut cmd = *cmd;
        cmd.size = body.len() as u64;
        self.send_data(&cmd.to_wire(), body)
    }

    /// Drives the outbound queue until the socket would block or it is
    /// empty, disarming write-readiness once drained.
    pub fn drain_send(self: &Arc<Self>) -> Result<DrainOutcome> {
        let mut send = self.send.lock().unwrap();
        let SendSide { stream, queue } = &mut *send;
        let outcome = queue.drain(stream)?;
        if outcome == DrainOutcome::Drained {
            drop(send);
            self.scheduler.disarm_write(self);
        }
        Ok(outcome)
    }

    /// Reads and frames as many complete commands as are available without
    /// blocking. A reply-flagged frame is handled internally against this
    /// peer's transaction table (its completion may itself enqueue sends on
    /// other peers); a request frame is returned to the caller, which owns
    /// the routing decision of whether to dispatch it locally or forward it.
    pub fn on_readable(self: &Arc<Self>, reply_wait: Duration) -> Result<Vec<(CommandHeader, Vec<u8>)>> {
        let mut frames = Vec::new();
        {
            let mut recv = self.recv.lock().unwrap();
            loop {
                match Self::read_one_step(&mut recv) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        let mut requests = Vec::new();
        for (cmd, body) in frames {
            if wire::is_reply(cmd.trans) {
                let id = wire::trans_id(cmd.trans);
                let more = cmd.flags.contains(CommandFlags::MORE);
                let trans = self.trans.lock().unwrap().take_for_reply(id, more, reply_wait);
                match trans {
                    Some(trans) => trans.complete(&cmd, &body),
                    None => tracing::debug!(peer = %self.addr, trans = id, "reply for unknown transaction"),
                }
            } else {
                requests.push((cmd, body));
            }
        }
        Ok(requests)
    }

    fn read_one_step(recv: &mut RecvSide) -> Result<Option<(CommandHeader, Vec<u8>)>> {
        loop {
            match &mut recv.state {
                RxState::Header { buf, have } => {
                    match recv.stream.read(&mut buf[*have..]) {
                        Ok(0) => return Err(Error::ConnectionReset),
                        Ok(n) => {
                            *have += n;
                            if *have == buf.len() {
                                let header = CommandHeader::from_wire(buf)?;
                                let size = header.size as usize;
                                recv.state = RxState::Body { header, buf: vec![0u8; size], have: 0 };
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(classify_recv_error(e)),
                    }
                }
                RxState::Body { header, buf, have } => {
                    if buf.is_empty() {
                        let header = *header;
                        let frame = (header, Vec::new());
                        recv.state = RxState::header();
                        return Ok(Some(frame));
                    }
                    match recv.stream.read(&mut buf[*have..]) {
                        Ok(0) => return Err(Error::ConnectionReset),
                        Ok(n) => {
                            *have += n;
                            if *have == buf.len() {
                                let header = *header;
                                let body = std::mem::take(buf);
                                recv.state = RxState::header();
                                return Ok(Some((header, body)));
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(classify_recv_error(e)),
                    }
                }
            }
        }
    }
}

fn classify_recv_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof => Error::ConnectionReset,
        _ => Error::Fatal(format!("recv(): {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000)
    }

    #[test]
    fn enqueue_arms_write_and_rejects_after_terminal() {
        let peer = Peer::new_for_test(addr());
        peer.send(b"hello").unwrap();
        assert!(peer.mark_need_exit(Error::ConnectionReset));
        let err = peer.send(b"world").unwrap_err();
        assert_eq!(err, Error::ConnectionReset);
    }

    #[test]
    fn mark_need_exit_only_takes_effect_once() {
        let peer = Peer::new_for_test(addr());
        assert!(peer.mark_need_exit(Error::Timeout));
        assert!(!peer.mark_need_exit(Error::ConnectionReset));
        assert_eq!(peer.need_exit.lock().unwrap().clone(), Some(Error::Timeout));
    }

    #[test]
    fn read_and_write_fds_register_independently_with_a_real_poll() {
        let peer = Peer::new_for_test(addr());
        let poll = mio::Poll::new().unwrap();
        peer.register_read(poll.registry(), Token(1)).unwrap();
        peer.register_write(poll.registry(), Token(2)).unwrap();
        peer.deregister_read(poll.registry()).unwrap();
        peer.deregister_write(poll.registry()).unwrap();
    }
}
