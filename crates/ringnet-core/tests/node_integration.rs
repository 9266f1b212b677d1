use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant as StdInstant};

use ringnet_core::testing::{CountingScheduler, InMemoryRouteTable};
use ringnet_core::wire::{self, AttrHeader, CommandFlags, CommandHeader, RawId};
use ringnet_core::{Completion, DrainOutcome, IoRequest, Node, NodeConfig, Peer};

/// A dispatcher that just records every request it sees, for assertions.
#[derive(Default)]
struct RecordingDispatcher {
    seen: Mutex<Vec<(CommandHeader, Vec<u8>)>>,
}

impl ringnet_core::CommandDispatcher for RecordingDispatcher {
    fn dispatch(&self, _peer: &Arc<Peer>, cmd: &CommandHeader, body: &[u8]) {
        self.seen.lock().unwrap().push((*cmd, body.to_vec()));
    }
}

fn noop_dispatcher() -> RecordingDispatcher {
    RecordingDispatcher::default()
}

fn new_test_node() -> (Arc<Node>, Arc<CountingScheduler>) {
    let scheduler = CountingScheduler::new();
    let route = InMemoryRouteTable::new();
    let node = Node::new(NodeConfig::default(), scheduler.clone(), route);
    (node, scheduler)
}

/// Builds a connected loopback pair: `peer_side` becomes a `ringnet_core`
/// peer registered on `node`; `raw_side` is a plain socket the test drives
/// directly to feed frames in and read replies out.
fn loopback_peer(node: &Arc<Node>, addr_tag: u16) -> (Arc<Peer>, TcpStream, SocketAddr) {
    loopback_peer_with_ids(node, addr_tag, &[])
}

/// Same as `loopback_peer`, but registers `ids` as owned by the new peer in
/// `node`'s route table.
fn loopback_peer_with_ids(node: &Arc<Node>, addr_tag: u16, ids: &[RawId]) -> (Arc<Peer>, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let local = listener.local_addr().unwrap();
    let raw_side = TcpStream::connect(local).unwrap();
    let (accepted, peer_addr) = listener.accept().unwrap();
    accepted.set_nonblocking(true).unwrap();
    let tagged_addr = SocketAddr::new(peer_addr.ip(), addr_tag);
    let peer = node.create_peer(tagged_addr, accepted, ids).unwrap();
    (peer, raw_side, tagged_addr)
}

fn write_frame(stream: &mut TcpStream, cmd: &CommandHeader, body: &[u8]) {
    stream.write_all(&cmd.to_wire()).unwrap();
    stream.write_all(body).unwrap();
}

fn read_frame(stream: &mut TcpStream) -> (CommandHeader, Vec<u8>) {
    let mut header_buf = [0u8; CommandHeader::WIRE_LEN];
    stream.read_exact(&mut header_buf).unwrap();
    let header = CommandHeader::from_wire(&header_buf).unwrap();
    let mut body = vec![0u8; header.size as usize];
    stream.read_exact(&mut body).unwrap();
    (header, body)
}

fn wait_until(mut f: impl FnMut() -> bool, timeout: StdDuration) {
    let deadline = StdInstant::now() + timeout;
    while !f() {
        if StdInstant::now() >= deadline {
            panic!("condition not met within timeout");
        }
        std::thread::sleep(StdDuration::from_millis(5));
    }
}

#[test]
fn local_request_is_dispatched_not_treated_as_reply() {
    let (node, _scheduler) = new_test_node();
    let (peer, mut raw, _addr) = loopback_peer(&node, 1);

    let cmd = CommandHeader {
        id: RawId([1u8; wire::ID_SIZE]),
        status: 0,
        flags: CommandFlags::NEED_ACK,
        size: 4,
        trans: 55,
    };
    write_frame(&mut raw, &cmd, b"ping");

    let dispatcher = noop_dispatcher();
    wait_until(
        || {
            node.on_readable(&peer, &dispatcher);
            !dispatcher.seen.lock().unwrap().is_empty()
        },
        StdDuration::from_secs(2),
    );

    let seen = dispatcher.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0.trans, 55);
    assert_eq!(seen[0].1, b"ping");
}

#[test]
fn duplicate_peer_address_is_rejected() {
    let (node, _scheduler) = new_test_node();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let local = listener.local_addr().unwrap();
    let first = TcpStream::connect(local).unwrap();
    let (accepted_first, addr) = listener.accept().unwrap();
    accepted_first.set_nonblocking(true).unwrap();
    node.create_peer(addr, accepted_first, &[]).unwrap();

    let second = TcpStream::connect(local).unwrap();
    let (accepted_second, _) = listener.accept().unwrap();
    accepted_second.set_nonblocking(true).unwrap();
    let err = node.create_peer(addr, accepted_second, &[]).unwrap_err();
    assert_eq!(err, ringnet_core::Error::AlreadyExists);
    drop(first);
    drop(second);
}

#[test]
fn forwarded_request_relays_reply_back_to_requester() {
    let (node, _scheduler) = new_test_node();
    let (requester, mut requester_raw, _) = loopback_peer(&node, 10);
    let owned_id = RawId([2u8; wire::ID_SIZE]);
    let (target, mut target_raw, _) = loopback_peer_with_ids(&node, 11, &[owned_id]);

    let original = CommandHeader { id: owned_id, status: 0, flags: CommandFlags::empty(), size: 5, trans: 900 };
    write_frame(&mut requester_raw, &original, b"write");

    // `target` owns `owned_id`, so the node must route this request there on
    // its own — the test never calls `Node::forward` itself.
    let dispatcher = noop_dispatcher();
    wait_until(
        || {
            node.on_readable(&requester, &dispatcher);
            node.on_writable(&target);
            requester_raw.set_read_timeout(Some(StdDuration::from_millis(1))).unwrap();
            target_raw.set_read_timeout(Some(StdDuration::from_millis(20))).unwrap();
            let mut probe = [0u8; 1];
            matches!(target_raw.peek(&mut probe), Ok(n) if n > 0)
        },
        StdDuration::from_secs(2),
    );
    target_raw.set_read_timeout(None).unwrap();
    assert!(dispatcher.seen.lock().unwrap().is_empty(), "owned request must not be dispatched locally");

    let (target_got, target_body) = read_frame(&mut target_raw);
    assert_ne!(target_got.trans, 900, "forwarded request gets a freshly allocated local transaction id");
    assert_eq!(target_body, b"write");
    let local_trans = target_got.trans;

    let reply = CommandHeader {
        id: target_got.id,
        status: 0,
        flags: CommandFlags::empty(),
        size: 2,
        trans: wire::make_reply(local_trans),
    };
    write_frame(&mut target_raw, &reply, b"ok");

    let forward_dispatcher = noop_dispatcher();
    wait_until(
        || {
            node.on_readable(&target, &forward_dispatcher);
            node.on_writable(&requester);
            requester_raw.set_read_timeout(Some(StdDuration::from_millis(20))).unwrap();
            let mut probe = [0u8; 1];
            match requester_raw.peek(&mut probe) {
                Ok(n) => n > 0,
                Err(_) => false,
            }
        },
        StdDuration::from_secs(2),
    );

    requester_raw.set_read_timeout(None).unwrap();
    let (reply_cmd, reply_body) = read_frame(&mut requester_raw);
    assert_eq!(wire::trans_id(reply_cmd.trans), 900);
    assert!(wire::is_reply(reply_cmd.trans));
    assert_eq!(reply_body, b"ok");
}

#[test]
fn multi_fragment_reply_keeps_transaction_open_until_terminal() {
    let (node, _scheduler) = new_test_node();
    let (peer, mut raw, _) = loopback_peer(&node, 20);

    let received: Arc<Mutex<Vec<(i32, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();
    let completion = Completion::UserSupplied(Box::new(move |_peer, reply, _body| {
        received_clone.lock().unwrap().push((reply.status, reply.flags.contains(CommandFlags::MORE)));
    }));
    let local_trans = node
        .trans_send(&peer, completion, |local_trans| {
            let cmd = CommandHeader {
                id: RawId::ZERO,
                status: 0,
                flags: CommandFlags::empty(),
                size: 0,
                trans: local_trans,
            };
            let req = IoRequest { header: Some(cmd.to_wire().into()), data: None, file: None };
            (cmd, req)
        })
        .unwrap();

    assert_eq!(peer.pending_transaction_count(), 1);

    let fragment = CommandHeader {
        id: RawId::ZERO,
        status: 1,
        flags: CommandFlags::MORE,
        size: 0,
        trans: wire::make_reply(local_trans),
    };
    write_frame(&mut raw, &fragment, &[]);

    let dispatcher = noop_dispatcher();
    wait_until(
        || {
            node.on_readable(&peer, &dispatcher);
            received.lock().unwrap().len() == 1
        },
        StdDuration::from_secs(2),
    );
    assert_eq!(peer.pending_transaction_count(), 1, "fragment reply must not remove the transaction");

    let terminal = CommandHeader {
        id: RawId::ZERO,
        status: 2,
        flags: CommandFlags::empty(),
        size: 0,
        trans: wire::make_reply(local_trans),
    };
    write_frame(&mut raw, &terminal, &[]);

    wait_until(
        || {
            node.on_readable(&peer, &dispatcher);
            received.lock().unwrap().len() == 2
        },
        StdDuration::from_secs(2),
    );
    assert_eq!(peer.pending_transaction_count(), 0, "terminal reply must remove the transaction");

    let got = received.lock().unwrap();
    assert_eq!(got[0], (1, true));
    assert_eq!(got[1], (2, false));
}

#[test]
fn reset_peer_fails_pending_transactions_and_disarms_scheduling() {
    let (node, scheduler) = new_test_node();
    let (peer, _raw, _) = loopback_peer(&node, 30);

    let statuses: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let statuses_clone = statuses.clone();
    let completion = Completion::UserSupplied(Box::new(move |_peer, reply, _body| {
        statuses_clone.lock().unwrap().push(reply.status);
    }));
    node.trans_send(&peer, completion, |local_trans| {
        let cmd = CommandHeader { id: RawId::ZERO, status: 0, flags: CommandFlags::empty(), size: 0, trans: local_trans };
        let req = IoRequest { header: Some(cmd.to_wire().into()), data: None, file: None };
        (cmd, req)
    })
    .unwrap();

    assert_eq!(node.peer_count(), 1);
    node.reset_peer(&peer);
    assert_eq!(node.peer_count(), 0);
    assert!(peer.is_terminal());
    assert_eq!(statuses.lock().unwrap().as_slice(), &[ringnet_core::Error::ConnectionReset.as_status()]);
    assert_eq!(scheduler.reads_disarmed.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[test]
fn send_resumes_after_would_block() {
    let (node, _scheduler) = new_test_node();
    let (peer, mut raw, _) = loopback_peer(&node, 40);

    let payload = vec![0xABu8; 4 * 1024 * 1024];
    let attr = AttrHeader { cmd: 1, size: payload.len() as u64, flags: 0 };
    let cmd = CommandHeader {
        id: RawId::ZERO,
        status: 0,
        flags: CommandFlags::empty(),
        size: 0,
        trans: 1,
    };
    peer.send_reply(&cmd, &attr, &payload, false).unwrap();

    let first = peer.drain_send().unwrap();
    assert_eq!(first, DrainOutcome::WouldBlock, "4MiB without a reader should not fit in one pass");

    let mut total_read = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    raw.set_read_timeout(Some(StdDuration::from_millis(200))).unwrap();
    let expected = CommandHeader::WIRE_LEN + AttrHeader::WIRE_LEN + payload.len();
    let deadline = StdInstant::now() + StdDuration::from_secs(10);
    loop {
        match raw.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => total_read += n,
            Err(_) => {}
        }
        let _ = peer.drain_send();
        if total_read >= expected || StdInstant::now() >= deadline {
            break;
        }
    }
    assert_eq!(total_read, expected);
}
