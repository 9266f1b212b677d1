//! Per-peer outbound queue.
//!
//! Every queued request is a header, an optional in-memory body, and an
//! optional file region, sent in that order. `offset` tracks how far into
//! the *concatenation* of those three regions the head request has
//! progressed, so a partial write can resume exactly where a previous
//! `WouldBlock` left off without re-deriving which region it was in.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, OwnedFd};

use crate::error::Error;
use crate::socket;

/// A file-backed region to be transmitted with `sendfile`. `fd` is an
/// owned duplicate so the caller's original fd can be closed independently.
pub struct FileRegion {
    pub fd: OwnedFd,
    pub offset: u64,
    pub len: u64,
}

/// One queued unit of outbound data: a header, an optional body, and/or a
/// file region. At least one of the three should be present.
#[derive(Default)]
pub struct IoRequest {
    pub header: Option<Box<[u8]>>,
    pub data: Option<Box<[u8]>>,
    pub file: Option<FileRegion>,
}

impl IoRequest {
    #[must_use]
    pub fn header_len(&self) -> u64 {
        self.header.as_ref().map_or(0, |h| h.len() as u64)
    }

    #[must_use]
    pub fn data_len(&self) -> u64 {
        self.data.as_ref().map_or(0, |d| d.len() as u64)
    }

    #[must_use]
    pub fn file_len(&self) -> u64 {
        self.file.as_ref().map_or(0, |f| f.len)
    }

    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.header_len() + self.data_len() + self.file_len()
    }
}

/// Outcome of a single `drain` call, telling the caller whether the
/// write-readiness registration should stay armed.
#[derive(Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The queue was already empty; nothing to do.
    Idle,
    /// The socket would block; some data remains queued.
    WouldBlock,
    /// Every queued request was fully transmitted.
    Drained,
}

#[derive(Default)]
pub struct SendQueue {
    queue: VecDeque<IoRequest>,
    offset: u64,
}

impl SendQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, req: IoRequest) {
        self.queue.push_back(req);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Attempts to transmit as much of the queue as the socket will accept
    /// without blocking, advancing past fully-sent requests and stopping at
    /// the first `WouldBlock` or the first real error.
    pub fn drain(&mut self, stream: &mut TcpStream) -> Result<DrainOutcome, Error> {
        if self.queue.is_empty() {
            return Ok(DrainOutcome::Idle);
        }
        loop {
            let Some(head) = self.queue.front() else {
                return Ok(DrainOutcome::Drained);
            };
            let header_len = head.header_len();
            let data_len = head.data_len();
            let total = head.total_len();

            let sent = if self.offset < header_len {
                let header = head.header.as_ref().unwrap();
                self.write_slice(stream, &header[self.offset as usize..])
            } else if self.offset < header_len + data_len {
                let data = head.data.as_ref().unwrap();
                let rel = (self.offset - header_len) as usize;
                self.write_slice(stream, &data[rel..])
            } else {
                let file = head.file.as_ref().expect("region past header+data implies a file region");
                let rel = self.offset - header_len - data_len;
                self.write_file(stream, file, rel)
            };

            match sent {
                Ok(0) => return Err(Error::ConnectionReset),
                Ok(n) => {
                    self.offset += n as u64;
                    if self.offset >= total {
                        self.queue.pop_front();
                        self.offset = 0;
                        if self.queue.is_empty() {
                            return Ok(DrainOutcome::Drained);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(DrainOutcome::WouldBlock),
                Err(e) => return Err(classify_send_error(e)),
            }
        }
    }

    fn write_slice(&self, stream: &mut TcpStream, buf: &[u8]) -> io::Result<usize> {
        stream.write(buf)
    }

    fn write_file(&self, stream: &mut TcpStream, file: &FileRegion, rel: u64) -> io::Result<usize> {
        let mut off = (file.offset + rel) as libc::off_t;
        let remaining = (file.len - rel) as usize;
        socket::sendfile(stream.as_raw_fd(), file.fd.as_raw_fd(), &mut off, remaining)
    }

    /// Drops every queued request, for use when a peer is being torn down
    /// and queued sends will never complete.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.offset = 0;
    }
}

fn classify_send_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => {
            Error::ConnectionReset
        }
        _ => Error::Fatal(format!("send(): {e}")),
    }
}
