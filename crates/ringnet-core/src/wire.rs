//! On-wire framing: command headers, attribute headers, and the id type
//! used to address both peers and stored objects.
//!
//! Every multi-byte integer on the wire is little-endian. `swap_bytes`
//! mirrors the byte-reordering step the original implementation applied at
//! the protocol boundary; it is its own inverse, which the round-trip tests
//! below pin down.

use crate::error::{Error, Result};
use bitflags::bitflags;

pub const ID_SIZE: usize = 32;

/// A 256-bit address identifying either a peer (by its announced ids) or a
/// stored object (by its content hash). Opaque bytes: never byte-swapped.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawId(pub [u8; ID_SIZE]);

impl RawId {
    pub const ZERO: Self = Self([0u8; ID_SIZE]);

    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidArgument("id must be 32 bytes"));
        }
        let mut id = [0u8; ID_SIZE];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }
}

impl std::fmt::Debug for RawId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "...")
    }
}

/// Top bit of the transaction id: set on replies, clear on requests.
pub const REPLY_BIT: u64 = 1u64 << 63;

#[inline]
#[must_use]
pub fn trans_id(trans: u64) -> u64 {
    trans & !REPLY_BIT
}

#[inline]
#[must_use]
pub fn is_reply(trans: u64) -> bool {
    trans & REPLY_BIT != 0
}

#[inline]
#[must_use]
pub fn make_reply(id: u64) -> u64 {
    (id & !REPLY_BIT) | REPLY_BIT
}

bitflags! {
    /// Per-command flags carried alongside the transaction id. `REPLY_BIT`
    /// is not one of these: it lives in the high bit of `trans` itself so
    /// that request/reply pairing survives flag stripping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct CommandFlags: u64 {
        /// More reply fragments follow; the transaction stays open.
        const MORE     = 1 << 0;
        /// Sender wants at least a terminal ack, even for a void command.
        const NEED_ACK = 1 << 1;
        /// Suppresses forwarding: process locally or fail, never relay.
        const DIRECT   = 1 << 2;
    }
}

/// Fixed-size header in front of every command's payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandHeader {
    pub id: RawId,
    pub status: i32,
    pub flags: CommandFlags,
    pub size: u64,
    pub trans: u64,
}

impl CommandHeader {
    pub const WIRE_LEN: usize = ID_SIZE + 4 + 8 + 8 + 8;

    #[must_use]
    pub fn to_wire(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        let mut off = 0;
        buf[off..off + ID_SIZE].copy_from_slice(&self.id.0);
        off += ID_SIZE;
        buf[off..off + 4].copy_from_slice(&self.status.to_le_bytes());
        off += 4;
        buf[off..off + 8].copy_from_slice(&self.flags.bits().to_le_bytes());
        off += 8;
        buf[off..off + 8].copy_from_slice(&self.size.to_le_bytes());
        off += 8;
        buf[off..off + 8].copy_from_slice(&self.trans.to_le_bytes());
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_LEN {
            return Err(Error::InvalidArgument("short command header"));
        }
        let id = RawId::from_slice(&buf[0..ID_SIZE])?;
        let mut off = ID_SIZE;
        let status = i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let flag_bits = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let size = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let trans = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        let flags = CommandFlags::from_bits_truncate(flag_bits);
        Ok(Self { id, status, flags, size, trans })
    }

    /// Byte-swaps the numeric fields in place. Applying this twice is the
    /// identity; used when relaying to/from a peer of differing endianness
    /// negotiated out of band (not modeled here).
    #[must_use]
    pub fn swap_bytes(&self) -> Self {
        Self {
            id: self.id,
            status: self.status.swap_bytes(),
            flags: CommandFlags::from_bits_retain(self.flags.bits().swap_bytes()),
            size: self.size.swap_bytes(),
            trans: self.trans.swap_bytes(),
        }
    }
}

/// Header for a single typed attribute within a command's body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttrHeader {
    pub cmd: u32,
    pub size: u64,
    pub flags: u32,
}

impl AttrHeader {
    pub const WIRE_LEN: usize = 4 + 8 + 4;

    #[must_use]
    pub fn to_wire(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[0..4].copy_from_slice(&self.cmd.to_le_bytes());
        buf[4..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_LEN {
            return Err(Error::InvalidArgument("short attribute header"));
        }
        let cmd = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let size = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        let flags = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        Ok(Self { cmd, size, flags })
    }

    #[must_use]
    pub fn swap_bytes(&self) -> Self {
        Self { cmd: self.cmd.swap_bytes(), size: self.size.swap_bytes(), flags: self.flags.swap_bytes() }
    }
}
