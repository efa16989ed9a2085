// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use bytes::{BufMut, BytesMut};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32, U64,
    Unaligned,
};

/// Persist mode bits: flush via RDMA WRITE, durability on SEND receipt.
pub const FLUSH_WRITE: u32 = 0;
/// Deep persist: the daemon traverses to the final durability domain.
pub const DEEP_PERSIST: u32 = 1;
/// Inline persist: the data rides in the SEND payload, no prior WRITE.
pub const PERSIST_SEND: u32 = 2;
/// Schedule the command with a completion (work-queue flush hint).
pub const COMPLETION: u32 = 4;

/// The two least significant bits select the persist mode.
pub const PERSIST_MASK: u32 = 0x3;
pub const PERSIST_MAX: u32 = 2;

/// Lane-level persist message, posted via SEND on registered buffers.
/// For [`PERSIST_SEND`] the payload of `size` bytes follows the header.
#[repr(C)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
pub struct PersistMsg {
    pub flags: U32<BigEndian>,
    pub lane: U32<BigEndian>,
    pub addr: U64<BigEndian>,
    pub size: U64<BigEndian>,
}

pub const PERSIST_MSG_SIZE: usize = size_of::<PersistMsg>();

impl PersistMsg {
    pub fn new(flags: u32, lane: u32, addr: u64, size: u64) -> Self {
        Self {
            flags: U32::new(flags),
            lane: U32::new(lane),
            addr: U64::new(addr),
            size: U64::new(size),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut, inline_data: Option<&[u8]>) {
        buf.put_slice(self.as_bytes());
        if let Some(data) = inline_data {
            buf.put_slice(data);
        }
    }

    /// Split a received SEND payload into the message and the optional
    /// inline data.
    pub fn decode(payload: &[u8]) -> Result<(Self, &[u8])> {
        let Ok((msg, rest)) = Self::read_from_prefix(payload) else {
            bail!("truncated persist message -- {} bytes", payload.len());
        };
        Ok((msg, rest))
    }
}

/// Persist response echoed back on the lane the request arrived on.
#[repr(C)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
pub struct PersistResp {
    pub flags: U32<BigEndian>,
    pub lane: U32<BigEndian>,
}

pub const PERSIST_RESP_SIZE: usize = size_of::<PersistResp>();

impl PersistResp {
    pub fn new(lane: u32) -> Self {
        Self {
            flags: U32::new(0),
            lane: U32::new(lane),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let Ok(resp) = Self::read_from_bytes(payload) else {
            bail!("truncated persist response -- {} bytes", payload.len());
        };
        Ok(resp)
    }
}
