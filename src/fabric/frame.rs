// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32, U64,
    Unaligned,
};

use crate::fabric::MAX_MSG_SIZE;

/// Operations of the lane transport. WRITE/READ/SEND are posted by the
/// peer that owns the lane; WRITE_ACK/READ_RESP are transport-generated
/// completions; SEND flows in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameOp {
    Write = 1,
    Read = 2,
    Send = 3,
    WriteAck = 4,
    ReadResp = 5,
}

impl FrameOp {
    fn from_wire(raw: u32) -> Result<Self> {
        Ok(match raw {
            1 => Self::Write,
            2 => Self::Read,
            3 => Self::Send,
            4 => Self::WriteAck,
            5 => Self::ReadResp,
            other => bail!("unknown lane frame op -- {other}"),
        })
    }
}

/// WRITE flag: generate a completion once the write has been applied.
pub const FRAME_COMPLETION: u32 = 0x1;

/// Fixed 32-byte frame header. RMA frames (WRITE/READ) carry the remote
/// key and target address; message frames leave them zero. `len` counts
/// the payload bytes following the header.
#[repr(C)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
pub struct FrameHdr {
    pub op: U32<BigEndian>,
    pub flags: U32<BigEndian>,
    pub rkey: U64<BigEndian>,
    pub addr: U64<BigEndian>,
    pub len: U64<BigEndian>,
}

pub const FRAME_HDR_SIZE: usize = size_of::<FrameHdr>();

impl FrameHdr {
    pub fn rma(op: FrameOp, flags: u32, rkey: u64, addr: u64, len: u64) -> Self {
        Self {
            op: U32::new(op as u32),
            flags: U32::new(flags),
            rkey: U64::new(rkey),
            addr: U64::new(addr),
            len: U64::new(len),
        }
    }

    pub fn msg(op: FrameOp, len: u64) -> Self {
        Self::rma(op, 0, 0, 0, len)
    }

    pub fn frame_op(&self) -> Result<FrameOp> {
        FrameOp::from_wire(self.op.get())
    }
}

/// Read one frame header, enforcing the transport's message size limit
/// before any payload is touched.
pub async fn read_hdr<R>(rd: &mut R) -> Result<FrameHdr>
where R: AsyncRead + Unpin {
    let mut buf = [0u8; FRAME_HDR_SIZE];
    rd.read_exact(&mut buf).await?;
    let hdr = FrameHdr::read_from_bytes(&buf)
        .map_err(|e| anyhow::anyhow!("malformed frame header: {e}"))?;
    if hdr.len.get() > MAX_MSG_SIZE as u64 {
        bail!("frame payload exceeds max message size -- {}", hdr.len.get());
    }
    hdr.frame_op()?;
    Ok(hdr)
}

/// Write a frame header followed by its payload.
pub async fn write_frame<W>(wr: &mut W, hdr: &FrameHdr, payload: &[u8]) -> Result<()>
where W: AsyncWrite + Unpin {
    debug_assert_eq!(hdr.len.get() as usize, payload.len());
    wr.write_all(hdr.as_bytes()).await?;
    if !payload.is_empty() {
        wr.write_all(payload).await?;
    }
    wr.flush().await?;
    Ok(())
}
