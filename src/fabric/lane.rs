// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, anyhow, bail};
use tokio::{
    io::AsyncReadExt,
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
};
use tokio_util::sync::CancellationToken;

use crate::{
    fabric::frame::{
        FRAME_COMPLETION, FrameHdr, FrameOp, read_hdr, write_frame,
    },
    proto::{error::RpmemError, persist::PERSIST_RESP_SIZE},
};

/// Completion event bits, mirroring the flags a completion queue entry
/// would carry.
pub mod event {
    pub const WRITE: u32 = 0x1;
    pub const READ: u32 = 0x2;
    pub const SEND: u32 = 0x4;
    pub const RECV: u32 = 0x8;
}

/// Client-side lane: an exclusive endpoint plus its completion state.
///
/// A lane has at most one WRITE-with-completion outstanding, at most one
/// SEND outstanding and at most one RECV posted at any moment; the
/// work-queue element counter and flushing flag enforce the TX depth
/// invariant from the data plane.
pub struct Lane {
    rd: OwnedReadHalf,
    wr: OwnedWriteHalf,

    /// Completion flags still outstanding for the current operation.
    pub pending: u32,
    /// Number of unsignaled commands in the work queue.
    pub wq_elems: usize,
    /// The work queue is waiting for a WRITE completion to drain.
    pub wq_is_flushing: bool,

    recv_buf: [u8; PERSIST_RESP_SIZE],
    recv_posted: bool,
}

impl Lane {
    pub fn new(stream: tokio::net::TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let (rd, wr) = stream.into_split();
        Ok(Self {
            rd,
            wr,
            pending: 0,
            wq_elems: 0,
            wq_is_flushing: false,
            recv_buf: [0u8; PERSIST_RESP_SIZE],
            recv_posted: false,
        })
    }

    /// Initialize the list of events the next wait will reap.
    #[inline]
    pub fn begin(&mut self, events: u32) {
        self.pending = events;
    }

    /// Post a WRITE of `payload` to `raddr`. With `completion` the peer
    /// acknowledges once the write is applied.
    pub async fn post_write(
        &mut self,
        rkey: u64,
        raddr: u64,
        payload: &[u8],
        completion: bool,
    ) -> Result<()> {
        let flags = if completion { FRAME_COMPLETION } else { 0 };
        let hdr =
            FrameHdr::rma(FrameOp::Write, flags, rkey, raddr, payload.len() as u64);
        write_frame(&mut self.wr, &hdr, payload)
            .await
            .map_err(reset)
    }

    /// Post a READ of `len` bytes from `raddr`; the payload arrives as a
    /// READ_RESP completion.
    pub async fn post_read(&mut self, rkey: u64, raddr: u64, len: u64) -> Result<()> {
        let hdr = FrameHdr::rma(FrameOp::Read, 0, rkey, raddr, len);
        write_frame(&mut self.wr, &hdr, &[]).await.map_err(reset)
    }

    /// Post a SEND carrying `payload`. The send completion is reaped at
    /// return: the buffer is reusable once the frame hit the stream.
    pub async fn post_send(&mut self, payload: &[u8]) -> Result<()> {
        let hdr = FrameHdr::msg(FrameOp::Send, payload.len() as u64);
        write_frame(&mut self.wr, &hdr, payload)
            .await
            .map_err(reset)?;
        self.pending &= !event::SEND;
        Ok(())
    }

    /// Re-arm the persist-response receive slot.
    #[inline]
    pub fn post_recv(&mut self) {
        self.recv_posted = true;
    }

    #[inline]
    pub fn recv_payload(&self) -> &[u8] {
        &self.recv_buf
    }

    /// Wait until every event in `mask` has completed, reaping whatever
    /// completions arrive in the meantime. `read_dst` receives the payload
    /// of an expected READ_RESP.
    ///
    /// Cancellation of `cancel` unblocks the wait with ECONNRESET, which is
    /// the only cancellation primitive of the data plane.
    pub async fn wait(
        &mut self,
        mask: u32,
        mut read_dst: Option<&mut [u8]>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        while self.pending & mask != 0 {
            if cancel.is_cancelled() {
                return Err(RpmemError::ConnReset.into());
            }

            let hdr = tokio::select! {
                _ = cancel.cancelled() => return Err(RpmemError::ConnReset.into()),
                res = read_hdr(&mut self.rd) => res.map_err(reset)?,
            };

            let completed = match hdr.frame_op()? {
                FrameOp::WriteAck => event::WRITE,
                FrameOp::ReadResp => {
                    let dst = read_dst
                        .as_deref_mut()
                        .ok_or_else(|| anyhow!("unexpected READ completion"))?;
                    let len = hdr.len.get() as usize;
                    if len > dst.len() {
                        bail!(
                            "READ completion longer than posted buffer -- {len}"
                        );
                    }
                    self.rd
                        .read_exact(&mut dst[..len])
                        .await
                        .map_err(|e| reset(e.into()))?;
                    event::READ
                },
                FrameOp::Send => {
                    if !self.recv_posted {
                        bail!("message received with no RECV posted");
                    }
                    if hdr.len.get() as usize != PERSIST_RESP_SIZE {
                        bail!(
                            "unexpected message size received -- {}",
                            hdr.len.get()
                        );
                    }
                    self.rd
                        .read_exact(&mut self.recv_buf)
                        .await
                        .map_err(|e| reset(e.into()))?;
                    self.recv_posted = false;
                    event::RECV
                },
                op => bail!("unexpected frame received on lane -- {op:?}"),
            };

            self.pending &= !completed;
        }

        Ok(())
    }
}

/// Any endpoint failure is a connection reset from the caller's point of
/// view; the latched errno propagates to every other lane.
fn reset(err: anyhow::Error) -> anyhow::Error {
    anyhow!(RpmemError::ConnReset).context(err)
}
