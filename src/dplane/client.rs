// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Result, anyhow};
use bytes::BytesMut;
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    client::PoolState,
    fabric::{
        self, Node,
        connect::connect_lanes,
        lane::{Lane, event},
    },
    mem::LocalMem,
    proto::{
        PersistMethod, Provider,
        error::RpmemError,
        persist::{
            COMPLETION, DEEP_PERSIST, PERSIST_MASK, PERSIST_MAX, PERSIST_SEND,
            PersistMsg,
        },
    },
    utils::{AlignedBuf, WQ_SIZE},
};

/// Everything the data plane needs from the out-of-band handshake.
#[derive(Debug, Clone, Copy)]
pub struct DataPlaneAttr {
    pub provider: Provider,
    pub max_wq_size: usize,
    pub persist_method: PersistMethod,
    pub laddr: LocalMem,
    pub size: usize,
    pub buff_size: usize,
    pub nlanes: u32,
    pub port: u16,
    pub raddr: u64,
    pub rkey: u64,
}

/// Client side of the in-band data plane: the set of lanes plus the
/// parameters negotiated for them.
pub struct DataPlane {
    state: Arc<PoolState>,

    raddr: u64,
    rkey: u64,
    laddr: LocalMem,
    size: usize,
    buff_size: usize,
    persist_method: PersistMethod,
    nlanes: u32,
    /// Negotiated TX queue depth; the number of unsignaled commands on a
    /// lane stays strictly below it.
    wq_size: usize,
    max_msg_size: usize,

    lanes: Vec<Mutex<Lane>>,
}

impl DataPlane {
    /// Connect the in-band endpoint: one stream per lane, receive slots
    /// armed. `nlanes` is clamped to what the transport supports and the
    /// final value is reported back.
    pub async fn connect(
        node: &str,
        attr: &DataPlaneAttr,
        nlanes: &mut u32,
        state: Arc<PoolState>,
    ) -> Result<Self> {
        let lanes_clamped = attr.nlanes.min(fabric::max_nlanes());
        if lanes_clamped < attr.nlanes {
            info!("number of lanes clamped to {lanes_clamped}");
        }

        // TX queue: at least what the persist method requires, at least the
        // environment override, capped by the provider limit.
        let pm_wq = fabric::wq_size(attr.persist_method, Node::Client);
        let wq_size = pm_wq.max(*WQ_SIZE as usize).min(attr.max_wq_size);

        let streams = connect_lanes(node, attr.port, lanes_clamped).await?;
        let mut lanes = Vec::with_capacity(streams.len());
        for stream in streams {
            let mut lane = Lane::new(stream)?;
            lane.post_recv();
            lanes.push(Mutex::new(lane));
        }

        *nlanes = lanes_clamped;

        Ok(Self {
            state,
            raddr: attr.raddr,
            rkey: attr.rkey,
            laddr: attr.laddr,
            size: attr.size,
            buff_size: attr.buff_size,
            persist_method: attr.persist_method,
            nlanes: lanes_clamped,
            wq_size,
            max_msg_size: fabric::MAX_MSG_SIZE,
            lanes,
        })
    }

    pub fn nlanes(&self) -> u32 {
        self.nlanes
    }

    pub fn persist_method(&self) -> PersistMethod {
        self.persist_method
    }

    /// TX queue depth, exposed for validation purposes only.
    pub fn wq_size(&self) -> usize {
        self.wq_size
    }

    fn check_closing(&self) -> Result<()> {
        if self.state.is_closing() || self.state.errno() != 0 {
            return Err(RpmemError::ConnReset.into());
        }
        Ok(())
    }

    fn check_lane(&self, lane: u32) -> Result<()> {
        if lane >= self.nlanes {
            return Err(
                RpmemError::Invalid(format!("invalid lane number -- {lane}")).into()
            );
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset >= self.size
            || offset.checked_add(len).is_none_or(|end| end > self.size)
        {
            return Err(RpmemError::Invalid(format!(
                "offset or length out of pool range -- [{offset}, {offset}+{len})"
            ))
            .into());
        }
        Ok(())
    }

    /// Perform a remote flush operation: submit the range, durability is
    /// established by a subsequent drain.
    pub async fn flush(
        &self,
        offset: usize,
        len: usize,
        lane: u32,
        flags: u32,
    ) -> Result<()> {
        debug_assert!((flags & PERSIST_MASK) <= PERSIST_MAX);
        debug_assert_ne!(flags & PERSIST_MASK, DEEP_PERSIST);

        self.check_closing()?;
        self.check_lane(lane)?;
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(());
        }

        let mut lanep = self.lanes[lane as usize].lock().await;

        let mut offset = offset;
        let mut left = len;
        let res: Result<()> = async {
            while left > 0 {
                let chunk = left.min(self.max_msg_size);
                let done = match self.persist_method {
                    // GPSPM flush is emulated by persist; drain is a no-op
                    PersistMethod::Gpspm => {
                        self.persist_gpspm(&mut lanep, offset, chunk, lane, flags)
                            .await?
                    },
                    PersistMethod::Apm => {
                        self.flush_apm(&mut lanep, offset, chunk, lane, flags).await?
                    },
                };
                offset += done;
                left -= done;
            }
            Ok(())
        }
        .await;

        self.finish_op(res)
    }

    /// Perform a remote drain operation: wait until every flush submitted
    /// on the lane is durable. Draining an idle lane is a no-op.
    pub async fn drain(&self, lane: u32) -> Result<()> {
        self.check_closing()?;
        self.check_lane(lane)?;

        let res: Result<()> = async {
            match self.persist_method {
                PersistMethod::Gpspm => Ok(()),
                PersistMethod::Apm => {
                    let mut lanep = self.lanes[lane as usize].lock().await;
                    self.drain_apm(&mut lanep, lane).await
                },
            }
        }
        .await;

        self.finish_op(res)
    }

    /// Perform a remote persist operation: flush and drain fused.
    pub async fn persist(
        &self,
        offset: usize,
        len: usize,
        lane: u32,
        flags: u32,
    ) -> Result<()> {
        debug_assert!((flags & PERSIST_MASK) <= PERSIST_MAX);

        self.check_closing()?;
        self.check_lane(lane)?;
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(());
        }

        let mut lanep = self.lanes[lane as usize].lock().await;

        let mut offset = offset;
        let mut left = len;
        let res: Result<()> = async {
            while left > 0 {
                let chunk = left.min(self.max_msg_size);
                let done = match self.persist_method {
                    PersistMethod::Gpspm => {
                        self.persist_gpspm(&mut lanep, offset, chunk, lane, flags)
                            .await?
                    },
                    PersistMethod::Apm => {
                        self.persist_apm(&mut lanep, offset, chunk, lane, flags)
                            .await?
                    },
                };
                offset += done;
                left -= done;
            }
            Ok(())
        }
        .await;

        self.finish_op(res)
    }

    /// Read back remote pool contents through a lane, chunked by the
    /// transport message limit via a page-aligned scratch buffer.
    pub async fn read(
        &self,
        buf: &mut [u8],
        offset: usize,
        lane: u32,
    ) -> Result<()> {
        self.check_closing()?;
        self.check_lane(lane)?;
        if buf.is_empty() {
            return Ok(());
        }

        let scratch_len = buf.len().min(self.max_msg_size);
        let mut scratch = AlignedBuf::zeroed(scratch_len)?;

        let mut lanep = self.lanes[lane as usize].lock().await;

        let res: Result<()> = async {
            let mut rd = 0usize;
            while rd < buf.len() {
                let chunk = (buf.len() - rd).min(scratch_len);
                let raddr = self.raddr + (offset + rd) as u64;

                lanep.begin(event::READ);
                lanep.post_read(self.rkey, raddr, chunk as u64).await?;
                lanep
                    .wait(
                        event::READ,
                        Some(&mut scratch.as_mut_slice()[..chunk]),
                        &self.state.cancel,
                    )
                    .await?;

                buf[rd..rd + chunk].copy_from_slice(&scratch.as_slice()[..chunk]);
                rd += chunk;
            }
            Ok(())
        }
        .await;

        self.finish_op(res)
    }

    /// Convert any failure after the closing flag was raised into
    /// ECONNRESET, so callers racing a shutdown observe one error.
    fn finish_op(&self, res: Result<()>) -> Result<()> {
        if self.state.is_closing() || self.state.errno() != 0 {
            return Err(RpmemError::ConnReset.into());
        }
        res
    }

    // -- GPSPM ---------------------------------------------------------------

    async fn persist_gpspm(
        &self,
        lanep: &mut Lane,
        offset: usize,
        len: usize,
        lane: u32,
        flags: u32,
    ) -> Result<usize> {
        let mut len = len;
        let mut flags = flags;
        let mode = flags & PERSIST_MASK;

        self.wq_flush_check(lanep, &mut flags).await?;

        if mode == PERSIST_SEND {
            len = len.min(self.buff_size);
            self.persist_send(lanep, offset, len, lane, flags).await?;
        } else {
            self.persist_saw(lanep, offset, len, lane, flags).await?;
        }

        wq_set_empty(lanep);
        Ok(len)
    }

    // -- APM -----------------------------------------------------------------

    async fn flush_apm(
        &self,
        lanep: &mut Lane,
        offset: usize,
        len: usize,
        lane: u32,
        flags: u32,
    ) -> Result<usize> {
        let mut len = len;
        let mut flags = flags;
        let mode = flags & PERSIST_MASK;

        self.wq_flush_check(lanep, &mut flags).await?;

        if mode == PERSIST_SEND {
            len = len.min(self.buff_size);
            self.persist_send(lanep, offset, len, lane, flags).await?;
        } else {
            self.flush_raw(lanep, offset, len, flags).await?;
        }

        lanep.wq_elems += 1;
        Ok(len)
    }

    async fn drain_apm(&self, lanep: &mut Lane, _lane: u32) -> Result<()> {
        if lanep.wq_is_flushing {
            self.wq_flush_wait(lanep).await?;
        }

        self.drain_raw(lanep).await?;
        // successful drain means the work queue is empty
        wq_set_empty(lanep);
        Ok(())
    }

    async fn persist_apm(
        &self,
        lanep: &mut Lane,
        offset: usize,
        len: usize,
        lane: u32,
        flags: u32,
    ) -> Result<usize> {
        let mut len = len;
        let mut flags = flags;
        let mode = flags & PERSIST_MASK;

        self.wq_flush_check(lanep, &mut flags).await?;

        if mode == DEEP_PERSIST {
            self.persist_saw(lanep, offset, len, lane, flags).await?;
        } else if mode == PERSIST_SEND {
            len = len.min(self.buff_size);
            self.persist_send(lanep, offset, len, lane, flags).await?;
        } else {
            self.persist_raw(lanep, offset, len, flags).await?;
        }

        wq_set_empty(lanep);
        Ok(len)
    }

    // -- primitive operations ------------------------------------------------

    /// Flush via RMA WRITE, with a completion when the work queue is about
    /// to fill.
    async fn flush_raw(
        &self,
        lanep: &mut Lane,
        offset: usize,
        len: usize,
        flags: u32,
    ) -> Result<()> {
        let completion = flags & COMPLETION != 0;
        if completion {
            lanep.begin(event::WRITE);
        }

        let src = self.laddr.slice(offset, len)?;
        lanep
            .post_write(self.rkey, self.raddr + offset as u64, src, completion)
            .await?;

        if completion {
            lanep.wq_is_flushing = true;
        }
        Ok(())
    }

    /// Drain via an 8-byte RMA READ: a read-after-write fence on the lane.
    async fn drain_raw(&self, lanep: &mut Lane) -> Result<()> {
        let mut raw = [0u8; 8];

        lanep.begin(event::READ);
        lanep.post_read(self.rkey, self.raddr, raw.len() as u64).await?;
        lanep
            .wait(event::READ, Some(&mut raw), &self.state.cancel)
            .await
            .map_err(|e| anyhow!(e).context("waiting for READ completion failed"))
    }

    /// Persist via READ-after-WRITE.
    async fn persist_raw(
        &self,
        lanep: &mut Lane,
        offset: usize,
        len: usize,
        flags: u32,
    ) -> Result<()> {
        self.flush_raw(lanep, offset, len, flags).await?;

        // flush the work queue prior to posting a subsequent message
        if flags & COMPLETION != 0 {
            self.wq_inc_and_flush(lanep).await?;
        }

        self.drain_raw(lanep).await
    }

    /// Persist via SEND-after-WRITE: the daemon flushes the written range
    /// and acknowledges on the lane.
    async fn persist_saw(
        &self,
        lanep: &mut Lane,
        offset: usize,
        len: usize,
        lane: u32,
        flags: u32,
    ) -> Result<()> {
        lanep
            .wait(event::SEND, None, &self.state.cancel)
            .await
            .map_err(|e| anyhow!(e).context("waiting for SEND completion failed"))?;

        let completion = flags & COMPLETION != 0;
        if completion {
            lanep.begin(event::WRITE);
        }
        let src = self.laddr.slice(offset, len)?;
        lanep
            .post_write(self.rkey, self.raddr + offset as u64, src, completion)
            .await?;

        if completion {
            self.wq_inc_and_flush(lanep).await?;
        }

        lanep.begin(event::RECV | event::SEND);

        let msg = PersistMsg::new(
            flags & PERSIST_MASK,
            lane,
            self.raddr + offset as u64,
            len as u64,
        );
        let mut buf = BytesMut::new();
        msg.encode(&mut buf, None);
        lanep.post_send(&buf).await?;

        lanep
            .wait(event::RECV, None, &self.state.cancel)
            .await
            .map_err(|e| anyhow!(e).context("waiting for RECV completion failed"))?;

        lanep.post_recv();
        Ok(())
    }

    /// Persist with the data inlined in the SEND payload; no prior WRITE.
    async fn persist_send(
        &self,
        lanep: &mut Lane,
        offset: usize,
        len: usize,
        lane: u32,
        flags: u32,
    ) -> Result<()> {
        debug_assert!(len <= self.buff_size);

        lanep
            .wait(event::SEND, None, &self.state.cancel)
            .await
            .map_err(|e| anyhow!(e).context("waiting for SEND completion failed"))?;

        lanep.begin(event::RECV | event::SEND);

        let msg =
            PersistMsg::new(flags, lane, self.raddr + offset as u64, len as u64);
        let data = self.laddr.slice(offset, len)?;
        let mut buf = BytesMut::with_capacity(size_of::<PersistMsg>() + len);
        msg.encode(&mut buf, Some(data));
        lanep.post_send(&buf).await?;

        lanep
            .wait(event::RECV, None, &self.state.cancel)
            .await
            .map_err(|e| anyhow!(e).context("waiting for RECV completion failed"))?;

        lanep.post_recv();
        Ok(())
    }

    // -- work queue management -----------------------------------------------

    /// Before posting, decide whether the queue needs a completion on this
    /// WRITE (it is about to fill) or is already flushing (wait first).
    async fn wq_flush_check(&self, lanep: &mut Lane, flags: &mut u32) -> Result<()> {
        if lanep.wq_is_flushing {
            return self.wq_flush_wait(lanep).await;
        }

        debug_assert!(lanep.wq_elems < self.wq_size);
        if lanep.wq_elems + 1 == self.wq_size {
            *flags |= COMPLETION;
        }
        Ok(())
    }

    /// Wait for the flushing WRITE completion; afterwards the queue is
    /// empty and can accept subsequent commands.
    async fn wq_flush_wait(&self, lanep: &mut Lane) -> Result<()> {
        debug_assert_eq!(lanep.wq_elems, self.wq_size);
        debug_assert!(lanep.wq_is_flushing);

        lanep
            .wait(event::WRITE, None, &self.state.cancel)
            .await
            .map_err(|e| anyhow!(e).context("waiting for WRITE completion failed"))?;

        lanep.wq_is_flushing = false;
        wq_set_empty(lanep);
        Ok(())
    }

    async fn wq_inc_and_flush(&self, lanep: &mut Lane) -> Result<()> {
        lanep.wq_elems += 1;
        lanep.wq_is_flushing = true;
        self.wq_flush_wait(lanep).await
    }
}

#[inline]
fn wq_set_empty(lanep: &mut Lane) {
    debug_assert!(!lanep.wq_is_flushing);
    lanep.wq_elems = 0;
}
