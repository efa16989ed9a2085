// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result, bail};
use tokio::{
    io::AsyncReadExt,
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use zerocopy::IntoBytes;

use crate::{
    daemon::policy::{FlushFn, MemcpyFn, PmPolicy},
    fabric::{
        self, ACCEPT_TIMEOUT, CQ_WAIT, Node,
        accept::Listener,
        frame::{FRAME_COMPLETION, FrameHdr, FrameOp, read_hdr, write_frame},
    },
    mem::Region,
    proto::{
        POOL_HDR_SIZE, PersistMethod, Provider,
        common::RespAttr,
        persist::{
            DEEP_PERSIST, PERSIST_MASK, PERSIST_MSG_SIZE, PERSIST_SEND, PersistMsg,
            PersistResp,
        },
    },
};

/// Server-side deep-flush callback: traverses to the final durability
/// domain of the pool backing.
pub type DeepFn = Arc<dyn Fn(usize, usize) -> Result<()> + Send + Sync>;

/// Attributes for bringing up the daemon side of the data plane.
pub struct InbandAttr {
    pub region: Region,
    pub nlanes: u32,
    pub nthreads: usize,
    pub provider: Provider,
    pub persist_method: PersistMethod,
    pub buff_size: usize,
    pub policy: PmPolicy,
    pub no_headers: bool,
    pub deep: DeepFn,
}

/// One accepted lane on the daemon side: the response path plus the
/// persist-message receive slot.
struct ServerLane {
    idx: u32,
    wr: Mutex<OwnedWriteHalf>,
    /// Persist-message receive slot; sized for the header plus the inline
    /// buffer.
    pmsg: Mutex<Vec<u8>>,
}

/// Daemon side of the in-band data plane: registered pool memory, accepted
/// lanes and the worker pool consuming their completion queues.
pub struct InbandServer {
    region: Region,
    rkey: u64,
    nlanes: u32,
    nthreads: usize,
    lanes_per_thread: usize,
    persist_method: PersistMethod,
    pmsg_size: usize,
    policy: PmPolicy,
    no_headers: bool,
    deep: DeepFn,

    closing: CancellationToken,
    listener: Mutex<Option<Listener>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl InbandServer {
    /// Bind the listening endpoint, register the pool memory and compute
    /// the response attributes for the client.
    pub async fn init(
        node: &str,
        attr: InbandAttr,
    ) -> Result<(Arc<Self>, RespAttr)> {
        let nlanes = attr.nlanes.min(fabric::max_nlanes());

        let nthreads = if attr.nthreads != 0 {
            attr.nthreads
        } else {
            // default: one worker per lane
            nlanes as usize
        };
        let lanes_per_thread = (nlanes as usize - 1) / nthreads + 1;

        let listener = Listener::bind(node).await?;
        let port = listener.port();

        let rkey: u64 = rand::random();
        let pmsg_size =
            (PERSIST_MSG_SIZE + attr.buff_size).div_ceil(64) * 64;

        let resp = RespAttr {
            port,
            rkey,
            raddr: attr.region.addr(),
            nlanes,
            persist_method: Some(attr.policy.method),
        };

        let srv = Arc::new(Self {
            region: attr.region,
            rkey,
            nlanes,
            nthreads,
            lanes_per_thread,
            persist_method: attr.policy.method,
            pmsg_size,
            policy: attr.policy,
            no_headers: attr.no_headers,
            deep: attr.deep,
            closing: CancellationToken::new(),
            listener: Mutex::new(Some(listener)),
            tasks: StdMutex::new(Vec::new()),
        });

        Ok((srv, resp))
    }

    /// Accept all lanes and start processing; run in the background while
    /// the control plane keeps serving requests.
    pub async fn accept_and_start(self: &Arc<Self>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .context("in-band listener already consumed")?;

        info!("waiting for in-band connection");
        let streams = listener
            .accept_lanes(self.nlanes, ACCEPT_TIMEOUT, &self.closing)
            .await?;
        info!("in-band connection established");

        // per-worker completion queues, sized like the per-thread CQs
        let cq_depth = self.lanes_per_thread
            * fabric::cq_size(self.persist_method, Node::Server);
        let mut queues = Vec::with_capacity(self.nthreads);
        let mut handles = Vec::new();
        for _ in 0..self.nthreads {
            let (tx, rx) = mpsc::channel::<Arc<ServerLane>>(cq_depth.max(1));
            queues.push(tx);
            handles.push(tokio::spawn(Arc::clone(self).worker(rx)));
        }

        // lanes are assigned to workers round-robin
        for (idx, stream) in streams.into_iter().enumerate() {
            stream.set_nodelay(true)?;
            let (rd, wr) = stream.into_split();
            let lane = Arc::new(ServerLane {
                idx: idx as u32,
                wr: Mutex::new(wr),
                pmsg: Mutex::new(vec![0u8; self.pmsg_size]),
            });
            let cq = queues[idx % self.nthreads].clone();
            handles.push(tokio::spawn(Arc::clone(self).lane_reader(rd, lane, cq)));
        }

        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);

        Ok(())
    }

    /// Cooperative shutdown: raise the closing flag, signal every queue
    /// and wait for the workers to exit.
    pub async fn stop(&self) {
        self.closing.cancel();

        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Tear the connection down without replying; the peer observes
    /// ECONNRESET. Used for every validation failure.
    fn teardown(&self, why: &str) {
        error!("{why}");
        self.closing.cancel();
    }

    /// Lane engine: applies RMA operations in posting order and forwards
    /// persist messages to the lane's completion queue. In-order execution
    /// on the single stream provides the READ/SEND-after-WRITE guarantees.
    async fn lane_reader(
        self: Arc<Self>,
        mut rd: OwnedReadHalf,
        lane: Arc<ServerLane>,
        cq: mpsc::Sender<Arc<ServerLane>>,
    ) {
        loop {
            let hdr = tokio::select! {
                _ = self.closing.cancelled() => return,
                res = read_hdr(&mut rd) => match res {
                    Ok(hdr) => hdr,
                    Err(e) => {
                        if !self.closing.is_cancelled() {
                            debug!("lane {} closed: {e}", lane.idx);
                        }
                        return;
                    },
                },
            };

            let res = self.lane_frame(&mut rd, &lane, &cq, &hdr).await;
            if let Err(e) = res {
                self.teardown(&format!("lane {} failed: {e:#}", lane.idx));
                return;
            }
        }
    }

    async fn lane_frame(
        &self,
        rd: &mut OwnedReadHalf,
        lane: &Arc<ServerLane>,
        cq: &mpsc::Sender<Arc<ServerLane>>,
        hdr: &FrameHdr,
    ) -> Result<()> {
        match hdr.frame_op()? {
            FrameOp::Write => {
                let (offset, len) = self.check_rma(hdr)?;
                let dst = self.region.slice_mut(offset, len)?;
                rd.read_exact(dst).await?;

                if hdr.flags.get() & FRAME_COMPLETION != 0 {
                    let ack = FrameHdr::msg(FrameOp::WriteAck, 0);
                    let mut wr = lane.wr.lock().await;
                    write_frame(&mut *wr, &ack, &[]).await?;
                }
            },
            FrameOp::Read => {
                let (offset, len) = self.check_rma(hdr)?;
                let payload = self.region.slice(offset, len)?;
                let resp =
                    FrameHdr::msg(FrameOp::ReadResp, len as u64);
                let mut wr = lane.wr.lock().await;
                write_frame(&mut *wr, &resp, payload).await?;
            },
            FrameOp::Send => {
                let len = hdr.len.get() as usize;
                if len > self.pmsg_size {
                    bail!("persist message too long -- {len}");
                }
                {
                    let mut pmsg = lane.pmsg.lock().await;
                    pmsg.resize(self.pmsg_size, 0);
                    rd.read_exact(&mut pmsg[..len]).await?;
                    pmsg.truncate(len);
                }
                // hand the receive completion to the owning worker
                if cq.send(Arc::clone(lane)).await.is_err() {
                    bail!("completion queue closed");
                }
            },
            op => bail!("unexpected frame received from peer -- {op:?}"),
        }
        Ok(())
    }

    /// Validate key and bounds of an RMA operation.
    fn check_rma(&self, hdr: &FrameHdr) -> Result<(usize, usize)> {
        if hdr.rkey.get() != self.rkey {
            bail!("invalid remote key -- 0x{:x}", hdr.rkey.get());
        }
        let addr = hdr.addr.get();
        let len = hdr.len.get();
        if !self.region.contains(addr, len) {
            bail!(
                "invalid address or size requested (0x{addr:x}, {len})"
            );
        }
        Ok((self.region.offset_of(addr), len as usize))
    }

    /// CPU-bound completion consumer: waits on the per-worker queue with a
    /// bounded poll so the closing flag is observed promptly.
    async fn worker(self: Arc<Self>, mut cq: mpsc::Receiver<Arc<ServerLane>>) {
        loop {
            if self.closing.is_cancelled() {
                return;
            }

            let lane = tokio::select! {
                _ = self.closing.cancelled() => return,
                res = timeout(CQ_WAIT, cq.recv()) => match res {
                    Err(_) => continue,
                    Ok(None) => return,
                    Ok(Some(lane)) => lane,
                },
            };

            if let Err(e) = self.process_recv(&lane).await {
                self.teardown(&format!(
                    "processing persist message on lane {} failed: {e:#}",
                    lane.idx
                ));
                return;
            }
        }
    }

    /// Process a received persist message: validate, execute the
    /// persistency action for its mode, then post the response. The
    /// response is not emitted until the flush callback returned.
    async fn process_recv(&self, lane: &ServerLane) -> Result<()> {
        let (resp, lane_id) = {
            let pmsg = lane.pmsg.lock().await;
            let (msg, data) = PersistMsg::decode(&pmsg)?;
            self.check_pmsg(lane, &msg, data)?;

            let offset = self.region.offset_of(msg.addr.get());
            let size = msg.size.get() as usize;

            match msg.flags.get() & PERSIST_MASK {
                DEEP_PERSIST => (self.deep)(offset, size)
                    .context("deep persist failed")?,
                PERSIST_SEND => match self.policy.memcpy {
                    MemcpyFn::PmemMemcpyPersist => {
                        self.region.memcpy_persist(offset, &data[..size])?;
                    },
                    MemcpyFn::MsyncMemcpy => {
                        self.region.memcpy_msync(offset, &data[..size])?;
                    },
                },
                _ => match self.policy.flush {
                    FlushFn::PmemPersist => self.region.persist(offset, size)?,
                    FlushFn::Msync => self.region.msync(offset, size)?,
                    FlushFn::FatalNeverCalled => {
                        bail!("flush requested under appliance persistency method");
                    },
                },
            }

            // return back the lane id
            (PersistResp::new(msg.lane.get()), lane.idx)
        };

        let hdr = FrameHdr::msg(FrameOp::Send, resp.as_bytes().len() as u64);
        let mut wr = lane.wr.lock().await;
        write_frame(&mut *wr, &hdr, resp.as_bytes())
            .await
            .with_context(|| format!("posting response on lane {lane_id}"))?;
        Ok(())
    }

    /// Verify a persist message before acting on it.
    fn check_pmsg(
        &self,
        lane: &ServerLane,
        msg: &PersistMsg,
        data: &[u8],
    ) -> Result<()> {
        if msg.lane.get() >= self.nlanes {
            bail!("invalid lane number -- {}", msg.lane.get());
        }
        if !self.region.contains(msg.addr.get(), msg.size.get()) {
            bail!(
                "invalid address or size requested for persist operation \
                 (0x{:x}, {})",
                msg.addr.get(),
                msg.size.get()
            );
        }
        if !self.no_headers {
            let offset = self.region.offset_of(msg.addr.get());
            if (offset as u64) < POOL_HDR_SIZE {
                bail!(
                    "persist offset ({offset}) inside the pool header on lane {}",
                    lane.idx
                );
            }
        }
        if msg.flags.get() & PERSIST_MASK == PERSIST_SEND
            && (data.len() as u64) < msg.size.get()
        {
            bail!(
                "truncated inline persist data -- {} of {}",
                data.len(),
                msg.size.get()
            );
        }
        Ok(())
    }
}

impl Drop for InbandServer {
    fn drop(&mut self) {
        self.closing.cancel();
    }
}

impl std::fmt::Debug for InbandServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InbandServer")
            .field("nlanes", &self.nlanes)
            .field("nthreads", &self.nthreads)
            .field("persist_method", &self.persist_method)
            .finish_non_exhaustive()
    }
}

/// Map an anyhow failure from init to the wire status the daemon responds
/// with.
pub fn init_error_status(err: &anyhow::Error) -> crate::proto::error::ProtoStatus {
    // a bind failure is a connection-level fatal, everything else generic
    if err.downcast_ref::<std::io::Error>().is_some() {
        crate::proto::error::ProtoStatus::FatalConn
    } else {
        crate::proto::error::ProtoStatus::Fatal
    }
}

