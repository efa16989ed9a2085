// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result, anyhow, bail};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    process::Child,
    sync::{Mutex, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};
use zerocopy::FromBytes as ZFromBytes;

use crate::{
    client::PoolState,
    obc::{MAX_OBC_MSG, ssh::SshConn},
    proto::{
        CloseFlags, MsgType, PersistMethod,
        attr::{PackedPoolAttr, PoolAttr},
        close::{CLOSE_RESP_SIZE, CloseReq},
        common::ReqAttr,
        create::{CREATE_RESP_SIZE, CreateReq, CreateResp},
        error::RpmemError,
        hdr::{MSG_HDR_RESP_SIZE, MsgHdrResp},
        open::{OPEN_RESP_SIZE, OpenReq, OpenResp},
        parse::{WireRequest, encode_request},
        set_attr::{SET_ATTR_RESP_SIZE, SetAttrReq},
    },
    target::TargetInfo,
};

/// Decoded in-band connection attributes from a CREATE/OPEN response.
#[derive(Debug, Clone, Copy)]
pub struct IbcInfo {
    pub port: u16,
    pub persist_method: PersistMethod,
    pub rkey: u64,
    pub raddr: u64,
    pub nlanes: u32,
}

type RawResp = (MsgHdrResp, Vec<u8>);
type Pending = Arc<StdMutex<Option<oneshot::Sender<RawResp>>>>;

/// Client side of the out-of-band control channel.
///
/// Requests are strictly one-at-a-time; a background reader owns the inbound
/// half of the stream and doubles as the connection monitor: bytes arriving
/// with no request in flight are a protocol violation, EOF is a peer
/// shutdown. Either latches an errno into the shared pool state and cancels
/// every in-flight data-plane wait.
pub struct ObcClient {
    wr: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    state: Arc<PoolState>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    child: StdMutex<Option<Child>>,
}

impl ObcClient {
    /// Bootstrap over ssh: spawn the remote daemon and consume its status
    /// word.
    pub async fn connect(info: &TargetInfo, state: Arc<PoolState>) -> Result<Self> {
        info.check_port()?;
        let conn = SshConn::open(info).await?;
        let (rd, wr, child) = conn.into_parts();
        Ok(Self::from_parts(Box::new(rd), Box::new(wr), Some(child), state))
    }

    /// Build the control channel over an already-established byte stream.
    /// The peer's initial status word must already have been consumed.
    pub fn from_io<R, W>(rd: R, wr: W, state: Arc<PoolState>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_parts(Box::new(rd), Box::new(wr), None, state)
    }

    fn from_parts(
        rd: Box<dyn AsyncRead + Send + Unpin>,
        wr: Box<dyn AsyncWrite + Send + Unpin>,
        child: Option<Child>,
        state: Arc<PoolState>,
    ) -> Self {
        let pending: Pending = Arc::new(StdMutex::new(None));
        let reader =
            tokio::spawn(read_loop(rd, Arc::clone(&pending), Arc::clone(&state)));

        Self {
            wr: Mutex::new(wr),
            pending,
            state,
            reader: StdMutex::new(Some(reader)),
            child: StdMutex::new(child),
        }
    }

    fn latched(&self) -> Option<RpmemError> {
        match self.state.errno() {
            0 => None,
            err if err == libc::ECONNRESET => Some(RpmemError::ConnReset),
            err => Some(RpmemError::Errno(err)),
        }
    }

    async fn request(
        &self,
        req: &impl WireRequest,
        exp_type: MsgType,
        exp_size: usize,
    ) -> Result<Vec<u8>> {
        if let Some(err) = self.latched() {
            return Err(err.into());
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.is_some() {
                bail!("out-of-band request already in flight");
            }
            *pending = Some(tx);
        }

        let buf = encode_request(req);
        {
            let mut wr = self.wr.lock().await;
            let res = async {
                wr.write_all(&buf).await?;
                wr.flush().await
            }
            .await;
            if let Err(e) = res {
                self.pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .take();
                return Err(anyhow!(RpmemError::ConnReset)
                    .context(format!("sending request message failed: {e}")));
            }
        }

        let (hdr, body) = rx.await.map_err(|_| {
            self.latched().unwrap_or(RpmemError::ConnReset)
        })?;

        hdr.validate(exp_type, exp_size as u64)?;
        Ok(body)
    }

    /// Perform the create request operation.
    pub async fn create(
        &self,
        req: &ReqAttr,
        pool_attr: Option<&PoolAttr>,
    ) -> Result<IbcInfo> {
        let pool_attr = match pool_attr {
            Some(attr) => PackedPoolAttr::pack(attr),
            None => {
                debug!("using zeroed pool attributes");
                PackedPoolAttr::default()
            },
        };
        let msg = CreateReq {
            req: req.clone(),
            pool_attr,
        };

        debug!("sending create request message");
        let body = self
            .request(&msg, MsgType::CreateResp, CREATE_RESP_SIZE)
            .await
            .context("create request failed")?;
        let resp = CreateResp::decode(&body)?;
        debug!("create request response received");

        ibc_info(&resp.ibc)
    }

    /// Perform the open request operation; returns the in-band attributes
    /// and the effective pool attributes stored on the daemon.
    pub async fn open(&self, req: &ReqAttr) -> Result<(IbcInfo, PoolAttr)> {
        let msg = OpenReq { req: req.clone() };

        debug!("sending open request message");
        let body = self
            .request(&msg, MsgType::OpenResp, OPEN_RESP_SIZE)
            .await
            .context("open request failed")?;
        let resp = OpenResp::decode(&body)?;
        debug!("open request response received");

        Ok((ibc_info(&resp.ibc)?, resp.pool_attr.unpack()))
    }

    /// Perform the close request operation. This does not tear the stream
    /// down; call [`ObcClient::disconnect`] afterwards.
    pub async fn close(&self, flags: CloseFlags) -> Result<()> {
        let msg = CloseReq { flags };

        debug!("sending close request message");
        self.request(&msg, MsgType::CloseResp, CLOSE_RESP_SIZE)
            .await
            .context("close request failed")?;
        debug!("close request response received");
        Ok(())
    }

    /// Perform the set attributes request operation.
    pub async fn set_attr(&self, pool_attr: Option<&PoolAttr>) -> Result<()> {
        let pool_attr = match pool_attr {
            Some(attr) => PackedPoolAttr::pack(attr),
            None => {
                debug!("using zeroed pool attributes");
                PackedPoolAttr::default()
            },
        };
        let msg = SetAttrReq { pool_attr };

        debug!("sending set attributes request message");
        self.request(&msg, MsgType::SetAttrResp, SET_ATTR_RESP_SIZE)
            .await
            .context("set attributes request failed")?;
        debug!("set attributes request response received");
        Ok(())
    }

    /// Stop the monitor, close the stream and reap the ssh child.
    pub async fn disconnect(&self) -> Result<()> {
        self.state.set_closing();
        self.state.cancel.cancel();

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = reader {
            let _ = handle.await;
        }

        if let Err(e) = self.wr.lock().await.shutdown().await {
            debug!("shutting down out-of-band stream: {e}");
        }

        let child = self.child.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut child) = child {
            let status = child.wait().await.context("waiting for ssh failed")?;
            if !status.success() {
                warn!("remote command exit status -- {status}");
            }
        }

        Ok(())
    }
}

fn ibc_info(ibc: &crate::proto::common::IbcAttr) -> Result<IbcInfo> {
    let (port, persist_method) = ibc.validate()?;
    Ok(IbcInfo {
        port,
        persist_method,
        rkey: ibc.rkey.get(),
        raddr: ibc.raddr.get(),
        nlanes: ibc.nlanes.get(),
    })
}

/// Inbound side of the control channel: delivers responses to the waiting
/// request and treats anything else as a monitor event.
async fn read_loop(
    mut rd: Box<dyn AsyncRead + Send + Unpin>,
    pending: Pending,
    state: Arc<PoolState>,
) {
    loop {
        let mut hdr_buf = [0u8; MSG_HDR_RESP_SIZE];

        let res = tokio::select! {
            _ = state.cancel.cancelled() => return,
            res = rd.read_exact(&mut hdr_buf) => res,
        };

        if let Err(e) = res {
            if !state.is_closing() {
                debug!("out-of-band connection closed: {e}");
                state.latch(libc::ECONNRESET);
            }
            return;
        }

        let Ok(hdr) = MsgHdrResp::read_from_bytes(&hdr_buf) else {
            state.latch(libc::EPROTO);
            return;
        };

        let size = hdr.size.get();
        if size < MSG_HDR_RESP_SIZE as u64 || size > MAX_OBC_MSG {
            warn!("invalid message size received -- {size}");
            state.latch(libc::EPROTO);
            return;
        }

        let mut body = vec![0u8; (size as usize) - MSG_HDR_RESP_SIZE];
        let res = tokio::select! {
            _ = state.cancel.cancelled() => return,
            res = rd.read_exact(&mut body) => res,
        };
        if res.is_err() {
            if !state.is_closing() {
                state.latch(libc::ECONNRESET);
            }
            return;
        }

        let waiter = pending.lock().unwrap_or_else(|e| e.into_inner()).take();
        match waiter {
            Some(tx) => {
                let _ = tx.send((hdr, body));
            },
            None => {
                // response with nothing in flight: protocol violation
                if !state.is_closing() {
                    warn!("unexpected data received");
                    state.latch(libc::EPROTO);
                }
                return;
            },
        }
    }
}
