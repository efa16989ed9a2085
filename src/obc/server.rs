// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result, anyhow};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info};
use zerocopy::{FromBytes as ZFromBytes, IntoBytes};

use crate::{
    obc::MAX_OBC_MSG,
    proto::{
        MsgType,
        attr::PackedPoolAttr,
        close::CLOSE_RESP_SIZE,
        common::RespAttr,
        create::CREATE_RESP_SIZE,
        error::{ProtoStatus, RpmemError},
        hdr::{MSG_HDR_SIZE, MsgHdr, MsgHdrResp},
        open::OPEN_RESP_SIZE,
        parse::Request,
        set_attr::SET_ATTR_RESP_SIZE,
    },
};

/// One received control-plane event.
#[derive(Debug)]
pub enum ObcEvent {
    Request(Request),
    /// The peer closed the stream cleanly (read returned EOF).
    Disconnected,
}

/// Server side of the out-of-band control channel: a single-threaded
/// request/response loop over a pre-established byte stream, typically the
/// standard streams of an ssh-spawned daemon.
pub struct ObcServer<R, W> {
    rd: R,
    wr: W,
}

impl<R, W> ObcServer<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(rd: R, wr: W) -> Self {
        Self { rd, wr }
    }

    /// Send the initial status word; zero tells the client the daemon is
    /// ready.
    pub async fn status(&mut self, status: u32) -> Result<()> {
        self.wr
            .write_all(&status.to_be_bytes())
            .await
            .context("writing status failed")?;
        self.wr.flush().await?;
        Ok(())
    }

    /// Read, frame and validate the next request.
    ///
    /// Any validation failure is fatal to the connection: the error is
    /// returned before any state was mutated and without consuming further
    /// bytes, and the caller is expected to disconnect without replying.
    pub async fn recv_request(&mut self) -> Result<ObcEvent> {
        let mut hdr_buf = [0u8; MSG_HDR_SIZE];
        match self.rd.read_exact(&mut hdr_buf).await {
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("out-of-band connection disconnected");
                return Ok(ObcEvent::Disconnected);
            },
            Err(e) => {
                return Err(anyhow!(e).context("receiving message header failed"));
            },
        }

        let hdr = MsgHdr::read_from_bytes(&hdr_buf)
            .map_err(|e| anyhow!(RpmemError::Proto(e.to_string())))?;
        let typ = hdr.validate().map_err(|e| {
            error!("parsing message header failed: {e}");
            anyhow!(e)
        })?;
        if hdr.size.get() > MAX_OBC_MSG {
            let err = RpmemError::Proto(format!(
                "invalid message size -- {}",
                hdr.size.get()
            ));
            error!("parsing message header failed: {err}");
            return Err(err.into());
        }

        let mut body = vec![0u8; hdr.size.get() as usize - MSG_HDR_SIZE];
        self.rd
            .read_exact(&mut body)
            .await
            .context("receiving message body failed")?;

        let req = Request::decode(&hdr, &body).map_err(|e| {
            error!("parsing message body failed: {e}");
            anyhow!(e)
        })?;
        debug!("received {typ:?} request");

        Ok(ObcEvent::Request(req))
    }

    /// Send a create request response message.
    pub async fn send_create_resp(
        &mut self,
        status: ProtoStatus,
        resp: &RespAttr,
    ) -> Result<()> {
        let hdr = MsgHdrResp::new(status, MsgType::CreateResp, CREATE_RESP_SIZE as u64);
        let mut buf = BytesMut::with_capacity(CREATE_RESP_SIZE);
        buf.put_slice(hdr.as_bytes());
        buf.put_slice(resp.to_ibc().as_bytes());
        self.send(&buf).await
    }

    /// Send an open request response message carrying the effective pool
    /// attributes.
    pub async fn send_open_resp(
        &mut self,
        status: ProtoStatus,
        resp: &RespAttr,
        pool_attr: &PackedPoolAttr,
    ) -> Result<()> {
        let hdr = MsgHdrResp::new(status, MsgType::OpenResp, OPEN_RESP_SIZE as u64);
        let mut buf = BytesMut::with_capacity(OPEN_RESP_SIZE);
        buf.put_slice(hdr.as_bytes());
        buf.put_slice(resp.to_ibc().as_bytes());
        buf.put_slice(pool_attr.as_bytes());
        self.send(&buf).await
    }

    /// Send a close request response message.
    pub async fn send_close_resp(&mut self, status: ProtoStatus) -> Result<()> {
        let hdr = MsgHdrResp::new(status, MsgType::CloseResp, CLOSE_RESP_SIZE as u64);
        self.send(hdr.as_bytes()).await
    }

    /// Send a set attributes request response message.
    pub async fn send_set_attr_resp(&mut self, status: ProtoStatus) -> Result<()> {
        let hdr =
            MsgHdrResp::new(status, MsgType::SetAttrResp, SET_ATTR_RESP_SIZE as u64);
        self.send(hdr.as_bytes()).await
    }

    async fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.wr
            .write_all(buf)
            .await
            .context("sending response message failed")?;
        self.wr.flush().await?;
        Ok(())
    }
}
