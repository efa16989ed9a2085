// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{BufMut, Bytes, BytesMut};
use enum_dispatch::enum_dispatch;
use zerocopy::IntoBytes;

use crate::proto::{
    MsgType,
    close::CloseReq,
    create::CreateReq,
    error::RpmemError,
    hdr::{MSG_HDR_SIZE, MsgHdr},
    open::OpenReq,
    set_attr::SetAttrReq,
};

/// A request message that knows how to lay itself out on the wire.
#[enum_dispatch]
pub trait WireRequest {
    fn msg_type(&self) -> MsgType;

    /// Number of body bytes following the message header.
    fn body_size(&self) -> u64;

    fn encode_body(&self, buf: &mut BytesMut);
}

/// Every request type the daemon dispatches on.
#[enum_dispatch(WireRequest)]
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Create(CreateReq),
    Open(OpenReq),
    Close(CloseReq),
    SetAttr(SetAttrReq),
}

impl Request {
    /// Decode a validated header plus its body bytes into a request.
    ///
    /// All bounded validation happens here, before any state is mutated:
    /// version guard, provider range, descriptor size arithmetic and
    /// NUL-termination. Failures surface as EPROTO.
    pub fn decode(hdr: &MsgHdr, body: &[u8]) -> Result<Self, RpmemError> {
        let typ = hdr.validate()?;
        let size = hdr.size.get();
        if body.len() as u64 + MSG_HDR_SIZE as u64 != size {
            return Err(RpmemError::Proto(format!(
                "message body size mismatch -- is {} should be {}",
                body.len() as u64 + MSG_HDR_SIZE as u64,
                size
            )));
        }
        Ok(match typ {
            MsgType::Create => Self::Create(CreateReq::decode(body, size)?),
            MsgType::Open => Self::Open(OpenReq::decode(body, size)?),
            MsgType::Close => Self::Close(CloseReq::decode(body, size)?),
            MsgType::SetAttr => Self::SetAttr(SetAttrReq::decode(body, size)?),
            // header validation rejects response types
            _ => unreachable!("validated header produced a response type"),
        })
    }
}

/// Serialize a full request message: header followed by the body.
pub fn encode_request(req: &impl WireRequest) -> Bytes {
    let body_size = req.body_size();
    let total = MSG_HDR_SIZE as u64 + body_size;
    let mut buf = BytesMut::with_capacity(total as usize);
    let hdr = MsgHdr::new(req.msg_type(), total);
    buf.put_slice(hdr.as_bytes());
    req.encode_body(&mut buf);
    debug_assert_eq!(buf.len() as u64, total);
    buf.freeze()
}
