// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{BufMut, BytesMut};
use zerocopy::{FromBytes as ZFromBytes, IntoBytes};

use crate::proto::{
    MsgType,
    attr::{PACKED_ATTR_SIZE, PackedPoolAttr},
    error::RpmemError,
    hdr::{MSG_HDR_RESP_SIZE, MSG_HDR_SIZE},
    parse::WireRequest,
};

pub const SET_ATTR_SIZE: usize = MSG_HDR_SIZE + PACKED_ATTR_SIZE;
pub const SET_ATTR_RESP_SIZE: usize = MSG_HDR_RESP_SIZE;

/// SET_ATTR request: overwrite the stored pool attributes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetAttrReq {
    pub pool_attr: PackedPoolAttr,
}

impl WireRequest for SetAttrReq {
    fn msg_type(&self) -> MsgType {
        MsgType::SetAttr
    }

    fn body_size(&self) -> u64 {
        PACKED_ATTR_SIZE as u64
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(self.pool_attr.as_bytes());
    }
}

impl SetAttrReq {
    pub fn decode(body: &[u8], hdr_size: u64) -> Result<Self, RpmemError> {
        if hdr_size != SET_ATTR_SIZE as u64 {
            return Err(RpmemError::Proto(format!(
                "invalid set attributes request size -- {hdr_size}"
            )));
        }
        let pool_attr = PackedPoolAttr::read_from_bytes(body).map_err(|_| {
            RpmemError::Proto("truncated set attributes request".to_string())
        })?;
        Ok(Self { pool_attr })
    }
}
