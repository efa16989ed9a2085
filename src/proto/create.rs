// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{BufMut, BytesMut};
use zerocopy::{FromBytes as ZFromBytes, IntoBytes};

use crate::proto::{
    MsgType,
    attr::{PACKED_ATTR_SIZE, PackedPoolAttr},
    common::{
        IBC_ATTR_SIZE, IbcAttr, MSG_COMMON_SIZE, MsgCommon, ReqAttr, put_pool_desc,
        take_pool_desc,
    },
    error::RpmemError,
    hdr::{MSG_HDR_RESP_SIZE, MSG_HDR_SIZE},
    parse::WireRequest,
};

/// Fixed part of a CREATE message: header, common block, packed pool
/// attributes and the pool descriptor length field.
pub const CREATE_FIXED_SIZE: usize =
    MSG_HDR_SIZE + MSG_COMMON_SIZE + PACKED_ATTR_SIZE + 4;

pub const CREATE_RESP_SIZE: usize = MSG_HDR_RESP_SIZE + IBC_ATTR_SIZE;

/// CREATE request: ask the daemon to create the pool set named by the
/// descriptor and bring up the in-band connection for it.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateReq {
    pub req: ReqAttr,
    pub pool_attr: PackedPoolAttr,
}

impl WireRequest for CreateReq {
    fn msg_type(&self) -> MsgType {
        MsgType::Create
    }

    fn body_size(&self) -> u64 {
        (CREATE_FIXED_SIZE - MSG_HDR_SIZE + self.req.pool_desc.len() + 1) as u64
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        let common = MsgCommon::new(
            self.req.pool_size,
            self.req.nlanes,
            self.req.provider,
            self.req.buff_size,
        );
        buf.put_slice(common.as_bytes());
        buf.put_slice(self.pool_attr.as_bytes());
        put_pool_desc(buf, &self.req.pool_desc);
    }
}

impl CreateReq {
    /// Decode and validate a CREATE body. `hdr_size` is the size announced
    /// in the (already validated) message header.
    pub fn decode(body: &[u8], hdr_size: u64) -> Result<Self, RpmemError> {
        let (common, rest) = MsgCommon::read_from_prefix(body)
            .map_err(|_| RpmemError::Proto("truncated create request".to_string()))?;
        let provider = common.validate()?;

        let (pool_attr, rest) = PackedPoolAttr::read_from_prefix(rest)
            .map_err(|_| RpmemError::Proto("truncated create request".to_string()))?;

        let pool_desc = take_pool_desc(rest, CREATE_FIXED_SIZE as u64, hdr_size)?;

        Ok(Self {
            req: ReqAttr {
                pool_size: common.pool_size.get(),
                nlanes: common.nlanes.get(),
                provider,
                buff_size: common.buff_size.get(),
                pool_desc,
            },
            pool_attr,
        })
    }
}

/// CREATE response body: in-band connection attributes only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateResp {
    pub ibc: IbcAttr,
}

impl CreateResp {
    pub fn decode(body: &[u8]) -> Result<Self, RpmemError> {
        let ibc = IbcAttr::read_from_bytes(body).map_err(|_| {
            RpmemError::Proto("truncated create response".to_string())
        })?;
        ibc.validate()?;
        Ok(Self { ibc })
    }
}
