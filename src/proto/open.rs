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

/// Fixed part of an OPEN message: header, common block and the descriptor
/// length field (no pool attributes in the request direction).
pub const OPEN_FIXED_SIZE: usize = MSG_HDR_SIZE + MSG_COMMON_SIZE + 4;

pub const OPEN_RESP_SIZE: usize =
    MSG_HDR_RESP_SIZE + IBC_ATTR_SIZE + PACKED_ATTR_SIZE;

/// OPEN request: open an existing pool set on the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenReq {
    pub req: ReqAttr,
}

impl WireRequest for OpenReq {
    fn msg_type(&self) -> MsgType {
        MsgType::Open
    }

    fn body_size(&self) -> u64 {
        (OPEN_FIXED_SIZE - MSG_HDR_SIZE + self.req.pool_desc.len() + 1) as u64
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        let common = MsgCommon::new(
            self.req.pool_size,
            self.req.nlanes,
            self.req.provider,
            self.req.buff_size,
        );
        buf.put_slice(common.as_bytes());
        put_pool_desc(buf, &self.req.pool_desc);
    }
}

impl OpenReq {
    pub fn decode(body: &[u8], hdr_size: u64) -> Result<Self, RpmemError> {
        let (common, rest) = MsgCommon::read_from_prefix(body)
            .map_err(|_| RpmemError::Proto("truncated open request".to_string()))?;
        let provider = common.validate()?;

        let pool_desc = take_pool_desc(rest, OPEN_FIXED_SIZE as u64, hdr_size)?;

        Ok(Self {
            req: ReqAttr {
                pool_size: common.pool_size.get(),
                nlanes: common.nlanes.get(),
                provider,
                buff_size: common.buff_size.get(),
                pool_desc,
            },
        })
    }
}

/// OPEN response body: in-band connection attributes plus the effective
/// pool attributes read from the pool header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenResp {
    pub ibc: IbcAttr,
    pub pool_attr: PackedPoolAttr,
}

impl OpenResp {
    pub fn decode(body: &[u8]) -> Result<Self, RpmemError> {
        let (ibc, rest) = IbcAttr::read_from_prefix(body)
            .map_err(|_| RpmemError::Proto("truncated open response".to_string()))?;
        ibc.validate()?;
        let pool_attr = PackedPoolAttr::read_from_bytes(rest)
            .map_err(|_| RpmemError::Proto("truncated open response".to_string()))?;
        Ok(Self { ibc, pool_attr })
    }

    pub fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(self.ibc.as_bytes());
        buf.put_slice(self.pool_attr.as_bytes());
    }
}
