// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{BufMut, BytesMut};
use zerocopy::{BigEndian, FromBytes as ZFromBytes, U32};

use crate::proto::{
    CloseFlags, MsgType,
    error::RpmemError,
    hdr::{MSG_HDR_RESP_SIZE, MSG_HDR_SIZE},
    parse::WireRequest,
};

pub const CLOSE_SIZE: usize = MSG_HDR_SIZE + 4;
pub const CLOSE_RESP_SIZE: usize = MSG_HDR_RESP_SIZE;

/// CLOSE request; bit 0 of the flags asks the daemon to remove the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReq {
    pub flags: CloseFlags,
}

impl WireRequest for CloseReq {
    fn msg_type(&self) -> MsgType {
        MsgType::Close
    }

    fn body_size(&self) -> u64 {
        4
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.flags.bits());
    }
}

impl CloseReq {
    pub fn decode(body: &[u8], hdr_size: u64) -> Result<Self, RpmemError> {
        if hdr_size != CLOSE_SIZE as u64 {
            return Err(RpmemError::Proto(format!(
                "invalid close request size -- {hdr_size}"
            )));
        }
        let flags = U32::<BigEndian>::read_from_bytes(body)
            .map_err(|_| RpmemError::Proto("truncated close request".to_string()))?;
        Ok(Self {
            flags: CloseFlags::from_bits_truncate(flags.get()),
        })
    }
}
