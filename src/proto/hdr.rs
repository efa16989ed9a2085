// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32, U64,
    Unaligned,
};

use crate::proto::{
    MsgType,
    error::{MAX_PROTO_STATUS, ProtoStatus, RpmemError},
};

/// Request message header: type and total message size (header included).
#[repr(C)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
pub struct MsgHdr {
    pub typ: U32<BigEndian>,
    pub size: U64<BigEndian>,
}

pub const MSG_HDR_SIZE: usize = size_of::<MsgHdr>();

impl MsgHdr {
    pub fn new(typ: MsgType, size: u64) -> Self {
        Self {
            typ: U32::new(typ as u32),
            size: U64::new(size),
        }
    }

    /// Validate the fixed checks every inbound request header must pass:
    /// a known server-handled type and a size covering at least the header.
    pub fn validate(&self) -> Result<MsgType, RpmemError> {
        let typ = MsgType::from_wire(self.typ.get())
            .map_err(|e| RpmemError::Proto(e.to_string()))?;
        match typ {
            MsgType::Create | MsgType::Open | MsgType::Close | MsgType::SetAttr => {},
            other => {
                return Err(RpmemError::Proto(format!(
                    "unexpected message type -- {other:?}"
                )));
            },
        }
        if self.size.get() < MSG_HDR_SIZE as u64 {
            return Err(RpmemError::Proto(format!(
                "invalid message size -- {}",
                self.size.get()
            )));
        }
        Ok(typ)
    }
}

/// Response message header: status, echoed type and total size.
#[repr(C)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
pub struct MsgHdrResp {
    pub status: U32<BigEndian>,
    pub typ: U32<BigEndian>,
    pub size: U64<BigEndian>,
}

pub const MSG_HDR_RESP_SIZE: usize = size_of::<MsgHdrResp>();

impl MsgHdrResp {
    pub fn new(status: ProtoStatus, typ: MsgType, size: u64) -> Self {
        Self {
            status: U32::new(status as u32),
            typ: U32::new(typ as u32),
            size: U64::new(size),
        }
    }

    /// Validate a response header against the expected type and size, then
    /// convert a non-success status into its mapped error.
    pub fn validate(&self, typ: MsgType, size: u64) -> Result<(), RpmemError> {
        if self.typ.get() != typ as u32 {
            return Err(RpmemError::Proto(format!(
                "invalid message type received -- {}",
                self.typ.get()
            )));
        }
        if self.size.get() != size {
            return Err(RpmemError::Proto(format!(
                "invalid message size received -- {}",
                self.size.get()
            )));
        }
        if self.status.get() >= MAX_PROTO_STATUS {
            return Err(RpmemError::Proto(format!(
                "invalid status received -- {}",
                self.status.get()
            )));
        }
        match ProtoStatus::from_wire(self.status.get()) {
            Some(ProtoStatus::Success) => Ok(()),
            Some(status) => Err(RpmemError::Status(status)),
            None => Err(RpmemError::Proto(format!(
                "invalid status received -- {}",
                self.status.get()
            ))),
        }
    }
}
