// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::BufMut;
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16, U32,
    U64, Unaligned,
};

use crate::proto::{
    PROTO_MAJOR, PROTO_MINOR, PersistMethod, Provider, error::RpmemError,
};

/// Common fields of the CREATE and OPEN request bodies.
#[repr(C)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
pub struct MsgCommon {
    pub major: U16<BigEndian>,
    pub minor: U16<BigEndian>,
    pub pool_size: U64<BigEndian>,
    pub nlanes: U32<BigEndian>,
    pub provider: U32<BigEndian>,
    pub buff_size: U64<BigEndian>,
}

pub const MSG_COMMON_SIZE: usize = size_of::<MsgCommon>();

impl MsgCommon {
    pub fn new(
        pool_size: u64,
        nlanes: u32,
        provider: Provider,
        buff_size: u64,
    ) -> Self {
        Self {
            major: U16::new(PROTO_MAJOR),
            minor: U16::new(PROTO_MINOR),
            pool_size: U64::new(pool_size),
            nlanes: U32::new(nlanes),
            provider: U32::new(provider as u32),
            buff_size: U64::new(buff_size),
        }
    }

    /// Version and provider guards shared by CREATE and OPEN.
    pub fn validate(&self) -> Result<Provider, RpmemError> {
        if self.major.get() != PROTO_MAJOR || self.minor.get() != PROTO_MINOR {
            return Err(RpmemError::Proto(format!(
                "unsupported protocol version -- {}.{}",
                self.major.get(),
                self.minor.get()
            )));
        }
        Provider::from_wire(self.provider.get())
            .map_err(|e| RpmemError::Proto(e.to_string()))
    }
}

/// In-band connection attributes returned by CREATE_RESP and OPEN_RESP;
/// everything the client needs to bring up the data plane.
#[repr(C)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
pub struct IbcAttr {
    pub port: U32<BigEndian>,
    pub persist_method: U32<BigEndian>,
    pub rkey: U64<BigEndian>,
    pub raddr: U64<BigEndian>,
    pub nlanes: U32<BigEndian>,
}

pub const IBC_ATTR_SIZE: usize = size_of::<IbcAttr>();

impl IbcAttr {
    pub fn validate(&self) -> Result<(u16, PersistMethod), RpmemError> {
        let port = self.port.get();
        if port == 0 || port > u32::from(u16::MAX) {
            return Err(RpmemError::Proto(format!(
                "invalid port number received -- {port}"
            )));
        }
        let pm = PersistMethod::from_wire(self.persist_method.get())
            .map_err(|e| RpmemError::Proto(e.to_string()))?;
        Ok((port as u16, pm))
    }
}

/// Decoded request attributes shared by the CREATE and OPEN paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqAttr {
    pub pool_size: u64,
    pub nlanes: u32,
    pub provider: Provider,
    pub buff_size: u64,
    pub pool_desc: String,
}

/// Response attributes the daemon assembles after bringing up its side of
/// the data plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RespAttr {
    pub port: u16,
    pub rkey: u64,
    pub raddr: u64,
    pub nlanes: u32,
    pub persist_method: Option<PersistMethod>,
}

impl RespAttr {
    pub fn to_ibc(self) -> IbcAttr {
        IbcAttr {
            port: U32::new(u32::from(self.port)),
            persist_method: U32::new(
                self.persist_method.map_or(0, |pm| pm as u32),
            ),
            rkey: U64::new(self.rkey),
            raddr: U64::new(self.raddr),
            nlanes: U32::new(self.nlanes),
        }
    }
}

/// Encode the pool descriptor field: u32 length (NUL included) followed by
/// the NUL-terminated descriptor string.
pub fn put_pool_desc(buf: &mut impl BufMut, desc: &str) {
    let len = desc.len() as u32 + 1;
    buf.put_u32(len);
    buf.put_slice(desc.as_bytes());
    buf.put_u8(0);
}

/// Decode and validate a pool descriptor field from a message tail.
///
/// `fixed_size` is the size of the message up to and including the
/// descriptor length field; `hdr_size` is the total size announced in the
/// message header. The equality `hdr_size == fixed_size + desc.size` is one
/// of the bounded-validation requirements.
pub fn take_pool_desc(
    tail: &[u8],
    fixed_size: u64,
    hdr_size: u64,
) -> Result<String, RpmemError> {
    let (len, rest) = U32::<BigEndian>::read_from_prefix(tail)
        .map_err(|_| RpmemError::Proto("truncated pool descriptor".to_string()))?;
    let desc_size = len.get() as usize;

    if hdr_size != fixed_size + desc_size as u64 {
        return Err(RpmemError::Proto(format!(
            "message and pool descriptor size mismatch -- is {hdr_size} should be {}",
            fixed_size + desc_size as u64
        )));
    }
    if desc_size < 2 {
        return Err(RpmemError::Proto(format!(
            "invalid pool descriptor size -- {desc_size} (must be >= 2)"
        )));
    }
    if rest.len() < desc_size {
        return Err(RpmemError::Proto("truncated pool descriptor".to_string()));
    }
    let desc = &rest[..desc_size];
    if desc[desc_size - 1] != 0 {
        return Err(RpmemError::Proto(
            "invalid pool descriptor (must be null-terminated string)".to_string(),
        ));
    }
    // the declared size must match the string length, so no interior NULs
    let strlen = desc.iter().position(|b| *b == 0).unwrap_or(desc_size);
    if strlen + 1 != desc_size {
        return Err(RpmemError::Proto(format!(
            "invalid pool descriptor size -- is {} should be {desc_size}",
            strlen + 1
        )));
    }
    let s = std::str::from_utf8(&desc[..strlen])
        .map_err(|_| RpmemError::Proto("pool descriptor is not text".to_string()))?;
    Ok(s.to_string())
}
