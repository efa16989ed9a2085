// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32,
    Unaligned,
};

use crate::proto::{SIG_SIZE, USER_FLAGS_SIZE, UUID_SIZE};

/// Pool attributes as the application sees them.
///
/// The whole block survives a create -> open round-trip byte for byte; an
/// all-zero block on open means "no attribute check requested" and the
/// daemon returns the stored attributes as-is.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolAttr {
    pub signature: [u8; SIG_SIZE],
    pub major: u32,
    pub compat_features: u32,
    pub incompat_features: u32,
    pub ro_compat_features: u32,
    pub poolset_uuid: [u8; UUID_SIZE],
    pub uuid: [u8; UUID_SIZE],
    pub next_uuid: [u8; UUID_SIZE],
    pub prev_uuid: [u8; UUID_SIZE],
    pub user_flags: [u8; USER_FLAGS_SIZE],
}

impl PoolAttr {
    pub fn is_zeroed(&self) -> bool {
        *self == Self::default()
    }
}

/// On-wire packed rendition of [`PoolAttr`]: no padding, multi-byte fields
/// big-endian.
#[repr(C)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
pub struct PackedPoolAttr {
    pub signature: [u8; SIG_SIZE],
    pub major: U32<BigEndian>,
    pub compat_features: U32<BigEndian>,
    pub incompat_features: U32<BigEndian>,
    pub ro_compat_features: U32<BigEndian>,
    pub poolset_uuid: [u8; UUID_SIZE],
    pub uuid: [u8; UUID_SIZE],
    pub next_uuid: [u8; UUID_SIZE],
    pub prev_uuid: [u8; UUID_SIZE],
    pub user_flags: [u8; USER_FLAGS_SIZE],
}

pub const PACKED_ATTR_SIZE: usize = size_of::<PackedPoolAttr>();

impl PackedPoolAttr {
    pub fn pack(attr: &PoolAttr) -> Self {
        Self {
            signature: attr.signature,
            major: U32::new(attr.major),
            compat_features: U32::new(attr.compat_features),
            incompat_features: U32::new(attr.incompat_features),
            ro_compat_features: U32::new(attr.ro_compat_features),
            poolset_uuid: attr.poolset_uuid,
            uuid: attr.uuid,
            next_uuid: attr.next_uuid,
            prev_uuid: attr.prev_uuid,
            user_flags: attr.user_flags,
        }
    }

    pub fn unpack(&self) -> PoolAttr {
        PoolAttr {
            signature: self.signature,
            major: self.major.get(),
            compat_features: self.compat_features.get(),
            incompat_features: self.incompat_features.get(),
            ro_compat_features: self.ro_compat_features.get(),
            poolset_uuid: self.poolset_uuid,
            uuid: self.uuid,
            next_uuid: self.next_uuid,
            prev_uuid: self.prev_uuid,
            user_flags: self.user_flags,
        }
    }

    pub fn is_zeroed(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }
}
