// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use rpmem_rs::proto::attr::{PACKED_ATTR_SIZE, PackedPoolAttr, PoolAttr};
use zerocopy::{FromBytes, IntoBytes};

fn sample_attr() -> PoolAttr {
    PoolAttr {
        signature: *b"<RPMEM>\0",
        major: 1,
        compat_features: 0xa,
        incompat_features: 0xb,
        ro_compat_features: 0xc,
        poolset_uuid: *b"POOLSET_UUID0123",
        uuid: *b"UUID0123456789AB",
        next_uuid: *b"NEXT_UUID0123456",
        prev_uuid: *b"PREV_UUID0123456",
        user_flags: *b"USER_FLAGS012345",
    }
}

#[test]
fn packed_attr_is_104_bytes_no_padding() {
    assert_eq!(PACKED_ATTR_SIZE, 104);
    assert_eq!(size_of::<PackedPoolAttr>(), 104);
}

#[test]
fn attr_pack_unpack_roundtrip() {
    let attr = sample_attr();
    let packed = PackedPoolAttr::pack(&attr);
    assert_eq!(packed.unpack(), attr);
}

#[test]
fn attr_survives_wire_roundtrip_byte_for_byte() {
    let packed = PackedPoolAttr::pack(&sample_attr());
    let wire = packed.as_bytes().to_vec();

    let back = PackedPoolAttr::read_from_bytes(&wire).expect("104 bytes");
    assert_eq!(back, packed);
    assert_eq!(back.as_bytes(), &wire[..]);
}

#[test]
fn attr_fields_travel_big_endian() {
    let attr = PoolAttr {
        major: 0x0102_0304,
        ..Default::default()
    };
    let packed = PackedPoolAttr::pack(&attr);

    // major sits right after the 8-byte signature
    assert_eq!(&packed.as_bytes()[8..12], &[0x01, 0x02, 0x03, 0x04]);
}

#[test]
fn zeroed_attr_means_no_attribute_check() {
    assert!(PoolAttr::default().is_zeroed());
    assert!(PackedPoolAttr::default().is_zeroed());

    let attr = sample_attr();
    assert!(!attr.is_zeroed());
    assert!(!PackedPoolAttr::pack(&attr).is_zeroed());
}
