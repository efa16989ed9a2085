// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{BufMut, BytesMut};
use rpmem_rs::proto::{
    CloseFlags, MsgType,
    attr::{PackedPoolAttr, PoolAttr},
    close::CloseReq,
    common::ReqAttr,
    create::{CREATE_FIXED_SIZE, CreateReq},
    error::{ProtoStatus, RpmemError},
    hdr::{MSG_HDR_SIZE, MsgHdr, MsgHdrResp},
    open::OpenReq,
    parse::{Request, WireRequest, encode_request},
    set_attr::SetAttrReq,
    Provider,
};
use zerocopy::{FromBytes, IntoBytes};

fn sample_req(desc: &str) -> ReqAttr {
    ReqAttr {
        pool_size: 8 << 20,
        nlanes: 32,
        provider: Provider::Verbs,
        buff_size: 8192,
        pool_desc: desc.to_string(),
    }
}

fn sample_create(desc: &str) -> CreateReq {
    CreateReq {
        req: sample_req(desc),
        pool_attr: PackedPoolAttr::pack(&PoolAttr {
            signature: *b"<RPMEM>\0",
            major: 1,
            poolset_uuid: *b"POOLSET_UUID0123",
            ..Default::default()
        }),
    }
}

fn decode_wire(wire: &[u8]) -> Result<Request, RpmemError> {
    let (hdr, body) = wire.split_at(MSG_HDR_SIZE);
    let hdr = MsgHdr::read_from_bytes(hdr).expect("header");
    Request::decode(&hdr, body)
}

fn is_proto_err(err: &RpmemError) -> bool {
    matches!(err, RpmemError::Proto(_)) && err.errno() == libc::EPROTO
}

#[test]
fn create_request_roundtrip() {
    let msg = sample_create("pool0.set");
    let wire = encode_request(&msg);
    assert_eq!(
        wire.len(),
        CREATE_FIXED_SIZE + "pool0.set".len() + 1,
        "declared layout"
    );

    match decode_wire(&wire).expect("decodes") {
        Request::Create(back) => assert_eq!(back, msg),
        other => panic!("wrong request decoded: {other:?}"),
    }
}

#[test]
fn open_request_roundtrip() {
    let msg = OpenReq {
        req: sample_req("dir/pool1.set"),
    };
    let wire = encode_request(&msg);

    match decode_wire(&wire).expect("decodes") {
        Request::Open(back) => assert_eq!(back, msg),
        other => panic!("wrong request decoded: {other:?}"),
    }
}

#[test]
fn close_and_set_attr_roundtrip() {
    let close = CloseReq {
        flags: CloseFlags::REMOVE,
    };
    match decode_wire(&encode_request(&close)).expect("decodes") {
        Request::Close(back) => assert_eq!(back, close),
        other => panic!("wrong request decoded: {other:?}"),
    }

    let set_attr = SetAttrReq {
        pool_attr: PackedPoolAttr::pack(&PoolAttr {
            user_flags: *b"USER_FLAGS012345",
            ..Default::default()
        }),
    };
    match decode_wire(&encode_request(&set_attr)).expect("decodes") {
        Request::SetAttr(back) => assert_eq!(back, set_attr),
        other => panic!("wrong request decoded: {other:?}"),
    }
}

#[test]
fn truncated_messages_are_rejected() {
    let wire = encode_request(&sample_create("pool0.set"));
    let hdr = MsgHdr::read_from_bytes(&wire[..MSG_HDR_SIZE]).expect("header");

    // every proper prefix of the body fails before any state is mutated
    for cut in 0..wire.len() - MSG_HDR_SIZE {
        let err = Request::decode(&hdr, &wire[MSG_HDR_SIZE..MSG_HDR_SIZE + cut])
            .expect_err("truncated body must not decode");
        assert!(is_proto_err(&err), "cut at {cut}: {err}");
    }
}

#[test]
fn version_guard() {
    // a CREATE with a bumped major version must be rejected
    let wire = encode_request(&sample_create("pool0.set"));
    let mut raw = wire.to_vec();
    // major is the first field of the common block, right after the header
    raw[MSG_HDR_SIZE] = 0xff;

    let err = decode_wire(&raw).expect_err("bad version");
    assert!(is_proto_err(&err));

    // the wire status reserved for version mismatch maps to
    // EPROTONOSUPPORT on the client
    assert_eq!(ProtoStatus::BadProto.errno(), libc::EPROTONOSUPPORT);
}

#[test]
fn provider_guard() {
    let wire = encode_request(&sample_create("pool0.set"));
    let mut raw = wire.to_vec();
    // provider field: common block offset 16 (2+2+8+4)
    let off = MSG_HDR_SIZE + 16;
    raw[off..off + 4].copy_from_slice(&7u32.to_be_bytes());

    let err = decode_wire(&raw).expect_err("bad provider");
    assert!(is_proto_err(&err));
}

#[test]
fn descriptor_bounds() {
    // size below the minimum of two bytes
    let mut msg = sample_create("");
    msg.req.pool_desc = String::new();
    let wire = encode_request(&msg);
    let err = decode_wire(&wire).expect_err("descriptor of 1 byte");
    assert!(is_proto_err(&err));

    // descriptor not NUL-terminated at size-1
    let ok = encode_request(&sample_create("pool0.set"));
    let mut raw = ok.to_vec();
    let last = raw.len() - 1;
    raw[last] = b'x';
    let err = decode_wire(&raw).expect_err("missing terminator");
    assert!(is_proto_err(&err));

    // interior NUL makes the declared size disagree with the string
    let mut raw = ok.to_vec();
    raw[last - 2] = 0;
    let err = decode_wire(&raw).expect_err("interior NUL");
    assert!(is_proto_err(&err));

    // header size not matching fixed part + descriptor size
    let mut raw = ok.to_vec();
    let hdr = MsgHdr::new(MsgType::Create, raw.len() as u64 + 4);
    raw[..MSG_HDR_SIZE].copy_from_slice(hdr.as_bytes());
    let err = decode_wire(&raw).expect_err("size mismatch");
    assert!(is_proto_err(&err));
}

#[test]
fn unknown_and_response_types_are_rejected() {
    for typ in [0u32, 2, 4, 6, 8, 9, 0xffff_ffff] {
        let mut raw = BytesMut::new();
        raw.put_u32(typ);
        raw.put_u64(MSG_HDR_SIZE as u64 + 4);
        raw.put_u32(0);

        let hdr = MsgHdr::read_from_bytes(&raw[..MSG_HDR_SIZE]).expect("header");
        let err = Request::decode(&hdr, &raw[MSG_HDR_SIZE..])
            .expect_err("non-request type");
        assert!(is_proto_err(&err), "type {typ}");
    }
}

#[test]
fn response_header_validation() {
    // mismatched type
    let hdr = MsgHdrResp::new(ProtoStatus::Success, MsgType::OpenResp, 44);
    let err = hdr.validate(MsgType::CreateResp, 44).expect_err("type");
    assert!(is_proto_err(&err));

    // mismatched size
    let hdr = MsgHdrResp::new(ProtoStatus::Success, MsgType::CreateResp, 45);
    let err = hdr.validate(MsgType::CreateResp, 44).expect_err("size");
    assert!(is_proto_err(&err));

    // status out of range
    let mut raw = [0u8; 16];
    raw[..4].copy_from_slice(&14u32.to_be_bytes());
    raw[4..8].copy_from_slice(&(MsgType::CreateResp as u32).to_be_bytes());
    raw[8..16].copy_from_slice(&44u64.to_be_bytes());
    let hdr = MsgHdrResp::read_from_bytes(&raw).expect("header");
    let err = hdr.validate(MsgType::CreateResp, 44).expect_err("status 14");
    assert!(is_proto_err(&err));

    // carried error status maps to its errno
    let hdr = MsgHdrResp::new(ProtoStatus::Busy, MsgType::CreateResp, 44);
    let err = hdr.validate(MsgType::CreateResp, 44).expect_err("busy");
    assert_eq!(err.errno(), libc::EBUSY);
}

#[test]
fn message_type_values_are_wire_stable() {
    assert_eq!(MsgType::Create as u32, 1);
    assert_eq!(MsgType::CreateResp as u32, 2);
    assert_eq!(MsgType::Open as u32, 3);
    assert_eq!(MsgType::OpenResp as u32, 4);
    assert_eq!(MsgType::Close as u32, 5);
    assert_eq!(MsgType::CloseResp as u32, 6);
    assert_eq!(MsgType::SetAttr as u32, 7);
    assert_eq!(MsgType::SetAttrResp as u32, 8);

    let msg = sample_create("p");
    assert_eq!(msg.msg_type(), MsgType::Create);
}
