// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use rpmem_rs::proto::error::{MAX_PROTO_STATUS, ProtoStatus, RpmemError};

#[test]
fn wire_status_values_are_stable() {
    assert_eq!(ProtoStatus::Success as u32, 0);
    assert_eq!(ProtoStatus::BadProto as u32, 1);
    assert_eq!(ProtoStatus::BadName as u32, 2);
    assert_eq!(ProtoStatus::BadSize as u32, 3);
    assert_eq!(ProtoStatus::BadNlanes as u32, 4);
    assert_eq!(ProtoStatus::BadProvider as u32, 5);
    assert_eq!(ProtoStatus::Fatal as u32, 6);
    assert_eq!(ProtoStatus::FatalConn as u32, 7);
    assert_eq!(ProtoStatus::Busy as u32, 8);
    assert_eq!(ProtoStatus::Exists as u32, 9);
    assert_eq!(ProtoStatus::ProvNoSup as u32, 10);
    assert_eq!(ProtoStatus::NoExist as u32, 11);
    assert_eq!(ProtoStatus::NoAccess as u32, 12);
    assert_eq!(ProtoStatus::PoolCfg as u32, 13);
    assert_eq!(MAX_PROTO_STATUS, 14);
}

#[test]
fn status_to_errno_mapping() {
    let expected = [
        (ProtoStatus::Success, 0),
        (ProtoStatus::BadProto, libc::EPROTONOSUPPORT),
        (ProtoStatus::BadName, libc::EINVAL),
        (ProtoStatus::BadSize, libc::EFBIG),
        (ProtoStatus::BadNlanes, libc::EINVAL),
        (ProtoStatus::BadProvider, libc::EINVAL),
        (ProtoStatus::Fatal, libc::EREMOTEIO),
        (ProtoStatus::FatalConn, libc::ECONNABORTED),
        (ProtoStatus::Busy, libc::EBUSY),
        (ProtoStatus::Exists, libc::EEXIST),
        (ProtoStatus::ProvNoSup, libc::EMEDIUMTYPE),
        (ProtoStatus::NoExist, libc::ENOENT),
        (ProtoStatus::NoAccess, libc::EACCES),
        (ProtoStatus::PoolCfg, libc::EINVAL),
    ];

    for (status, errno) in expected {
        assert_eq!(status.errno(), errno, "{status:?}");
        assert_eq!(ProtoStatus::from_wire(status as u32), Some(status));
    }

    assert_eq!(ProtoStatus::from_wire(14), None);
}

#[test]
fn errno_to_status_for_db_failures() {
    assert_eq!(ProtoStatus::from_errno(libc::EEXIST), ProtoStatus::Exists);
    assert_eq!(ProtoStatus::from_errno(libc::EACCES), ProtoStatus::NoAccess);
    assert_eq!(ProtoStatus::from_errno(libc::ENOENT), ProtoStatus::NoExist);
    assert_eq!(
        ProtoStatus::from_errno(libc::EWOULDBLOCK),
        ProtoStatus::Busy
    );
    assert_eq!(ProtoStatus::from_errno(libc::EBADF), ProtoStatus::BadName);
    assert_eq!(ProtoStatus::from_errno(libc::EINVAL), ProtoStatus::PoolCfg);
    assert_eq!(ProtoStatus::from_errno(libc::EIO), ProtoStatus::Fatal);
}

#[test]
fn typed_errors_report_errno() {
    assert_eq!(
        RpmemError::Proto("x".to_string()).errno(),
        libc::EPROTO
    );
    assert_eq!(RpmemError::ConnReset.errno(), libc::ECONNRESET);
    assert_eq!(
        RpmemError::Invalid("x".to_string()).errno(),
        libc::EINVAL
    );
    assert_eq!(RpmemError::NoProvider.errno(), libc::ENOMEDIUM);
    assert_eq!(RpmemError::Status(ProtoStatus::Exists).errno(), libc::EEXIST);
}
