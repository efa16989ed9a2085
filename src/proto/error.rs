// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Response status codes carried on the wire. Numeric values are fixed by
/// the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProtoStatus {
    Success = 0,
    BadProto = 1,
    BadName = 2,
    BadSize = 3,
    BadNlanes = 4,
    BadProvider = 5,
    Fatal = 6,
    FatalConn = 7,
    Busy = 8,
    Exists = 9,
    ProvNoSup = 10,
    NoExist = 11,
    NoAccess = 12,
    PoolCfg = 13,
}

pub const MAX_PROTO_STATUS: u32 = 14;

impl ProtoStatus {
    pub fn from_wire(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Success,
            1 => Self::BadProto,
            2 => Self::BadName,
            3 => Self::BadSize,
            4 => Self::BadNlanes,
            5 => Self::BadProvider,
            6 => Self::Fatal,
            7 => Self::FatalConn,
            8 => Self::Busy,
            9 => Self::Exists,
            10 => Self::ProvNoSup,
            11 => Self::NoExist,
            12 => Self::NoAccess,
            13 => Self::PoolCfg,
            _ => return None,
        })
    }

    /// Local errno value the status maps to on the client.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::BadProto => libc::EPROTONOSUPPORT,
            Self::BadName => libc::EINVAL,
            Self::BadSize => libc::EFBIG,
            Self::BadNlanes => libc::EINVAL,
            Self::BadProvider => libc::EINVAL,
            Self::Fatal => libc::EREMOTEIO,
            Self::FatalConn => libc::ECONNABORTED,
            Self::Busy => libc::EBUSY,
            Self::Exists => libc::EEXIST,
            Self::ProvNoSup => libc::EMEDIUMTYPE,
            Self::NoExist => libc::ENOENT,
            Self::NoAccess => libc::EACCES,
            Self::PoolCfg => libc::EINVAL,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::BadProto => "Protocol version number mismatch",
            Self::BadName => "Invalid pool descriptor",
            Self::BadSize => "Invalid pool size",
            Self::BadNlanes => "Invalid number of lanes",
            Self::BadProvider => "Invalid provider",
            Self::Fatal => "Fatal error",
            Self::FatalConn => "Fatal in-band connection error",
            Self::Busy => "Pool already in use",
            Self::Exists => "Pool already exists",
            Self::ProvNoSup => "Provider not supported",
            Self::NoExist => {
                "Pool set or its part doesn't exist or it is unavailable"
            },
            Self::NoAccess => "Pool set permission denied",
            Self::PoolCfg => "Invalid pool set configuration",
        }
    }

    /// Wire status for a local errno, used by the daemon when converting db
    /// failures into responses.
    pub fn from_errno(err: i32) -> Self {
        match err {
            libc::EEXIST => Self::Exists,
            libc::EACCES => Self::NoAccess,
            libc::ENOENT => Self::NoExist,
            libc::EWOULDBLOCK => Self::Busy,
            libc::EBADF => Self::BadName,
            libc::EINVAL => Self::PoolCfg,
            _ => Self::Fatal,
        }
    }
}

/// Typed errors surfaced by the library. Every variant reports the errno
/// the original C API would have set.
#[derive(Debug, Error)]
pub enum RpmemError {
    /// Malformed header, truncated body, unknown type, version mismatch.
    #[error("protocol violation: {0}")]
    Proto(String),

    /// Non-success status received from the daemon.
    #[error("{}", .0.as_str())]
    Status(ProtoStatus),

    /// The peer went away; latched into the pool handle by the monitor.
    #[error("connection reset by peer")]
    ConnReset,

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("no provider available for target")]
    NoProvider,

    /// The provider was initialized without fork() support.
    #[error("fabric initialized without fork() support")]
    ForkUnsafe,

    #[error("operation timed out: {0}")]
    Timeout(&'static str),

    /// An errno latched into the pool handle by an earlier failure;
    /// subsequent operations fail fast with it.
    #[error("pool handle failed (errno {0})")]
    Errno(i32),
}

impl RpmemError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::Proto(_) => libc::EPROTO,
            Self::Status(s) => s.errno(),
            Self::ConnReset => libc::ECONNRESET,
            Self::Invalid(_) => libc::EINVAL,
            Self::NoProvider => libc::ENOMEDIUM,
            Self::ForkUnsafe => libc::EPERM,
            Self::Timeout(_) => libc::ETIMEDOUT,
            Self::Errno(errno) => *errno,
        }
    }
}
