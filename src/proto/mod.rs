// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod attr;
pub mod close;
pub mod common;
pub mod create;
pub mod error;
pub mod hdr;
pub mod open;
pub mod parse;
pub mod persist;
pub mod set_attr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

pub const PROTO_MAJOR: u16 = 0;
pub const PROTO_MINOR: u16 = 1;

pub const SIG_SIZE: usize = 8;
pub const UUID_SIZE: usize = 16;
pub const USER_FLAGS_SIZE: usize = 16;

/// Size of the pool header region; header-carrying pools reject persists
/// below this offset.
pub const POOL_HDR_SIZE: u64 = 4096;

pub const MIN_POOL_SIZE: u64 = 8 * 1024;
pub const MIN_PART_SIZE: u64 = 2 * 1024 * 1024;

/// Default buffer size for inline (SEND) persists.
pub const DEF_BUFF_SIZE: u64 = 8192;

/// Types of out-of-band messages. The numeric values are part of the wire
/// protocol and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    Create = 1,
    CreateResp = 2,
    Open = 3,
    OpenResp = 4,
    Close = 5,
    CloseResp = 6,
    SetAttr = 7,
    SetAttrResp = 8,
}

impl MsgType {
    pub fn from_wire(raw: u32) -> Result<Self> {
        Ok(match raw {
            1 => Self::Create,
            2 => Self::CreateResp,
            3 => Self::Open,
            4 => Self::OpenResp,
            5 => Self::Close,
            6 => Self::CloseResp,
            7 => Self::SetAttr,
            8 => Self::SetAttrResp,
            other => bail!("invalid message type -- {other}"),
        })
    }
}

/// Remote persist operation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum PersistMethod {
    /// General Purpose Server Persistency Method: the daemon flushes.
    Gpspm = 1,
    /// Appliance Persistency Method: hardware ordering suffices.
    Apm = 2,
}

impl PersistMethod {
    pub fn from_wire(raw: u32) -> Result<Self> {
        Ok(match raw {
            1 => Self::Gpspm,
            2 => Self::Apm,
            other => bail!("invalid persistency method received -- {other}"),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpspm => "General Purpose Server Persistency Method",
            Self::Apm => "Appliance Persistency Method",
        }
    }
}

/// Fabric providers recognized on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum Provider {
    Verbs = 1,
    Sockets = 2,
}

impl Provider {
    pub fn from_wire(raw: u32) -> Result<Self> {
        Ok(match raw {
            1 => Self::Verbs,
            2 => Self::Sockets,
            other => bail!("invalid provider -- {other}"),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verbs => "verbs",
            Self::Sockets => "sockets",
        }
    }
}

bitflags::bitflags! {
    /// Flags carried by the CLOSE request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloseFlags: u32 {
        /// Unlink every part file of the pool set after closing.
        const REMOVE = 0x1;
    }
}
