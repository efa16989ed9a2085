// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tracing::info;

use crate::proto::PersistMethod;

/// Flush routine wired to the WRITE persist mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushFn {
    /// CPU cache flush for true persistent memory.
    PmemPersist,
    /// msync for page-cache backed pools.
    Msync,
    /// APM on true pmem: hardware ordering makes a flush request a protocol
    /// violation.
    FatalNeverCalled,
}

/// memcpy routine wired to the inline (SEND) persist mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemcpyFn {
    PmemMemcpyPersist,
    MsyncMemcpy,
}

/// Persistency policy: the effective method announced to the client and
/// the callbacks servicing each persist mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmPolicy {
    pub method: PersistMethod,
    pub flush: FlushFn,
    pub memcpy: MemcpyFn,
}

/// Choose the persistency method and flush functions from the requested
/// method and the pool type.
///
/// APM is only effective on true pmem; on anything else it degrades to
/// GPSPM with msync. The selected method is what goes back to the client
/// in the create/open response.
pub fn apply_pm_policy(requested: PersistMethod, is_pmem: bool) -> PmPolicy {
    let policy = match (requested, is_pmem) {
        (PersistMethod::Apm, true) => PmPolicy {
            method: PersistMethod::Apm,
            flush: FlushFn::FatalNeverCalled,
            memcpy: MemcpyFn::PmemMemcpyPersist,
        },
        (PersistMethod::Apm, false) => PmPolicy {
            method: PersistMethod::Gpspm,
            flush: FlushFn::Msync,
            memcpy: MemcpyFn::MsyncMemcpy,
        },
        (PersistMethod::Gpspm, true) => PmPolicy {
            method: PersistMethod::Gpspm,
            flush: FlushFn::PmemPersist,
            memcpy: MemcpyFn::PmemMemcpyPersist,
        },
        (PersistMethod::Gpspm, false) => PmPolicy {
            method: PersistMethod::Gpspm,
            flush: FlushFn::Msync,
            memcpy: MemcpyFn::MsyncMemcpy,
        },
    };

    info!(
        "persistency policy: method {}, flush {:?}",
        policy.method.as_str(),
        policy.flush
    );

    policy
}
