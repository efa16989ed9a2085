// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::alloc::{self, Layout};

use anyhow::{Result, bail};
use once_cell::sync::Lazy;
use tracing::warn;

/// Environment variable with the command used to spawn the remote daemon.
pub const RPMEM_CMD_ENV: &str = "RPMEM_CMD";
/// Environment variable overriding the ssh executable.
pub const RPMEM_SSH_ENV: &str = "RPMEM_SSH";
pub const RPMEM_DEF_CMD: &str = "rpmemd";
pub const RPMEM_DEF_SSH: &str = "ssh";
pub const RPMEM_PROV_SOCKET_ENV: &str = "RPMEM_ENABLE_SOCKETS";
pub const RPMEM_PROV_VERBS_ENV: &str = "RPMEM_ENABLE_VERBS";
pub const RPMEM_MAX_NLANES_ENV: &str = "RPMEM_MAX_NLANES";
pub const RPMEM_WQ_SIZE_ENV: &str = "RPMEM_WORK_QUEUE_SIZE";
const FORK_UNSAFE_ENV: &str = "FI_FORK_UNSAFE";

pub const PAGE_SIZE: usize = 4096;

/// Read a positive integer from the environment. Invalid values are logged
/// and ignored, matching the lenient tunable handling of the daemon's peers.
pub fn env_uint(name: &str) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    if val.is_empty() {
        return None;
    }
    match val.parse::<i64>() {
        Ok(v) if v > 0 => Some(v.min(i64::from(u32::MAX)) as u32),
        _ => {
            warn!("{name} variable must be a positive integer");
            None
        },
    }
}

/// Parse boolean-ish environment value ("1"/"0", "yes"/"no", "true"/"false",
/// "on"/"off").
pub fn env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("{name} variable must be a boolean");
            None
        },
    }
}

/// Upper clamp on the number of lanes, RPMEM_MAX_NLANES. Read once at first
/// use and immutable afterwards.
pub static MAX_NLANES: Lazy<u32> =
    Lazy::new(|| env_uint(RPMEM_MAX_NLANES_ENV).unwrap_or(u32::MAX));

/// Requested TX work queue size, RPMEM_WORK_QUEUE_SIZE.
///
/// A work queue of 50 elements gives the best throughput of consecutive
/// flush operations with the smallest resource footprint; the default was
/// obtained empirically on the reference setup.
pub static WQ_SIZE: Lazy<u32> =
    Lazy::new(|| env_uint(RPMEM_WQ_SIZE_ENV).unwrap_or(50));

/// Whether the provider was initialized without fork() support. When set,
/// create/open must refuse to build a pool handle.
pub static FORK_UNSAFE: Lazy<bool> =
    Lazy::new(|| env_bool(FORK_UNSAFE_ENV).unwrap_or(false));

/// Parse a size with an optional K/M/G/T binary suffix ("8M" -> 8 MiB).
pub fn parse_size(s: &str) -> Result<usize> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty size");
    }
    let (digits, mult) = match s.as_bytes()[s.len() - 1].to_ascii_uppercase() {
        b'K' => (&s[..s.len() - 1], 1usize << 10),
        b'M' => (&s[..s.len() - 1], 1usize << 20),
        b'G' => (&s[..s.len() - 1], 1usize << 30),
        b'T' => (&s[..s.len() - 1], 1usize << 40),
        _ => (s, 1usize),
    };
    let base: usize = digits
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid size '{s}': {e}"))?;
    base.checked_mul(mult)
        .ok_or_else(|| anyhow::anyhow!("size overflow: '{s}'"))
}

#[inline]
pub fn is_page_aligned(v: usize) -> bool {
    v % PAGE_SIZE == 0
}

#[inline]
pub fn page_align_up(v: usize) -> usize {
    v.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Page-aligned heap buffer used as the local target of RMA READ operations
/// and as lane scratch space.
pub struct AlignedBuf {
    ptr: *mut u8,
    len: usize,
}

// The buffer is plain owned memory; the raw pointer is only kept to remember
// the allocation.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    pub fn zeroed(len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(1), PAGE_SIZE)
            .map_err(|e| anyhow::anyhow!("invalid buffer layout: {e}"))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            bail!("allocating {len} byte aligned buffer failed");
        }
        Ok(Self { ptr, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe the owned allocation.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr/len describe the owned allocation.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        if let Ok(layout) = Layout::from_size_align(self.len.max(1), PAGE_SIZE) {
            // SAFETY: allocated with the same layout in `zeroed`.
            unsafe { alloc::dealloc(self.ptr, layout) };
        }
    }
}
