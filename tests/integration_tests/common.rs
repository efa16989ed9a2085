// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, ensure};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rpmem_rs::{
    cfg::{config::DaemonConfig, enums::LogLevel},
    client::{PoolState, RpmemPool},
    daemon::engine::Rpmemd,
    mem::LocalMem,
    obc::client::ObcClient,
    proto::attr::PoolAttr,
    utils::AlignedBuf,
};
use tokio::{io::AsyncReadExt, task::JoinHandle};

pub const PART: usize = 2 * 1024 * 1024;
pub const POOL_SIZE: usize = 2 * PART;
pub const HDR: usize = 4096;

static ENV_INIT: std::sync::Once = std::sync::Once::new();

/// The daemon binds the in-band listener on the SSH_CONNECTION address;
/// tests run loopback-only.
pub fn sanitize_env() {
    ENV_INIT.call_once(|| {
        // SAFETY: called once before any daemon task reads the variable.
        unsafe { std::env::remove_var("SSH_CONNECTION") };
    });
}

pub fn write_poolset(dir: &Path, name: &str, parts: &[(usize, &str)]) -> PathBuf {
    let mut content = String::from("PMEMPOOLSET\n");
    for (size, part) in parts {
        content.push_str(&format!("{size} {}\n", dir.join(part).display()));
    }
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write pool set file");
    path
}

pub fn default_poolset(dir: &Path) -> PathBuf {
    write_poolset(dir, "pool0.set", &[(PART, "part0"), (PART, "part1")])
}

pub fn test_config(dir: &Path, persist_apm: bool) -> DaemonConfig {
    DaemonConfig {
        log_file: None,
        poolset_dir: dir.to_path_buf(),
        persist_apm,
        persist_general: true,
        use_syslog: false,
        log_level: LogLevel::Err,
        nthreads: 0,
    }
}

/// Page-aligned local pool memory for the client side of the tests.
pub struct PoolMem {
    buf: AlignedBuf,
}

impl PoolMem {
    pub fn zeroed(len: usize) -> Self {
        Self {
            buf: AlignedBuf::zeroed(len).expect("aligned pool memory"),
        }
    }

    /// Fill everything above the header with a deterministic PRNG
    /// sequence.
    pub fn fill_random(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        rng.fill(&mut self.buf.as_mut_slice()[HDR..]);
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut_slice()
    }

    /// View for the pool handle; the handle must not outlive this object.
    pub fn local(&self) -> LocalMem {
        // SAFETY: the tests keep the PoolMem alive for the pool lifetime.
        unsafe { LocalMem::from_raw(self.buf.as_slice().as_ptr(), self.buf.len()) }
    }
}

pub type DaemonHandle = JoinHandle<Result<()>>;

/// Boot a daemon engine over an in-process duplex control channel and hand
/// back the connected client side.
pub async fn start_session(
    config: DaemonConfig,
) -> Result<(ObcClient, Arc<PoolState>, DaemonHandle)> {
    sanitize_env();

    let (client_io, daemon_io) = tokio::io::duplex(1 << 16);
    let (mut c_rd, c_wr) = tokio::io::split(client_io);
    let (d_rd, d_wr) = tokio::io::split(daemon_io);

    let daemon: DaemonHandle = tokio::spawn(async move {
        let mut rpmemd = Rpmemd::new(config)?;
        rpmemd.serve(d_rd, d_wr).await
    });

    let mut status = [0u8; 4];
    c_rd.read_exact(&mut status)
        .await
        .context("reading initial status")?;
    ensure!(u32::from_be_bytes(status) == 0, "daemon not ready");

    let state = Arc::new(PoolState::new());
    let obc = ObcClient::from_io(c_rd, c_wr, Arc::clone(&state));

    Ok((obc, state, daemon))
}

pub async fn create_pool(
    dir: &Path,
    desc: &str,
    mem: LocalMem,
    nlanes: &mut u32,
    attr: Option<&PoolAttr>,
    persist_apm: bool,
) -> Result<(RpmemPool, DaemonHandle)> {
    let (obc, state, daemon) = start_session(test_config(dir, persist_apm)).await?;
    let pool = RpmemPool::create_with_obc(
        obc, state, "127.0.0.1", desc, mem, nlanes, attr,
    )
    .await?;
    Ok((pool, daemon))
}

pub async fn open_pool(
    dir: &Path,
    desc: &str,
    mem: LocalMem,
    nlanes: &mut u32,
    persist_apm: bool,
) -> Result<(RpmemPool, PoolAttr, DaemonHandle)> {
    let (obc, state, daemon) = start_session(test_config(dir, persist_apm)).await?;
    let (pool, attr) =
        RpmemPool::open_with_obc(obc, state, "127.0.0.1", desc, mem, nlanes)
            .await?;
    Ok((pool, attr, daemon))
}

pub fn sample_attr() -> PoolAttr {
    PoolAttr {
        signature: *b"<RPMEM>\0",
        major: 1,
        compat_features: 0x1,
        incompat_features: 0x2,
        ro_compat_features: 0x4,
        poolset_uuid: *b"POOLSET_UUID0123",
        uuid: *b"FIRST_PART_UUID0",
        next_uuid: *b"NEXT_REPL_UUID00",
        prev_uuid: *b"PREV_REPL_UUID00",
        user_flags: *b"USER_FLAGS012345",
    }
}
