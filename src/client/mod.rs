// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI32, Ordering},
};

use anyhow::{Context, Result, anyhow};
use bitflags::bitflags;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    dplane::client::{DataPlane, DataPlaneAttr},
    fabric::connect::select_provider,
    mem::LocalMem,
    obc::{client::ObcClient, ssh::SshConn},
    proto::{
        CloseFlags, DEF_BUFF_SIZE, POOL_HDR_SIZE, PersistMethod, Provider,
        attr::PoolAttr,
        error::RpmemError,
        persist::{DEEP_PERSIST, FLUSH_WRITE, PERSIST_SEND},
    },
    target::{TargetFlags, TargetInfo},
    utils::{FORK_UNSAFE, MAX_NLANES, is_page_aligned},
};

bitflags! {
    /// Flags accepted by flush and persist operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FlushFlags: u32 {
        /// Use plain RDMA WRITE regardless of the default inline mode; no
        /// atomicity guarantees for the flushed range.
        const RELAXED = 0x1;
    }
}

bitflags! {
    /// Flags accepted by [`RpmemPool::remove`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RemoveFlags: u32 {
        /// Ignore errors while removing part files.
        const FORCE = 0x1;
        /// Remove the pool set file as well.
        const POOL_SET = 0x2;
    }
}

/// State shared between the pool handle, the out-of-band monitor and every
/// lane wait: the closing flag, the latched errno and the cancellation
/// token that unblocks all waiters.
#[derive(Debug, Default)]
pub struct PoolState {
    closing: AtomicBool,
    error: AtomicI32,
    pub cancel: CancellationToken,
}

impl PoolState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the first errno and wake every blocked operation. Subsequent
    /// latches keep the original error.
    pub fn latch(&self, errno: i32) {
        let _ = self
            .error
            .compare_exchange(0, errno, Ordering::SeqCst, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn errno(&self) -> i32 {
        self.error.load(Ordering::SeqCst)
    }

    pub fn set_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// Handle to a remote pool: the out-of-band channel, the in-band data
/// plane and the negotiated parameters.
pub struct RpmemPool {
    state: Arc<PoolState>,
    obc: ObcClient,
    dp: DataPlane,
    no_headers: bool,
}

struct CommonInit {
    state: Arc<PoolState>,
    obc: ObcClient,
    info: TargetInfo,
    provider: Provider,
    max_wq_size: usize,
}

impl RpmemPool {
    /// Create a remote pool on the target node and replicate `mem` onto
    /// it.
    ///
    /// `target` has the form `[<user>@]<node>[:<port>]`; `pool_set_name`
    /// names a pool set file relative to the daemon's pool set directory.
    /// The effective lane count is reported back through `nlanes`.
    pub async fn create(
        target: &str,
        pool_set_name: &str,
        mem: LocalMem,
        nlanes: &mut u32,
        create_attr: Option<&PoolAttr>,
    ) -> Result<Self> {
        check_args(&mem, nlanes)?;
        let init = Self::common_init(target).await?;
        Self::create_inner(init, pool_set_name, mem, nlanes, create_attr).await
    }

    /// Create a pool over an already-established control channel; the
    /// channel must share `state` with this handle. Used by transports
    /// other than ssh.
    pub async fn create_with_obc(
        obc: ObcClient,
        state: Arc<PoolState>,
        node: &str,
        pool_set_name: &str,
        mem: LocalMem,
        nlanes: &mut u32,
        create_attr: Option<&PoolAttr>,
    ) -> Result<Self> {
        check_args(&mem, nlanes)?;
        let init = Self::init_with_obc(obc, state, node)?;
        Self::create_inner(init, pool_set_name, mem, nlanes, create_attr).await
    }

    async fn create_inner(
        init: CommonInit,
        pool_set_name: &str,
        mem: LocalMem,
        nlanes: &mut u32,
        create_attr: Option<&PoolAttr>,
    ) -> Result<Self> {
        let req = Self::req_attr(&init, pool_set_name, &mem, *nlanes);
        let ibc = match init.obc.create(&req, create_attr).await {
            Ok(ibc) => ibc,
            Err(e) => {
                warn!("create request failed");
                let _ = init.obc.disconnect().await;
                return Err(e);
            },
        };

        let no_headers = create_attr.is_none_or(PoolAttr::is_zeroed);

        Self::common_fip_init(init, req, ibc, mem, nlanes, no_headers, true).await
    }

    /// Open an existing remote pool; returns the handle and the pool
    /// attributes stored on the target node.
    pub async fn open(
        target: &str,
        pool_set_name: &str,
        mem: LocalMem,
        nlanes: &mut u32,
    ) -> Result<(Self, PoolAttr)> {
        check_args(&mem, nlanes)?;
        let init = Self::common_init(target).await?;
        Self::open_inner(init, pool_set_name, mem, nlanes).await
    }

    /// Open a pool over an already-established control channel.
    pub async fn open_with_obc(
        obc: ObcClient,
        state: Arc<PoolState>,
        node: &str,
        pool_set_name: &str,
        mem: LocalMem,
        nlanes: &mut u32,
    ) -> Result<(Self, PoolAttr)> {
        check_args(&mem, nlanes)?;
        let init = Self::init_with_obc(obc, state, node)?;
        Self::open_inner(init, pool_set_name, mem, nlanes).await
    }

    async fn open_inner(
        init: CommonInit,
        pool_set_name: &str,
        mem: LocalMem,
        nlanes: &mut u32,
    ) -> Result<(Self, PoolAttr)> {
        let req = Self::req_attr(&init, pool_set_name, &mem, *nlanes);
        let (ibc, open_attr) = match init.obc.open(&req).await {
            Ok(res) => res,
            Err(e) => {
                warn!("open request failed");
                let _ = init.obc.disconnect().await;
                return Err(e);
            },
        };

        let no_headers = open_attr.is_zeroed();

        let pool =
            Self::common_fip_init(init, req, ibc, mem, nlanes, no_headers, false)
                .await?;
        Ok((pool, open_attr))
    }

    fn init_with_obc(
        obc: ObcClient,
        state: Arc<PoolState>,
        node: &str,
    ) -> Result<CommonInit> {
        let (provider, max_wq_size) = select_provider(node)?;
        Ok(CommonInit {
            state,
            obc,
            info: TargetInfo::parse(node)?,
            provider,
            max_wq_size,
        })
    }

    async fn common_init(target: &str) -> Result<CommonInit> {
        if *FORK_UNSAFE {
            return Err(anyhow!(RpmemError::ForkUnsafe)
                .context("fabric is initialized without fork() support"));
        }

        let mut info = TargetInfo::parse(target)
            .context("parsing target node address failed")?;

        let (provider, max_wq_size) = select_provider(&info.node)?;
        info!("provider: {}", provider.as_str());

        if provider == Provider::Sockets {
            // the sockets provider does not support IPv6
            info!("forcing using IPv4");
            info.flags |= TargetFlags::USE_IPV4;
        }

        let state = Arc::new(PoolState::new());

        info!("establishing out-of-band connection");
        let obc = ObcClient::connect(&info, Arc::clone(&state))
            .await
            .context("out-of-band connection failed")?;
        info!("out-of-band connection established");

        Ok(CommonInit {
            state,
            obc,
            info,
            provider,
            max_wq_size,
        })
    }

    fn req_attr(
        init: &CommonInit,
        pool_set_name: &str,
        mem: &LocalMem,
        nlanes: u32,
    ) -> crate::proto::common::ReqAttr {
        crate::proto::common::ReqAttr {
            pool_size: mem.len() as u64,
            nlanes: nlanes.min(*MAX_NLANES),
            provider: init.provider,
            buff_size: DEF_BUFF_SIZE,
            pool_desc: pool_set_name.to_string(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn common_fip_init(
        init: CommonInit,
        req: crate::proto::common::ReqAttr,
        ibc: crate::obc::client::IbcInfo,
        mem: LocalMem,
        nlanes: &mut u32,
        no_headers: bool,
        created: bool,
    ) -> Result<Self> {
        let attr = DataPlaneAttr {
            provider: req.provider,
            max_wq_size: init.max_wq_size,
            persist_method: ibc.persist_method,
            laddr: mem,
            size: mem.len(),
            buff_size: DEF_BUFF_SIZE as usize,
            nlanes: (*nlanes).min(ibc.nlanes),
            port: ibc.port,
            raddr: ibc.raddr,
            rkey: ibc.rkey,
        };

        info!("establishing in-band connection");
        let dp = match DataPlane::connect(
            &init.info.node,
            &attr,
            nlanes,
            Arc::clone(&init.state),
        )
        .await
        {
            Ok(dp) => dp,
            Err(e) => {
                warn!("in-band connection initialization failed");
                let flags = if created {
                    CloseFlags::REMOVE
                } else {
                    CloseFlags::empty()
                };
                let _ = init.obc.close(flags).await;
                let _ = init.obc.disconnect().await;
                return Err(e);
            },
        };
        info!("in-band connection established, final nlanes: {}", *nlanes);

        Ok(Self {
            state: init.state,
            obc: init.obc,
            dp,
            no_headers,
        })
    }

    /// The persist method negotiated with the daemon; the daemon may
    /// downgrade a requested APM to GPSPM on non-pmem backing.
    pub fn persist_method(&self) -> PersistMethod {
        self.dp.persist_method()
    }

    pub fn nlanes(&self) -> u32 {
        self.dp.nlanes()
    }

    fn check_error(&self) -> Result<()> {
        match self.state.errno() {
            0 => Ok(()),
            errno if errno == libc::ECONNRESET => Err(RpmemError::ConnReset.into()),
            errno => Err(RpmemError::Errno(errno).into()),
        }
    }

    fn check_offset(&self, offset: usize) -> Result<()> {
        if !self.no_headers && (offset as u64) < POOL_HDR_SIZE {
            return Err(RpmemError::Invalid(format!(
                "offset ({offset}) in pool is less than {POOL_HDR_SIZE} bytes"
            ))
            .into());
        }
        Ok(())
    }

    fn latch_on_error<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            let errno = e
                .downcast_ref::<RpmemError>()
                .map_or(libc::EIO, RpmemError::errno);
            self.state.latch(errno);
        }
        res
    }

    /// Flush a range to the target node; durability requires a subsequent
    /// drain on the same lane.
    pub async fn flush(
        &self,
        offset: usize,
        length: usize,
        lane: u32,
        flags: FlushFlags,
    ) -> Result<()> {
        self.check_error()?;
        self.check_offset(offset)?;

        // inline SEND flush has atomicity guarantees; relaxed flush takes
        // the plain WRITE path
        let mode = if flags.contains(FlushFlags::RELAXED) {
            FLUSH_WRITE
        } else {
            PERSIST_SEND
        };

        let res = self.dp.flush(offset, length, lane, mode).await;
        self.latch_on_error(res)
    }

    /// Wait until every flush submitted on the lane is durable on the
    /// target node.
    pub async fn drain(&self, lane: u32) -> Result<()> {
        self.check_error()?;

        let res = self.dp.drain(lane).await;
        self.latch_on_error(res)
    }

    /// Make a range durable on the target node: flush and drain fused.
    pub async fn persist(
        &self,
        offset: usize,
        length: usize,
        lane: u32,
        flags: FlushFlags,
    ) -> Result<()> {
        self.check_error()?;
        self.check_offset(offset)?;

        let mode = if flags.contains(FlushFlags::RELAXED) {
            FLUSH_WRITE
        } else {
            PERSIST_SEND
        };

        let res = self.dp.persist(offset, length, lane, mode).await;
        self.latch_on_error(res)
    }

    /// Deep persist: flush a range down to the final durability domain of
    /// the target node.
    pub async fn deep_persist(
        &self,
        offset: usize,
        length: usize,
        lane: u32,
    ) -> Result<()> {
        self.check_error()?;
        if (offset as u64) < POOL_HDR_SIZE {
            return Err(RpmemError::Invalid(format!(
                "offset ({offset}) in pool is less than {POOL_HDR_SIZE} bytes"
            ))
            .into());
        }

        let res = self.dp.persist(offset, length, lane, DEEP_PERSIST).await;
        self.latch_on_error(res)
    }

    /// Read back remote pool contents into `buff`.
    pub async fn read(
        &self,
        buff: &mut [u8],
        offset: usize,
        lane: u32,
    ) -> Result<()> {
        self.check_error()?;

        if !self.no_headers && (offset as u64) < POOL_HDR_SIZE {
            debug!(
                "reading from pool at offset ({offset}) less than \
                 {POOL_HDR_SIZE} bytes"
            );
        }

        let res = self.dp.read(buff, offset, lane).await;
        self.latch_on_error(res)
    }

    /// Overwrite the pool attributes stored on the target node.
    pub async fn set_attr(&self, attr: Option<&PoolAttr>) -> Result<()> {
        self.check_error()?;
        self.obc
            .set_attr(attr)
            .await
            .context("set attributes request failed")
    }

    /// Close the remote pool; with [`CloseFlags::REMOVE`] every part file
    /// of the pool set is unlinked on the target node.
    pub async fn close(self, flags: CloseFlags) -> Result<()> {
        info!("closing out-of-band connection");
        self.state.set_closing();

        // tear the data plane down before the close request so the daemon
        // side drains its lanes first
        drop(self.dp);

        let res = self.obc.close(flags).await;
        if let Err(e) = &res {
            warn!("close request failed: {e:#}");
        }

        self.obc.disconnect().await?;
        info!("out-of-band connection closed");

        res
    }

    /// Remove a pool from a remote node by running the daemon in remove
    /// mode over a fresh ssh connection.
    pub async fn remove(
        target: &str,
        pool_set: &str,
        flags: RemoveFlags,
    ) -> Result<()> {
        let info = TargetInfo::parse(target)
            .context("parsing target node address failed")?;

        let mut args = vec!["--remove", pool_set];
        if flags.contains(RemoveFlags::FORCE) {
            args.push("--force");
        }
        if flags.contains(RemoveFlags::POOL_SET) {
            args.push("--pool-set");
        }

        let mut ssh =
            SshConn::execv(&info, &args).context("executing ssh command failed")?;

        ssh.wait_eof()
            .await
            .context("waiting for remote command failed")?;
        ssh.close().await.context("remote command failed")?;

        Ok(())
    }
}

impl std::fmt::Debug for RpmemPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpmemPool")
            .field("nlanes", &self.dp.nlanes())
            .field("persist_method", &self.dp.persist_method())
            .field("no_headers", &self.no_headers)
            .finish_non_exhaustive()
    }
}

fn check_args(mem: &LocalMem, nlanes: &u32) -> Result<()> {
    if mem.is_empty() {
        return Err(RpmemError::Invalid("invalid pool size".to_string()).into());
    }
    if !is_page_aligned(mem.addr() as usize) {
        return Err(RpmemError::Invalid(
            "pool address must be aligned to page size".to_string(),
        )
        .into());
    }
    if !is_page_aligned(mem.len()) {
        return Err(RpmemError::Invalid(
            "pool size must be aligned to page size".to_string(),
        )
        .into());
    }
    if *nlanes == 0 {
        return Err(RpmemError::Invalid(
            "number of lanes must be positive".to_string(),
        )
        .into());
    }
    Ok(())
}
