// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use tokio::{io::{AsyncRead, AsyncWrite}, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    cfg::config::DaemonConfig,
    daemon::{
        db::{DbPool, PoolSetDb, db_status},
        policy::apply_pm_policy,
    },
    dplane::server::{InbandAttr, InbandServer, init_error_status},
    obc::server::{ObcEvent, ObcServer},
    proto::{
        CloseFlags, MIN_POOL_SIZE, PersistMethod,
        attr::{PackedPoolAttr, PoolAttr},
        close::CloseReq,
        common::{ReqAttr, RespAttr},
        create::CreateReq,
        error::ProtoStatus,
        open::OpenReq,
        parse::Request,
        set_attr::SetAttrReq,
    },
    target::ssh_conn_addr,
};

/// The daemon engine: pool lifecycle state and the request handlers wired
/// into the out-of-band dispatch loop.
pub struct Rpmemd {
    db: Arc<PoolSetDb>,
    config: DaemonConfig,
    persist_method: PersistMethod,

    pool: Option<Arc<DbPool>>,
    created: bool,
    fip: Option<Arc<InbandServer>>,
    fip_task: Option<JoinHandle<Result<()>>>,
    closing: bool,
}

impl Rpmemd {
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let persist_method = if config.persist_apm {
            PersistMethod::Apm
        } else {
            PersistMethod::Gpspm
        };

        let db = Arc::new(PoolSetDb::new(&config.poolset_dir, 0o666)?);

        Ok(Self {
            db,
            config,
            persist_method,
            pool: None,
            created: false,
            fip: None,
            fip_task: None,
            closing: false,
        })
    }

    pub fn db(&self) -> &Arc<PoolSetDb> {
        &self.db
    }

    /// Run the single-threaded out-of-band event loop over the byte
    /// stream: status word first, then request dispatch until close or
    /// disconnect.
    pub async fn serve<R, W>(&mut self, rd: R, wr: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut obc = ObcServer::new(rd, wr);
        obc.status(0).await?;

        self.print_info();

        loop {
            let event = match obc.recv_request().await {
                Ok(event) => event,
                Err(e) => {
                    error!("out-of-band connection process failed: {e:#}");
                    self.req_cleanup().await;
                    return Err(e);
                },
            };

            let res = match event {
                ObcEvent::Disconnected => break,
                ObcEvent::Request(Request::Create(req)) => {
                    self.req_create(&mut obc, req).await
                },
                ObcEvent::Request(Request::Open(req)) => {
                    self.req_open(&mut obc, req).await
                },
                ObcEvent::Request(Request::Close(req)) => {
                    self.req_close(&mut obc, req).await
                },
                ObcEvent::Request(Request::SetAttr(req)) => {
                    self.req_set_attr(&mut obc, req).await
                },
            };

            if let Err(e) = res {
                error!("out-of-band connection process failed: {e:#}");
                self.req_cleanup().await;
                return Err(e);
            }

            if self.closing {
                break;
            }
        }

        self.req_cleanup().await;
        Ok(())
    }

    fn print_info(&self) {
        info!(
            "ssh connection: {}",
            std::env::var("SSH_CONNECTION").unwrap_or_else(|_| "(null)".into())
        );
        info!(
            "user: {}",
            std::env::var("USER").unwrap_or_else(|_| "(null)".into())
        );
        info!(
            "pool set directory: '{}'",
            self.config.poolset_dir.display()
        );
        info!("persist method: {}", self.persist_method.as_str());
        info!("number of threads: {}", self.config.nthreads);
    }

    /// Verify pool parameters against the request.
    fn check_pool(pool: &DbPool, req: &ReqAttr) -> Result<(), ProtoStatus> {
        if req.nlanes == 0 {
            error!("invalid number of lanes -- 0");
            return Err(ProtoStatus::BadNlanes);
        }
        if (pool.pool_size() as u64) < MIN_POOL_SIZE {
            error!("invalid pool size -- must be >= {MIN_POOL_SIZE}");
            return Err(ProtoStatus::PoolCfg);
        }
        if (pool.pool_size() as u64) < req.pool_size {
            error!("requested size is too big");
            return Err(ProtoStatus::BadSize);
        }
        Ok(())
    }

    /// Bring up the daemon side of the data plane for an opened pool.
    async fn fip_init(
        &mut self,
        pool: &Arc<DbPool>,
        req: &ReqAttr,
        no_headers: bool,
    ) -> Result<RespAttr, ProtoStatus> {
        let policy = apply_pm_policy(self.persist_method, pool.set.is_pmem());

        let deep_pool = Arc::clone(pool);
        let attr = InbandAttr {
            region: pool.set.region(),
            nlanes: req.nlanes,
            nthreads: self.config.nthreads,
            provider: req.provider,
            persist_method: self.persist_method,
            buff_size: req.buff_size as usize,
            policy,
            no_headers,
            deep: Arc::new(move |offset, len| {
                deep_pool.set.deep_flush(offset, len)
            }),
        };

        let node = ssh_conn_addr().unwrap_or_else(|| "127.0.0.1".to_string());

        let (fip, resp) = InbandServer::init(&node, attr).await.map_err(|e| {
            error!("in-band initialization failed: {e:#}");
            init_error_status(&e)
        })?;

        // establish the in-band connection in the background while the
        // response travels back to the client
        let accept_fip = Arc::clone(&fip);
        self.fip_task = Some(tokio::spawn(async move {
            accept_fip.accept_and_start().await
        }));
        self.fip = Some(fip);

        Ok(resp)
    }

    /// Handle a create request.
    async fn req_create<R, W>(
        &mut self,
        obc: &mut ObcServer<R, W>,
        msg: CreateReq,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("create request: '{}'", msg.req.pool_desc);

        let rattr: Option<PoolAttr> = if msg.pool_attr.is_zeroed() {
            None
        } else {
            Some(msg.pool_attr.unpack())
        };

        let status = self.do_create(&msg.req, rattr.as_ref()).await;
        match status {
            Ok(resp) => {
                info!("create request response: (status = 0)");
                obc.send_create_resp(ProtoStatus::Success, &resp).await
            },
            Err(status) => {
                warn!("create request response: (status = {})", status as u32);
                self.closing = true;
                obc.send_create_resp(status, &RespAttr::default()).await
            },
        }
    }

    async fn do_create(
        &mut self,
        req: &ReqAttr,
        rattr: Option<&PoolAttr>,
    ) -> Result<RespAttr, ProtoStatus> {
        if self.pool.is_some() {
            error!("pool already opened");
            return Err(ProtoStatus::Fatal);
        }

        let pool = self
            .db
            .pool_create(&req.pool_desc, req.pool_size as usize, rattr)
            .await
            .map_err(|e| {
                error!("{e:#}");
                db_status(&e)
            })?;
        self.created = true;

        let res = async {
            Self::check_pool(&pool, req)?;
            self.fip_init(&pool, req, rattr.is_none()).await
        }
        .await;

        match res {
            Ok(resp) => {
                self.pool = Some(pool);
                Ok(resp)
            },
            Err(status) => {
                // a failed create leaves no pool behind
                let desc = pool.pool_desc.clone();
                self.db.pool_close(pool).await;
                if let Err(e) = self.db.pool_remove(&desc, false, false).await {
                    error!("removing pool '{desc}' failed: {e:#}");
                }
                self.created = false;
                Err(status)
            },
        }
    }

    /// Handle an open request.
    async fn req_open<R, W>(
        &mut self,
        obc: &mut ObcServer<R, W>,
        msg: OpenReq,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("open request: '{}'", msg.req.pool_desc);

        match self.do_open(&msg.req).await {
            Ok((resp, pool_attr)) => {
                info!("open request response: (status = 0)");
                obc.send_open_resp(ProtoStatus::Success, &resp, &pool_attr).await
            },
            Err(status) => {
                warn!("open request response: (status = {})", status as u32);
                self.closing = true;
                obc.send_open_resp(
                    status,
                    &RespAttr::default(),
                    &PackedPoolAttr::default(),
                )
                .await
            },
        }
    }

    async fn do_open(
        &mut self,
        req: &ReqAttr,
    ) -> Result<(RespAttr, PackedPoolAttr), ProtoStatus> {
        if self.pool.is_some() {
            error!("pool already opened");
            return Err(ProtoStatus::Fatal);
        }

        let (pool, pool_attr) = self
            .db
            .pool_open(&req.pool_desc, req.pool_size as usize)
            .await
            .map_err(|e| {
                error!("{e:#}");
                db_status(&e)
            })?;

        let res = async {
            Self::check_pool(&pool, req)?;
            self.fip_init(&pool, req, pool_attr.is_zeroed()).await
        }
        .await;

        match res {
            Ok(resp) => {
                self.pool = Some(pool);
                Ok((resp, pool_attr))
            },
            Err(status) => {
                self.db.pool_close(pool).await;
                Err(status)
            },
        }
    }

    /// Handle a close request; the REMOVE flag unlinks a created pool.
    async fn req_close<R, W>(
        &mut self,
        obc: &mut ObcServer<R, W>,
        msg: CloseReq,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("close request");
        self.closing = true;

        let Some(pool) = self.pool.take() else {
            error!("pool not opened");
            return obc.send_close_resp(ProtoStatus::Fatal).await;
        };

        let mut status = ProtoStatus::Success;

        if let Err(e) = self.fip_stop().await {
            error!("stopping in-band processing failed: {e:#}");
            status = ProtoStatus::Fatal;
        }

        let remove = self.created
            && (status != ProtoStatus::Success
                || msg.flags.contains(CloseFlags::REMOVE));

        let desc = pool.pool_desc.clone();
        self.db.pool_close(pool).await;
        if remove {
            info!("removing '{desc}'");
            if let Err(e) = self.db.pool_remove(&desc, false, false).await {
                error!("removing pool '{desc}' failed: {e:#}");
            }
        }

        info!("close request response (status = {})", status as u32);
        obc.send_close_resp(status).await
    }

    /// Handle a set attributes request.
    async fn req_set_attr<R, W>(
        &mut self,
        obc: &mut ObcServer<R, W>,
        msg: SetAttrReq,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("set attributes request");

        let status = match &self.pool {
            None => {
                error!("pool not opened");
                ProtoStatus::Fatal
            },
            Some(pool) => {
                match self.db.pool_set_attr(pool, &msg.pool_attr).await {
                    Ok(()) => ProtoStatus::Success,
                    Err(e) => {
                        error!("setting pool attributes failed: {e:#}");
                        db_status(&e)
                    },
                }
            },
        };

        obc.send_set_attr_resp(status).await
    }

    /// Stop the in-band background task and worker pool.
    async fn fip_stop(&mut self) -> Result<()> {
        let mut res = Ok(());

        if let Some(task) = self.fip_task.take() {
            match task.await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => res = Err(e),
                Err(e) => res = Err(anyhow::anyhow!(e).context("in-band task")),
            }
        }

        if let Some(fip) = self.fip.take() {
            fip.stop().await;
        }

        res
    }

    /// Clean up the in-band connection and everything allocated during
    /// open/create when the control channel dies unexpectedly.
    async fn req_cleanup(&mut self) {
        if self.fip.is_none() && self.pool.is_none() {
            return;
        }

        let fip_failed = self.fip_stop().await.is_err();

        if let Some(pool) = self.pool.take() {
            let remove = self.created && fip_failed;
            let desc = pool.pool_desc.clone();
            self.db.pool_close(pool).await;
            if remove {
                info!("removing '{desc}'");
                if let Err(e) = self.db.pool_remove(&desc, false, false).await {
                    error!("removing pool '{desc}' failed: {e:#}");
                }
            }
        }
    }
}

impl std::fmt::Debug for Rpmemd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rpmemd")
            .field("persist_method", &self.persist_method)
            .field("created", &self.created)
            .field("closing", &self.closing)
            .finish_non_exhaustive()
    }
}
