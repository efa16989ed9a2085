// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Result, anyhow, bail};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::{
    poolset::{self, Set, SetFile},
    proto::{
        MIN_PART_SIZE, MIN_POOL_SIZE,
        attr::{PackedPoolAttr, PoolAttr},
        error::ProtoStatus,
    },
};

/// An opened pool: the mapped set plus the metadata the data plane needs.
#[derive(Debug)]
pub struct DbPool {
    pub pool_desc: String,
    pub set: Set,
}

impl DbPool {
    pub fn pool_size(&self) -> usize {
        self.set.poolsize()
    }
}

/// Database of pool set files under one root directory. A single lock
/// serializes every create/open/close/remove operation.
#[derive(Debug)]
pub struct PoolSetDb {
    lock: Mutex<()>,
    root_dir: PathBuf,
    mode: u32,
}

impl PoolSetDb {
    /// Initialize the database; the root directory must be an absolute
    /// path.
    pub fn new(root_dir: &Path, mode: u32) -> Result<Self> {
        if !root_dir.is_absolute() {
            bail!(
                "root directory is not an absolute path -- '{}'",
                root_dir.display()
            );
        }
        Ok(Self {
            lock: Mutex::new(()),
            root_dir: root_dir.to_path_buf(),
            mode,
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Resolve a pool descriptor to the pool set file path. Absolute
    /// descriptors and descriptors whose resolution escapes the root
    /// directory are rejected with EBADF so the client can tell this apart
    /// from other failures.
    fn resolve(&self, pool_desc: &str) -> Result<PathBuf> {
        let escapes = pool_desc.starts_with('/')
            || Path::new(pool_desc)
                .components()
                .any(|c| c == std::path::Component::ParentDir);
        if escapes {
            return Err(anyhow!(std::io::Error::from_raw_os_error(libc::EBADF))
                .context(format!(
                    "pool descriptor does not resolve under the pool set \
                     directory -- '{pool_desc}'"
                )));
        }
        Ok(self.root_dir.join(pool_desc))
    }

    /// Create a new pool set. With attributes present they are stored in
    /// the pool header; an absent attribute block creates a headerless
    /// pool.
    pub async fn pool_create(
        &self,
        pool_desc: &str,
        _pool_size: usize,
        attr: Option<&PoolAttr>,
    ) -> Result<Arc<DbPool>> {
        let _guard = self.lock.lock().await;

        let path = self.resolve(pool_desc)?;
        let set = Set::create(
            &path,
            MIN_POOL_SIZE as usize,
            MIN_PART_SIZE as usize,
            self.mode,
        )
        .map_err(|e| e.context(format!("cannot create pool set -- '{pool_desc}'")))?;

        set.madvise_dontfork()?;

        if let Some(attr) = attr {
            set.write_attr(&PackedPoolAttr::pack(attr))?;
        }

        Ok(Arc::new(DbPool {
            pool_desc: pool_desc.to_string(),
            set,
        }))
    }

    /// Open an existing pool set and read back its stored attributes.
    pub async fn pool_open(
        &self,
        pool_desc: &str,
        _pool_size: usize,
    ) -> Result<(Arc<DbPool>, PackedPoolAttr)> {
        let _guard = self.lock.lock().await;

        let path = self.resolve(pool_desc)?;
        let set = Set::open(&path, MIN_PART_SIZE as usize)
            .map_err(|e| e.context(format!("cannot open pool set -- '{pool_desc}'")))?;

        set.madvise_dontfork()?;

        let attr = set.read_attr()?;

        Ok((
            Arc::new(DbPool {
                pool_desc: pool_desc.to_string(),
                set,
            }),
            attr,
        ))
    }

    /// Close a pool; the mapping goes away with the last reference.
    pub async fn pool_close(&self, pool: Arc<DbPool>) {
        let _guard = self.lock.lock().await;
        info!("pool closed -- '{}'", pool.pool_desc);
        drop(pool);
    }

    /// Overwrite the stored attributes of an open pool.
    pub async fn pool_set_attr(
        &self,
        pool: &DbPool,
        attr: &PackedPoolAttr,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        pool.set.write_attr(attr)
    }

    /// Remove a pool set: unlink every part file, optionally the set file
    /// itself.
    pub async fn pool_remove(
        &self,
        pool_desc: &str,
        force: bool,
        remove_set: bool,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;

        let path = self.resolve(pool_desc)?;
        poolset::remove(&path, force, remove_set)
    }

    /// Scan the root directory recursively; every pool-set file must not
    /// share a part-file path with any other. The first duplicate is
    /// reported as EEXIST.
    pub async fn check_dir(&self) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut seen: Vec<SetFile> = Vec::new();
        check_dir_r(&self.root_dir, &mut seen)
    }
}

fn check_dir_r(dir: &Path, seen: &mut Vec<SetFile>) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| anyhow!(e).context(format!(
            "cannot open the directory -- {}",
            dir.display()
        )))?;

    for entry in entries {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type()?.is_dir() {
            check_dir_r(&path, seen)?;
            continue;
        }

        let Some(set) = SetFile::parse_if_poolset(&path).unwrap_or_else(|e| {
            // unreadable or malformed files do not fail the scan
            error!("skipping {}: {e:#}", path.display());
            None
        }) else {
            continue;
        };

        for prev in seen.iter() {
            for part in &set.parts {
                if prev.parts.iter().any(|p| p.path == part.path) {
                    error!(
                        "part file '{}' from pool set '{}' duplicated in pool \
                         set '{}'",
                        part.path.display(),
                        set.path.display(),
                        prev.path.display()
                    );
                    return Err(anyhow!(std::io::Error::from_raw_os_error(
                        libc::EEXIST
                    ))
                    .context("duplicate found in pool set file"));
                }
            }
        }

        seen.push(set);
    }

    Ok(())
}

/// Convert a database failure into the wire status for the response.
pub fn db_status(err: &anyhow::Error) -> ProtoStatus {
    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        if let Some(errno) = io.raw_os_error() {
            return ProtoStatus::from_errno(errno);
        }
        return match io.kind() {
            std::io::ErrorKind::NotFound => ProtoStatus::NoExist,
            std::io::ErrorKind::PermissionDenied => ProtoStatus::NoAccess,
            std::io::ErrorKind::AlreadyExists => ProtoStatus::Exists,
            std::io::ErrorKind::InvalidInput => ProtoStatus::PoolCfg,
            _ => ProtoStatus::Fatal,
        };
    }
    ProtoStatus::Fatal
}
