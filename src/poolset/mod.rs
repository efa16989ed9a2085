// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs::{File, OpenOptions},
    num::NonZeroUsize,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
    ptr::NonNull,
};

use anyhow::{Context, Result, anyhow};
use nix::sys::mman::{
    MapFlags, MmapAdvise, ProtFlags, madvise, mmap, mmap_anonymous, munmap,
};
use tracing::{debug, warn};
use zerocopy::{FromBytes as ZFromBytes, IntoBytes};

use crate::{
    mem::{Region, is_pmem_path},
    proto::attr::{PACKED_ATTR_SIZE, PackedPoolAttr},
    utils::{is_page_aligned, parse_size},
};

const POOLSET_SIGNATURE: &str = "PMEMPOOLSET";

/// One part of a pool set as declared in the set file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartFile {
    pub path: PathBuf,
    pub size: usize,
}

/// Parsed pool-set file: the list of parts backing replica 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetFile {
    pub path: PathBuf,
    pub parts: Vec<PartFile>,
}

impl SetFile {
    /// Parse a pool-set file. Local replicas beyond replica 0 are not
    /// supported on the remote side.
    pub fn parse(path: &Path) -> Result<Self> {
        match Self::parse_if_poolset(path)? {
            Some(set) => Ok(set),
            None => Err(invalid_input(format!(
                "{}: not a pool set file",
                path.display()
            ))),
        }
    }

    /// Like [`SetFile::parse`] but reports `Ok(None)` for files that do not
    /// start with the pool-set signature, so directory scans can skip
    /// unrelated files.
    pub fn parse_if_poolset(path: &Path) -> Result<Option<Self>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading pool set file {}", path.display()))?;

        let mut lines = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'));

        if lines.next() != Some(POOLSET_SIGNATURE) {
            return Ok(None);
        }

        let mut parts = Vec::new();
        for line in lines {
            if line.starts_with("REPLICA") {
                return Err(invalid_input(format!(
                    "{}: remote replication of replicated pool sets is not \
                     supported",
                    path.display()
                )));
            }

            let Some((size, part_path)) = line.split_once(char::is_whitespace)
            else {
                return Err(invalid_input(format!(
                    "{}: invalid pool set line -- '{line}'",
                    path.display()
                )));
            };
            let size = parse_size(size)
                .map_err(|e| invalid_input(format!("{}: {e}", path.display())))?;
            let part_path = PathBuf::from(part_path.trim());
            if !part_path.is_absolute() {
                return Err(invalid_input(format!(
                    "{}: part path is not an absolute path -- '{}'",
                    path.display(),
                    part_path.display()
                )));
            }
            if !is_page_aligned(size) {
                return Err(invalid_input(format!(
                    "{}: part size is not page aligned -- {size}",
                    path.display()
                )));
            }
            parts.push(PartFile {
                path: part_path,
                size,
            });
        }

        if parts.is_empty() {
            return Err(invalid_input(format!(
                "{}: pool set file with no parts",
                path.display()
            )));
        }

        Ok(Some(Self {
            path: path.to_path_buf(),
            parts,
        }))
    }

    pub fn poolsize(&self) -> usize {
        self.parts.iter().map(|p| p.size).sum()
    }
}

/// Contiguous mapping of every part of replica 0.
struct Mapping {
    base: NonNull<std::ffi::c_void>,
    len: usize,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/len came from mmap.
        if let Err(e) = unsafe { munmap(self.base, self.len) } {
            warn!("unmapping pool set failed: {e}");
        }
    }
}

/// An open (mapped) pool set.
pub struct Set {
    set_file: SetFile,
    parts: Vec<File>,
    mapping: Mapping,
    poolsize: usize,
    is_pmem: bool,
}

impl Set {
    /// Create the part files of the set described by `path` and map them.
    /// Every part must satisfy the minimum part size and the total pool the
    /// minimum pool size.
    pub fn create(
        path: &Path,
        min_pool: usize,
        min_part: usize,
        mode: u32,
    ) -> Result<Self> {
        let set_file = SetFile::parse(path)?;

        if set_file.poolsize() < min_pool {
            return Err(invalid_input(format!(
                "net pool size {} smaller than {min_pool}",
                set_file.poolsize()
            )));
        }

        let mut created: Vec<PathBuf> = Vec::new();
        let res = (|| -> Result<Vec<File>> {
            let mut files = Vec::with_capacity(set_file.parts.len());
            for part in &set_file.parts {
                if part.size < min_part {
                    return Err(invalid_input(format!(
                        "part size {} smaller than {min_part}",
                        part.size
                    )));
                }

                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .mode(mode)
                    .open(&part.path)
                    .with_context(|| {
                        format!("cannot create part file {}", part.path.display())
                    })?;
                created.push(part.path.clone());

                file.set_len(part.size as u64).with_context(|| {
                    format!("cannot truncate part file {}", part.path.display())
                })?;
                // the umask does not apply to the pool parts
                std::fs::set_permissions(
                    &part.path,
                    std::fs::Permissions::from_mode(mode),
                )?;
                files.push(file);
            }
            Ok(files)
        })();

        let files = match res {
            Ok(files) => files,
            Err(e) => {
                for path in created {
                    let _ = std::fs::remove_file(&path);
                }
                return Err(e);
            },
        };

        Self::map(set_file, files)
    }

    /// Open an existing pool set; part files must exist with the declared
    /// sizes.
    pub fn open(path: &Path, min_part: usize) -> Result<Self> {
        let set_file = SetFile::parse(path)?;

        let mut files = Vec::with_capacity(set_file.parts.len());
        for part in &set_file.parts {
            if part.size < min_part {
                return Err(invalid_input(format!(
                    "part size {} smaller than {min_part}",
                    part.size
                )));
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&part.path)
                .with_context(|| {
                    format!("cannot open part file {}", part.path.display())
                })?;
            let len = file.metadata()?.len();
            if len != part.size as u64 {
                return Err(invalid_input(format!(
                    "part file {} size mismatch -- is {len} should be {}",
                    part.path.display(),
                    part.size
                )));
            }
            files.push(file);
        }

        Self::map(set_file, files)
    }

    /// Reserve the whole range, then map every part into it at its offset.
    fn map(set_file: SetFile, files: Vec<File>) -> Result<Self> {
        let poolsize = set_file.poolsize();
        let len = NonZeroUsize::new(poolsize)
            .ok_or_else(|| invalid_input("empty pool set".to_string()))?;

        // SAFETY: fresh anonymous reservation.
        let base = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .context("reserving pool mapping failed")?;

        let mapping = Mapping {
            base,
            len: poolsize,
        };

        let mut offset = 0usize;
        for (part, file) in set_file.parts.iter().zip(&files) {
            let addr = NonZeroUsize::new(mapping.base.as_ptr() as usize + offset)
                .ok_or_else(|| anyhow!("mapping address overflow"))?;
            let part_len = NonZeroUsize::new(part.size)
                .ok_or_else(|| invalid_input("empty pool part".to_string()))?;
            // SAFETY: fixed mapping inside the reservation, file length
            // verified above.
            unsafe {
                mmap(
                    Some(addr),
                    part_len,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
                    file,
                    0,
                )
            }
            .with_context(|| {
                format!("mapping part file {} failed", part.path.display())
            })?;
            offset += part.size;
        }

        let is_pmem = set_file.parts.iter().all(|p| is_pmem_path(&p.path));
        debug!(
            "pool set {} mapped: {poolsize} bytes, pmem: {is_pmem}",
            set_file.path.display()
        );

        Ok(Self {
            set_file,
            parts: files,
            mapping,
            poolsize,
            is_pmem,
        })
    }

    pub fn set_file(&self) -> &SetFile {
        &self.set_file
    }

    pub fn poolsize(&self) -> usize {
        self.poolsize
    }

    pub fn is_pmem(&self) -> bool {
        self.is_pmem
    }

    /// Registered-memory view of replica 0.
    pub fn region(&self) -> Region {
        // SAFETY: the mapping lives as long as the set.
        unsafe {
            Region::from_raw(self.mapping.base.cast::<u8>(), self.poolsize)
        }
    }

    /// Workaround for device-dax alignment vs the fork registration of the
    /// verbs stack: advise the whole replica before memory registration.
    pub fn madvise_dontfork(&self) -> Result<()> {
        if !self
            .set_file
            .parts
            .iter()
            .any(|p| p.path.to_string_lossy().starts_with("/dev/dax"))
        {
            return Ok(());
        }
        // SAFETY: advising the owned mapping.
        unsafe {
            madvise(self.mapping.base, self.poolsize, MmapAdvise::MADV_DONTFORK)
        }
        .context("madvise failed")?;
        Ok(())
    }

    /// Deep flush: write back the range and reach the backing files'
    /// durability domain.
    pub fn deep_flush(&self, offset: usize, len: usize) -> Result<()> {
        self.region().msync(offset, len)?;
        for file in &self.parts {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Read the stored pool attribute block from the header region.
    pub fn read_attr(&self) -> Result<PackedPoolAttr> {
        let mut raw = [0u8; PACKED_ATTR_SIZE];
        self.region().read(0, &mut raw)?;
        PackedPoolAttr::read_from_bytes(&raw)
            .map_err(|e| anyhow!("reading pool attributes failed: {e}"))
    }

    /// Overwrite the stored pool attribute block and make it durable.
    pub fn write_attr(&self, attr: &PackedPoolAttr) -> Result<()> {
        let region = self.region();
        region.write(0, attr.as_bytes())?;
        if self.is_pmem {
            region.persist(0, PACKED_ATTR_SIZE)
        } else {
            region.msync(0, PACKED_ATTR_SIZE)
        }
    }
}

impl std::fmt::Debug for Set {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Set")
            .field("path", &self.set_file.path)
            .field("poolsize", &self.poolsize)
            .field("is_pmem", &self.is_pmem)
            .finish_non_exhaustive()
    }
}

/// Unlink every part file of the set; with `force` unlink errors are
/// tolerated. With `remove_set` the set file itself goes too.
pub fn remove(path: &Path, force: bool, remove_set: bool) -> Result<()> {
    let parsed = match SetFile::parse(path) {
        Ok(set) => Some(set),
        Err(e) if force => {
            warn!("parsing {} failed: {e:#}", path.display());
            None
        },
        Err(e) => return Err(e),
    };

    if let Some(set) = parsed {
        for part in &set.parts {
            if let Err(e) = std::fs::remove_file(&part.path) {
                if !force {
                    return Err(anyhow!(e)
                        .context(format!("unlink -- '{}'", part.path.display())));
                }
                warn!("unlink -- '{}': {e}", part.path.display());
            }
        }
    }

    if remove_set {
        std::fs::remove_file(path)
            .with_context(|| format!("unlink -- '{}'", path.display()))?;
    }

    Ok(())
}

/// Build an error that maps to EINVAL / invalid pool configuration.
fn invalid_input(msg: String) -> anyhow::Error {
    anyhow!(std::io::Error::new(std::io::ErrorKind::InvalidInput, msg))
}
