// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use rpmem_rs::proto::{CloseFlags, attr::PoolAttr};

use crate::integration_tests::common::{
    POOL_SIZE, PoolMem, create_pool, default_poolset, open_pool, sample_attr,
};

/// The attribute block given to create comes back from a fresh open
/// byte for byte, user flags included.
#[tokio::test(flavor = "multi_thread")]
async fn create_then_open_returns_attributes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    default_poolset(dir.path());

    let attr = sample_attr();
    let mem = PoolMem::zeroed(POOL_SIZE);

    let mut nlanes = 2;
    let (pool, daemon) = create_pool(
        dir.path(),
        "pool0.set",
        mem.local(),
        &mut nlanes,
        Some(&attr),
        false,
    )
    .await?;
    pool.close(CloseFlags::empty()).await?;
    daemon.await??;

    let mut nlanes = 2;
    let (pool, open_attr, daemon) =
        open_pool(dir.path(), "pool0.set", mem.local(), &mut nlanes, false).await?;
    assert_eq!(open_attr, attr);

    pool.close(CloseFlags::empty()).await?;
    daemon.await??;
    Ok(())
}

/// SET_ATTR overwrites the stored block; a subsequent open on a fresh
/// connection observes the new attributes.
#[tokio::test(flavor = "multi_thread")]
async fn set_attr_roundtrip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    default_poolset(dir.path());

    let attr_a = sample_attr();
    let attr_b = PoolAttr {
        signature: *b"<RPMEM>\0",
        major: 2,
        poolset_uuid: *b"POOLSET_UUID4567",
        user_flags: *b"NEW_USER_FLAGS00",
        ..Default::default()
    };

    let mem = PoolMem::zeroed(POOL_SIZE);

    let mut nlanes = 2;
    let (pool, daemon) = create_pool(
        dir.path(),
        "pool0.set",
        mem.local(),
        &mut nlanes,
        Some(&attr_a),
        false,
    )
    .await?;

    pool.set_attr(Some(&attr_b)).await?;
    pool.close(CloseFlags::empty()).await?;
    daemon.await??;

    let mut nlanes = 2;
    let (pool, open_attr, daemon) =
        open_pool(dir.path(), "pool0.set", mem.local(), &mut nlanes, false).await?;
    assert_eq!(open_attr, attr_b);

    pool.close(CloseFlags::empty()).await?;
    daemon.await??;
    Ok(())
}

/// An open of a pool created with attributes followed by set_attr to a
/// zeroed block leaves a headerless pool behind.
#[tokio::test(flavor = "multi_thread")]
async fn set_attr_to_zero_clears_header() -> Result<()> {
    let dir = tempfile::tempdir()?;
    default_poolset(dir.path());

    let mem = PoolMem::zeroed(POOL_SIZE);

    let mut nlanes = 1;
    let (pool, daemon) = create_pool(
        dir.path(),
        "pool0.set",
        mem.local(),
        &mut nlanes,
        Some(&sample_attr()),
        false,
    )
    .await?;
    pool.set_attr(None).await?;
    pool.close(CloseFlags::empty()).await?;
    daemon.await??;

    let mut nlanes = 1;
    let (pool, open_attr, daemon) =
        open_pool(dir.path(), "pool0.set", mem.local(), &mut nlanes, false).await?;
    assert!(open_attr.is_zeroed());

    pool.close(CloseFlags::empty()).await?;
    daemon.await??;
    Ok(())
}
