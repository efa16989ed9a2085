// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use rpmem_rs::{
    client::FlushFlags,
    proto::error::RpmemError,
};
use tokio::time::sleep;

use crate::integration_tests::common::{
    HDR, POOL_SIZE, PoolMem, create_pool, default_poolset, sample_attr,
};

/// When the daemon dies mid-session the monitor latches ECONNRESET and
/// every subsequent operation fails fast with it.
#[tokio::test(flavor = "multi_thread")]
async fn daemon_death_latches_econnreset() -> Result<()> {
    let dir = tempfile::tempdir()?;
    default_poolset(dir.path());

    let mut mem = PoolMem::zeroed(POOL_SIZE);
    mem.fill_random(3);

    let mut nlanes = 4;
    let (pool, daemon) = create_pool(
        dir.path(),
        "pool0.set",
        mem.local(),
        &mut nlanes,
        Some(&sample_attr()),
        false,
    )
    .await?;

    pool.persist(HDR, 4096, 0, FlushFlags::empty()).await?;

    // kill the daemon abruptly; its streams and lanes go away with it
    daemon.abort();
    let _ = daemon.await;

    // the monitor observes EOF within one poll period
    let mut latched = false;
    for _ in 0..50 {
        let res = pool.persist(HDR, 4096, 1, FlushFlags::empty()).await;
        if let Err(err) = res {
            let typed = err.downcast_ref::<RpmemError>().expect("typed error");
            assert_eq!(typed.errno(), libc::ECONNRESET);
            latched = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(latched, "peer death was never observed");

    // the error stays latched
    let err = pool
        .read(&mut [0u8; 8], HDR, 0)
        .await
        .expect_err("handle is poisoned");
    assert_eq!(
        err.downcast_ref::<RpmemError>().expect("typed").errno(),
        libc::ECONNRESET
    );

    Ok(())
}
