// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use clap::Parser;
use rpmem_rs::{
    cfg::{cli::Cli, config::DaemonConfig, logger::init_logger},
    daemon::engine::Rpmemd,
    obc::server::ObcServer,
    proto::error::RpmemError,
};
use tracing::{error, info};

/// Exit code for a failure: the OS errno of the most recent fatal
/// operation when one is known.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(io) = err.downcast_ref::<std::io::Error>()
        && let Some(errno) = io.raw_os_error()
    {
        return errno;
    }
    if let Some(e) = err.downcast_ref::<RpmemError>() {
        return e.errno();
    }
    1
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let config = match DaemonConfig::read(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rpmemd: reading configuration failed: {e:#}");
            return 1;
        },
    };

    let _log_guard = match init_logger(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("rpmemd: logging subsystem initialization failed: {e:#}");
            return 1;
        },
    };

    info!("rpmemd version {}", env!("CARGO_PKG_VERSION"));

    let mut rpmemd = match Rpmemd::new(config) {
        Ok(rpmemd) => rpmemd,
        Err(e) => {
            error!("pool set db initialization failed: {e:#}");
            return exit_code(&e);
        },
    };

    // remove mode: unlink the pool and exit without touching the wire
    if let Some(poolset) = &cli.remove {
        info!("removing '{poolset}'");
        return match rpmemd
            .db()
            .pool_remove(poolset, cli.force, cli.pool_set)
            .await
        {
            Ok(()) => {
                info!("removed '{poolset}'");
                0
            },
            Err(e) => {
                error!("removing '{poolset}' failed: {e:#}");
                exit_code(&e)
            },
        };
    }

    // every pool set under the root directory must have disjoint parts
    if let Err(e) = rpmemd.db().check_dir().await {
        error!("pool set directory check failed: {e:#}");
        let errno = exit_code(&e);
        let mut obc = ObcServer::new(tokio::io::stdin(), tokio::io::stdout());
        let _ = obc.status(errno as u32).await;
        return errno;
    }

    match rpmemd
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await
    {
        Ok(()) => 0,
        Err(e) => {
            error!("{e:#}");
            exit_code(&e)
        },
    }
}
