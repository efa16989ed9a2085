// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::PathBuf;

use clap::Parser;

use crate::cfg::enums::LogLevel;

/// Command-line arguments of the rpmemd daemon. Every long option mirrors
/// a config file key; command-line values take the highest precedence.
#[derive(Parser, Debug, Default)]
#[command(
    name = "rpmemd",
    version,
    about = "remote persistent memory replication daemon"
)]
pub struct Cli {
    /// Configuration file location.
    #[arg(short = 'c', long = "config", value_name = "path")]
    pub config: Option<PathBuf>,

    /// Log file location; implies logging to a file instead of syslog.
    #[arg(long = "log-file", value_name = "path")]
    pub log_file: Option<PathBuf>,

    /// Pool set files directory.
    #[arg(long = "poolset-dir", value_name = "path")]
    pub poolset_dir: Option<PathBuf>,

    /// Enable the Appliance Persistency Method.
    #[arg(long = "persist-apm")]
    pub persist_apm: bool,

    /// Enable the General Server Persistency Mechanism.
    #[arg(long = "persist-general")]
    pub persist_general: bool,

    /// Use syslog(3) for logging messages.
    #[arg(long = "use-syslog")]
    pub use_syslog: bool,

    /// Set log level value.
    #[arg(long = "log-level", value_name = "level")]
    pub log_level: Option<LogLevel>,

    /// Remove pool described by given pool set file and exit.
    #[arg(short = 'r', long = "remove", value_name = "poolset")]
    pub remove: Option<String>,

    /// Ignore errors when removing a pool.
    #[arg(short = 'f', long = "force")]
    pub force: bool,

    /// Remove the pool set file as well.
    #[arg(short = 's', long = "pool-set")]
    pub pool_set: bool,

    /// Number of processing threads; 0 means one per lane.
    #[arg(short = 't', long = "nthreads", value_name = "num")]
    pub nthreads: Option<usize>,
}
