// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cfg::{cli::Cli, enums::LogLevel};

pub const DAEMON_NAME: &str = "rpmemd";

/// Effective daemon configuration after merging every source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Append-mode log path; set implies not using syslog.
    pub log_file: Option<PathBuf>,
    /// Root directory for pool set lookup.
    pub poolset_dir: PathBuf,
    /// Permit the Appliance Persistency Method.
    pub persist_apm: bool,
    /// Permit the General Purpose Server Persistency Method.
    pub persist_general: bool,
    /// Route log messages to syslog.
    pub use_syslog: bool,
    pub log_level: LogLevel,
    /// Worker thread count; 0 selects the default of one per lane.
    pub nthreads: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            poolset_dir: PathBuf::from("$HOME"),
            persist_apm: false,
            persist_general: true,
            use_syslog: true,
            log_level: LogLevel::Err,
            nthreads: 0,
        }
    }
}

/// Partial configuration as read from one config file; every key is
/// optional so later sources override earlier ones field by field.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigOverlay {
    #[serde(rename = "log-file")]
    log_file: Option<PathBuf>,
    #[serde(rename = "poolset-dir")]
    poolset_dir: Option<PathBuf>,
    #[serde(rename = "persist-apm")]
    persist_apm: Option<bool>,
    #[serde(rename = "persist-general")]
    persist_general: Option<bool>,
    #[serde(rename = "use-syslog")]
    use_syslog: Option<bool>,
    #[serde(rename = "log-level")]
    log_level: Option<LogLevel>,
    nthreads: Option<usize>,
}

impl DaemonConfig {
    /// Assemble the configuration: built-in defaults, the system config
    /// file, the user config file, an explicit `-c` file and finally the
    /// command line, in increasing precedence.
    pub fn read(cli: &Cli) -> Result<Self> {
        let mut config = Self::default();

        let system = PathBuf::from(format!("/etc/{DAEMON_NAME}/{DAEMON_NAME}.conf"));
        config.apply_file(&system, false)?;

        if let Ok(home) = std::env::var("HOME") {
            let user = Path::new(&home).join(format!(".{DAEMON_NAME}.conf"));
            config.apply_file(&user, false)?;
        }

        if let Some(path) = &cli.config {
            config.apply_file(path, true)?;
        }

        config.apply_cli(cli);
        config.expand_home()?;

        Ok(config)
    }

    fn apply_file(&mut self, path: &Path, required: bool) -> Result<()> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if !required => {
                tracing::debug!("skipping config file {}: {e}", path.display());
                return Ok(());
            },
            Err(e) => {
                return Err(anyhow::anyhow!(e)
                    .context(format!("reading config file {}", path.display())));
            },
        };

        if content.trim().is_empty() {
            return Ok(());
        }

        let overlay: ConfigOverlay = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        self.apply_overlay(overlay);
        Ok(())
    }

    fn apply_overlay(&mut self, overlay: ConfigOverlay) {
        if let Some(log_file) = overlay.log_file {
            self.log_file = Some(log_file);
            // an explicit log file takes the daemon off syslog
            self.use_syslog = false;
        }
        if let Some(poolset_dir) = overlay.poolset_dir {
            self.poolset_dir = poolset_dir;
        }
        if let Some(persist_apm) = overlay.persist_apm {
            self.persist_apm = persist_apm;
        }
        if let Some(persist_general) = overlay.persist_general {
            self.persist_general = persist_general;
        }
        if let Some(use_syslog) = overlay.use_syslog {
            self.use_syslog = use_syslog;
        }
        if let Some(log_level) = overlay.log_level {
            self.log_level = log_level;
        }
        if let Some(nthreads) = overlay.nthreads {
            self.nthreads = nthreads;
        }
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(log_file) = &cli.log_file {
            self.log_file = Some(log_file.clone());
            self.use_syslog = false;
        }
        if let Some(poolset_dir) = &cli.poolset_dir {
            self.poolset_dir = poolset_dir.clone();
        }
        if cli.persist_apm {
            self.persist_apm = true;
        }
        if cli.persist_general {
            self.persist_general = true;
        }
        if cli.use_syslog {
            self.use_syslog = true;
        }
        if let Some(log_level) = cli.log_level {
            self.log_level = log_level;
        }
        if let Some(nthreads) = cli.nthreads {
            self.nthreads = nthreads;
        }
    }

    /// A literal `$HOME` inside the pool set directory expands to the
    /// value of the HOME environment variable.
    fn expand_home(&mut self) -> Result<()> {
        let dir = self.poolset_dir.to_string_lossy().into_owned();
        if !dir.contains("$HOME") {
            return Ok(());
        }
        let home = std::env::var("HOME").context("HOME environment variable")?;
        self.poolset_dir = PathBuf::from(dir.replace("$HOME", &home));
        Ok(())
    }
}
