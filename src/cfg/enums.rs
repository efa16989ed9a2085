// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Daemon log levels, ordered by severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Err,
    Warn,
    Notice,
    Info,
    Debug,
}

impl LogLevel {
    /// The tracing filter directive the level maps to. `notice` shares the
    /// INFO level with `info`; `debug` enables everything.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Err => "error",
            Self::Warn => "warn",
            Self::Notice | Self::Info => "info",
            Self::Debug => "debug",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Err => "err",
            Self::Warn => "warn",
            Self::Notice => "notice",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, anyhow::Error> {
        Ok(match s {
            "err" => LogLevel::Err,
            "warn" => LogLevel::Warn,
            "notice" => LogLevel::Notice,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            other => bail!("invalid log level value -- '{other}'"),
        })
    }
}
