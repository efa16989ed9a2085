// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::PathBuf;

use clap::Parser;
use rpmem_rs::cfg::{cli::Cli, config::DaemonConfig, enums::LogLevel};
use serial_test::serial;

fn cli(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("rpmemd").chain(args.iter().copied()))
        .expect("cli parses")
}

#[test]
#[serial]
fn defaults() {
    let config = DaemonConfig::read(&cli(&[])).expect("reads");
    assert!(config.log_file.is_none());
    assert!(!config.persist_apm);
    assert!(config.persist_general);
    assert_eq!(config.log_level, LogLevel::Err);
    assert_eq!(config.nthreads, 0);
    // the default pool set directory is the home directory
    if let Ok(home) = std::env::var("HOME") {
        assert_eq!(config.poolset_dir, PathBuf::from(home));
    }
}

#[test]
#[serial]
fn explicit_config_file_and_cli_precedence() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("rpmemd.conf");
    std::fs::write(
        &path,
        "log-level: info\nnthreads: 4\npoolset-dir: /tmp/pools\n",
    )
    .expect("write config");

    let args = [
        "-c".to_string(),
        path.to_string_lossy().to_string(),
        "--nthreads".to_string(),
        "2".to_string(),
    ];
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let config = DaemonConfig::read(&cli(&args)).expect("reads");
    assert_eq!(config.log_level, LogLevel::Info);
    // the command line wins over the config file
    assert_eq!(config.nthreads, 2);
    assert_eq!(config.poolset_dir, PathBuf::from("/tmp/pools"));
}

#[test]
#[serial]
fn missing_explicit_config_is_fatal() {
    let err = DaemonConfig::read(&cli(&["-c", "/nonexistent/rpmemd.conf"]))
        .expect_err("missing -c file");
    assert!(err.to_string().contains("config"));
}

#[test]
#[serial]
fn log_file_disables_syslog() {
    let config =
        DaemonConfig::read(&cli(&["--log-file", "/tmp/rpmemd.log"])).expect("reads");
    assert_eq!(config.log_file, Some(PathBuf::from("/tmp/rpmemd.log")));
    assert!(!config.use_syslog);
}

#[test]
#[serial]
fn home_expands_in_poolset_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("rpmemd.conf");
    std::fs::write(&path, "poolset-dir: $HOME/poolsets\n").expect("write config");

    let home = std::env::var("HOME").expect("HOME is set in tests");
    let config = DaemonConfig::read(&cli(&[
        "-c",
        path.to_string_lossy().as_ref(),
    ]))
    .expect("reads");
    assert_eq!(config.poolset_dir, PathBuf::from(format!("{home}/poolsets")));
}

#[test]
fn unknown_config_keys_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("rpmemd.conf");
    std::fs::write(&path, "no-such-option: 1\n").expect("write config");

    let res = DaemonConfig::read(&cli(&["-c", path.to_string_lossy().as_ref()]));
    assert!(res.is_err());
}

#[test]
fn log_level_parsing() {
    for (raw, level) in [
        ("err", LogLevel::Err),
        ("warn", LogLevel::Warn),
        ("notice", LogLevel::Notice),
        ("info", LogLevel::Info),
        ("debug", LogLevel::Debug),
    ] {
        assert_eq!(raw.parse::<LogLevel>().expect("parses"), level);
        assert_eq!(level.as_str(), raw);
    }
    assert!("verbose".parse::<LogLevel>().is_err());

    assert_eq!(LogLevel::Notice.as_filter(), "info");
    assert_eq!(LogLevel::Err.as_filter(), "error");
}

#[test]
fn remove_mode_arguments() {
    let cli = cli(&["--remove", "pool0.set", "--force", "--pool-set"]);
    assert_eq!(cli.remove.as_deref(), Some("pool0.set"));
    assert!(cli.force);
    assert!(cli.pool_set);
}
