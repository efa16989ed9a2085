// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{path::Path, time::Duration};

use assert_cmd::Command;

use crate::integration_tests::common::{PART, write_poolset};

fn rpmemd(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("rpmemd").expect("binary builds");
    cmd.env("HOME", dir)
        .env_remove("SSH_CONNECTION")
        .arg("--poolset-dir")
        .arg(dir)
        .timeout(Duration::from_secs(30));
    cmd
}

#[test]
fn version_flag() {
    Command::cargo_bin("rpmemd")
        .expect("binary builds")
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn remove_mode_unlinks_parts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_poolset(dir.path(), "pool0.set", &[(PART, "part0")]);
    drop(
        rpmem_rs::poolset::Set::create(&path, 8 * 1024, PART, 0o666)
            .expect("create parts"),
    );
    assert!(dir.path().join("part0").exists());

    rpmemd(dir.path())
        .arg("--remove")
        .arg("pool0.set")
        .assert()
        .success();

    assert!(!dir.path().join("part0").exists());
    assert!(path.exists());
}

#[test]
fn remove_mode_with_pool_set_flag() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_poolset(dir.path(), "pool0.set", &[(PART, "part0")]);
    drop(
        rpmem_rs::poolset::Set::create(&path, 8 * 1024, PART, 0o666)
            .expect("create parts"),
    );

    rpmemd(dir.path())
        .arg("--remove")
        .arg("pool0.set")
        .arg("--force")
        .arg("--pool-set")
        .assert()
        .success();

    assert!(!path.exists());
}

#[test]
fn remove_mode_missing_pool_exits_with_errno() {
    let dir = tempfile::tempdir().expect("tempdir");

    rpmemd(dir.path())
        .arg("--remove")
        .arg("missing.set")
        .assert()
        .failure()
        .code(libc::ENOENT);
}

/// Two pool set files sharing a part file make the startup scan fail with
/// EEXIST before the daemon starts serving.
#[test]
fn duplicate_parts_fail_startup() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_poolset(dir.path(), "a.set", &[(PART, "shared")]);
    write_poolset(dir.path(), "b.set", &[(PART, "shared")]);

    rpmemd(dir.path())
        .write_stdin(Vec::new())
        .assert()
        .failure()
        .code(libc::EEXIST);
}
