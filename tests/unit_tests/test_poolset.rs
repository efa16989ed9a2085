// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use rpmem_rs::{
    daemon::db::{PoolSetDb, db_status},
    poolset::{Set, SetFile},
    proto::{
        attr::{PackedPoolAttr, PoolAttr},
        error::ProtoStatus,
    },
};

const MIN_POOL: usize = 8 * 1024;
const PART: usize = 2 * 1024 * 1024;

fn write_poolset(dir: &Path, name: &str, parts: &[(usize, &str)]) -> PathBuf {
    let mut content = String::from("PMEMPOOLSET\n");
    for (size, part) in parts {
        content.push_str(&format!("{size} {}\n", dir.join(part).display()));
    }
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write pool set file");
    path
}

#[test]
fn parse_poolset_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_poolset(
        dir.path(),
        "pool0.set",
        &[(PART, "part0"), (2 * PART, "part1")],
    );

    let set = SetFile::parse(&path).expect("parses");
    assert_eq!(set.parts.len(), 2);
    assert_eq!(set.parts[0].size, PART);
    assert_eq!(set.parts[1].size, 2 * PART);
    assert_eq!(set.poolsize(), 3 * PART);
}

#[test]
fn parse_accepts_comments_and_size_suffixes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pool0.set");
    std::fs::write(
        &path,
        format!(
            "# remote pool\nPMEMPOOLSET\n\n2M {}\n",
            dir.path().join("part0").display()
        ),
    )
    .expect("write");

    let set = SetFile::parse(&path).expect("parses");
    assert_eq!(set.parts[0].size, 2 << 20);
}

#[test]
fn parse_rejects_bad_files() {
    let dir = tempfile::tempdir().expect("tempdir");

    // no signature: recognizably not a pool set
    let other = dir.path().join("notes.txt");
    std::fs::write(&other, "hello\n").expect("write");
    assert!(SetFile::parse(&other).is_err());
    assert!(
        SetFile::parse_if_poolset(&other)
            .expect("readable")
            .is_none()
    );

    // replicas are not supported on the remote side
    let replica = dir.path().join("replica.set");
    std::fs::write(
        &replica,
        format!(
            "PMEMPOOLSET\n2M {}\nREPLICA\n2M {}\n",
            dir.path().join("p0").display(),
            dir.path().join("p1").display()
        ),
    )
    .expect("write");
    assert!(SetFile::parse(&replica).is_err());

    // relative part paths are invalid
    let relative = dir.path().join("relative.set");
    std::fs::write(&relative, "PMEMPOOLSET\n2M parts/part0\n").expect("write");
    assert!(SetFile::parse(&relative).is_err());
}

#[test]
fn create_open_attr_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_poolset(
        dir.path(),
        "pool0.set",
        &[(2 * PART, "part0"), (2 * PART, "part1")],
    );

    let attr = PackedPoolAttr::pack(&PoolAttr {
        signature: *b"<RPMEM>\0",
        major: 1,
        poolset_uuid: *b"POOLSET_UUID0123",
        user_flags: *b"USER_FLAGS012345",
        ..Default::default()
    });

    {
        let set = Set::create(&path, MIN_POOL, PART, 0o666).expect("creates");
        assert_eq!(set.poolsize(), 4 * PART);
        assert!(!set.is_pmem());
        set.write_attr(&attr).expect("writes attr");

        // data written through the region lands in the part files
        let region = set.region();
        region.write(4096, b"pool data").expect("writes");
        region.msync(4096, 9).expect("syncs");
    }

    assert!(dir.path().join("part0").exists());
    assert!(dir.path().join("part1").exists());

    let set = Set::open(&path, PART).expect("opens");
    assert_eq!(set.read_attr().expect("reads attr"), attr);

    let mut back = [0u8; 9];
    set.region().read(4096, &mut back).expect("reads");
    assert_eq!(&back, b"pool data");

    // the parts map contiguously: writes may span the part boundary
    let boundary = 2 * PART - 4;
    set.region().write(boundary, &[0xaa; 8]).expect("writes");
    let mut spanning = [0u8; 8];
    set.region().read(boundary, &mut spanning).expect("reads");
    assert_eq!(spanning, [0xaa; 8]);
}

#[test]
fn create_of_existing_parts_fails_with_eexist() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_poolset(dir.path(), "pool0.set", &[(2 * PART, "part0")]);

    let _set = Set::create(&path, MIN_POOL, PART, 0o666).expect("creates");
    let err = Set::create(&path, MIN_POOL, PART, 0o666)
        .expect_err("parts already exist");
    assert_eq!(db_status(&err), ProtoStatus::Exists);
}

#[test]
fn failed_create_leaves_no_parts_behind() {
    let dir = tempfile::tempdir().expect("tempdir");
    // second part is below the minimum part size
    let path = write_poolset(
        dir.path(),
        "pool0.set",
        &[(2 * PART, "part0"), (4096, "part1")],
    );

    assert!(Set::create(&path, MIN_POOL, PART, 0o666).is_err());
    assert!(!dir.path().join("part0").exists());
    assert!(!dir.path().join("part1").exists());
}

#[test]
fn remove_unlinks_parts_and_optionally_set_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_poolset(
        dir.path(),
        "pool0.set",
        &[(2 * PART, "part0"), (2 * PART, "part1")],
    );
    drop(Set::create(&path, MIN_POOL, PART, 0o666).expect("creates"));

    rpmem_rs::poolset::remove(&path, false, false).expect("removes parts");
    assert!(!dir.path().join("part0").exists());
    assert!(!dir.path().join("part1").exists());
    assert!(path.exists());

    // removing again fails without force, passes with it
    assert!(rpmem_rs::poolset::remove(&path, false, false).is_err());
    rpmem_rs::poolset::remove(&path, true, true).expect("forced");
    assert!(!path.exists());
}

#[tokio::test]
async fn db_rejects_absolute_descriptors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = PoolSetDb::new(dir.path(), 0o666).expect("db");

    let err = db
        .pool_create("/abs/pool0.set", MIN_POOL, None)
        .await
        .expect_err("absolute descriptor");
    assert_eq!(db_status(&err), ProtoStatus::BadName);
}

#[tokio::test]
async fn db_open_missing_pool_maps_to_noexist() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = PoolSetDb::new(dir.path(), 0o666).expect("db");

    let err = db
        .pool_open("missing.set", MIN_POOL)
        .await
        .expect_err("missing pool set");
    assert_eq!(db_status(&err), ProtoStatus::NoExist);
}

#[tokio::test]
async fn check_dir_detects_cross_set_duplicates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = PoolSetDb::new(dir.path(), 0o666).expect("db");

    write_poolset(dir.path(), "a.set", &[(2 * PART, "shared"), (PART, "a1")]);
    db.check_dir().await.expect("single set is fine");

    // a second set referencing the same part file
    write_poolset(dir.path(), "b.set", &[(PART, "shared")]);
    let err = db.check_dir().await.expect_err("duplicate part");
    assert_eq!(db_status(&err), ProtoStatus::Exists);
}

#[tokio::test]
async fn check_dir_skips_unrelated_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = PoolSetDb::new(dir.path(), 0o666).expect("db");

    std::fs::write(dir.path().join("README"), "not a pool set\n").expect("write");
    std::fs::create_dir(dir.path().join("sub")).expect("mkdir");
    write_poolset(&dir.path().join("sub"), "a.set", &[(PART, "a0")]);

    db.check_dir().await.expect("scan passes");
}
