// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use rpmem_rs::utils::{
    AlignedBuf, PAGE_SIZE, is_page_aligned, page_align_up, parse_size,
};

#[test]
fn size_suffixes() {
    assert_eq!(parse_size("0").expect("plain"), 0);
    assert_eq!(parse_size("4096").expect("plain"), 4096);
    assert_eq!(parse_size("8K").expect("kibi"), 8 * 1024);
    assert_eq!(parse_size("2M").expect("mebi"), 2 * 1024 * 1024);
    assert_eq!(parse_size("1G").expect("gibi"), 1 << 30);
    assert_eq!(parse_size(" 4m ").expect("lowercase and spaces"), 4 << 20);

    assert!(parse_size("").is_err());
    assert!(parse_size("x").is_err());
    assert!(parse_size("-1K").is_err());
    assert!(parse_size("99999999999999999999G").is_err());
}

#[test]
fn page_alignment_helpers() {
    assert!(is_page_aligned(0));
    assert!(is_page_aligned(PAGE_SIZE));
    assert!(!is_page_aligned(PAGE_SIZE + 1));

    assert_eq!(page_align_up(0), 0);
    assert_eq!(page_align_up(1), PAGE_SIZE);
    assert_eq!(page_align_up(PAGE_SIZE), PAGE_SIZE);
}

#[test]
fn aligned_buf_is_page_aligned_and_zeroed() {
    let mut buf = AlignedBuf::zeroed(3 * PAGE_SIZE).expect("allocates");
    assert_eq!(buf.len(), 3 * PAGE_SIZE);
    assert!(is_page_aligned(buf.as_slice().as_ptr() as usize));
    assert!(buf.as_slice().iter().all(|b| *b == 0));

    buf.as_mut_slice()[0] = 0xff;
    assert_eq!(buf.as_slice()[0], 0xff);
}
