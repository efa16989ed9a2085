// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use rpmem_rs::target::{TargetFlags, TargetInfo};

#[test]
fn node_only() {
    let info = TargetInfo::parse("host0").expect("parses");
    assert_eq!(info.node, "host0");
    assert_eq!(info.user, None);
    assert_eq!(info.service, None);
    assert_eq!(info.flags, TargetFlags::empty());
    assert_eq!(info.user_at_node(), "host0");
}

#[test]
fn user_and_service() {
    let info = TargetInfo::parse("pmem@host0:7636").expect("parses");
    assert_eq!(info.user.as_deref(), Some("pmem"));
    assert_eq!(info.node, "host0");
    assert_eq!(info.service.as_deref(), Some("7636"));
    assert!(info.flags.contains(TargetFlags::HAS_USER));
    assert!(info.flags.contains(TargetFlags::HAS_SERVICE));
    assert_eq!(info.user_at_node(), "pmem@host0");
    info.check_port().expect("valid port");
}

#[test]
fn bracketed_ipv6_with_service() {
    let info = TargetInfo::parse("user@[fe80::1]:2222").expect("parses");
    assert_eq!(info.node, "fe80::1");
    assert_eq!(info.service.as_deref(), Some("2222"));
    assert!(info.flags.contains(TargetFlags::HAS_SERVICE));
}

#[test]
fn bracketed_ipv6_without_service() {
    let info = TargetInfo::parse("[::1]").expect("parses");
    assert_eq!(info.node, "::1");
    assert_eq!(info.service, None);
}

#[test]
fn bare_ipv6_has_no_service() {
    // more than one colon without brackets is an address, not node:port
    let info = TargetInfo::parse("fe80::1:2").expect("parses");
    assert_eq!(info.node, "fe80::1:2");
    assert_eq!(info.service, None);
}

#[test]
fn invalid_targets() {
    assert!(TargetInfo::parse("").is_err());
    assert!(TargetInfo::parse("user@").is_err());
    assert!(TargetInfo::parse("[fe80::1").is_err());
}

#[test]
fn port_bounds() {
    for bad in ["0", "-1", "65536", "x", ""] {
        let info = TargetInfo::parse(&format!("host:{bad}"));
        match info {
            Ok(info) => assert!(info.check_port().is_err(), "port '{bad}'"),
            // an empty service component never parses
            Err(_) => assert!(bad.is_empty()),
        }
    }

    let info = TargetInfo::parse("host:65535").expect("parses");
    info.check_port().expect("maximum port");
}
