// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use bitflags::bitflags;

bitflags! {
    /// Properties of a parsed replication target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TargetFlags: u32 {
        const HAS_USER    = 0x1;
        const HAS_SERVICE = 0x2;
        /// Force IPv4 when invoking ssh (sockets provider limitation).
        const USE_IPV4    = 0x4;
    }
}

/// Parsed `[<user>@]<node>[:<service>]` target specification.
///
/// `node` may be a bracketed IPv6 literal (`[::1]:7636`); an unbracketed
/// value with more than one colon is treated as a bare IPv6 address with no
/// service part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub user: Option<String>,
    pub node: String,
    pub service: Option<String>,
    pub flags: TargetFlags,
}

impl TargetInfo {
    pub fn parse(target: &str) -> Result<Self> {
        let mut flags = TargetFlags::empty();

        let (user, rest) = match target.split_once('@') {
            Some((u, r)) => {
                flags |= TargetFlags::HAS_USER;
                (Some(u.to_string()), r)
            },
            None => (None, target),
        };

        let (node, service) = if let Some(rest) = rest.strip_prefix('[') {
            // IPv6 literal
            let Some((addr, tail)) = rest.split_once(']') else {
                bail!("unterminated IPv6 literal in target '{target}'");
            };
            match tail.strip_prefix(':') {
                Some(svc) => (addr.to_string(), Some(svc.to_string())),
                None => (addr.to_string(), None),
            }
        } else {
            let first = rest.find(':');
            let last = rest.rfind(':');
            if first == last {
                // zero or one colon: IPv4/hostname with optional service
                match rest.split_once(':') {
                    Some((n, s)) => (n.to_string(), Some(s.to_string())),
                    None => (rest.to_string(), None),
                }
            } else {
                // multiple colons: bare IPv6 address
                (rest.to_string(), None)
            }
        };

        if node.is_empty() {
            bail!("no node specified in target '{target}'");
        }

        if service.is_some() {
            flags |= TargetFlags::HAS_SERVICE;
        }

        Ok(Self {
            user,
            node,
            service,
            flags,
        })
    }

    /// `user@node` or bare `node`, the way ssh expects its destination.
    pub fn user_at_node(&self) -> String {
        match &self.user {
            Some(u) => format!("{u}@{}", self.node),
            None => self.node.clone(),
        }
    }

    /// Verify the service component parses as a TCP port.
    pub fn check_port(&self) -> Result<()> {
        let Some(service) = &self.service else {
            return Ok(());
        };
        match service.parse::<i64>() {
            Ok(p) if (1..=i64::from(u16::MAX)).contains(&p) => Ok(()),
            _ => bail!("invalid port number -- '{service}'"),
        }
    }
}

/// Extract the daemon-side bind address from the SSH_CONNECTION variable
/// ("client_ip client_port server_ip server_port", see ssh(1)).
pub fn ssh_conn_addr() -> Option<String> {
    let conn = std::env::var("SSH_CONNECTION").ok()?;
    conn.split_whitespace().nth(2).map(str::to_string)
}
