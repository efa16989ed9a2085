// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod accept;
pub mod connect;
pub mod frame;
pub mod lane;

use std::time::Duration;

use crate::proto::PersistMethod;

/// How long a blocked completion-queue consumer sleeps before re-checking
/// the closing flag.
pub const CQ_WAIT: Duration = Duration::from_millis(100);

pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MONITOR_TIMEOUT: Duration = Duration::from_millis(1000);

/// Limits of the built-in lane transport, reported the way a fabric
/// provider reports its domain attributes.
pub const MAX_WQ_SIZE: usize = 1024;
pub const MAX_MSG_SIZE: usize = 1 << 30;
const TX_CTX_CNT: u32 = 128;
const RX_CTX_CNT: u32 = 128;
const CQ_CNT: u32 = 128;

/// Node role, used to select lane queue sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Client,
    Server,
}

struct LaneAttr {
    n_per_sq: usize,
    n_per_rq: usize,
    n_per_cq: usize,
}

/// Queue sizes required by the remote persist methods.
///
/// WRITE, READ and SEND requests occupy the send queue, RECV requests the
/// receive queue.
const fn lane_attr(pm: PersistMethod, node: Node) -> LaneAttr {
    match (node, pm) {
        // WRITE + SEND (APM also: WRITE + READ for persist,
        // WRITE + SEND for deep persist)
        (Node::Client, PersistMethod::Gpspm | PersistMethod::Apm) => LaneAttr {
            n_per_sq: 2,
            n_per_rq: 1,
            n_per_cq: 3,
        },
        (Node::Server, PersistMethod::Gpspm | PersistMethod::Apm) => LaneAttr {
            n_per_sq: 1,
            n_per_rq: 1,
            n_per_cq: 3,
        },
    }
}

/// Minimum TX queue size per lane for the persist method and role.
pub const fn wq_size(pm: PersistMethod, node: Node) -> usize {
    lane_attr(pm, node).n_per_sq
}

/// RX queue size per lane.
pub const fn rx_size(pm: PersistMethod, node: Node) -> usize {
    lane_attr(pm, node).n_per_rq
}

/// Completion queue depth per lane.
pub const fn cq_size(pm: PersistMethod, node: Node) -> usize {
    lane_attr(pm, node).n_per_cq
}

/// Maximum number of lanes the transport supports, the equivalent of
/// min(tx_ctx_cnt, rx_ctx_cnt, cq_cnt) of a fabric domain.
pub const fn max_nlanes() -> u32 {
    let mut m = TX_CTX_CNT;
    if RX_CTX_CNT < m {
        m = RX_CTX_CNT;
    }
    if CQ_CNT < m {
        m = CQ_CNT;
    }
    m
}
