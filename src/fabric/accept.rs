// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::proto::error::RpmemError;

/// Listening side of the lane transport: a passive endpoint bound to a
/// dynamic port, accepting exactly the negotiated number of lanes.
pub struct Listener {
    inner: TcpListener,
    port: u16,
}

impl Listener {
    /// Bind on `node` with a dynamically allocated port.
    pub async fn bind(node: &str) -> Result<Self> {
        let inner = TcpListener::bind((node, 0))
            .await
            .with_context(|| format!("binding in-band listener on {node}"))?;
        let port = inner.local_addr()?.port();
        info!("in-band listener bound on {node}:{port}");
        Ok(Self { inner, port })
    }

    /// Port to announce in the in-band connection attributes.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept `nlanes` connections within `wait`, aborting early when the
    /// shutdown token fires. Lanes are numbered in accept order.
    pub async fn accept_lanes(
        &self,
        nlanes: u32,
        wait: std::time::Duration,
        shutdown: &CancellationToken,
    ) -> Result<Vec<TcpStream>> {
        let mut streams = Vec::with_capacity(nlanes as usize);
        let deadline = tokio::time::Instant::now() + wait;

        while (streams.len() as u32) < nlanes {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(RpmemError::Timeout("accepting in-band lanes"))?;

            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    return Err(RpmemError::ConnReset.into());
                },
                res = timeout(remaining, self.inner.accept()) => res,
            };

            let (stream, peer) = accepted
                .map_err(|_| RpmemError::Timeout("accepting in-band lanes"))?
                .context("accepting lane connection")?;
            debug!("lane {} connected from {peer}", streams.len());
            streams.push(stream);
        }

        Ok(streams)
    }
}
