// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result, anyhow};
use tokio::{net::TcpStream, time::timeout};
use tracing::info;

use crate::{
    fabric::{CONNECT_TIMEOUT, MAX_WQ_SIZE},
    proto::{Provider, error::RpmemError},
    utils::{self, RPMEM_PROV_SOCKET_ENV, RPMEM_PROV_VERBS_ENV},
};

/// Result of probing which providers can reach a node.
#[derive(Debug, Default, Clone, Copy)]
pub struct FabricProbe {
    providers: u32,
    max_wq_size: [usize; 3],
}

impl FabricProbe {
    pub fn supports(&self, provider: Provider) -> bool {
        self.providers & (1u32 << provider as u32) != 0
    }

    pub fn any(&self) -> bool {
        self.providers != 0
    }

    pub fn max_wq_size(&self, provider: Provider) -> usize {
        self.max_wq_size[provider as usize]
    }
}

/// Enumerate providers reachable for `node`.
///
/// Both recognized providers are serviced by the built-in lane transport,
/// so the probe reports the transport limits for each of them; reachability
/// itself is established by the connect step.
pub fn probe(node: &str) -> Result<FabricProbe> {
    let mut probe = FabricProbe::default();
    for provider in [Provider::Verbs, Provider::Sockets] {
        probe.providers |= 1u32 << provider as u32;
        probe.max_wq_size[provider as usize] = MAX_WQ_SIZE;
    }
    info!("fabric providers probed for {node}: verbs, sockets");
    Ok(probe)
}

/// Select the provider for a node from the probe and the environment.
///
/// The sockets provider must be explicitly enabled; the verbs provider is
/// on by default, has priority, and can be disabled. Returns the provider
/// together with its maximum WQ size.
pub fn select_provider(node: &str) -> Result<(Provider, usize)> {
    let probe = probe(node)?;

    let mut selected = None;

    if probe.supports(Provider::Sockets)
        && utils::env_bool(RPMEM_PROV_SOCKET_ENV).unwrap_or(false)
    {
        selected = Some(Provider::Sockets);
    }

    if probe.supports(Provider::Verbs)
        && utils::env_bool(RPMEM_PROV_VERBS_ENV).unwrap_or(true)
    {
        selected = Some(Provider::Verbs);
    }

    match selected {
        Some(provider) => Ok((provider, probe.max_wq_size(provider))),
        None => Err(anyhow!(RpmemError::NoProvider)),
    }
}

/// Establish the in-band connections, one stream per lane, within the
/// connect timeout.
pub async fn connect_lanes(
    node: &str,
    port: u16,
    nlanes: u32,
) -> Result<Vec<TcpStream>> {
    let mut streams = Vec::with_capacity(nlanes as usize);
    let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;

    for lane in 0..nlanes {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or(RpmemError::Timeout("connecting in-band lanes"))?;

        let stream = timeout(remaining, TcpStream::connect((node, port)))
            .await
            .map_err(|_| RpmemError::Timeout("connecting in-band lanes"))?
            .with_context(|| format!("connecting lane {lane} to {node}:{port}"))?;
        streams.push(stream);
    }

    Ok(streams)
}
