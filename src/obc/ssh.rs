// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::process::Stdio;

use anyhow::{Context, Result, bail};
use once_cell::sync::Lazy;
use tokio::{
    io::{AsyncReadExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
};
use tracing::{debug, info};

use crate::{
    target::{TargetFlags, TargetInfo},
    utils::{RPMEM_CMD_ENV, RPMEM_DEF_CMD, RPMEM_DEF_SSH, RPMEM_SSH_ENV},
};

const CMD_SEPARATOR: char = '|';

/// Remote daemon commands read from RPMEM_CMD. The variable may carry
/// multiple commands separated by '|'; they are consumed round-robin, one
/// per out-of-band connection, in the order replicas are established.
struct CmdPool {
    cmds: Vec<String>,
    current: usize,
}

static CMDS: Lazy<std::sync::Mutex<CmdPool>> = Lazy::new(|| {
    let raw = std::env::var(RPMEM_CMD_ENV).unwrap_or_else(|_| RPMEM_DEF_CMD.into());
    let cmds = raw.split(CMD_SEPARATOR).map(str::to_string).collect();
    std::sync::Mutex::new(CmdPool { cmds, current: 0 })
});

fn next_cmd() -> String {
    let mut pool = CMDS.lock().unwrap_or_else(|e| e.into_inner());
    let cmd = pool.cmds[pool.current].clone();
    pool.current = (pool.current + 1) % pool.cmds.len();
    cmd
}

fn ssh_cmd() -> String {
    std::env::var(RPMEM_SSH_ENV).unwrap_or_else(|_| RPMEM_DEF_SSH.into())
}

/// An ssh child process carrying the out-of-band byte stream on its
/// standard streams.
pub struct SshConn {
    child: Child,
    pub stdin: ChildStdin,
    pub stdout: BufReader<ChildStdout>,
}

impl SshConn {
    /// Spawn ssh against the target and run the configured remote command
    /// with the given extra arguments.
    pub fn execv(info: &TargetInfo, args: &[&str]) -> Result<Self> {
        let mut remote = next_cmd();
        for arg in args {
            remote.push(' ');
            remote.push_str(arg);
        }

        let mut cmd = Command::new(ssh_cmd());
        if let Some(service) = &info.service {
            cmd.arg("-p").arg(service);
        }
        // no pseudo-terminal: the stream carries binary data
        cmd.arg("-T");
        if info.flags.contains(TargetFlags::USE_IPV4) {
            cmd.arg("-4");
        }
        // fail instead of prompting for a password
        cmd.arg("-oBatchMode=yes");
        cmd.arg(info.user_at_node());
        cmd.arg(&remote);

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        info!("executing command '{} ... {remote}'", ssh_cmd());

        let mut child = cmd.spawn().context("spawning ssh failed")?;
        let stdin = child
            .stdin
            .take()
            .context("ssh child has no stdin")?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .context("ssh child has no stdout")?;

        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    /// Spawn the remote daemon and wait for its initial status word.
    /// A non-zero status means the daemon failed to initialize.
    pub async fn open(info: &TargetInfo) -> Result<Self> {
        let mut conn = Self::execv(info, &[])?;

        let mut status = [0u8; 4];
        conn.stdout
            .read_exact(&mut status)
            .await
            .context("reading initial status failed")?;
        let status = u32::from_be_bytes(status);
        if status != 0 {
            let _ = conn.close().await;
            bail!("unexpected status received -- '{status}'");
        }

        debug!("received status: {status}");
        Ok(conn)
    }

    /// Block until the remote command terminates; any data arriving on the
    /// stream is a protocol violation.
    pub async fn wait_eof(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        match self.stdout.read(&mut byte).await {
            Ok(0) => Ok(()),
            Ok(_) => bail!("unexpected data received"),
            Err(e) => Err(e.into()),
        }
    }

    /// Close the stream and reap the child; returns an error carrying the
    /// child's exit code if it did not exit cleanly.
    pub async fn close(mut self) -> Result<()> {
        drop(self.stdin);
        drop(self.stdout);

        let status = self.child.wait().await.context("waiting for ssh failed")?;
        if !status.success() {
            match status.code() {
                Some(code) => bail!("remote command failed -- {code}"),
                None => bail!("remote command killed by signal"),
            }
        }
        Ok(())
    }

    /// Split into the raw parts an [`super::client::ObcClient`] is built
    /// from.
    pub fn into_parts(self) -> (BufReader<ChildStdout>, ChildStdin, Child) {
        (self.stdout, self.stdin, self.child)
    }
}
