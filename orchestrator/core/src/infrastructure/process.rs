// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Shell command helpers shared by the executor, workspace inspector and deployment
//! platform adapters.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Lines of stderr kept for diagnostics.
pub const DIAGNOSTIC_TAIL_LINES: usize = 40;

/// `<shell> -c <command>`, killed when the handle is dropped.
///
/// On unix the shell leads its own process group so that [`ProcessGroup`] can take
/// down anything it spawned in the background.
pub fn shell_command(
    shell: &str,
    command: &str,
    workdir: Option<&Path>,
    env: &HashMap<String, String>,
) -> Command {
    let mut cmd = Command::new(shell);
    cmd.arg("-c").arg(command);
    for (key, value) in env {
        cmd.env(key, value);
    }
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
    cmd
}

/// Kills the whole process group of a child spawned by [`shell_command`] when dropped.
///
/// `kill_on_drop` only reaches the shell itself; grandchildren it forked would
/// otherwise outlive a hard timeout.
#[derive(Debug)]
pub struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<u32>,
}

impl ProcessGroup {
    pub fn of(child: &Child) -> Self {
        Self { pgid: child.id() }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pgid) = self.pgid.and_then(|id| i32::try_from(id).ok()) {
                // ESRCH once every member has exited
                unsafe {
                    libc::killpg(pgid, libc::SIGKILL);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub async fn run_captured(mut cmd: Command) -> std::io::Result<CapturedOutput> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let child = cmd.spawn()?;
    let _group = ProcessGroup::of(&child);
    let output = child.wait_with_output().await?;
    Ok(CapturedOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Last `max` non-empty lines of `text`.
pub fn tail(text: &str, max: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max);
    lines[start..].join("\n")
}
