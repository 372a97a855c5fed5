// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Child process spawning and teardown.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStdin, Command};
use tokio::time::Instant;

use crate::bus::registry::is_pid_alive;
use crate::error::HarnessError;

// ---------------------------------------------------------------------------
// spawn
// ---------------------------------------------------------------------------

/// A freshly spawned child.
#[derive(Debug)]
pub struct Spawned {
    pub child: Child,
    pub pid: u32,
    /// Write end of the child's stdin. Closing it tells the child to exit.
    pub keep_alive: ChildStdin,
}

/// Spawn `program` with its stdin connected to a pipe kept by the caller.
pub fn spawn<I, K, V>(program: &Path, args: &[String], envs: I) -> io::Result<Spawned>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    let mut child = Command::new(program)
        .args(args)
        .envs(envs)
        .stdin(Stdio::piped())
        .spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| io::Error::other("child exited before its pid was read"))?;
    let keep_alive = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("child stdin was not piped"))?;
    tracing::info!(pid, program = %program.display(), "spawned child");
    Ok(Spawned { child, pid, keep_alive })
}

// ---------------------------------------------------------------------------
// request_shutdown / is_alive
// ---------------------------------------------------------------------------

/// Send SIGTERM. A process that is already gone is not an error.
pub fn request_shutdown(pid: u32) -> io::Result<()> {
    if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Whether `pid` still names a process (zombies included).
pub fn is_alive(pid: u32) -> bool {
    is_pid_alive(pid as i32)
}

// ---------------------------------------------------------------------------
// terminate (graceful: SIGTERM → poll → SIGKILL)
// ---------------------------------------------------------------------------

/// Shut `child` down: SIGTERM, then poll for exit every `poll` until `grace`
/// elapses.
///
/// A child that outlives the grace period is killed and reported as
/// [`HarnessError::HarnessTimeout`]; ignoring SIGTERM is a bug in the child.
pub async fn terminate(
    child: &mut Child,
    grace: Duration,
    poll: Duration,
) -> Result<ExitStatus, HarnessError> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return Ok(child.wait().await?);
    };
    request_shutdown(pid)?;

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid, %status, "child exited");
                return Ok(status);
            }
            Ok(None) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
        if started.elapsed() > grace {
            tracing::warn!(pid, ?grace, "child ignored SIGTERM, sending SIGKILL");
            child.start_kill()?;
            child.wait().await?;
            return Err(HarnessError::timeout(format!("exit of child process {pid}"), grace));
        }
        tokio::time::sleep(poll).await;
    }
}
