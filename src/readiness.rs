// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Readiness race: a periodic "is the service up yet" probe against the
// child's exit, bounded by an overall deadline.

use std::future::Future;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// How a start attempt ended. Produced exactly once per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// The probe succeeded before the child exited.
    Ready,
    /// The child exited first.
    ChildExited(ExitStatus),
    /// Neither happened before the deadline.
    TimedOut,
}

/// Race `probe` (evaluated every `period`, first after one period) against
/// `exit`, for at most `deadline`.
///
/// `probe` must be quick and non-blocking; a failing probe counts as "not
/// ready yet". An error from `exit` ends the race with that error.
pub async fn race<E, P>(
    exit: E,
    mut probe: P,
    period: Duration,
    deadline: Duration,
) -> io::Result<ReadinessOutcome>
where
    E: Future<Output = io::Result<ExitStatus>>,
    P: FnMut() -> bool,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(exit);

    let contest = async {
        let mut probes = 0u32;
        loop {
            tokio::select! {
                status = &mut exit => {
                    if let Ok(status) = &status {
                        tracing::debug!(%status, probes, "child exited before becoming ready");
                    }
                    return status.map(ReadinessOutcome::ChildExited);
                }
                _ = ticker.tick() => {
                    probes += 1;
                    if probe() {
                        tracing::debug!(probes, "service ready");
                        return Ok(ReadinessOutcome::Ready);
                    }
                }
            }
        }
    };

    match tokio::time::timeout(deadline, contest).await {
        Ok(outcome) => outcome,
        Err(_) => Ok(ReadinessOutcome::TimedOut),
    }
}
