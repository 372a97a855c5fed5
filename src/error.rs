// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy of the harness.
//
// Only `EnvironmentUnavailable` is an ordinary outcome: the stub service
// decided it cannot run here and the calling test should be skipped. Every
// other variant means the harness or the system under test is broken and is
// turned into a loud test failure through [`HarnessError::fatal`].

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use crate::bus::BusError;
use crate::client::ClientError;

/// The stub service exited with the reserved "missing dependency" status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("missing dependency for running stub service {} ({status})", program.display())]
pub struct EnvironmentUnavailable {
    pub program: PathBuf,
    pub status: ExitStatus,
}

/// Errors produced by the harness.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Recoverable: skip the calling test.
    #[error(transparent)]
    EnvironmentUnavailable(#[from] EnvironmentUnavailable),

    /// A bounded wait ran out.
    #[error("{what} did not complete within {deadline:?}")]
    HarnessTimeout { what: String, deadline: Duration },

    /// The stub service died during startup with a non-skip status.
    #[error("stub service {} exited during startup with {status}", program.display())]
    StartupFailed { program: PathBuf, status: ExitStatus },

    /// Unexpected reply shape or an inconsistent success/error pair.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A bootstrap trial could not produce a client.
    #[error("client construction via {strategy} failed: {source}")]
    ConstructionFailed {
        strategy: &'static str,
        #[source]
        source: ClientError,
    },

    /// Leftover state after teardown, or misuse of a stopped handle.
    #[error("harness internal error: {0}")]
    HarnessInternal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl HarnessError {
    pub fn timeout(what: impl Into<String>, deadline: Duration) -> Self {
        HarnessError::HarnessTimeout { what: what.into(), deadline }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        HarnessError::ProtocolViolation(msg.into())
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            HarnessError::EnvironmentUnavailable(_) => "environment_unavailable",
            HarnessError::HarnessTimeout { .. } => "harness_timeout",
            HarnessError::StartupFailed { .. } => "startup_failed",
            HarnessError::ProtocolViolation(_) => "protocol_violation",
            HarnessError::ConstructionFailed { .. } => "construction_failed",
            HarnessError::HarnessInternal(_) => "harness_internal",
            HarnessError::Config(_) => "config",
            HarnessError::Bus(_) => "bus",
            HarnessError::Io(_) => "io",
        }
    }

    /// Whether a caller may branch on this error instead of failing.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, HarnessError::EnvironmentUnavailable(_))
    }

    /// Fail the running test with this error's diagnostic.
    #[track_caller]
    pub fn fatal(self) -> ! {
        tracing::error!(label = self.as_label(), "{self}");
        panic!("{}: {self}", self.as_label())
    }
}
