// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Harness configuration: where the stub service lives, how it is reached,
// and the deadlines applied to every wait.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::HarnessError;

/// Program to run as the stub service.
pub const SERVICE_PROGRAM_ENV: &str = "STUBHARNESS_SERVICE";
/// Name the stub service must claim, handed to the child.
pub const SERVICE_NAME_ENV: &str = "STUBHARNESS_SERVICE_NAME";
/// Seed for bootstrap trials.
pub const SEED_ENV: &str = "STUBHARNESS_SEED";

pub const DEFAULT_SERVICE_NAME: &str = "org.stubharness.NetworkService";
pub const DEFAULT_CONTROL_PATH: &str = "/org/stubharness/NetworkService";
pub const DEFAULT_CONTROL_INTERFACE: &str = "org.stubharness.NetworkService.Test";

/// Exit status a stub uses to say "cannot run here, skip the test".
pub const SKIP_EXIT_CODE: i32 = 77;

// ---------------------------------------------------------------------------
// ServiceConfig
// ---------------------------------------------------------------------------

/// Configuration for one stub service instance.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Path to the stub service program.
    pub program: PathBuf,
    /// Additional command-line arguments.
    pub args: Vec<String>,
    /// Bus directory shared with the child.
    pub bus_dir: PathBuf,
    /// Bus name the child claims once it is ready.
    pub service_name: String,
    /// Object path of the test-control interface.
    pub control_path: String,
    pub control_interface: String,
    /// Period of the readiness probe.
    pub probe_period: Duration,
    /// Upper bound on a single readiness probe.
    pub probe_timeout: Duration,
    /// Overall readiness deadline.
    pub ready_timeout: Duration,
    /// Time granted between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// Poll period while waiting for exit during teardown.
    pub stop_poll: Duration,
    /// Per-call timeout for control calls.
    pub call_timeout: Duration,
    /// Watchdog for the client observing a device added remotely.
    pub device_timeout: Duration,
    pub skip_exit_code: i32,
}

impl ServiceConfig {
    pub fn new(program: impl Into<PathBuf>, bus_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            bus_dir: bus_dir.into(),
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
            control_path: DEFAULT_CONTROL_PATH.to_owned(),
            control_interface: DEFAULT_CONTROL_INTERFACE.to_owned(),
            probe_period: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(250),
            ready_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(2),
            stop_poll: Duration::from_millis(50),
            call_timeout: Duration::from_secs(3),
            device_timeout: Duration::from_secs(5),
            skip_exit_code: SKIP_EXIT_CODE,
        }
    }

    /// Build from [`SERVICE_PROGRAM_ENV`] and, if set, the bus directory
    /// variable. Without one each call gets its own temp directory, so
    /// services started in the same process never share a bus.
    pub fn from_env() -> Result<Self, HarnessError> {
        let program = std::env::var_os(SERVICE_PROGRAM_ENV)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| HarnessError::Config(format!("{SERVICE_PROGRAM_ENV} is not set")))?;
        let bus_dir = std::env::var_os(crate::bus::BUS_DIR_ENV)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                static NEXT_BUS: AtomicUsize = AtomicUsize::new(0);
                let n = NEXT_BUS.fetch_add(1, Ordering::Relaxed);
                std::env::temp_dir().join(format!("stubharness-{}-{n}", std::process::id()))
            });
        Ok(Self::new(program, bus_dir))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

// ---------------------------------------------------------------------------
// BootstrapConfig
// ---------------------------------------------------------------------------

/// Tuning of the randomized client-bootstrap matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    /// One in N constructions (per level) happens inside an extra context.
    pub nested_one_in: u32,
    /// One in N constructions is dispatched from an idle task.
    pub idle_one_in: u32,
    /// Fixed seed; a fresh one is drawn and logged when `None`.
    pub seed: Option<u64>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self { nested_one_in: 5, idle_one_in: 3, seed: None }
    }
}

impl BootstrapConfig {
    /// Defaults, with the seed taken from [`SEED_ENV`] when present.
    pub fn from_env() -> Result<Self, HarnessError> {
        let seed = match std::env::var(SEED_ENV) {
            Ok(s) if !s.trim().is_empty() => Some(
                s.trim()
                    .parse()
                    .map_err(|e| HarnessError::Config(format!("{SEED_ENV}={s:?}: {e}")))?,
            ),
            _ => None,
        };
        Ok(Self { seed, ..Self::default() })
    }
}
