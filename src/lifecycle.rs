// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Stub service lifecycle: spawn, wait for readiness, tear down.
//
//   Stopped ─start()─► Starting ─Ready─► Running ─stop()─► Stopping ─► Stopped
//                         │
//                         └─ exited / timed out ─► Stopping ─► Stopped (+ error)

use std::rc::Rc;

use tokio::process::{Child, ChildStdin};

use crate::bus::{Bus, LocalBus, BUS_DIR_ENV};
use crate::client::{Client, DeviceObserved};
use crate::config::{ServiceConfig, SERVICE_NAME_ENV};
use crate::error::{EnvironmentUnavailable, HarnessError};
use crate::process::{self, Spawned};
use crate::readiness::{self, ReadinessOutcome};
use crate::rpc::{self, DeviceKind, RpcProxy};
use crate::value::{ConnectionProfile, Value};

/// Where a [`ServiceHandle`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

// ---------------------------------------------------------------------------
// ServiceHandle
// ---------------------------------------------------------------------------

/// A running stub service together with the bus connection used to reach it.
///
/// The child process and the bus connection are established together by
/// [`ServiceHandle::start`] and released together by [`ServiceHandle::stop`].
pub struct ServiceHandle {
    config: ServiceConfig,
    state: LifecycleState,
    bus: Option<Rc<dyn Bus>>,
    child: Option<Child>,
    pid: Option<u32>,
    /// Pid the service name must be owned by. Kept after teardown.
    spawned: i32,
    proxy: Option<RpcProxy>,
    /// Closed exactly once, at teardown.
    keep_alive: Option<ChildStdin>,
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("service", &self.config.service_name)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .finish()
    }
}

impl ServiceHandle {
    /// Connect to the bus, spawn the stub and wait until it owns its name.
    ///
    /// A child that exits during startup is reaped and the handle torn down
    /// before the error is returned. Exit status `skip_exit_code` maps to
    /// [`HarnessError::EnvironmentUnavailable`].
    pub async fn start(config: ServiceConfig) -> Result<Self, HarnessError> {
        let bus: Rc<dyn Bus> = Rc::new(LocalBus::connect(&config.bus_dir)?);
        Self::start_on(config, bus).await
    }

    /// Like [`start`](Self::start) but on an already connected bus.
    pub async fn start_on(config: ServiceConfig, bus: Rc<dyn Bus>) -> Result<Self, HarnessError> {
        let envs = [
            (BUS_DIR_ENV, config.bus_dir.as_os_str().to_owned()),
            (SERVICE_NAME_ENV, config.service_name.clone().into()),
        ];
        let Spawned { mut child, pid, keep_alive } =
            process::spawn(&config.program, &config.args, envs)?;
        let name = config.service_name.clone();
        let (probe_period, probe_timeout, ready_timeout) =
            (config.probe_period, config.probe_timeout, config.ready_timeout);

        let mut handle = ServiceHandle {
            config,
            state: LifecycleState::Starting,
            bus: Some(bus.clone()),
            child: None,
            pid: Some(pid),
            spawned: pid as i32,
            proxy: None,
            keep_alive: Some(keep_alive),
        };

        // Only the spawned child owning the name counts; another owner is
        // someone else's service.
        let owned_by_child = || match bus.name_owner(&name, probe_timeout) {
            Ok(Some(owner)) if owner == pid as i32 => true,
            Ok(Some(owner)) => {
                tracing::debug!(owner, child = pid, service = %name, "name owned elsewhere");
                false
            }
            _ => false,
        };
        let outcome =
            readiness::race(child.wait(), owned_by_child, probe_period, ready_timeout).await;

        match outcome {
            Ok(ReadinessOutcome::Ready) => {
                let cfg = &handle.config;
                let proxy = RpcProxy::new(
                    bus,
                    &cfg.service_name,
                    &cfg.control_path,
                    &cfg.control_interface,
                    cfg.call_timeout,
                );
                handle.proxy = Some(proxy);
                handle.child = Some(child);
                handle.state = LifecycleState::Running;
                tracing::info!(pid, service = %name, "stub service running");
                Ok(handle)
            }
            Ok(ReadinessOutcome::ChildExited(status)) => {
                // Reaped by the race; nothing left to signal.
                handle.pid = None;
                handle.stop().await?;
                let program = handle.config.program.clone();
                if status.code() == Some(handle.config.skip_exit_code) {
                    let skip = EnvironmentUnavailable { program, status };
                    tracing::info!("{skip}");
                    Err(skip.into())
                } else {
                    Err(HarnessError::StartupFailed { program, status })
                }
            }
            Ok(ReadinessOutcome::TimedOut) => {
                let what = format!("startup of stub service {}", handle.config.program.display());
                handle.child = Some(child);
                if let Err(e) = handle.stop().await {
                    tracing::warn!(error = %e, "teardown after startup timeout failed");
                }
                Err(HarnessError::timeout(what, ready_timeout))
            }
            Err(e) => {
                handle.child = Some(child);
                if let Err(stop_err) = handle.stop().await {
                    tracing::warn!(error = %stop_err, "teardown after failed exit watch failed");
                }
                Err(e.into())
            }
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// RPC handle to the test-control interface, while running.
    pub fn proxy(&self) -> Option<&RpcProxy> {
        self.proxy.as_ref()
    }

    /// Tear the service down and verify nothing is left behind.
    ///
    /// Closes the keep-alive pipe, sends SIGTERM, polls for exit within
    /// `stop_grace` (escalating to SIGKILL and an error past it), then checks
    /// the service name no longer resolves to the child. No-op once stopped.
    pub async fn stop(&mut self) -> Result<(), HarnessError> {
        if self.state == LifecycleState::Stopped {
            return Ok(());
        }
        self.state = LifecycleState::Stopping;
        tracing::debug!(pid = ?self.pid, "stopping stub service");

        drop(self.keep_alive.take());
        self.proxy = None;

        let exited = match self.child.take() {
            Some(mut child) => {
                process::terminate(&mut child, self.config.stop_grace, self.config.stop_poll)
                    .await
                    .map(|_| ())
            }
            None => Ok(()),
        };
        self.pid = None;
        let bus = self.bus.take();
        self.state = LifecycleState::Stopped;
        exited?;

        if let Some(bus) = bus {
            let name = &self.config.service_name;
            let owner = bus.name_owner(name, self.config.probe_timeout).unwrap_or(None);
            if owner == Some(self.spawned) {
                return Err(HarnessError::HarnessInternal(format!(
                    "bus name {name} is still owned by pid {} after teardown",
                    self.spawned
                )));
            }
        }
        Ok(())
    }

    fn running_proxy(&self) -> &RpcProxy {
        match &self.proxy {
            Some(p) => p,
            None => HarnessError::HarnessInternal(format!(
                "service handle used while {:?}",
                self.state
            ))
            .fatal(),
        }
    }

    // -----------------------------------------------------------------------
    // Test-facing calls: any failure fails the test.
    // -----------------------------------------------------------------------

    /// Add a device via `method` and wait for `client` to observe it.
    pub async fn add_device<C: Client + ?Sized>(
        &self,
        client: &C,
        method: &str,
        ifname: &str,
    ) -> DeviceObserved {
        self.add_device_of_kind(client, &DeviceKind::from_method(method), ifname)
            .await
    }

    /// Add a wired device and wait for `client` to observe it.
    pub async fn add_wired_device<C: Client + ?Sized>(
        &self,
        client: &C,
        ifname: &str,
        hw_address: Option<&str>,
        subchannels: Option<&[&str]>,
    ) -> DeviceObserved {
        let kind = DeviceKind::Wired {
            hw_address: hw_address.map(str::to_owned),
            subchannels: subchannels.map(|s| s.iter().map(|c| (*c).to_owned()).collect()),
        };
        self.add_device_of_kind(client, &kind, ifname).await
    }

    async fn add_device_of_kind<C: Client + ?Sized>(
        &self,
        client: &C,
        kind: &DeviceKind,
        ifname: &str,
    ) -> DeviceObserved {
        let timeout = self.config.device_timeout;
        rpc::add_device_observed(self.running_proxy(), client, kind, ifname, timeout)
            .await
            .unwrap_or_else(|e| e.fatal())
    }

    pub fn add_connection(&self, profile: &impl ConnectionProfile, verify: bool) -> String {
        self.running_proxy()
            .add_connection(profile, verify)
            .unwrap_or_else(|e| e.fatal())
    }

    pub fn add_connection_raw(&self, profile: Value, verify: bool) -> String {
        self.running_proxy()
            .add_connection_raw(profile, verify)
            .unwrap_or_else(|e| e.fatal())
    }

    pub fn update_connection(
        &self,
        path: Option<&str>,
        profile: &impl ConnectionProfile,
        verify: bool,
    ) {
        self.running_proxy()
            .update_connection(path, profile, verify)
            .unwrap_or_else(|e| e.fatal())
    }

    pub fn update_connection_raw(&self, path: &str, profile: Value, verify: bool) {
        self.running_proxy()
            .update_connection_raw(path, profile, verify)
            .unwrap_or_else(|e| e.fatal())
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if self.state != LifecycleState::Stopped {
            // Closing the keep-alive pipe makes the child exit on its own.
            tracing::warn!(pid = ?self.pid, "service handle dropped without stop()");
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Bring the stub service up.
///
/// Returns `Err` only when the stub reported that it cannot run here; the
/// caller should skip. Any other failure fails the test.
pub async fn start_service(config: ServiceConfig) -> Result<ServiceHandle, EnvironmentUnavailable> {
    match ServiceHandle::start(config).await {
        Ok(handle) => Ok(handle),
        Err(HarnessError::EnvironmentUnavailable(skip)) => {
            tracing::warn!("skipping: {skip}");
            Err(skip)
        }
        Err(e) => e.fatal(),
    }
}

/// Tear the stub service down. Idempotent.
pub async fn stop_service(handle: &mut ServiceHandle) {
    if let Err(e) = handle.stop().await {
        e.fatal();
    }
}
