// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Typed calls on the stub service's test-control interface.
//
// Every call is synchronous, never auto-starts the service and is bounded by
// the proxy's per-call timeout. Replies are checked against the expected
// signature before anything is read out of them.

use std::rc::Rc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};

use crate::bus::{Bus, CallFlags, MethodCall};
use crate::client::{Client, DeviceObserved};
use crate::error::HarnessError;
use crate::value::{ConnectionProfile, Value, PROFILE_SIGNATURE};

/// Hardware address sent when the caller gives none.
pub const NO_HW_ADDRESS: &str = "/";

const ADD_WIRED_DEVICE: &str = "AddWiredDevice";

// ---------------------------------------------------------------------------
// DeviceKind
// ---------------------------------------------------------------------------

/// Which remote method creates the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// `AddWiredDevice (ss as) -> (o)`.
    Wired {
        hw_address: Option<String>,
        subchannels: Option<Vec<String>>,
    },
    /// Any single-argument add method, e.g. `AddWifiDevice (s) -> (o)`.
    Method(String),
}

impl DeviceKind {
    pub fn wired() -> Self {
        DeviceKind::Wired { hw_address: None, subchannels: None }
    }

    /// Map a method name onto a kind; `AddWiredDevice` gets default arguments.
    pub fn from_method(method: &str) -> Self {
        if method == ADD_WIRED_DEVICE {
            Self::wired()
        } else {
            DeviceKind::Method(method.to_owned())
        }
    }

    fn member(&self) -> &str {
        match self {
            DeviceKind::Wired { .. } => ADD_WIRED_DEVICE,
            DeviceKind::Method(m) => m,
        }
    }

    fn body(&self, ifname: &str) -> Value {
        match self {
            DeviceKind::Wired { hw_address, subchannels } => Value::Tuple(vec![
                Value::str(ifname),
                Value::str(hw_address.as_deref().unwrap_or(NO_HW_ADDRESS)),
                Value::StrArray(subchannels.clone().unwrap_or_default()),
            ]),
            DeviceKind::Method(_) => Value::Tuple(vec![Value::str(ifname)]),
        }
    }
}

// ---------------------------------------------------------------------------
// RpcProxy
// ---------------------------------------------------------------------------

/// Direct handle to the stub's test-control object.
#[derive(Clone)]
pub struct RpcProxy {
    bus: Rc<dyn Bus>,
    destination: String,
    path: String,
    interface: String,
    timeout: Duration,
}

impl std::fmt::Debug for RpcProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProxy")
            .field("destination", &self.destination)
            .field("path", &self.path)
            .field("interface", &self.interface)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RpcProxy {
    pub fn new(
        bus: Rc<dyn Bus>,
        destination: &str,
        path: &str,
        interface: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            bus,
            destination: destination.to_owned(),
            path: path.to_owned(),
            interface: interface.to_owned(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn call(
        &self,
        member: &str,
        body: Value,
        reply_signature: &str,
    ) -> Result<Value, HarnessError> {
        let call = MethodCall::new(&self.destination, &self.path, &self.interface, member, body);
        tracing::debug!(member, args = %call.body.signature(), "control call");
        let reply = self.bus.call_sync(&call, CallFlags::NO_AUTO_START, self.timeout)?;
        if !reply.is_of_type(reply_signature) {
            return Err(HarnessError::protocol(format!(
                "{member} replied with {:?}, expected {reply_signature:?}",
                reply.signature()
            )));
        }
        Ok(reply)
    }

    fn call_for_path(&self, member: &str, body: Value) -> Result<String, HarnessError> {
        let reply = self.call(member, body, "(o)")?;
        reply
            .single_object_path()
            .map(str::to_owned)
            .ok_or_else(|| HarnessError::protocol(format!("{member} reply carries no object path")))
    }

    /// Create a device of `kind` named `ifname`; returns its object path.
    pub fn add_device(&self, kind: &DeviceKind, ifname: &str) -> Result<String, HarnessError> {
        self.call_for_path(kind.member(), kind.body(ifname))
    }

    pub fn add_wired_device(
        &self,
        ifname: &str,
        hw_address: Option<&str>,
        subchannels: Option<&[&str]>,
    ) -> Result<String, HarnessError> {
        let kind = DeviceKind::Wired {
            hw_address: hw_address.map(str::to_owned),
            subchannels: subchannels.map(|s| s.iter().map(|c| (*c).to_owned()).collect()),
        };
        self.add_device(&kind, ifname)
    }

    pub fn add_connection(
        &self,
        profile: &impl ConnectionProfile,
        verify: bool,
    ) -> Result<String, HarnessError> {
        self.add_connection_raw(Value::Settings(profile.to_settings()), verify)
    }

    /// Add an already marshalled profile.
    ///
    /// # Panics
    /// If `profile` is not of type `a{sa{sv}}`.
    pub fn add_connection_raw(&self, profile: Value, verify: bool) -> Result<String, HarnessError> {
        assert_profile(&profile);
        let body = Value::Tuple(vec![Value::variant(profile), Value::Bool(verify)]);
        self.call_for_path("AddConnection", body)
    }

    /// Replace the connection at `path`, or at the profile's own path.
    ///
    /// # Panics
    /// If neither `path` nor the profile names an object path.
    pub fn update_connection(
        &self,
        path: Option<&str>,
        profile: &impl ConnectionProfile,
        verify: bool,
    ) -> Result<(), HarnessError> {
        let path = path.or_else(|| profile.path());
        let Some(path) = path else {
            panic!("update_connection needs a path: none given and the profile has none");
        };
        self.update_connection_raw(path, Value::Settings(profile.to_settings()), verify)
    }

    /// # Panics
    /// If `path` is not absolute or `profile` is not of type `a{sa{sv}}`.
    pub fn update_connection_raw(
        &self,
        path: &str,
        profile: Value,
        verify: bool,
    ) -> Result<(), HarnessError> {
        assert_profile(&profile);
        assert!(path.starts_with('/'), "connection path {path:?} must start with '/'");
        let body = Value::Tuple(vec![
            Value::object_path(path),
            Value::variant(profile),
            Value::Bool(verify),
        ]);
        self.call("UpdateConnection", body, "()").map(|_| ())
    }
}

#[track_caller]
fn assert_profile(profile: &Value) {
    let signature = profile.signature();
    assert!(
        signature == PROFILE_SIGNATURE,
        "connection profile must be {PROFILE_SIGNATURE}, got {signature}"
    );
    assert!(
        profile.is_well_formed(),
        "connection profile {PROFILE_SIGNATURE} holds values that are not variants"
    );
}

// ---------------------------------------------------------------------------
// PendingAdd
// ---------------------------------------------------------------------------

/// A device the stub accepted that the client has yet to report.
#[derive(Debug)]
pub struct PendingAdd {
    pub interface: String,
    pub path: String,
    events: broadcast::Receiver<DeviceObserved>,
}

impl PendingAdd {
    pub fn new(
        interface: &str,
        path: &str,
        events: broadcast::Receiver<DeviceObserved>,
    ) -> Self {
        Self { interface: interface.to_owned(), path: path.to_owned(), events }
    }

    /// Wait up to `watchdog` for the client to report the device.
    ///
    /// Every notification seen meanwhile must describe this device; missed
    /// notifications count as a violation.
    pub async fn wait(self, watchdog: Duration) -> Result<DeviceObserved, HarnessError> {
        let PendingAdd { interface, path, mut events } = self;
        let observe = async {
            match events.recv().await {
                Ok(dev) => Ok(dev),
                Err(RecvError::Lagged(n)) => Err(HarnessError::protocol(format!(
                    "client dropped {n} device notifications before {interface} at {path}"
                ))),
                Err(RecvError::Closed) => {
                    Err(HarnessError::protocol("client closed its device notifications"))
                }
            }
        };
        let dev = tokio::time::timeout(watchdog, observe).await.map_err(|_| {
            HarnessError::timeout(
                format!("client observing device {interface} at {path}"),
                watchdog,
            )
        })??;

        if dev.path != path || dev.interface != interface {
            return Err(HarnessError::protocol(format!(
                "client reported device {} at {}, expected {interface} at {path}",
                dev.interface, dev.path
            )));
        }
        Ok(dev)
    }
}

/// Add a device remotely, then wait for `client` to observe it.
pub async fn add_device_observed<C: Client + ?Sized>(
    proxy: &RpcProxy,
    client: &C,
    kind: &DeviceKind,
    ifname: &str,
    watchdog: Duration,
) -> Result<DeviceObserved, HarnessError> {
    // Subscribe first so a notification racing the reply is not lost.
    let events = client.subscribe_devices();
    let path = proxy.add_device(kind, ifname)?;
    PendingAdd::new(ifname, &path, events).wait(watchdog).await
}
