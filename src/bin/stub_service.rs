// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Stub network service for the harness tests.
//
// Usage: stub-service
//
// Reads the bus directory from STUBHARNESS_BUS_DIR (exits 77 without it) and
// the name to claim from STUBHARNESS_SERVICE_NAME. Serves the test-control
// interface until its stdin is closed or it is signalled.

use std::collections::BTreeMap;
use std::io::Read;

use tracing_subscriber::EnvFilter;

use stubharness::bus::{LocalBus, MethodCall, RemoteError, BUS_DIR_ENV};
use stubharness::config::{
    DEFAULT_CONTROL_INTERFACE, DEFAULT_CONTROL_PATH, DEFAULT_SERVICE_NAME, SERVICE_NAME_ENV,
    SKIP_EXIT_CODE,
};
use stubharness::value::{Settings, Value};

const ERROR_PREFIX: &str = "org.stubharness.Error";

fn error(kind: &str, message: impl Into<String>) -> RemoteError {
    RemoteError::new(&format!("{ERROR_PREFIX}.{kind}"), message)
}

fn invalid_args(call: &MethodCall, expected: &str) -> RemoteError {
    error(
        "InvalidArgs",
        format!("{} expects ({expected}), got {}", call.member, call.body.signature()),
    )
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StubState {
    devices: BTreeMap<String, String>,
    connections: BTreeMap<String, Settings>,
    next_device: u32,
    next_connection: u32,
}

impl StubState {
    fn add_device(&mut self, ifname: &str) -> Result<Value, RemoteError> {
        if self.devices.values().any(|d| d == ifname) {
            return Err(error("DeviceExists", format!("device {ifname} already exists")));
        }
        self.next_device += 1;
        let path = format!("{DEFAULT_CONTROL_PATH}/Devices/{}", self.next_device);
        tracing::info!(ifname, %path, "device added");
        self.devices.insert(path.clone(), ifname.to_owned());
        Ok(Value::Tuple(vec![Value::object_path(path)]))
    }

    fn add_connection(&mut self, settings: Settings, verify: bool) -> Result<Value, RemoteError> {
        if verify {
            verify_settings(&settings)?;
        }
        self.next_connection += 1;
        let path = format!("{DEFAULT_CONTROL_PATH}/Settings/{}", self.next_connection);
        tracing::info!(%path, verify, "connection added");
        self.connections.insert(path.clone(), settings);
        Ok(Value::Tuple(vec![Value::object_path(path)]))
    }

    fn update_connection(
        &mut self,
        path: &str,
        settings: Settings,
        verify: bool,
    ) -> Result<Value, RemoteError> {
        let Some(slot) = self.connections.get_mut(path) else {
            return Err(error("UnknownConnection", format!("no connection at {path}")));
        };
        if verify {
            verify_settings(&settings)?;
        }
        *slot = settings;
        tracing::info!(path, verify, "connection updated");
        Ok(Value::unit())
    }

    fn devices(&self) -> Value {
        let map = self
            .devices
            .iter()
            .map(|(path, ifname)| (path.clone(), Value::variant(Value::str(ifname.clone()))))
            .collect();
        Value::Tuple(vec![Value::VarDict(map)])
    }

    fn handle(&mut self, call: &MethodCall) -> Result<Value, RemoteError> {
        if call.path != DEFAULT_CONTROL_PATH || call.interface != DEFAULT_CONTROL_INTERFACE {
            return Err(error(
                "UnknownObject",
                format!("no interface {} at {}", call.interface, call.path),
            ));
        }
        let args = call.body.items().unwrap_or_default();
        match call.member.as_str() {
            "AddWiredDevice" => match args {
                [Value::Str(ifname), Value::Str(_hw), Value::StrArray(_subchannels)] => {
                    self.add_device(ifname)
                }
                _ => Err(invalid_args(call, "ssas")),
            },
            m if m.starts_with("Add") && m.ends_with("Device") => match args {
                [Value::Str(ifname)] => self.add_device(ifname),
                _ => Err(invalid_args(call, "s")),
            },
            "AddConnection" => match args {
                [Value::Variant(profile), Value::Bool(verify)] => match profile.peel() {
                    Value::Settings(s) => self.add_connection(s.clone(), *verify),
                    _ => Err(invalid_args(call, "vb")),
                },
                _ => Err(invalid_args(call, "vb")),
            },
            "UpdateConnection" => match args {
                [Value::ObjectPath(path), Value::Variant(profile), Value::Bool(verify)] => {
                    match profile.peel() {
                        Value::Settings(s) => self.update_connection(path, s.clone(), *verify),
                        _ => Err(invalid_args(call, "ovb")),
                    }
                }
                _ => Err(invalid_args(call, "ovb")),
            },
            "GetDevices" => Ok(self.devices()),
            other => Err(error("UnknownMethod", format!("no method {other}"))),
        }
    }
}

/// A verified profile names itself and carries a uuid.
fn verify_settings(settings: &Settings) -> Result<(), RemoteError> {
    let connection = settings
        .get("connection")
        .ok_or_else(|| error("InvalidConnection", "missing setting 'connection'"))?;
    for key in ["id", "uuid"] {
        let ok = connection
            .get(key)
            .and_then(|v| v.peel().as_str())
            .is_some_and(|s| !s.is_empty());
        if !ok {
            return Err(error("InvalidConnection", format!("missing connection.{key}")));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if std::env::var_os(BUS_DIR_ENV).is_none() {
        tracing::warn!("{BUS_DIR_ENV} is not set, no bus to serve on");
        std::process::exit(SKIP_EXIT_CODE);
    }
    let bus = match LocalBus::from_env() {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "cannot open bus");
            std::process::exit(1);
        }
    };
    let name = std::env::var(SERVICE_NAME_ENV).unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_owned());

    // Keep-alive: the controller holds our stdin. EOF means it is gone.
    let registry = bus.registry().clone();
    let watched = name.clone();
    std::thread::spawn(move || {
        let mut sink = [0u8; 64];
        let mut stdin = std::io::stdin();
        while matches!(stdin.read(&mut sink), Ok(n) if n > 0) {}
        tracing::info!("stdin closed, shutting down");
        registry.unregister(&watched);
        std::process::exit(0);
    });

    tracing::info!(pid = std::process::id(), %name, "stub service starting");
    let mut state = StubState::default();
    if let Err(e) = bus.serve(&name, |call| state.handle(call)) {
        tracing::error!(error = %e, "serving failed");
        std::process::exit(1);
    }
}
