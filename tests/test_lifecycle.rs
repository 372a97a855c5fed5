// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end tests against the real stub-service binary: start/stop,
// skip-on-77, startup failures, device and connection round trips observed
// by a client built through the bootstrap matrix.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, LocalSet};

use stubharness::bus::{Bus, BusError, CallFlags, LocalBus, MethodCall, BUS_DIR_ENV};
use stubharness::client::{Client, ClientError, ClientFactory, DeviceObserved};
use stubharness::config::{
    DEFAULT_CONTROL_INTERFACE, DEFAULT_CONTROL_PATH, SERVICE_PROGRAM_ENV, SKIP_EXIT_CODE,
};
use stubharness::value::{Settings, Value};
use stubharness::{
    start_service, stop_service, BootstrapMatrix, HarnessError, LifecycleState, ServiceConfig,
    ServiceHandle,
};

const STUB: &str = env!("CARGO_BIN_EXE_stub-service");

fn stub_config(dir: &Path) -> ServiceConfig {
    ServiceConfig::new(STUB, dir)
}

fn sh_config(dir: &Path, script: &str) -> ServiceConfig {
    ServiceConfig::new("/bin/sh", dir).with_args(["-c", script])
}

fn owned(dir: &Path, name: &str) -> bool {
    LocalBus::connect(dir)
        .expect("connect")
        .name_has_owner(name, Duration::from_millis(100))
        .expect("probe")
}

// ---------------------------------------------------------------------------
// A client that watches the stub's device list
// ---------------------------------------------------------------------------

struct StubClient {
    bus: LocalBus,
    service: String,
    initialized: bool,
    events: broadcast::Sender<DeviceObserved>,
    poller: Option<JoinHandle<()>>,
}

impl StubClient {
    fn devices(bus: &LocalBus, service: &str) -> Result<BTreeMap<String, String>, BusError> {
        let call = MethodCall::new(
            service,
            DEFAULT_CONTROL_PATH,
            DEFAULT_CONTROL_INTERFACE,
            "GetDevices",
            Value::unit(),
        );
        let reply = bus.call_sync(&call, CallFlags::NO_AUTO_START, Duration::from_secs(1))?;
        let mut out = BTreeMap::new();
        if let Some([Value::VarDict(map)]) = reply.items() {
            for (path, ifname) in map {
                if let Some(ifname) = ifname.peel().as_str() {
                    out.insert(path.clone(), ifname.to_owned());
                }
            }
        }
        Ok(out)
    }
}

impl Client for StubClient {
    fn init(&mut self) -> Result<(), ClientError> {
        let (bus, service, events) = (self.bus.clone(), self.service.clone(), self.events.clone());
        let seen = Self::devices(&bus, &service)
            .map_err(|e| ClientError::new(e.to_string()))?;
        self.poller = Some(tokio::task::spawn_local(async move {
            let mut seen: BTreeSet<String> = seen.into_keys().collect();
            let mut tick = tokio::time::interval(Duration::from_millis(10));
            loop {
                tick.tick().await;
                let Ok(now) = Self::devices(&bus, &service) else { continue };
                for (path, interface) in now {
                    if seen.insert(path.clone()) {
                        let _ = events.send(DeviceObserved { path, interface });
                    }
                }
            }
        }));
        self.initialized = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn subscribe_devices(&self) -> broadcast::Receiver<DeviceObserved> {
        self.events.subscribe()
    }
}

impl Drop for StubClient {
    fn drop(&mut self) {
        if let Some(p) = self.poller.take() {
            p.abort();
        }
    }
}

struct StubClientFactory {
    bus: LocalBus,
    service: String,
}

impl ClientFactory for StubClientFactory {
    type Client = StubClient;

    fn new_sync(&self) -> Result<StubClient, ClientError> {
        let mut c = self.allocate();
        c.init()?;
        Ok(c)
    }

    fn allocate(&self) -> StubClient {
        StubClient {
            bus: self.bus.clone(),
            service: self.service.clone(),
            initialized: false,
            events: broadcast::channel(16).0,
            poller: None,
        }
    }

    fn new_async(&self) -> LocalBoxFuture<'static, Result<StubClient, ClientError>> {
        let mut c = self.allocate();
        Box::pin(async move {
            tokio::task::yield_now().await;
            c.init()?;
            Ok(c)
        })
    }
}

fn profile(id: &str, uuid: Option<&str>) -> Settings {
    let mut connection = BTreeMap::new();
    connection.insert("id".to_owned(), Value::variant(Value::str(id)));
    if let Some(uuid) = uuid {
        connection.insert("uuid".to_owned(), Value::variant(Value::str(uuid)));
    }
    let mut s = Settings::new();
    s.insert("connection".to_owned(), connection);
    s
}

// ===========================================================================
// Start / stop
// ===========================================================================

#[tokio::test]
async fn start_then_stop_leaves_nothing_behind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = stub_config(dir.path());
    let name = config.service_name.clone();

    let mut handle = start_service(config).await.expect("stub must run here");
    assert_eq!(handle.state(), LifecycleState::Running);
    let pid = handle.pid().expect("pid");
    assert!(stubharness::process::is_alive(pid));
    assert!(owned(dir.path(), &name));
    assert!(handle.proxy().is_some());

    stop_service(&mut handle).await;
    assert_eq!(handle.state(), LifecycleState::Stopped);
    assert_eq!(handle.pid(), None);
    assert!(handle.proxy().is_none());
    assert!(!stubharness::process::is_alive(pid));
    assert!(!owned(dir.path(), &name));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut handle = start_service(stub_config(dir.path())).await.expect("start");

    stop_service(&mut handle).await;
    stop_service(&mut handle).await;
    handle.stop().await.expect("no-op");
    assert_eq!(handle.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn exit_77_is_environment_unavailable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = sh_config(dir.path(), "exit 77");
    let name = config.service_name.clone();

    let skip = start_service(config).await.expect_err("must skip");
    assert_eq!(skip.status.code(), Some(SKIP_EXIT_CODE));
    assert_eq!(skip.program, PathBuf::from("/bin/sh"));
    assert!(!owned(dir.path(), &name));
}

#[tokio::test]
async fn stub_without_bus_exits_77() {
    let status = tokio::process::Command::new(STUB)
        .env_remove(BUS_DIR_ENV)
        .stdin(std::process::Stdio::null())
        .status()
        .await
        .expect("run stub");
    assert_eq!(status.code(), Some(SKIP_EXIT_CODE));
}

#[tokio::test]
async fn other_startup_exit_is_startup_failed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = ServiceHandle::start(sh_config(dir.path(), "exit 3"))
        .await
        .expect_err("must fail");
    match err {
        HarnessError::StartupFailed { status, .. } => assert_eq!(status.code(), Some(3)),
        other => panic!("expected StartupFailed, got {other:?}"),
    }
}

#[tokio::test]
#[should_panic(expected = "startup_failed")]
async fn start_service_fails_the_test_on_startup_exit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let _ = start_service(sh_config(dir.path(), "exit 1")).await;
}

#[tokio::test]
async fn never_ready_child_times_out_and_is_torn_down() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pidfile = dir.path().join("child.pid");
    let script = format!("echo $$ > '{}'; exec sleep 30", pidfile.display());
    let mut config = sh_config(dir.path(), &script);
    config.ready_timeout = Duration::from_millis(300);
    let name = config.service_name.clone();

    let err = ServiceHandle::start(config).await.expect_err("must time out");
    match err {
        HarnessError::HarnessTimeout { deadline, .. } => {
            assert_eq!(deadline, Duration::from_millis(300))
        }
        other => panic!("expected HarnessTimeout, got {other:?}"),
    }

    let pid: u32 = std::fs::read_to_string(&pidfile)
        .expect("child wrote its pid")
        .trim()
        .parse()
        .expect("pid");
    assert!(!stubharness::process::is_alive(pid), "child {pid} outlived the timeout");
    assert!(!owned(dir.path(), &name));
}

#[tokio::test]
async fn name_owned_by_another_process_is_not_readiness() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = sh_config(dir.path(), "exec sleep 30");
    config.ready_timeout = Duration::from_millis(300);
    let name = config.service_name.clone();

    // Held by this test process, not by the child.
    let bus = LocalBus::connect(dir.path()).expect("connect");
    assert!(bus.registry().register(&name).expect("register"));

    let err = ServiceHandle::start(config).await.expect_err("must not be ready");
    assert!(matches!(err, HarnessError::HarnessTimeout { .. }), "{err:?}");
    let owner = bus.name_owner(&name, Duration::from_millis(100)).expect("owner");
    assert_eq!(owner, Some(std::process::id() as i32));
}

#[tokio::test]
async fn stub_losing_the_name_race_is_startup_failed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = stub_config(dir.path());
    let name = config.service_name.clone();
    let bus = LocalBus::connect(dir.path()).expect("connect");
    assert!(bus.registry().register(&name).expect("register"));

    let err = ServiceHandle::start(config).await.expect_err("name is taken");
    match err {
        HarnessError::StartupFailed { status, .. } => assert_eq!(status.code(), Some(1)),
        other => panic!("expected StartupFailed, got {other:?}"),
    }
    bus.registry().unregister(&name);
}

#[test]
fn config_from_env_gives_each_service_its_own_bus() {
    std::env::set_var(SERVICE_PROGRAM_ENV, STUB);
    std::env::remove_var(BUS_DIR_ENV);
    let a = ServiceConfig::from_env().expect("config");
    let b = ServiceConfig::from_env().expect("config");
    assert_eq!(a.program, PathBuf::from(STUB));
    assert_ne!(a.bus_dir, b.bus_dir);
}

#[tokio::test]
async fn missing_program_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = ServiceConfig::new("/nonexistent/stub-service", dir.path());
    let err = ServiceHandle::start(config).await.expect_err("must fail");
    assert!(matches!(err, HarnessError::Io(_)), "{err:?}");
    assert!(!err.is_recoverable());
}

// ===========================================================================
// RPC round trips
// ===========================================================================

#[tokio::test]
async fn wired_device_is_observed_by_client() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut handle = start_service(stub_config(dir.path())).await.expect("start");
    let factory = Rc::new(StubClientFactory {
        bus: LocalBus::connect(dir.path()).expect("connect"),
        service: handle.config().service_name.clone(),
    });

    LocalSet::new()
        .run_until(async {
            let mut matrix = BootstrapMatrix::seeded(5);
            let client = matrix.new_client(&factory, true).await;

            let dev = handle.add_wired_device(&*client, "eth7", None, None).await;
            assert_eq!(dev.interface, "eth7");
            assert!(dev.path.starts_with(DEFAULT_CONTROL_PATH), "{}", dev.path);

            let wifi = handle.add_device(&*client, "AddWifiDevice", "wlan0").await;
            assert_eq!(wifi.interface, "wlan0");
            assert_ne!(wifi.path, dev.path);
        })
        .await;

    stop_service(&mut handle).await;
}

#[tokio::test]
async fn connections_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut handle = start_service(stub_config(dir.path())).await.expect("start");

    let path = handle.add_connection(&profile("wired-1", Some("u-1")), true);
    assert!(path.starts_with(DEFAULT_CONTROL_PATH), "{path}");
    handle.update_connection(Some(path.as_str()), &profile("wired-1b", Some("u-1")), true);

    let raw = handle.add_connection_raw(Value::Settings(profile("no-uuid", None)), false);
    assert_ne!(raw, path);
    handle.update_connection_raw(&raw, Value::Settings(profile("still-no-uuid", None)), false);

    let proxy = handle.proxy().expect("running");
    let err = proxy
        .add_connection(&profile("bad", None), true)
        .expect_err("verification must reject");
    match err {
        HarnessError::Bus(BusError::Remote { name, .. }) => {
            assert!(name.ends_with("InvalidConnection"))
        }
        other => panic!("unexpected {other:?}"),
    }
    let unknown = "/org/stubharness/NetworkService/Settings/999";
    let err = proxy
        .update_connection(Some(unknown), &profile("x", Some("y")), false)
        .expect_err("unknown path");
    assert!(matches!(err, HarnessError::Bus(BusError::Remote { .. })), "{err:?}");

    stop_service(&mut handle).await;
}
