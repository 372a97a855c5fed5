// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Test harness for a client library that talks to an out-of-process stub
// service over a local bus. Brings the stub up and down, mutates its state
// over RPC, and constructs the client under test along randomized paths.

pub mod bus;
pub mod value;

mod error;
pub use error::{EnvironmentUnavailable, HarnessError};

pub mod config;
pub use config::{BootstrapConfig, ServiceConfig};

pub mod client;
pub use client::{Client, ClientError, ClientFactory, DeviceObserved, ErrorSlot};

pub mod process;
pub mod readiness;
pub use readiness::ReadinessOutcome;

pub mod rpc;
pub use rpc::{DeviceKind, PendingAdd, RpcProxy};

pub mod lifecycle;
pub use lifecycle::{start_service, stop_service, LifecycleState, ServiceHandle};

pub mod bootstrap;
pub use bootstrap::{
    run_trial, BootstrapChoice, BootstrapMatrix, ClientUnderTest, ConstructionMode, Dispatch,
    LoopGuard, SyncStrategy,
};
