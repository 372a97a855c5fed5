// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bus transport seam: name resolution plus synchronous method calls.
// `LocalBus` is the bundled implementation; tests substitute their own.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::Value;

pub mod local;
pub mod registry;

pub use local::{LocalBus, BUS_DIR_ENV};
pub use registry::{NameEntry, NameRegistry};

// ---------------------------------------------------------------------------
// Call description
// ---------------------------------------------------------------------------

/// Flags applied to a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallFlags(u32);

impl CallFlags {
    pub const NONE: CallFlags = CallFlags(0);
    /// Never launch a service to satisfy the call.
    pub const NO_AUTO_START: CallFlags = CallFlags(1);

    pub fn contains(self, other: CallFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A method call addressed to an object on a named service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    /// Always a tuple.
    pub body: Value,
}

impl MethodCall {
    pub fn new(destination: &str, path: &str, interface: &str, member: &str, body: Value) -> Self {
        Self {
            destination: destination.to_owned(),
            path: path.to_owned(),
            interface: interface.to_owned(),
            member: member.to_owned(),
            body,
        }
    }
}

/// Error reply raised by a service handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(name: &str, message: impl Into<String>) -> Self {
        Self { name: name.to_owned(), message: message.into() }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures surfaced by a bus transport.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("name {name} has no owner")]
    ServiceUnknown { name: String },

    #[error("name {name} is already owned by pid {owner}")]
    NameTaken { name: String, owner: i32 },

    #[error("no reply within {timeout:?}")]
    NoReply { timeout: Duration },

    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    #[error("transport i/o: {0}")]
    Io(#[from] io::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<RemoteError> for BusError {
    fn from(e: RemoteError) -> Self {
        BusError::Remote { name: e.name, message: e.message }
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// A connected bus.
pub trait Bus {
    /// Pid of the process owning `name`, if any. Never auto-starts the name.
    fn name_owner(&self, name: &str, timeout: Duration) -> Result<Option<i32>, BusError>;

    /// Whether `name` currently has an owner.
    fn name_has_owner(&self, name: &str, timeout: Duration) -> Result<bool, BusError> {
        Ok(self.name_owner(name, timeout)?.is_some())
    }

    /// Issue `call` and block for its reply, at most `timeout`.
    fn call_sync(
        &self,
        call: &MethodCall,
        flags: CallFlags,
        timeout: Duration,
    ) -> Result<Value, BusError>;
}
