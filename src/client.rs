// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The client-under-test seam.
//
// A client library plugs into the harness by implementing [`ClientFactory`]
// for its constructor family and [`Client`] for the object it produces.

use futures::future::LocalBoxFuture;
use thiserror::Error;
use tokio::sync::broadcast;

/// Error reported by the client library.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ClientError {
    pub message: String,
}

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// "Device observed" notification emitted by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceObserved {
    pub path: String,
    pub interface: String,
}

/// Where a constructor reports its error.
///
/// `Discard` is the "no error slot" form: failure is visible only as a
/// missing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSlot {
    Capture,
    Discard,
}

impl ErrorSlot {
    /// Split a constructor result into (object, reported error).
    pub fn settle<T>(self, result: Result<T, ClientError>) -> (Option<T>, Option<ClientError>) {
        match (self, result) {
            (_, Ok(v)) => (Some(v), None),
            (ErrorSlot::Capture, Err(e)) => (None, Some(e)),
            (ErrorSlot::Discard, Err(_)) => (None, None),
        }
    }
}

/// A constructed client object.
pub trait Client {
    /// Second half of the allocate-then-initialize form.
    fn init(&mut self) -> Result<(), ClientError>;

    /// Whether initialization completed successfully.
    fn is_initialized(&self) -> bool;

    /// Subscribe to the client's "device observed" notifications.
    fn subscribe_devices(&self) -> broadcast::Receiver<DeviceObserved>;
}

/// Constructor family of a client.
///
/// Implementations may spawn background work onto the ambient event context
/// with `tokio::task::spawn_local`; the harness decides which context that is.
pub trait ClientFactory {
    type Client: Client + 'static;

    /// Synchronous constructor. Must not iterate the ambient context.
    fn new_sync(&self) -> Result<Self::Client, ClientError>;

    /// Allocate without initializing; pair with [`Client::init`].
    fn allocate(&self) -> Self::Client;

    /// Asynchronous constructor, driven by the ambient context.
    fn new_async(&self) -> LocalBoxFuture<'static, Result<Self::Client, ClientError>>;
}
