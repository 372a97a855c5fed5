// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Local bus: name registry + one Unix socket per owned name.
// A call is one connection carrying one JSON request line and one JSON reply
// line. The transport never starts services on demand.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::registry::NameRegistry;
use super::{Bus, BusError, CallFlags, MethodCall, RemoteError};
use crate::value::Value;

/// Environment variable naming the bus directory, handed to spawned services.
pub const BUS_DIR_ENV: &str = "STUBHARNESS_BUS_DIR";

const SOCKET_SUFFIX: &str = ".sock";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Reply {
    Return(Value),
    Error(RemoteError),
}

// ---------------------------------------------------------------------------
// LocalBus
// ---------------------------------------------------------------------------

/// A connection to the bus rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalBus {
    registry: NameRegistry,
}

impl LocalBus {
    /// Connect to the bus in `dir`, creating the directory if needed.
    pub fn connect(dir: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self { registry: NameRegistry::open(dir)? })
    }

    /// Connect to the bus named by [`BUS_DIR_ENV`].
    pub fn from_env() -> io::Result<Self> {
        let dir = std::env::var_os(BUS_DIR_ENV).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{BUS_DIR_ENV} is not set"))
        })?;
        Self::connect(PathBuf::from(dir))
    }

    pub fn dir(&self) -> &Path {
        self.registry.dir()
    }

    pub fn registry(&self) -> &NameRegistry {
        &self.registry
    }

    fn socket_path(&self, name: &str) -> PathBuf {
        self.dir().join(format!("{name}{SOCKET_SUFFIX}"))
    }

    /// Own `name` and answer calls addressed to it until the listener fails.
    ///
    /// The socket is bound before the name is claimed, so a name that
    /// resolves is always callable.
    pub fn serve<H>(&self, name: &str, mut handler: H) -> Result<(), BusError>
    where
        H: FnMut(&MethodCall) -> Result<Value, RemoteError>,
    {
        let sock = self.socket_path(name);
        if let Some(owner) = self.registry.find(name) {
            return Err(BusError::NameTaken { name: name.to_owned(), owner: owner.pid });
        }
        let _ = fs::remove_file(&sock); // leftover of a dead owner
        let listener = UnixListener::bind(&sock)?;
        if !self.registry.register(name)? {
            let owner = self.registry.find(name).map_or(0, |e| e.pid);
            return Err(BusError::NameTaken { name: name.to_owned(), owner });
        }
        tracing::info!(name, socket = %sock.display(), "serving bus name");

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.registry.unregister(name);
                    return Err(e.into());
                }
            };
            if let Err(e) = answer(stream, name, &mut handler) {
                tracing::warn!(name, error = %e, "dropping malformed call");
            }
        }
        self.registry.unregister(name);
        Ok(())
    }
}

fn answer<H>(stream: UnixStream, name: &str, handler: &mut H) -> Result<(), BusError>
where
    H: FnMut(&MethodCall) -> Result<Value, RemoteError>,
{
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let call: MethodCall = serde_json::from_str(&line)?;
    tracing::debug!(member = %call.member, path = %call.path, "incoming call");

    let reply = if call.destination != name {
        Reply::Error(RemoteError::new(
            "org.stubharness.Error.UnknownDestination",
            format!("{} is not served here", call.destination),
        ))
    } else {
        match handler(&call) {
            Ok(v) => Reply::Return(v),
            Err(e) => Reply::Error(e),
        }
    };
    let mut out = serde_json::to_string(&reply)?;
    out.push('\n');
    let mut stream = stream;
    stream.write_all(out.as_bytes())?;
    Ok(())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

impl Bus for LocalBus {
    fn name_owner(&self, name: &str, _timeout: Duration) -> Result<Option<i32>, BusError> {
        // Registry lookups are local file reads; they cannot stall on a peer.
        Ok(self.registry.find(name).map(|e| e.pid))
    }

    // Activation is not implemented, so NO_AUTO_START and NONE behave alike.
    fn call_sync(
        &self,
        call: &MethodCall,
        _flags: CallFlags,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        if self.registry.find(&call.destination).is_none() {
            return Err(BusError::ServiceUnknown { name: call.destination.clone() });
        }

        let stream = UnixStream::connect(self.socket_path(&call.destination))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let mut req = serde_json::to_string(call)?;
        req.push('\n');
        (&stream).write_all(req.as_bytes()).map_err(|e| {
            if is_timeout(&e) { BusError::NoReply { timeout } } else { e.into() }
        })?;

        let mut line = String::new();
        match BufReader::new(&stream).read_line(&mut line) {
            Ok(0) => return Err(BusError::NoReply { timeout }),
            Ok(_) => {}
            Err(e) if is_timeout(&e) => return Err(BusError::NoReply { timeout }),
            Err(e) => return Err(e.into()),
        }
        match serde_json::from_str(&line)? {
            Reply::Return(v) => Ok(v),
            Reply::Error(e) => Err(e.into()),
        }
    }
}
