// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Directory-backed bus name registry.
// Each owned name is one `<name>.owner` file holding the owner pid and the
// registration time. Any process opening the same directory sees the same set
// of names; entries whose owner died are cleaned up on lookup.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const OWNER_SUFFIX: &str = ".owner";

static TMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

// ---------------------------------------------------------------------------
// NameEntry
// ---------------------------------------------------------------------------

/// A single owned name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub name: String,
    /// PID of the owning process.
    pub pid: i32,
    /// Unix timestamp (seconds) when registered.
    pub registered_at: i64,
}

impl NameEntry {
    pub fn is_alive(&self) -> bool {
        is_pid_alive(self.pid)
    }

    fn encode(&self) -> String {
        format!("{} {}\n", self.pid, self.registered_at)
    }

    fn decode(name: &str, text: &str) -> Option<Self> {
        let mut it = text.split_whitespace();
        let pid = it.next()?.parse().ok()?;
        let registered_at = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        Some(Self { name: name.to_owned(), pid, registered_at })
    }
}

// ---------------------------------------------------------------------------
// Platform: is_pid_alive
// ---------------------------------------------------------------------------

/// `kill(pid, 0)` probe. EPERM still means the process exists.
pub(crate) fn is_pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

fn current_pid() -> i32 {
    std::process::id() as i32
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// NameRegistry
// ---------------------------------------------------------------------------

/// Name registry rooted at a bus directory.
#[derive(Debug, Clone)]
pub struct NameRegistry {
    dir: PathBuf,
}

impl NameRegistry {
    /// Open (creating if needed) the registry in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn owner_file(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}{OWNER_SUFFIX}"))
    }

    /// Claim `name` for the current process.
    pub fn register(&self, name: &str) -> io::Result<bool> {
        self.register_as(name, current_pid())
    }

    /// Claim `name` for `pid`. Returns `false` if a live owner holds it.
    ///
    /// The claim is a hard link of a fully written temp file, so readers never
    /// observe a half-written entry and two claimants cannot both win.
    pub fn register_as(&self, name: &str, pid: i32) -> io::Result<bool> {
        if name.is_empty() || name.contains('/') {
            let msg = format!("invalid bus name {name:?}");
            return Err(io::Error::new(io::ErrorKind::InvalidInput, msg));
        }
        let entry = NameEntry { name: name.to_owned(), pid, registered_at: now_secs() };
        let tmp = self.dir.join(format!(
            ".{name}.{}.{}.tmp",
            current_pid(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(entry.encode().as_bytes())?;
            f.sync_all()?;
        }
        let target = self.owner_file(name);
        let result = loop {
            match fs::hard_link(&tmp, &target) {
                Ok(()) => break Ok(true),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if self.find(name).is_some() {
                        break Ok(false); // held by a live owner
                    }
                    // stale entry was just removed by find(); retry
                }
                Err(e) => break Err(e),
            }
        };
        let _ = fs::remove_file(&tmp);
        result
    }

    /// Release `name` if the current process owns it.
    pub fn unregister(&self, name: &str) -> bool {
        self.unregister_as(name, current_pid())
    }

    /// Release `name` if `pid` owns it.
    pub fn unregister_as(&self, name: &str, pid: i32) -> bool {
        match self.read_entry(name) {
            Some(e) if e.pid == pid => fs::remove_file(self.owner_file(name)).is_ok(),
            _ => false,
        }
    }

    fn read_entry(&self, name: &str) -> Option<NameEntry> {
        let text = fs::read_to_string(self.owner_file(name)).ok()?;
        NameEntry::decode(name, &text)
    }

    /// Look up the live owner of `name`. Stale entries are removed.
    pub fn find(&self, name: &str) -> Option<NameEntry> {
        let path = self.owner_file(name);
        let text = fs::read_to_string(&path).ok()?;
        match NameEntry::decode(name, &text) {
            Some(e) if e.is_alive() => Some(e),
            _ => {
                let _ = fs::remove_file(&path); // auto-clean stale
                None
            }
        }
    }

    /// All live entries, sorted by name.
    pub fn list(&self) -> Vec<NameEntry> {
        let mut out: Vec<NameEntry> = self
            .names_on_disk()
            .into_iter()
            .filter_map(|name| self.find(&name))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Remove all entries for dead processes. Returns count removed.
    pub fn gc(&self) -> usize {
        let mut removed = 0;
        for name in self.names_on_disk() {
            let live = self.read_entry(&name).is_some_and(|e| e.is_alive());
            if !live && fs::remove_file(self.owner_file(&name)).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Drop every entry regardless of owner.
    pub fn clear(&self) {
        for name in self.names_on_disk() {
            let _ = fs::remove_file(self.owner_file(&name));
        }
    }

    fn names_on_disk(&self) -> Vec<String> {
        let Ok(rd) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        rd.filter_map(|e| e.ok())
            .filter_map(|e| {
                let file = e.file_name().into_string().ok()?;
                if file.starts_with('.') {
                    return None;
                }
                file.strip_suffix(OWNER_SUFFIX).map(str::to_owned)
            })
            .collect()
    }
}
