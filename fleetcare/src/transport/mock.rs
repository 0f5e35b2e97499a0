//! In-memory fleet for tests.
//!
//! Each device is a flat map of absolute remote paths to file contents;
//! directories exist implicitly through the paths below them or explicitly
//! when added with [`MockFleet::add_dir`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::config::TransferOptions;
use super::pattern::{RemotePattern, join_remote};
use super::{CommandResult, RemoteEntry, SessionFactory, SessionResult, TransferResult, TransferSession};
use crate::device::Device;
use crate::error::{SessionError, TransportError};

/// A recorded session call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open(String),
    List(String, String),
    Get(String, String),
    Put(String, String),
    Remove(String, String),
    Exec(String, String),
    Close(String),
}

impl Call {
    pub fn device(&self) -> &str {
        match self {
            Call::Open(d)
            | Call::Close(d)
            | Call::List(d, _)
            | Call::Get(d, _)
            | Call::Put(d, _)
            | Call::Remove(d, _)
            | Call::Exec(d, _) => d,
        }
    }
}

#[derive(Debug, Default)]
struct MockDevice {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    refuse: bool,
    failing_commands: Vec<String>,
    failing_removes: Vec<String>,
    failing_gets: Vec<String>,
    failing_puts: Vec<String>,
}

impl MockDevice {
    fn list(&self, dir: &str) -> Vec<RemoteEntry> {
        let prefix = join_remote(dir, "");
        let mut entries: BTreeMap<String, bool> = BTreeMap::new();

        let paths = self.files.keys().map(|p| (p, false)).chain(self.dirs.iter().map(|p| (p, true)));
        for (path, explicit_dir) in paths {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                Some((first, _)) => {
                    entries.insert(first.to_string(), true);
                }
                None => {
                    entries.insert(rest.to_string(), explicit_dir);
                }
            }
        }

        entries
            .into_iter()
            .map(|(name, is_dir)| RemoteEntry { name, is_dir })
            .collect()
    }

    fn remove_tree(&mut self, path: &str) {
        let prefix = join_remote(path, "");
        self.files.retain(|p, _| !p.starts_with(&prefix));
        self.dirs.retain(|p| p != path && !p.starts_with(&prefix));
    }
}

#[derive(Debug, Default)]
struct FleetState {
    devices: HashMap<String, MockDevice>,
    calls: Vec<Call>,
    active: usize,
    max_active: usize,
}

/// Shared in-memory fleet; clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct MockFleet {
    state: Arc<Mutex<FleetState>>,
}

impl MockFleet {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().unwrap()
    }

    /// Register a device with no files.
    pub fn add_device(&self, name: &str) -> &Self {
        self.state().devices.entry(name.to_string()).or_default();
        self
    }

    pub fn add_file(&self, device: &str, path: &str, contents: &[u8]) -> &Self {
        self.state()
            .devices
            .entry(device.to_string())
            .or_default()
            .files
            .insert(path.to_string(), contents.to_vec());
        self
    }

    pub fn add_dir(&self, device: &str, path: &str) -> &Self {
        self.state()
            .devices
            .entry(device.to_string())
            .or_default()
            .dirs
            .insert(path.to_string());
        self
    }

    /// Refuse connections to a device.
    pub fn refuse(&self, device: &str) -> &Self {
        self.state().devices.entry(device.to_string()).or_default().refuse = true;
        self
    }

    /// Commands containing `needle` exit with status 1 on this device.
    pub fn fail_command(&self, device: &str, needle: &str) -> &Self {
        self.state()
            .devices
            .entry(device.to_string())
            .or_default()
            .failing_commands
            .push(needle.to_string());
        self
    }

    /// Removing a path containing `needle` fails on this device.
    pub fn fail_remove(&self, device: &str, needle: &str) -> &Self {
        self.state()
            .devices
            .entry(device.to_string())
            .or_default()
            .failing_removes
            .push(needle.to_string());
        self
    }

    /// Downloading a file whose path contains `needle` fails on this device.
    pub fn fail_get(&self, device: &str, needle: &str) -> &Self {
        self.state()
            .devices
            .entry(device.to_string())
            .or_default()
            .failing_gets
            .push(needle.to_string());
        self
    }

    /// Uploading to a path containing `needle` fails on this device.
    pub fn fail_put(&self, device: &str, needle: &str) -> &Self {
        self.state()
            .devices
            .entry(device.to_string())
            .or_default()
            .failing_puts
            .push(needle.to_string());
        self
    }

    /// Sorted file names directly inside a remote directory.
    pub fn files_in(&self, device: &str, dir: &str) -> Vec<String> {
        let state = self.state();
        state
            .devices
            .get(device)
            .map(|d| d.list(dir).into_iter().filter(|e| !e.is_dir).map(|e| e.name).collect())
            .unwrap_or_default()
    }

    pub fn has_file(&self, device: &str, path: &str) -> bool {
        self.state()
            .devices
            .get(device)
            .is_some_and(|d| d.files.contains_key(path))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn calls_for(&self, device: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.device() == device).collect()
    }

    /// Commands executed on a device, in order.
    pub fn commands(&self, device: &str) -> Vec<String> {
        self.calls_for(device)
            .into_iter()
            .filter_map(|c| match c {
                Call::Exec(_, cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    /// Highest number of sessions open at the same time.
    pub fn max_active(&self) -> usize {
        self.state().max_active
    }

    /// Sessions opened but not closed.
    pub fn open_sessions(&self) -> usize {
        self.state().active
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }
}

impl SessionFactory for MockFleet {
    type Session = MockSession;

    async fn open(&self, device: &Device) -> SessionResult<MockSession> {
        self.record(Call::Open(device.name.clone()));
        let refused = self
            .state()
            .devices
            .get(&device.name)
            .is_none_or(|d| d.refuse);
        if refused {
            return Err(SessionError::Connection(TransportError::ConnectionFailed {
                host: device.host.clone(),
                port: device.port.unwrap_or(22),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            }));
        }

        {
            let mut state = self.state();
            state.active += 1;
            state.max_active = state.max_active.max(state.active);
        }
        // Give other device tasks a chance to open their sessions.
        tokio::task::yield_now().await;

        Ok(MockSession {
            fleet: self.clone(),
            device: device.name.clone(),
        })
    }
}

/// Session onto one mock device.
#[derive(Debug)]
pub struct MockSession {
    fleet: MockFleet,
    device: String,
}

impl MockSession {
    fn with_device<T>(&self, f: impl FnOnce(&mut MockDevice) -> T) -> T {
        let mut state = self.fleet.state();
        let device = state.devices.entry(self.device.clone()).or_default();
        f(device)
    }

    fn download_tree(&self, remote_dir: &str, local_dir: &Path, result: &mut TransferResult) {
        let mut pending: Vec<(String, PathBuf)> = vec![(remote_dir.to_string(), local_dir.to_path_buf())];
        while let Some((dir, local)) = pending.pop() {
            if let Err(e) = std::fs::create_dir_all(&local) {
                result.push_failure(&dir, e);
                continue;
            }
            for entry in self.with_device(|d| d.list(&dir)) {
                let remote = join_remote(&dir, &entry.name);
                if entry.is_dir {
                    pending.push((remote, local.join(&entry.name)));
                } else {
                    self.download_file(&remote, &local.join(&entry.name), result);
                }
            }
        }
    }

    fn download_file(&self, remote: &str, local: &Path, result: &mut TransferResult) {
        let failing = self.with_device(|d| d.failing_gets.iter().any(|n| remote.contains(n.as_str())));
        if failing {
            result.push_failure(remote, "read error");
            return;
        }
        let contents = self.with_device(|d| d.files.get(remote).cloned());
        match contents {
            Some(bytes) => match std::fs::write(local, bytes) {
                Ok(()) => result.push_ok(remote),
                Err(e) => result.push_failure(remote, e),
            },
            None => result.push_failure(remote, "no such file"),
        }
    }
}

impl TransferSession for MockSession {
    async fn list(&mut self, remote_dir: &str) -> SessionResult<Vec<RemoteEntry>> {
        self.fleet.record(Call::List(self.device.clone(), remote_dir.to_string()));
        tokio::task::yield_now().await;
        Ok(self.with_device(|d| d.list(remote_dir)))
    }

    async fn get(
        &mut self,
        remote_pattern: &str,
        local_dir: &Path,
        options: &TransferOptions,
    ) -> SessionResult<TransferResult> {
        self.fleet.record(Call::Get(self.device.clone(), remote_pattern.to_string()));
        let pattern = RemotePattern::parse(remote_pattern);
        let mut result = TransferResult::new(remote_pattern);

        for entry in self.with_device(|d| d.list(&pattern.dir)) {
            if !pattern.matches(&entry.name) {
                continue;
            }
            let remote = pattern.entry_path(&entry.name);
            if entry.is_dir {
                let local = if options.preserve_structure {
                    local_dir.join(&entry.name)
                } else {
                    local_dir.to_path_buf()
                };
                self.download_tree(&remote, &local, &mut result);
            } else {
                self.download_file(&remote, &local_dir.join(&entry.name), &mut result);
            }
        }
        Ok(result)
    }

    async fn put(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        _options: &TransferOptions,
    ) -> SessionResult<TransferResult> {
        self.fleet.record(Call::Put(self.device.clone(), remote_path.to_string()));
        let mut result = TransferResult::new(remote_path);
        let failing = self.with_device(|d| d.failing_puts.iter().any(|n| remote_path.contains(n.as_str())));
        if failing {
            result.push_failure(remote_path, "no space left on device");
            return Ok(result);
        }
        match std::fs::read(local_path) {
            Ok(bytes) => {
                self.with_device(|d| d.files.insert(remote_path.to_string(), bytes));
                result.push_ok(remote_path);
            }
            Err(e) => result.push_failure(remote_path, e),
        }
        Ok(result)
    }

    async fn remove(&mut self, remote_pattern: &str) -> SessionResult<TransferResult> {
        self.fleet.record(Call::Remove(self.device.clone(), remote_pattern.to_string()));
        let pattern = RemotePattern::parse(remote_pattern);
        let mut result = TransferResult::new(remote_pattern);

        let matched: Vec<RemoteEntry> = self
            .with_device(|d| d.list(&pattern.dir))
            .into_iter()
            .filter(|e| pattern.matches(&e.name))
            .collect();

        if matched.is_empty() && !pattern.is_wildcard() {
            result.push_failure(remote_pattern, "no such file");
        }

        for entry in matched {
            let path = pattern.entry_path(&entry.name);
            let failing = self.with_device(|d| d.failing_removes.iter().any(|n| path.contains(n.as_str())));
            if failing {
                result.push_failure(path, "permission denied");
                continue;
            }
            if entry.is_dir {
                self.with_device(|d| d.remove_tree(&path));
            } else {
                self.with_device(|d| d.files.remove(&path));
            }
            result.push_ok(path);
        }
        Ok(result)
    }

    async fn exec(&mut self, command: &str) -> SessionResult<CommandResult> {
        self.fleet.record(Call::Exec(self.device.clone(), command.to_string()));
        let failing = self.with_device(|d| d.failing_commands.iter().any(|n| command.contains(n.as_str())));
        Ok(CommandResult {
            command: command.to_string(),
            exit_status: Some(u32::from(failing)),
            stdout: String::new(),
            stderr: if failing { "operation not permitted".to_string() } else { String::new() },
        })
    }

    async fn close(self) -> SessionResult<()> {
        self.fleet.record(Call::Close(self.device.clone()));
        self.fleet.state().active -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str) -> Device {
        Device::new(name, "10.0.0.1", "root", "pw")
    }

    #[tokio::test]
    async fn test_listing_and_get() {
        let fleet = MockFleet::new();
        fleet
            .add_file("d1", "/tmp/logs/app.log", b"a")
            .add_file("d1", "/tmp/logs/old/boot.log", b"b")
            .add_dir("d1", "/tmp/logs/empty");

        let mut session = fleet.open(&device("d1")).await.unwrap();
        let entries = session.list("/tmp/logs").await.unwrap();
        assert_eq!(
            entries,
            vec![
                RemoteEntry::file("app.log"),
                RemoteEntry::dir("empty"),
                RemoteEntry::dir("old")
            ]
        );

        let out = tempfile::tempdir().unwrap();
        let result = session
            .get("/tmp/logs/*", out.path(), &TransferOptions::default())
            .await
            .unwrap();
        assert!(result.is_success());
        assert!(out.path().join("old/boot.log").exists());
        assert!(out.path().join("empty").is_dir());
        session.close().await.unwrap();
        assert_eq!(fleet.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_injected_transfer_failures() {
        let fleet = MockFleet::new();
        fleet
            .add_file("d1", "/mnt/log/a.log", b"a")
            .add_file("d1", "/mnt/log/b.log", b"b")
            .fail_get("d1", "b.log")
            .fail_put("d1", "/mnt/flash/");

        let mut session = fleet.open(&device("d1")).await.unwrap();
        let out = tempfile::tempdir().unwrap();
        let fetched = session
            .get("/mnt/log/*", out.path(), &TransferOptions::default())
            .await
            .unwrap();
        assert_eq!(fetched.transferred, vec!["/mnt/log/a.log".to_string()]);
        assert!(fetched.check().is_err());

        let local = out.path().join("a.log");
        let sent = session
            .put(&local, "/mnt/flash/a.iso", &TransferOptions::default())
            .await
            .unwrap();
        assert!(!sent.is_success());
        assert!(!fleet.has_file("d1", "/mnt/flash/a.iso"));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_device() {
        let fleet = MockFleet::new();
        fleet.refuse("d1");
        let err = fleet.open(&device("d1")).await.unwrap_err();
        assert!(err.is_connection());
    }
}
