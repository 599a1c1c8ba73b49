//! In-memory transport for unit tests.
//!
//! [`MockTransport`] hands out [`MockConnection`]s that share one [`MockFs`],
//! so files written over one connection are visible after a reconnect. Every
//! channel operation is counted per name and can be scripted to fail.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::remote::credentials::AuthSettings;
use crate::remote::error::{ConnectFailure, ErrorKind, RemoteError};
use crate::remote::metadata::{FileInfo, FileType};
use crate::remote::profile::PROFILE_COMMAND;
use crate::remote::transport::{
    ConnectRequest, Connection, ExecOutput, FileChannel, Transport, remote_file_name,
    remote_parent,
};

const MOCK_MTIME_MS: i64 = 1_700_000_000_000;
const MOCK_UID: u32 = 1000;
const MOCK_GID: u32 = 1000;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    mode: u32,
    link: Option<String>,
}

/// In-memory remote filesystem keyed by absolute path.
#[derive(Debug)]
pub(crate) struct MockFs {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl Default for MockFs {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "/".to_string(),
            Entry {
                data: Vec::new(),
                mode: FileType::Directory.mode_bits() | 0o755,
                link: None,
            },
        );
        Self {
            entries: Mutex::new(entries),
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parent_of(path: &str) -> String {
    remote_parent(path).unwrap_or("/").to_string()
}

impl MockFs {
    pub(crate) fn put_dir(&self, path: &str) {
        let path = normalize(path);
        if path != "/" {
            self.put_dir(&parent_of(&path));
        }
        lock(&self.entries).entry(path).or_insert(Entry {
            data: Vec::new(),
            mode: FileType::Directory.mode_bits() | 0o755,
            link: None,
        });
    }

    /// Create a file and any missing parents.
    pub(crate) fn put_file(&self, path: &str, data: &[u8], perm: u32) {
        let path = normalize(path);
        self.put_dir(&parent_of(&path));
        lock(&self.entries).insert(
            path,
            Entry {
                data: data.to_vec(),
                mode: FileType::Regular.mode_bits() | (perm & 0o777),
                link: None,
            },
        );
    }

    pub(crate) fn put_symlink(&self, path: &str, target: &str) {
        let path = normalize(path);
        self.put_dir(&parent_of(&path));
        lock(&self.entries).insert(
            path,
            Entry {
                data: Vec::new(),
                mode: FileType::Symlink.mode_bits() | 0o777,
                link: Some(target.to_string()),
            },
        );
    }

    pub(crate) fn exists(&self, path: &str) -> bool {
        lock(&self.entries).contains_key(&normalize(path))
    }

    pub(crate) fn read(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.entries).get(&normalize(path)).map(|e| e.data.clone())
    }

    pub(crate) fn paths(&self) -> Vec<String> {
        lock(&self.entries).keys().cloned().collect()
    }

    fn not_found(path: &str) -> RemoteError {
        RemoteError::new(ErrorKind::NoSuchFile, format!("{}: no such file", path))
    }

    fn resolve(&self, path: &str) -> Result<String, RemoteError> {
        let mut current = normalize(path);
        let entries = lock(&self.entries);
        for _ in 0..8 {
            let entry = entries.get(&current).ok_or_else(|| Self::not_found(path))?;
            match &entry.link {
                Some(target) if target.starts_with('/') => current = normalize(target),
                Some(target) => current = normalize(&format!("{}/{}", parent_of(&current), target)),
                None => return Ok(current),
            }
        }
        Err(RemoteError::new(ErrorKind::Failure, "too many levels of symlinks"))
    }

    fn info(&self, name: &str, entry: &Entry) -> FileInfo {
        FileInfo::from_raw_mode(
            name,
            entry.mode,
            MOCK_UID,
            MOCK_GID,
            entry.data.len() as u64,
            MOCK_MTIME_MS,
            entry.link.clone(),
        )
    }

    fn stat(&self, path: &str, follow: bool) -> Result<FileInfo, RemoteError> {
        let resolved = if follow { self.resolve(path)? } else { normalize(path) };
        let entries = lock(&self.entries);
        let entry = entries.get(&resolved).ok_or_else(|| Self::not_found(path))?;
        let link = if follow { None } else { entry.link.clone() };
        Ok(FileInfo::from_raw_mode(
            remote_file_name(path),
            entry.mode,
            MOCK_UID,
            MOCK_GID,
            entry.data.len() as u64,
            MOCK_MTIME_MS,
            link,
        ))
    }

    fn list(&self, path: &str) -> Result<Vec<FileInfo>, RemoteError> {
        let dir = self.resolve(path)?;
        let entries = lock(&self.entries);
        let own = entries.get(&dir).ok_or_else(|| Self::not_found(path))?;
        if FileType::from_mode(own.mode) != FileType::Directory {
            return Err(RemoteError::new(ErrorKind::Failure, format!("{}: not a directory", path)));
        }
        let mut out = vec![self.info(".", own), self.info("..", own)];
        for (child, entry) in entries.iter() {
            if child != "/" && parent_of(child) == dir {
                out.push(self.info(remote_file_name(child), entry));
            }
        }
        Ok(out)
    }

    fn check_parent(&self, path: &str) -> Result<(), RemoteError> {
        let parent = parent_of(&normalize(path));
        match lock(&self.entries).get(&parent) {
            Some(e) if FileType::from_mode(e.mode) == FileType::Directory => Ok(()),
            _ => Err(Self::not_found(path)),
        }
    }

    fn write(&self, path: &str, data: Vec<u8>) -> Result<(), RemoteError> {
        self.check_parent(path)?;
        let mut entries = lock(&self.entries);
        let mode = entries
            .get(&normalize(path))
            .map(|e| e.mode)
            .unwrap_or(FileType::Regular.mode_bits() | 0o644);
        entries.insert(
            normalize(path),
            Entry {
                data,
                mode,
                link: None,
            },
        );
        Ok(())
    }

    fn mkdir(&self, path: &str) -> Result<(), RemoteError> {
        self.check_parent(path)?;
        let mut entries = lock(&self.entries);
        let path = normalize(path);
        if entries.contains_key(&path) {
            return Err(RemoteError::new(ErrorKind::Failure, format!("{}: exists", path)));
        }
        entries.insert(
            path,
            Entry {
                data: Vec::new(),
                mode: FileType::Directory.mode_bits() | 0o755,
                link: None,
            },
        );
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.check_parent(to)?;
        let mut entries = lock(&self.entries);
        // Plain SFTP rename refuses to replace an existing target.
        if entries.contains_key(&normalize(to)) {
            return Err(RemoteError::new(ErrorKind::Failure, format!("{}: exists", to)));
        }
        let entry = entries
            .remove(&normalize(from))
            .ok_or_else(|| Self::not_found(from))?;
        entries.insert(normalize(to), entry);
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), RemoteError> {
        let mut entries = lock(&self.entries);
        match entries.get(&normalize(path)) {
            Some(e) if FileType::from_mode(e.mode) == FileType::Directory => Err(RemoteError::new(
                ErrorKind::Failure,
                format!("{}: is a directory", path),
            )),
            Some(_) => {
                entries.remove(&normalize(path));
                Ok(())
            }
            None => Err(Self::not_found(path)),
        }
    }

    fn chmod(&self, path: &str, perm: u32) -> Result<(), RemoteError> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .get_mut(&normalize(path))
            .ok_or_else(|| Self::not_found(path))?;
        entry.mode = (entry.mode & !0o7777) | (perm & 0o7777);
        Ok(())
    }

    fn read_link(&self, path: &str) -> Result<String, RemoteError> {
        lock(&self.entries)
            .get(&normalize(path))
            .and_then(|e| e.link.clone())
            .ok_or_else(|| RemoteError::new(ErrorKind::Failure, format!("{}: not a link", path)))
    }
}

/// Per-operation counters and scripted failures.
#[derive(Debug, Default)]
struct Script {
    calls: Mutex<HashMap<&'static str, usize>>,
    // op -> (kind, remaining; None = forever)
    failures: Mutex<HashMap<&'static str, (ErrorKind, Option<usize>)>>,
}

impl Script {
    fn enter(&self, op: &'static str) -> Result<(), RemoteError> {
        *lock(&self.calls).entry(op).or_default() += 1;
        let mut failures = lock(&self.failures);
        let Some((kind, remaining)) = failures.get_mut(op) else {
            return Ok(());
        };
        let kind = *kind;
        match remaining {
            Some(0) => return Ok(()),
            Some(n) => *n -= 1,
            None => {}
        }
        Err(RemoteError::new(kind, format!("scripted {} failure", op)))
    }

    fn calls(&self, op: &str) -> usize {
        lock(&self.calls).get(op).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct ConnState {
    alive: AtomicBool,
    epoch: AtomicU64,
    opened: AtomicUsize,
    open_failures: Mutex<VecDeque<ErrorKind>>,
    exec_replies: Mutex<HashMap<String, ExecOutput>>,
    exec_failure: AtomicBool,
    execs: AtomicUsize,
    disconnects: AtomicUsize,
    applied_auth: Mutex<Option<AuthSettings>>,
    script: Script,
}

pub(crate) struct MockConnection {
    fs: Arc<MockFs>,
    state: Arc<ConnState>,
}

impl MockConnection {
    pub(crate) fn new() -> Self {
        Self::with_fs(Arc::new(MockFs::default()))
    }

    pub(crate) fn with_fs(fs: Arc<MockFs>) -> Self {
        let state = ConnState::default();
        state.alive.store(true, Ordering::SeqCst);
        Self {
            fs,
            state: Arc::new(state),
        }
    }

    pub(crate) fn fs(&self) -> &Arc<MockFs> {
        &self.fs
    }

    pub(crate) fn channels_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Make every channel opened so far report disconnected.
    pub(crate) fn kill_channels(&self) {
        self.state.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Simulate the connection dying silently.
    pub(crate) fn kill(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_channel_open(&self, kind: ErrorKind) {
        lock(&self.state.open_failures).push_back(kind);
    }

    pub(crate) fn set_exec_reply(&self, command: &str, exit_code: i32, stdout: &str) {
        lock(&self.state.exec_replies).insert(
            command.to_string(),
            ExecOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    pub(crate) fn set_exec_failure(&self, fail: bool) {
        self.state.exec_failure.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn exec_count(&self) -> usize {
        self.state.execs.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn applied_auth(&self) -> Option<AuthSettings> {
        lock(&self.state.applied_auth).clone()
    }

    /// Fail channel operation `op` with `kind`, `times` times (forever if `None`).
    pub(crate) fn fail_op(&self, op: &'static str, kind: ErrorKind, times: Option<usize>) {
        lock(&self.state.script.failures).insert(op, (kind, times));
    }

    /// How many times channel operation `op` was attempted.
    pub(crate) fn calls(&self, op: &str) -> usize {
        self.state.script.calls(op)
    }

    fn md5_reply(&self, command: &str) -> Option<ExecOutput> {
        let rest = command.strip_prefix("test -e '")?;
        let (path, _) = rest.split_once("' || exit 3;")?;
        if !self.fs.exists(path) {
            return Some(ExecOutput {
                exit_code: 3,
                ..ExecOutput::default()
            });
        }
        let data = self.fs.read(path).unwrap_or_default();
        Some(ExecOutput {
            exit_code: 0,
            stdout: format!("{}  {}\n", hex::encode(Md5::digest(&data)), path),
            stderr: String::new(),
        })
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    async fn open_file_channel(&self) -> Result<Box<dyn FileChannel>, RemoteError> {
        if !self.is_alive() {
            return Err(RemoteError::new(ErrorKind::ChannelLost, "connection closed"));
        }
        if let Some(kind) = lock(&self.state.open_failures).pop_front() {
            return Err(RemoteError::new(kind, "scripted open failure"));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockChannel {
            fs: self.fs.clone(),
            state: self.state.clone(),
            epoch: self.state.epoch.load(Ordering::SeqCst),
            lost: AtomicBool::new(false),
        }))
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, RemoteError> {
        self.state.execs.fetch_add(1, Ordering::SeqCst);
        if let Some(reply) = lock(&self.state.exec_replies).get(command) {
            return Ok(reply.clone());
        }
        if self.state.exec_failure.load(Ordering::SeqCst) {
            return Err(RemoteError::new(ErrorKind::Unsupported, "exec refused"));
        }
        if command == PROFILE_COMMAND {
            return Ok(ExecOutput {
                exit_code: 0,
                stdout: "Linux\n1000\n1000 27\n/bin/bash\n/tmp\n".to_string(),
                stderr: String::new(),
            });
        }
        if let Some(output) = self.md5_reply(command) {
            return Ok(output);
        }
        Ok(ExecOutput {
            exit_code: 127,
            stdout: String::new(),
            stderr: "command not found".to_string(),
        })
    }

    fn apply_auth(&self, auth: &AuthSettings) {
        *lock(&self.state.applied_auth) = Some(auth.clone());
    }

    async fn disconnect(&self) {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.alive.store(false, Ordering::SeqCst);
    }
}

struct MockChannel {
    fs: Arc<MockFs>,
    state: Arc<ConnState>,
    epoch: u64,
    lost: AtomicBool,
}

impl MockChannel {
    fn enter(&self, op: &'static str) -> Result<(), RemoteError> {
        if !self.is_connected() {
            return Err(RemoteError::new(ErrorKind::ChannelLost, "channel closed"));
        }
        self.state.script.enter(op).map_err(|e| {
            if e.kind == ErrorKind::ChannelLost {
                self.lost.store(true, Ordering::SeqCst);
            }
            e
        })
    }
}

#[async_trait]
impl FileChannel for MockChannel {
    fn is_connected(&self) -> bool {
        !self.lost.load(Ordering::SeqCst)
            && self.state.alive.load(Ordering::SeqCst)
            && self.state.epoch.load(Ordering::SeqCst) == self.epoch
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, RemoteError> {
        self.enter("stat")?;
        self.fs.stat(path, true)
    }

    async fn lstat(&self, path: &str) -> Result<FileInfo, RemoteError> {
        self.enter("lstat")?;
        self.fs.stat(path, false)
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, RemoteError> {
        self.enter("read_dir")?;
        self.fs.list(path)
    }

    async fn read_link(&self, path: &str) -> Result<String, RemoteError> {
        self.enter("read_link")?;
        self.fs.read_link(path)
    }

    async fn write_from(
        &self,
        path: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, RemoteError> {
        // The remote file exists as soon as it is opened for writing.
        if self.is_connected() {
            let _ = self.fs.write(path, Vec::new());
        }
        self.enter("write")?;
        let mut data = Vec::new();
        source.read_to_end(&mut data).await?;
        let len = data.len() as u64;
        self.fs.write(path, data)?;
        Ok(len)
    }

    async fn read_into(
        &self,
        path: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, RemoteError> {
        self.enter("read")?;
        let resolved = self.fs.resolve(path)?;
        let data = self.fs.read(&resolved).ok_or_else(|| MockFs::not_found(path))?;
        sink.write_all(&data).await?;
        sink.flush().await?;
        Ok(data.len() as u64)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.enter("rename")?;
        self.fs.rename(from, to)
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), RemoteError> {
        self.enter("chmod")?;
        self.fs.chmod(path, mode)
    }

    async fn mkdir(&self, path: &str) -> Result<(), RemoteError> {
        self.enter("mkdir")?;
        self.fs.mkdir(path)
    }

    async fn remove_file(&self, path: &str) -> Result<(), RemoteError> {
        self.enter("remove")?;
        self.fs.remove(path)
    }

    async fn close(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }
}

/// Transport whose handshakes are counted and can be delayed or failed.
#[derive(Default)]
pub(crate) struct MockTransport {
    fs: Arc<MockFs>,
    handshakes: AtomicUsize,
    delay: Mutex<Duration>,
    failures: Mutex<VecDeque<ConnectFailure>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    passwords: Mutex<Vec<Option<String>>>,
    auth: Mutex<Vec<AuthSettings>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fs(&self) -> &Arc<MockFs> {
        &self.fs
    }

    pub(crate) fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Fail the next handshake with `failure`.
    pub(crate) fn fail_next(&self, failure: ConnectFailure) {
        lock(&self.failures).push_back(failure);
    }

    pub(crate) fn last_connection(&self) -> Option<Arc<MockConnection>> {
        lock(&self.connections).last().cloned()
    }

    /// Passwords offered by each handshake, in order.
    pub(crate) fn passwords(&self) -> Vec<Option<String>> {
        lock(&self.passwords).clone()
    }

    /// Auth settings each handshake was made with, in order.
    pub(crate) fn auth_requests(&self) -> Vec<AuthSettings> {
        lock(&self.auth).clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, request: &ConnectRequest) -> Result<Arc<dyn Connection>, ConnectFailure> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        lock(&self.passwords).push(request.password.clone());
        lock(&self.auth).push(request.auth.clone());
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = lock(&self.failures).pop_front() {
            return Err(failure);
        }
        let conn = Arc::new(MockConnection::with_fs(self.fs.clone()));
        lock(&self.connections).push(conn.clone());
        Ok(conn)
    }
}
