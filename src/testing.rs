//! In-memory remote host used by unit tests

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::registry::ManagedHandle;
use crate::remote::{
    PtySize, RemoteAttrs, RemoteConnection, RemoteConnector, RemoteDirEntry, RemoteFs,
    ShellChannel, ShellCommand, ShellOutput,
};
use crate::sftp::{FileType, SftpError};
use crate::ssh::{SshConfig, SshError};

/// Connector that hands out [`FakeConnection`]s sharing one [`FakeFs`]
pub struct FakeConnector {
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    configs: Mutex<Vec<SshConfig>>,
    fail: Mutex<Option<SshError>>,
    delay: Mutex<Option<Duration>>,
    fs: Arc<FakeFs>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
            fail: Mutex::new(None),
            delay: Mutex::new(None),
            fs: Arc::new(FakeFs::default()),
        }
    }

    /// Connections made so far, oldest first
    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().clone()
    }

    pub fn last_config(&self) -> Option<SshConfig> {
        self.configs.lock().last().cloned()
    }

    /// Make the next connect fail with `err`
    pub fn fail_with(&self, err: SshError) {
        *self.fail.lock() = Some(err);
    }

    /// Delay every connect by `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn fs(&self) -> Arc<FakeFs> {
        self.fs.clone()
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn RemoteConnection>, SshError> {
        self.configs.lock().push(config.clone());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.fail.lock().take();
        if let Some(err) = failure {
            return Err(err);
        }

        let connection = Arc::new(FakeConnection::new(self.fs.clone()));
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

/// Fake connection; shells echo nothing but answer `ls` with `total 0`
pub struct FakeConnection {
    connected: AtomicBool,
    close_count: AtomicU32,
    fs: Arc<FakeFs>,
    shells: Mutex<Vec<FakeShell>>,
}

impl FakeConnection {
    fn new(fs: Arc<FakeFs>) -> Self {
        Self {
            connected: AtomicBool::new(true),
            close_count: AtomicU32::new(0),
            fs,
            shells: Mutex::new(Vec::new()),
        }
    }

    pub fn close_count(&self) -> u32 {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn shells(&self) -> Vec<FakeShell> {
        self.shells.lock().clone()
    }

    /// Simulate the transport dying under every open shell
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        for shell in self.shells.lock().iter() {
            let _ = shell
                .out_tx
                .try_send(ShellOutput::Error("SSH connection lost".to_string()));
        }
    }
}

#[async_trait]
impl ManagedHandle for FakeConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteConnection for FakeConnection {
    async fn open_shell(&self, size: PtySize) -> Result<ShellChannel, SshError> {
        if !self.is_connected() {
            return Err(SshError::Disconnected);
        }

        let (channel, mut cmd_rx, out_tx) = ShellChannel::pair();
        let shell = FakeShell {
            stdin: Arc::new(Mutex::new(Vec::new())),
            resizes: Arc::new(Mutex::new(vec![size])),
            closed: Arc::new(AtomicBool::new(false)),
            out_tx: out_tx.clone(),
        };
        self.shells.lock().push(shell.clone());

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    ShellCommand::Data(data) => {
                        shell.stdin.lock().extend_from_slice(&data);
                        if data.windows(3).any(|w| w == &b"ls\n"[..]) {
                            let _ = out_tx
                                .send(ShellOutput::Data(Bytes::from_static(b"total 0\n")))
                                .await;
                        }
                    }
                    ShellCommand::Resize(size) => shell.resizes.lock().push(size),
                    ShellCommand::Close => break,
                }
            }
            shell.closed.store(true, Ordering::SeqCst);
        });

        Ok(channel)
    }

    async fn open_file_transfer(&self) -> Result<Arc<dyn RemoteFs>, SftpError> {
        if !self.is_connected() {
            return Err(SftpError::ChannelError("not connected".to_string()));
        }
        Ok(self.fs.clone())
    }
}

/// Remote end of one fake shell
#[derive(Clone)]
pub struct FakeShell {
    stdin: Arc<Mutex<Vec<u8>>>,
    resizes: Arc<Mutex<Vec<PtySize>>>,
    closed: Arc<AtomicBool>,
    out_tx: mpsc::Sender<ShellOutput>,
}

impl FakeShell {
    /// Everything written to the shell so far
    pub fn stdin(&self) -> String {
        String::from_utf8_lossy(&self.stdin.lock()).into_owned()
    }

    /// PTY sizes, starting with the one the shell was opened with
    pub fn resizes(&self) -> Vec<PtySize> {
        self.resizes.lock().clone()
    }

    /// True once the local side closed the shell
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn emit(&self, data: &[u8]) {
        let _ = self
            .out_tx
            .send(ShellOutput::Data(Bytes::copy_from_slice(data)))
            .await;
    }

    /// Remote side ends the shell (e.g. `exit`)
    pub async fn close_remote(&self) {
        let _ = self.out_tx.send(ShellOutput::Closed).await;
    }
}

enum FakeNode {
    Dir,
    File(Vec<u8>),
}

/// In-memory file tree; the home directory is the empty path
#[derive(Default)]
pub struct FakeFs {
    nodes: Mutex<BTreeMap<String, FakeNode>>,
    fail_next: Mutex<Option<SftpError>>,
}

fn normalize(path: &str) -> String {
    if path == "." || path.is_empty() {
        return String::new();
    }
    let path = path.strip_prefix("./").unwrap_or(path);
    if path == "/" {
        return path.to_string();
    }
    path.trim_end_matches('/').to_string()
}

fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((dir, _)) => dir,
        None => "",
    }
}

fn attrs(node: &FakeNode) -> RemoteAttrs {
    let (file_type, size, mode) = match node {
        FakeNode::Dir => (FileType::Directory, 4096, 0o040755),
        FakeNode::File(data) => (FileType::File, data.len() as u64, 0o100644),
    };
    RemoteAttrs {
        file_type,
        size,
        mtime: 1_700_000_000,
        permissions: Some(mode),
        uid: 1000,
        gid: 1000,
    }
}

impl FakeFs {
    pub fn add_dir(&self, path: &str) {
        self.nodes.lock().insert(normalize(path), FakeNode::Dir);
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.nodes
            .lock()
            .insert(normalize(path), FakeNode::File(data.to_vec()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().get(&normalize(path)) {
            Some(FakeNode::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Make the next operation fail with `err`
    pub fn fail_next(&self, err: SftpError) {
        *self.fail_next.lock() = Some(err);
    }

    fn check_failure(&self) -> Result<(), SftpError> {
        match self.fail_next.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn read_bytes(&self, path: &str) -> Result<Vec<u8>, SftpError> {
        match self.nodes.lock().get(&normalize(path)) {
            Some(FakeNode::File(data)) => Ok(data.clone()),
            Some(FakeNode::Dir) => Err(SftpError::ProtocolError("Failure".to_string())),
            None => Err(SftpError::FileNotFound(path.to_string())),
        }
    }
}

#[async_trait]
impl RemoteFs for FakeFs {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, SftpError> {
        self.check_failure()?;
        let dir = normalize(path);
        let nodes = self.nodes.lock();

        if !dir.is_empty() && !matches!(nodes.get(&dir), Some(FakeNode::Dir)) {
            return Err(SftpError::FileNotFound(path.to_string()));
        }

        Ok(nodes
            .iter()
            .filter(|(key, _)| parent(key) == dir)
            .map(|(key, node)| RemoteDirEntry {
                name: key.rsplit('/').next().unwrap_or(key.as_str()).to_string(),
                attrs: attrs(node),
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<RemoteAttrs, SftpError> {
        self.check_failure()?;
        let key = normalize(path);
        if key.is_empty() {
            return Ok(attrs(&FakeNode::Dir));
        }
        self.nodes
            .lock()
            .get(&key)
            .map(attrs)
            .ok_or_else(|| SftpError::FileNotFound(path.to_string()))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError> {
        self.check_failure()?;
        self.read_bytes(path)
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<u64, SftpError> {
        self.check_failure()?;
        let data = tokio::fs::read(local).await?;
        let len = data.len() as u64;
        self.nodes
            .lock()
            .insert(normalize(remote), FakeNode::File(data));
        Ok(len)
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<u64, SftpError> {
        self.check_failure()?;
        let data = self.read_bytes(remote)?;
        tokio::fs::write(local, &data).await?;
        Ok(data.len() as u64)
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        self.check_failure()?;
        let mut nodes = self.nodes.lock();
        let key = normalize(path);
        if nodes.contains_key(&key) {
            return Err(SftpError::ProtocolError("Failure".to_string()));
        }
        nodes.insert(key, FakeNode::Dir);
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        self.check_failure()?;
        let mut nodes = self.nodes.lock();
        let key = normalize(path);
        if !matches!(nodes.get(&key), Some(FakeNode::Dir)) {
            return Err(SftpError::FileNotFound(path.to_string()));
        }
        if nodes.keys().any(|k| parent(k) == key) {
            return Err(SftpError::ProtocolError("Failure".to_string()));
        }
        nodes.remove(&key);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        self.check_failure()?;
        let mut nodes = self.nodes.lock();
        let key = normalize(path);
        match nodes.get(&key) {
            Some(FakeNode::File(_)) => {}
            Some(FakeNode::Dir) => return Err(SftpError::ProtocolError("Failure".to_string())),
            None => return Err(SftpError::FileNotFound(path.to_string())),
        }
        nodes.remove(&key);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.check_failure()?;
        let mut nodes = self.nodes.lock();
        let from_key = normalize(from);
        let to_key = normalize(to);

        let node = nodes
            .remove(&from_key)
            .ok_or_else(|| SftpError::FileNotFound(from.to_string()))?;
        let prefix = format!("{}/", from_key);
        let children: Vec<String> = nodes
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for child in children {
            if let Some(n) = nodes.remove(&child) {
                nodes.insert(format!("{}/{}", to_key, &child[prefix.len()..]), n);
            }
        }
        nodes.insert(to_key, node);
        Ok(())
    }

    async fn close(&self) {}
}
