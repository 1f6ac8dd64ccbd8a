//! Remote terminal proxy
//!
//! One [`TerminalConnection`] per browser transport:
//!
//! ```text
//! UNAUTHENTICATED --authenticate--> AUTHENTICATED --connect--> SHELL-OPEN
//!        |                              ^                          |
//!        +--bad token--> CLOSED         +---remote close/error-----+
//! ```
//!
//! The transport adapter feeds [`ClientEvent`]s in and drains
//! [`ServerEvent`]s out. Dropping the event sender is the transport
//! disconnect signal.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::events::{AuthResult, ClientEvent, ServerEvent, Utf8Decoder};
use crate::auth::TokenVerifier;
use crate::credentials::QuickCredentials;
use crate::dialer::Dialer;
use crate::error::ProxyError;
use crate::registry::{Lease, RegistryConfig, RegistryStats, SessionKey, SessionRegistry};
use crate::remote::{PtySize, RemoteConnection, ShellChannel, ShellCommand, ShellOutput};
use crate::{OwnerId, ServerId};

/// What a connect request points at
#[derive(Debug, Clone)]
pub enum ShellTarget {
    Server(ServerId),
    Quick(QuickCredentials),
}

/// Shared state behind every terminal transport
pub struct TerminalProxy {
    registry: SessionRegistry<dyn RemoteConnection>,
    dialer: Dialer,
    verifier: Arc<dyn TokenVerifier>,
}

impl TerminalProxy {
    pub fn new(dialer: Dialer, verifier: Arc<dyn TokenVerifier>, registry: RegistryConfig) -> Self {
        Self {
            registry: SessionRegistry::new(registry),
            dialer,
            verifier,
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        self.registry.stats().await
    }

    /// Close every registered connection (shutdown)
    pub async fn shutdown(&self) {
        self.registry.release_all().await;
    }

    /// Drive one transport until either side ends it
    pub async fn serve(
        &self,
        peer: &str,
        events: mpsc::Receiver<ClientEvent>,
        out: mpsc::Sender<ServerEvent>,
    ) {
        info!("Terminal transport {} opened", peer);
        let connection = TerminalConnection {
            proxy: self,
            peer,
            events,
            out,
            owner: None,
            shell: None,
            deferred: VecDeque::new(),
        };
        connection.run().await;
        info!("Terminal transport {} closed", peer);
    }

    /// Connect (or reuse) and open an interactive shell
    async fn open_shell(
        &self,
        owner: OwnerId,
        target: ShellTarget,
    ) -> Result<ActiveShell, ProxyError> {
        match target {
            ShellTarget::Server(server) => {
                let key = SessionKey::bound(owner, server);
                let entry = self
                    .registry
                    .acquire(&key, || self.dialer.dial_server(owner, server))
                    .await?;

                let lease = entry.lease();
                match lease.handle().open_shell(PtySize::default()).await {
                    Ok(channel) => Ok(ActiveShell::new(channel, ShellBinding::Bound(lease))),
                    Err(e) => {
                        drop(lease);
                        if !entry.handle().is_connected() {
                            self.registry.release_entry(&entry).await;
                        }
                        Err(e.into())
                    }
                }
            }
            ShellTarget::Quick(credentials) => {
                // Single-use: owned by this transport, never registered
                let connection = self.dialer.dial_quick(credentials).await?;
                match connection.open_shell(PtySize::default()).await {
                    Ok(channel) => Ok(ActiveShell::new(channel, ShellBinding::AdHoc(connection))),
                    Err(e) => {
                        connection.close().await;
                        Err(e.into())
                    }
                }
            }
        }
    }
}

/// Who keeps the remote connection alive for a shell
enum ShellBinding {
    /// Registry entry; the lease defers idle eviction
    Bound(Lease<dyn RemoteConnection>),
    /// Closed together with the shell
    AdHoc(Arc<dyn RemoteConnection>),
}

struct ActiveShell {
    input: mpsc::Sender<ShellCommand>,
    output: mpsc::Receiver<ShellOutput>,
    binding: ShellBinding,
    decoder: Utf8Decoder,
}

impl ActiveShell {
    fn new(channel: ShellChannel, binding: ShellBinding) -> Self {
        Self {
            input: channel.input,
            output: channel.output,
            binding,
            decoder: Utf8Decoder::new(),
        }
    }

    fn touch(&self) {
        if let ShellBinding::Bound(lease) = &self.binding {
            lease.entry().touch();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

enum Input {
    Client(ClientEvent),
    Shell(Option<ShellOutput>),
    TransportClosed,
}

struct TerminalConnection<'a> {
    proxy: &'a TerminalProxy,
    peer: &'a str,
    events: mpsc::Receiver<ClientEvent>,
    out: mpsc::Sender<ServerEvent>,
    owner: Option<OwnerId>,
    shell: Option<ActiveShell>,
    /// Events that arrived while a connect was in flight
    deferred: VecDeque<ClientEvent>,
}

async fn next_output(shell: &mut Option<ActiveShell>) -> Option<ShellOutput> {
    match shell {
        Some(shell) => shell.output.recv().await,
        None => std::future::pending().await,
    }
}

impl TerminalConnection<'_> {
    async fn run(mut self) {
        loop {
            let input = match self.deferred.pop_front() {
                Some(event) => Input::Client(event),
                None => tokio::select! {
                    event = self.events.recv() => match event {
                        Some(event) => Input::Client(event),
                        None => Input::TransportClosed,
                    },
                    output = next_output(&mut self.shell) => Input::Shell(output),
                },
            };

            let flow = match input {
                Input::Client(event) => self.on_client_event(event).await,
                Input::Shell(output) => self.on_shell_output(output).await,
                Input::TransportClosed => {
                    debug!("Transport {} disconnected", self.peer);
                    Flow::Stop
                }
            };

            if flow == Flow::Stop {
                break;
            }
        }

        self.close_shell().await;
    }

    async fn emit(&self, event: ServerEvent) -> Flow {
        match self.out.send(event).await {
            Ok(()) => Flow::Continue,
            Err(_) => {
                debug!("Transport {} writer gone", self.peer);
                Flow::Stop
            }
        }
    }

    async fn on_client_event(&mut self, event: ClientEvent) -> Flow {
        debug!("Transport {} event {}", self.peer, event.name());

        match event {
            ClientEvent::Authenticate(token) => self.authenticate(&token).await,
            ClientEvent::ConnectSsh(server) => self.connect(ShellTarget::Server(server)).await,
            ClientEvent::QuickConnect(credentials) => {
                self.connect(ShellTarget::Quick(credentials)).await
            }
            ClientEvent::SshInput(data) => self.write_shell(data.into_bytes()).await,
            ClientEvent::SendCommand(command) => {
                let mut line = command.into_bytes();
                line.push(b'\n');
                self.write_shell(line).await
            }
            ClientEvent::Resize(size) => {
                if let Some(shell) = &self.shell {
                    shell.touch();
                    if shell.input.send(ShellCommand::Resize(size.into())).await.is_err() {
                        debug!("Shell pump for {} already gone", self.peer);
                    }
                }
                Flow::Continue
            }
            ClientEvent::DisconnectSsh => {
                if self.shell.is_some() {
                    info!("Transport {} closed its shell", self.peer);
                    self.close_shell().await;
                    return self.emit(ServerEvent::SshClosed).await;
                }
                Flow::Continue
            }
            ClientEvent::Ping => self.emit(ServerEvent::Pong).await,
        }
    }

    async fn authenticate(&mut self, token: &str) -> Flow {
        match self.proxy.verifier.verify(token) {
            Ok(owner) => {
                info!("Transport {} authenticated as owner {}", self.peer, owner);
                self.owner = Some(owner);
                self.emit(ServerEvent::Authenticated(AuthResult {
                    success: true,
                    error: None,
                }))
                .await
            }
            Err(e) => {
                warn!("Transport {} failed authentication: {:?}", self.peer, e);
                let _ = self
                    .emit(ServerEvent::Authenticated(AuthResult {
                        success: false,
                        error: Some("Authentication failed".to_string()),
                    }))
                    .await;
                Flow::Stop
            }
        }
    }

    async fn connect(&mut self, target: ShellTarget) -> Flow {
        let Some(owner) = self.owner else {
            return self.emit(ServerEvent::error("Not authenticated")).await;
        };

        if self.shell.is_some() {
            debug!("Transport {} replacing its open shell", self.peer);
            self.close_shell().await;
        }

        let proxy = self.proxy;
        let attempt = proxy.open_shell(owner, target);
        tokio::pin!(attempt);

        // Keep watching the transport so a disconnect cancels the attempt
        let result = loop {
            tokio::select! {
                result = &mut attempt => break Some(result),
                event = self.events.recv() => match event {
                    Some(event) => self.deferred.push_back(event),
                    None => break None,
                },
            }
        };

        match result {
            None => {
                info!("Transport {} closed during connect, attempt cancelled", self.peer);
                Flow::Stop
            }
            Some(Ok(shell)) => {
                info!("Transport {} shell open", self.peer);
                self.shell = Some(shell);
                self.emit(ServerEvent::SshConnected).await
            }
            Some(Err(e)) => {
                warn!(
                    "Transport {} connect failed ({}): {}",
                    self.peer,
                    e.kind(),
                    e
                );
                self.emit(ServerEvent::error(e.user_message())).await
            }
        }
    }

    async fn write_shell(&mut self, data: Vec<u8>) -> Flow {
        match &self.shell {
            Some(shell) => {
                shell.touch();
                if shell.input.send(ShellCommand::Data(data)).await.is_err() {
                    debug!("Shell pump for {} already gone", self.peer);
                }
            }
            None => debug!("Transport {} sent input without a shell", self.peer),
        }
        Flow::Continue
    }

    async fn on_shell_output(&mut self, output: Option<ShellOutput>) -> Flow {
        match output {
            Some(ShellOutput::Data(bytes)) => {
                let Some(shell) = self.shell.as_mut() else {
                    return Flow::Continue;
                };
                let text = shell.decoder.decode(&bytes);
                if text.is_empty() {
                    return Flow::Continue;
                }
                self.emit(ServerEvent::SshData(text)).await
            }
            Some(ShellOutput::Closed) | None => {
                info!("Remote shell for {} closed", self.peer);
                if self.flush_decoder().await == Flow::Stop {
                    return Flow::Stop;
                }
                self.close_shell().await;
                self.emit(ServerEvent::SshClosed).await
            }
            Some(ShellOutput::Error(message)) => {
                warn!("Remote connection for {} failed: {}", self.peer, message);
                if let Some(shell) = self.shell.take() {
                    self.discard_failed(shell).await;
                }
                if self.emit(ServerEvent::error(message)).await == Flow::Stop {
                    return Flow::Stop;
                }
                self.emit(ServerEvent::SshClosed).await
            }
        }
    }

    async fn flush_decoder(&mut self) -> Flow {
        let tail = match self.shell.as_mut() {
            Some(shell) => shell.decoder.finish(),
            None => String::new(),
        };
        if tail.is_empty() {
            Flow::Continue
        } else {
            self.emit(ServerEvent::SshData(tail)).await
        }
    }

    /// Stop bridging. A bound connection stays registered until idle eviction.
    async fn close_shell(&mut self) {
        let Some(shell) = self.shell.take() else {
            return;
        };
        let _ = shell.input.send(ShellCommand::Close).await;

        match shell.binding {
            ShellBinding::Bound(lease) => drop(lease),
            ShellBinding::AdHoc(connection) => connection.close().await,
        }
    }

    /// The connection under the shell died; make sure nobody reuses it
    async fn discard_failed(&self, shell: ActiveShell) {
        match shell.binding {
            ShellBinding::Bound(lease) => {
                let entry = lease.entry().clone();
                drop(lease);
                self.proxy.registry.release_entry(&entry).await;
            }
            ShellBinding::AdHoc(connection) => connection.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::auth::AuthError;
    use crate::registry::ManagedHandle;
    use crate::remote::RemoteConnector;
    use crate::ssh::SshError;
    use crate::store::{AuthKind, MemoryServerStore, ServerRecord};
    use crate::terminal::events::ResizeRequest;
    use crate::testing::{FakeConnector, FakeShell};
    use crate::vault::CredentialVault;

    const MASTER: &str = "0123456789abcdef0123456789abcdef";
    const OWNER: OwnerId = 7;

    struct StaticVerifier;

    impl TokenVerifier for StaticVerifier {
        fn verify(&self, token: &str) -> Result<OwnerId, AuthError> {
            match token {
                "good" => Ok(OWNER),
                "other" => Ok(OWNER + 1),
                _ => Err(AuthError::Missing),
            }
        }
    }

    struct Client {
        tx: Option<mpsc::Sender<ClientEvent>>,
        rx: mpsc::Receiver<ServerEvent>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Client {
        async fn send(&self, event: ClientEvent) {
            self.tx.as_ref().unwrap().send(event).await.unwrap();
        }

        async fn recv(&mut self) -> Option<ServerEvent> {
            tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("no event within 5s")
        }

        async fn login(&mut self) {
            self.send(ClientEvent::Authenticate("good".into())).await;
            assert_eq!(
                self.recv().await,
                Some(ServerEvent::Authenticated(AuthResult {
                    success: true,
                    error: None
                }))
            );
        }

        async fn open(&mut self, server: ServerId) {
            self.send(ClientEvent::ConnectSsh(server)).await;
            assert_eq!(self.recv().await, Some(ServerEvent::SshConnected));
        }

        /// Simulate the browser going away
        fn hang_up(&mut self) {
            self.tx = None;
        }
    }

    fn proxy(connector: Arc<FakeConnector>) -> Arc<TerminalProxy> {
        let vault = Arc::new(CredentialVault::new(MASTER).unwrap());
        let store = MemoryServerStore::new();
        store.insert(ServerRecord {
            id: 1,
            owner_id: OWNER,
            name: "shell".into(),
            host: "shell.lan".into(),
            port: 22,
            username: "me".into(),
            auth_kind: AuthKind::Password,
            password_encrypted: vault.encrypt("pw", OWNER).unwrap(),
            private_key_encrypted: None,
        });
        let dialer = Dialer::new(
            connector as Arc<dyn RemoteConnector>,
            Arc::new(store),
            vault,
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        Arc::new(TerminalProxy::new(
            dialer,
            Arc::new(StaticVerifier),
            RegistryConfig::default(),
        ))
    }

    fn client(proxy: &Arc<TerminalProxy>) -> Client {
        let (tx, events) = mpsc::channel(64);
        let (out, rx) = mpsc::channel(64);
        let proxy = proxy.clone();
        let task = tokio::spawn(async move { proxy.serve("test", events, out).await });
        Client {
            tx: Some(tx),
            rx,
            task,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn only_shell(connector: &FakeConnector) -> FakeShell {
        let shells = connector.connections()[0].shells();
        assert_eq!(shells.len(), 1);
        shells[0].clone()
    }

    #[tokio::test]
    async fn test_bad_token_closes_transport() {
        let connector = Arc::new(FakeConnector::new());
        let mut c = client(&proxy(connector));

        c.send(ClientEvent::Authenticate("forged".into())).await;
        assert!(matches!(
            c.recv().await,
            Some(ServerEvent::Authenticated(AuthResult { success: false, .. }))
        ));
        assert_eq!(c.recv().await, None);
    }

    #[tokio::test]
    async fn test_connect_requires_authentication() {
        let connector = Arc::new(FakeConnector::new());
        let mut c = client(&proxy(connector.clone()));

        c.send(ClientEvent::ConnectSsh(1)).await;
        assert_eq!(c.recv().await, Some(ServerEvent::error("Not authenticated")));
        assert!(connector.connections().is_empty());
    }

    #[tokio::test]
    async fn test_bridges_input_and_output_in_order() {
        let connector = Arc::new(FakeConnector::new());
        let mut c = client(&proxy(connector.clone()));
        c.login().await;
        c.open(1).await;

        c.send(ClientEvent::SshInput("ls\n".into())).await;
        assert_eq!(c.recv().await, Some(ServerEvent::SshData("total 0\n".into())));

        let shell = only_shell(&connector);
        c.send(ClientEvent::SendCommand("pwd".into())).await;
        c.send(ClientEvent::Resize(ResizeRequest {
            rows: 50,
            cols: 200,
            height: 800,
            width: 1600,
        }))
        .await;
        eventually(|| shell.stdin() == "ls\npwd\n" && shell.resizes().len() == 2).await;
        assert_eq!(
            shell.resizes()[1],
            PtySize {
                cols: 200,
                rows: 50,
                pixel_width: 1600,
                pixel_height: 800
            }
        );

        shell.emit("caf\u{e9}".as_bytes()).await;
        assert_eq!(c.recv().await, Some(ServerEvent::SshData("café".into())));
    }

    #[tokio::test]
    async fn test_remote_close_emits_closed_and_keeps_connection() {
        let connector = Arc::new(FakeConnector::new());
        let proxy = proxy(connector.clone());
        let mut c = client(&proxy);
        c.login().await;
        c.open(1).await;

        only_shell(&connector).close_remote().await;
        assert_eq!(c.recv().await, Some(ServerEvent::SshClosed));

        // Still authenticated, and the connection is reused
        c.open(1).await;
        assert_eq!(connector.connections().len(), 1);
        assert_eq!(connector.connections()[0].close_count(), 0);
        assert_eq!(proxy.stats().await.bound_entries, 1);
    }

    #[tokio::test]
    async fn test_connection_loss_reports_and_releases() {
        let connector = Arc::new(FakeConnector::new());
        let proxy = proxy(connector.clone());
        let mut c = client(&proxy);
        c.login().await;
        c.open(1).await;

        connector.connections()[0].drop_connection();
        assert_eq!(c.recv().await, Some(ServerEvent::error("SSH connection lost")));
        assert_eq!(c.recv().await, Some(ServerEvent::SshClosed));
        assert_eq!(proxy.stats().await.total_entries, 0);

        // A fresh connect dials again
        c.open(1).await;
        assert_eq!(connector.connections().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_ssh_then_reconnect() {
        let connector = Arc::new(FakeConnector::new());
        let mut c = client(&proxy(connector.clone()));
        c.login().await;
        c.open(1).await;
        let first = only_shell(&connector);

        c.send(ClientEvent::DisconnectSsh).await;
        assert_eq!(c.recv().await, Some(ServerEvent::SshClosed));
        eventually(|| first.is_closed()).await;

        c.open(1).await;
        assert_eq!(connector.connections()[0].shells().len(), 2);
    }

    #[tokio::test]
    async fn test_hang_up_tears_down_shell() {
        let connector = Arc::new(FakeConnector::new());
        let proxy = proxy(connector.clone());
        let mut c = client(&proxy);
        c.login().await;
        c.open(1).await;
        let shell = only_shell(&connector);

        c.hang_up();
        c.task.await.unwrap();
        eventually(|| shell.is_closed()).await;

        // Bound connection stays for reuse until it idles out
        let conn = &connector.connections()[0];
        assert!(conn.is_connected());
        assert_eq!(proxy.stats().await.leased_entries, 0);
    }

    #[tokio::test]
    async fn test_quick_connect_is_closed_with_transport() {
        let connector = Arc::new(FakeConnector::new());
        let proxy = proxy(connector.clone());
        let mut c = client(&proxy);
        c.login().await;

        c.send(ClientEvent::QuickConnect(QuickCredentials {
            host: "adhoc.lan".into(),
            username: "root".into(),
            password: Some("pw".into()),
            ..Default::default()
        }))
        .await;
        assert_eq!(c.recv().await, Some(ServerEvent::SshConnected));
        assert_eq!(proxy.stats().await.total_entries, 0);

        c.hang_up();
        c.task.await.unwrap();
        assert_eq!(connector.connections()[0].close_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_errors_are_reported() {
        let connector = Arc::new(FakeConnector::new());
        let mut c = client(&proxy(connector.clone()));
        c.login().await;

        connector.fail_with(SshError::AuthenticationFailed("denied".into()));
        c.send(ClientEvent::ConnectSsh(1)).await;
        assert_eq!(
            c.recv().await,
            Some(ServerEvent::error("Authentication failed: denied"))
        );

        c.send(ClientEvent::ConnectSsh(42)).await;
        assert_eq!(c.recv().await, Some(ServerEvent::error("Server not found")));

        c.send(ClientEvent::Ping).await;
        assert_eq!(c.recv().await, Some(ServerEvent::Pong));
    }

    #[tokio::test]
    async fn test_other_owner_cannot_use_server() {
        let connector = Arc::new(FakeConnector::new());
        let mut c = client(&proxy(connector.clone()));
        c.send(ClientEvent::Authenticate("other".into())).await;
        c.recv().await;

        c.send(ClientEvent::ConnectSsh(1)).await;
        assert_eq!(c.recv().await, Some(ServerEvent::error("Server not found")));
        assert!(connector.connections().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let connector = Arc::new(FakeConnector::new());
        connector.set_delay(Duration::from_secs(60));
        let mut c = client(&proxy(connector.clone()));
        c.login().await;

        c.send(ClientEvent::ConnectSsh(1)).await;
        assert_eq!(c.recv().await, Some(ServerEvent::error("Connection timeout")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_up_cancels_pending_connect() {
        let connector = Arc::new(FakeConnector::new());
        connector.set_delay(Duration::from_secs(15));
        let proxy = proxy(connector.clone());
        let mut c = client(&proxy);
        c.login().await;

        c.send(ClientEvent::ConnectSsh(1)).await;
        tokio::task::yield_now().await;
        c.hang_up();
        c.task.await.unwrap();

        assert!(connector.connections().is_empty());
        assert_eq!(proxy.stats().await.total_entries, 0);
        assert!(proxy.registry.is_empty());
    }

    #[tokio::test]
    async fn test_events_during_connect_are_kept() {
        let connector = Arc::new(FakeConnector::new());
        connector.set_delay(Duration::from_millis(50));
        let mut c = client(&proxy(connector.clone()));
        c.login().await;

        c.send(ClientEvent::ConnectSsh(1)).await;
        c.send(ClientEvent::SshInput("ls\n".into())).await;
        c.send(ClientEvent::Ping).await;

        assert_eq!(c.recv().await, Some(ServerEvent::SshConnected));
        // Pong and shell output are not ordered against each other
        let mut rest = vec![c.recv().await, c.recv().await];
        rest.sort_by_key(|event| matches!(event, Some(ServerEvent::Pong)));
        assert_eq!(
            rest,
            vec![Some(ServerEvent::SshData("total 0\n".into())), Some(ServerEvent::Pong)]
        );
        eventually(|| only_shell(&connector).stdin() == "ls\n").await;
    }
}
