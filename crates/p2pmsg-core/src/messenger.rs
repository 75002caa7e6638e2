//! The public command/query surface consumed by the UI and CLI.
//!
//! A [`Messenger`] owns one vault, one message log, and at most one
//! active session. Commands are plain async methods; everything the UI
//! needs to observe arrives through the event bus. The core never calls
//! back into its callers.

use crate::config::Config;
use crate::crypto::kdf::Argon2Params;
use crate::error::{Error, ResourceError, Result, UserError, VaultError};
use crate::events::{DisconnectReason, Event, EventBus, MessageKind};
use crate::identity::{Fingerprint, Identity};
use crate::net::{self, backoff::Backoff, Outbound, SentMeta, OUTBOUND_QUEUE_CAPACITY};
use crate::protocol::{ByeReason, FileContent, FrameReader, MessageType};
use crate::session::{EstablishedSession, Handshake, RecordConfig};
use crate::storage::{sanitize_filename, FileStore, LoggedMessage, MessageLog, PeerRecord};
use crate::vault::KeyVault;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex as TokioMutex};
use tracing::{info, warn};

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to the (single) active or pending session.
#[derive(Clone)]
struct SessionHandle {
    /// Sender into the current session's outbound queue; `None` until the
    /// handshake completes (and between reconnect attempts).
    outbound: Arc<StdMutex<Option<mpsc::Sender<Outbound>>>>,
    /// The session stop flag; setting it tears everything down within a
    /// second.
    stop: Arc<watch::Sender<bool>>,
    /// The authenticated peer, once established.
    peer: Arc<StdMutex<Option<Fingerprint>>>,
}

impl SessionHandle {
    fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            outbound: Arc::new(StdMutex::new(None)),
            stop: Arc::new(stop),
            peer: Arc::new(StdMutex::new(None)),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Outbound>> {
        lock(&self.outbound).clone().ok_or(Error::NoSession)
    }

    fn same_as(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.stop, &other.stop)
    }
}

struct Inner {
    identity: Option<Arc<Identity>>,
    log: Option<Arc<TokioMutex<MessageLog>>>,
    files: Option<Arc<FileStore>>,
    active: Option<SessionHandle>,
}

/// The messenger core.
#[derive(Clone)]
pub struct Messenger {
    config: Config,
    vault: Arc<KeyVault>,
    events: EventBus,
    inner: Arc<TokioMutex<Inner>>,
}

impl Messenger {
    /// Build a core over `config`. Nothing touches disk until a vault
    /// operation runs.
    pub fn new(config: Config) -> Self {
        let vault = KeyVault::new(config.vault_dir(), Argon2Params::from(&config));
        Self {
            config,
            vault: Arc::new(vault),
            events: EventBus::default(),
            inner: Arc::new(TokioMutex::new(Inner {
                identity: None,
                log: None,
                files: None,
                active: None,
            })),
        }
    }

    /// The configuration this core runs with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Subscribe to core events.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Create a fresh vault and open it.
    pub async fn initialize_vault(&self, passphrase: &str) -> Result<Fingerprint> {
        let identity = self.vault.initialize(passphrase)?;
        self.finish_open(identity).await
    }

    /// Open the existing vault.
    pub async fn open_vault(&self, passphrase: &str) -> Result<Fingerprint> {
        let identity = self.vault.open(passphrase)?;
        self.finish_open(identity).await
    }

    /// Re-seal the vault under a new passphrase.
    pub fn rotate_passphrase(&self, old: &str, new: &str) -> Result<()> {
        self.vault.rotate_passphrase(old, new)
    }

    async fn finish_open(&self, identity: Identity) -> Result<Fingerprint> {
        let fingerprint = identity.fingerprint();
        let log_key = identity.derive_log_key()?;
        let log = MessageLog::open(&self.config.db_path(), log_key)?;
        log.record_local_keys(&self.vault.public_keys()?)?;

        let mut inner = self.inner.lock().await;
        inner.identity = Some(Arc::new(identity));
        inner.log = Some(Arc::new(TokioMutex::new(log)));
        inner.files = Some(Arc::new(FileStore::new(self.config.files_dir())));
        info!("vault open, core ready");
        Ok(fingerprint)
    }

    /// Our own fingerprint. Requires an open vault.
    pub async fn local_fingerprint(&self) -> Result<Fingerprint> {
        let inner = self.inner.lock().await;
        inner
            .identity
            .as_ref()
            .map(|identity| identity.fingerprint())
            .ok_or_else(|| VaultError::NotFound.into())
    }

    /// The currently connected peer, if a session is established.
    pub async fn current_peer(&self) -> Option<Fingerprint> {
        let inner = self.inner.lock().await;
        inner
            .active
            .as_ref()
            .and_then(|handle| *lock(&handle.peer))
    }

    /// Listen on `port` (0 picks an ephemeral port) and accept one peer.
    ///
    /// Returns the bound port once the socket is listening; the handshake
    /// and session run in the background and report through the event
    /// bus.
    pub async fn listen(&self, port: u16) -> Result<u16> {
        let (identity, log, files) = self.opened().await?;

        let handle = SessionHandle::new();
        {
            let mut inner = self.inner.lock().await;
            if inner.active.is_some() {
                return Err(ResourceError::Busy.into());
            }
            inner.active = Some(handle.clone());
        }

        let listener = match net::bind_listener(port) {
            Ok(listener) => listener,
            Err(e) => {
                self.clear_active(&handle).await;
                return Err(e);
            }
        };
        let bound_port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(port);

        let core = self.clone();
        tokio::spawn(async move {
            core.run_listener(listener, identity, log, files, handle).await;
        });
        Ok(bound_port)
    }

    /// Dial `addr:port` and complete the handshake before returning.
    pub async fn dial(&self, addr: &str, port: u16) -> Result<()> {
        self.dial_peer(addr, port, None).await
    }

    /// Dial a known contact: the responder must present the identity with
    /// this fingerprint or the handshake fails with `IdentityMismatch`.
    pub async fn dial_peer(
        &self,
        addr: &str,
        port: u16,
        expected: Option<Fingerprint>,
    ) -> Result<()> {
        net::validate_address(addr)?;
        net::validate_port(port)?;
        let (identity, log, files) = self.opened().await?;

        let handle = SessionHandle::new();
        {
            let mut inner = self.inner.lock().await;
            if inner.active.is_some() {
                return Err(ResourceError::Busy.into());
            }
            inner.active = Some(handle.clone());
        }

        self.events.emit(Event::PeerConnecting {
            addr: format!("{addr}:{port}"),
        });

        let first = connect_and_handshake(&self.config, &identity, &log, addr, port, expected).await;
        match first {
            Err(e) => {
                self.clear_active(&handle).await;
                Err(e)
            }
            Ok(connection) => {
                let core = self.clone();
                let addr = addr.to_string();
                tokio::spawn(async move {
                    core.run_dialer(connection, identity, log, files, handle, addr, port)
                        .await;
                });
                Ok(())
            }
        }
    }

    /// Queue a text message. Blocks while the outbound queue is full.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let sender = self.active_sender().await?;
        sender
            .send(Outbound::Record {
                kind: MessageType::Text,
                plaintext: text.as_bytes().to_vec(),
                meta: Some(SentMeta {
                    kind: MessageKind::Text,
                    event_body: text.to_string(),
                    log_body: text.as_bytes().to_vec(),
                    file_name: None,
                    file_size: None,
                }),
            })
            .await
            .map_err(|_| Error::NoSession)
    }

    /// Queue a file transfer. The file must fit the configured cap and
    /// carry a clean name.
    pub async fn send_file(&self, path: &Path) -> Result<()> {
        let sender = self.active_sender().await?;

        let metadata = tokio::fs::metadata(path).await?;
        if metadata.len() > self.config.max_file_bytes {
            return Err(UserError::FileTooLarge(metadata.len()).into());
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| UserError::InvalidFilename(path.display().to_string()))?;
        let name = sanitize_filename(name)?;

        let data = tokio::fs::read(path).await?;
        let content = FileContent {
            name: name.clone(),
            size: data.len() as u64,
            data,
        };
        let size = content.size as i64;

        sender
            .send(Outbound::Record {
                kind: MessageType::File,
                plaintext: content.to_bytes()?,
                meta: Some(SentMeta {
                    kind: MessageKind::File,
                    event_body: name.clone(),
                    log_body: name.clone().into_bytes(),
                    file_name: Some(name),
                    file_size: Some(size),
                }),
            })
            .await
            .map_err(|_| Error::NoSession)
    }

    /// Mark a peer verified after out-of-band fingerprint comparison.
    pub async fn verify_peer(&self, fingerprint: &Fingerprint) -> Result<()> {
        let (_, log, _) = self.opened().await?;
        let guard = log.lock().await;
        guard.verify_peer(fingerprint)
    }

    /// Load a pinned peer record.
    pub async fn peer(&self, fingerprint: &Fingerprint) -> Result<Option<PeerRecord>> {
        let (_, log, _) = self.opened().await?;
        let guard = log.lock().await;
        guard.peer(fingerprint)
    }

    /// Page through stored conversation history.
    pub async fn conversation_history(
        &self,
        fingerprint: &Fingerprint,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<LoggedMessage>> {
        let (_, log, _) = self.opened().await?;
        let guard = log.lock().await;
        guard.history(fingerprint, limit, offset)
    }

    /// Close the active session (or stop listening). No-op when idle.
    pub async fn disconnect(&self) -> Result<()> {
        let handle = {
            let inner = self.inner.lock().await;
            inner.active.clone()
        };
        let Some(handle) = handle else {
            return Ok(());
        };

        // Best-effort goodbye, then stop everything.
        if let Ok(sender) = handle.sender() {
            let _ = sender
                .send(Outbound::Bye {
                    reason: ByeReason::UserClose,
                })
                .await;
        }
        let _ = handle.stop.send_replace(true);
        Ok(())
    }

    async fn opened(
        &self,
    ) -> Result<(Arc<Identity>, Arc<TokioMutex<MessageLog>>, Arc<FileStore>)> {
        let inner = self.inner.lock().await;
        match (&inner.identity, &inner.log, &inner.files) {
            (Some(identity), Some(log), Some(files)) => {
                Ok((identity.clone(), log.clone(), files.clone()))
            }
            _ => Err(VaultError::NotFound.into()),
        }
    }

    async fn active_sender(&self) -> Result<mpsc::Sender<Outbound>> {
        let inner = self.inner.lock().await;
        inner
            .active
            .as_ref()
            .ok_or(Error::NoSession)?
            .sender()
    }

    async fn clear_active(&self, handle: &SessionHandle) {
        let mut inner = self.inner.lock().await;
        if inner
            .active
            .as_ref()
            .is_some_and(|active| active.same_as(handle))
        {
            inner.active = None;
        }
    }

    async fn run_listener(
        &self,
        listener: tokio::net::TcpListener,
        identity: Arc<Identity>,
        log: Arc<TokioMutex<MessageLog>>,
        files: Arc<FileStore>,
        handle: SessionHandle,
    ) {
        match net::accept_one(&listener, &handle.stop).await {
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "accept failed");
                self.emit_error(&e);
            }
            Ok(Some(mut stream)) => {
                drop(listener); // one peer per listen
                let handshake =
                    Handshake::respond(identity.clone(), RecordConfig::from(&self.config));
                match net::drive_handshake(
                    &mut stream,
                    handshake,
                    None,
                    &log,
                    self.config.handshake_timeout(),
                )
                .await
                {
                    Err(e) => {
                        warn!(error = %e, "inbound handshake failed");
                        self.emit_error(&e);
                    }
                    Ok((established, leftover)) => {
                        let reason = self
                            .run_established(&log, &files, &handle, stream, established, leftover)
                            .await;
                        self.events.emit(Event::PeerDisconnected { reason });
                    }
                }
            }
        }
        self.clear_active(&handle).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_dialer(
        &self,
        connection: NewConnection,
        identity: Arc<Identity>,
        log: Arc<TokioMutex<MessageLog>>,
        files: Arc<FileStore>,
        handle: SessionHandle,
        addr: String,
        port: u16,
    ) {
        let mut backoff = Backoff::new(self.config.reconnect_max_attempts);
        let mut current = Some(connection);

        while let Some((stream, established, leftover)) = current.take() {
            let peer = established.peer_fingerprint;
            let reason = self
                .run_established(&log, &files, &handle, stream, established, leftover)
                .await;
            self.events.emit(Event::PeerDisconnected { reason });

            if reason != DisconnectReason::Transport || *handle.stop.borrow() {
                break;
            }

            // Transport dropped mid-session: reconnect to the same peer
            // with exponential backoff.
            while let Some(delay) = backoff.next_delay() {
                tokio::time::sleep(delay).await;
                if *handle.stop.borrow() {
                    break;
                }
                self.events.emit(Event::PeerConnecting {
                    addr: format!("{addr}:{port}"),
                });
                match connect_and_handshake(
                    &self.config,
                    &identity,
                    &log,
                    &addr,
                    port,
                    Some(peer),
                )
                .await
                {
                    Ok(pair) => {
                        info!(attempt = backoff.attempts(), "reconnected");
                        current = Some(pair);
                        break;
                    }
                    Err(e) => {
                        warn!(attempt = backoff.attempts(), error = %e, "reconnect failed");
                        self.emit_error(&e);
                        if e.is_terminal() {
                            break;
                        }
                    }
                }
            }
            if current.is_none() {
                self.events.emit(Event::Error {
                    kind: "network".into(),
                    detail: "reconnect attempts exhausted".into(),
                });
            }
        }

        self.clear_active(&handle).await;
    }

    /// Register a freshly established session and run it to completion.
    async fn run_established(
        &self,
        log: &Arc<TokioMutex<MessageLog>>,
        files: &Arc<FileStore>,
        handle: &SessionHandle,
        stream: TcpStream,
        established: EstablishedSession,
        leftover: FrameReader,
    ) -> DisconnectReason {
        let peer = established.peer_fingerprint;
        let first_contact = established.first_contact;

        {
            let guard = log.lock().await;
            if let Err(e) = guard
                .record_peer(&peer, &established.peer_identity_key)
                .and_then(|_| guard.ensure_conversation(&peer))
            {
                warn!(error = %e, "failed to persist peer record");
                self.emit_error(&e);
            }
        }

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        *lock(&handle.peer) = Some(peer);
        *lock(&handle.outbound) = Some(tx.clone());

        self.events.emit(Event::HandshakeComplete {
            peer_fingerprint: peer,
            first_contact,
        });

        let reason = net::run_session(
            stream,
            established,
            leftover,
            &self.config,
            self.events.clone(),
            log.clone(),
            files.clone(),
            rx,
            tx,
            handle.stop.clone(),
        )
        .await;

        *lock(&handle.outbound) = None;
        *lock(&handle.peer) = None;
        reason
    }

    fn emit_error(&self, e: &Error) {
        self.events.emit(Event::Error {
            kind: e.kind().into(),
            detail: e.to_string(),
        });
    }
}

/// A connected, handshaken socket plus any record bytes that arrived
/// with the final handshake frame.
type NewConnection = (TcpStream, EstablishedSession, FrameReader);

async fn connect_and_handshake(
    cfg: &Config,
    identity: &Arc<Identity>,
    log: &Arc<TokioMutex<MessageLog>>,
    addr: &str,
    port: u16,
    expected: Option<Fingerprint>,
) -> Result<NewConnection> {
    let mut stream = net::connect(addr, port, cfg.connect_timeout()).await?;
    let (handshake, hello) =
        Handshake::initiate(identity.clone(), RecordConfig::from(cfg), expected)?;
    let (established, leftover) =
        net::drive_handshake(&mut stream, handshake, Some(hello), log, cfg.handshake_timeout())
            .await?;
    Ok((stream, established, leftover))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            // Cheap KDF so tests do not burn 100 MiB per derivation.
            argon2_time_cost: 1,
            argon2_memory_kib: 8,
            argon2_parallelism: 1,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn commands_require_open_vault() {
        let tmp = tempfile::tempdir().unwrap();
        let core = Messenger::new(test_config(tmp.path()));

        assert!(core.local_fingerprint().await.is_err());
        assert!(core.listen(5555).await.is_err());
        assert!(core.dial("127.0.0.1", 5555).await.is_err());
        assert!(core.send_text("hi").await.is_err());
    }

    #[tokio::test]
    async fn initialize_then_reopen() {
        let tmp = tempfile::tempdir().unwrap();

        let first = Messenger::new(test_config(tmp.path()));
        let created = first.initialize_vault("pw").await.unwrap();

        let second = Messenger::new(test_config(tmp.path()));
        let reopened = second.open_vault("pw").await.unwrap();
        assert_eq!(created, reopened);

        match second.open_vault("nope").await {
            Err(Error::Vault(VaultError::BadPassphrase)) => {}
            other => panic!("expected BadPassphrase, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_without_session_is_no_session() {
        let tmp = tempfile::tempdir().unwrap();
        let core = Messenger::new(test_config(tmp.path()));
        core.initialize_vault("pw").await.unwrap();

        match core.send_text("hello?").await {
            Err(Error::NoSession) => {}
            other => panic!("expected NoSession, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_listen_is_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let core = Messenger::new(test_config(tmp.path()));
        core.initialize_vault("pw").await.unwrap();

        core.listen(0).await.unwrap();
        match core.listen(0).await {
            Err(Error::Resource(ResourceError::Busy)) => {}
            other => panic!("expected Busy, got {other:?}"),
        }
        core.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_when_idle_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let core = Messenger::new(test_config(tmp.path()));
        core.disconnect().await.unwrap();
    }
}
