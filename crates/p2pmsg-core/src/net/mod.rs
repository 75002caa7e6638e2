//! Connection management: TCP lifecycle and per-connection pipelines.
//!
//! One connection runs three cooperating tasks once established:
//!
//! - **reader**: decodes frames, feeds the record layer, publishes events
//! - **writer**: drains the bounded outbound queue (producers block when
//!   it is full) and owns all sealing, so wire order equals seal order
//! - **heartbeat**: sends keep-alives on outbound silence and tears the
//!   session down after three silent intervals inbound
//!
//! A single stop flag causes every task to exit at its next suspension
//! point; accepts poll it at 1-second granularity.

pub mod backoff;

use crate::config::Config;
use crate::error::{Error, NetworkError, ProtocolError, Result, UserError};
use crate::events::{DisconnectReason, Event, EventBus, MessageKind};
use crate::identity::Fingerprint;
use crate::protocol::{ByeReason, FileContent, Frame, FrameReader, MessageType};
use crate::session::{EstablishedSession, Handshake, HandshakeProgress, RecordChannel};
use crate::storage::{Direction, FileStore, MessageLog};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex, Notify};
use tracing::{debug, info, warn};

/// Outbound queue capacity; producers block when it is full.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Bookkeeping attached to an outbound message so the writer can log and
/// report it after transmission.
pub(crate) struct SentMeta {
    /// Text or file.
    pub kind: MessageKind,
    /// Body for the `MessageSent` event (text, or file name).
    pub event_body: String,
    /// Plaintext stored in the message log (text, or stored path).
    pub log_body: Vec<u8>,
    /// Logical file name, for files.
    pub file_name: Option<String>,
    /// File size, for files.
    pub file_size: Option<i64>,
}

/// Items flowing through the outbound queue to the writer.
pub(crate) enum Outbound {
    /// Seal and send a record frame.
    Record {
        /// Frame type to seal as.
        kind: MessageType,
        /// Plaintext to seal.
        plaintext: Vec<u8>,
        /// Present for user messages; drives logging and `MessageSent`.
        meta: Option<SentMeta>,
    },
    /// Answer a peer rekey request (plaintext is the opened REKEY_REQUEST
    /// body).
    RekeyAck {
        /// The peer's fresh ephemeral public key bytes.
        plaintext: Vec<u8>,
    },
    /// Send a plaintext BYE and stop writing.
    Bye {
        /// Reason byte for the peer.
        reason: ByeReason,
    },
}

/// State shared between the three per-connection tasks.
struct Shared {
    channel: StdMutex<RecordChannel>,
    rekey_done: Notify,
    last_inbound: StdMutex<Instant>,
    last_outbound: StdMutex<Instant>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Validate a dial address: an IP literal or a plausible hostname.
pub fn validate_address(addr: &str) -> Result<()> {
    if addr.parse::<std::net::IpAddr>().is_ok() {
        return Ok(());
    }
    let plausible_host = !addr.is_empty()
        && addr.len() <= 253
        && addr.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if plausible_host {
        Ok(())
    } else {
        Err(UserError::InvalidAddress(addr.into()).into())
    }
}

/// Validate a TCP port.
pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(UserError::InvalidPort("0".into()).into());
    }
    Ok(())
}

/// Bind the listening socket on `0.0.0.0:port`.
///
/// `SO_REUSEADDR` is always set; `SO_REUSEPORT` is best-effort where the
/// platform has it.
pub(crate) fn bind_listener(port: u16) -> Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let bind_failed = |e: std::io::Error| NetworkError::BindFailed(e.to_string());

    let socket =
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(bind_failed)?;
    socket.set_reuse_address(true).map_err(bind_failed)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    if let Err(e) = socket.set_reuse_port(true) {
        debug!(error = %e, "SO_REUSEPORT unavailable, continuing without");
    }

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into()).map_err(bind_failed)?;
    socket.listen(1).map_err(bind_failed)?;
    socket.set_nonblocking(true).map_err(bind_failed)?;

    let listener = TcpListener::from_std(socket.into()).map_err(bind_failed)?;
    info!(port, "listening");
    Ok(listener)
}

/// Accept one peer, polling the stop flag every second.
///
/// Returns `None` when stopped before anyone connected.
pub(crate) async fn accept_one(
    listener: &TcpListener,
    stop: &Arc<watch::Sender<bool>>,
) -> Result<Option<TcpStream>> {
    let stop_rx = stop.subscribe();
    loop {
        if *stop_rx.borrow() {
            return Ok(None);
        }
        match tokio::time::timeout(Duration::from_secs(1), listener.accept()).await {
            Err(_) => continue,
            Ok(Ok((stream, addr))) => {
                info!(%addr, "inbound connection accepted");
                let _ = stream.set_nodelay(true);
                return Ok(Some(stream));
            }
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}

/// Dial a peer with the configured timeout.
pub(crate) async fn connect(addr: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    validate_address(addr)?;
    validate_port(port)?;

    let stream = tokio::time::timeout(timeout, TcpStream::connect((addr, port)))
        .await
        .map_err(|_| Error::from(NetworkError::Timeout))??;
    let _ = stream.set_nodelay(true);
    info!(addr, port, "connected");
    Ok(stream)
}

/// Run a handshake to completion over `stream` within `deadline`.
///
/// `hello` is the initiator's opening frame; responders pass `None` and
/// wait. The message log provides pinned keys for the TOFU check.
///
/// Returns the session and the frame reader, which may already hold
/// record bytes that arrived in the same segment as the final handshake
/// frame; the session pipelines must take it over.
pub(crate) async fn drive_handshake(
    stream: &mut TcpStream,
    mut handshake: Handshake,
    hello: Option<Frame>,
    log: &Arc<TokioMutex<MessageLog>>,
    deadline: Duration,
) -> Result<(EstablishedSession, FrameReader)> {
    let exchange = async {
        if let Some(frame) = hello {
            stream.write_all(&frame.to_bytes()).await?;
            stream.flush().await?;
        }

        let mut frames = FrameReader::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::from(NetworkError::Io(
                    "connection closed during handshake".into(),
                )));
            }
            frames.push(&buf[..n]);

            while let Some(frame) = frames.try_read()? {
                let progress = {
                    let guard = log.lock().await;
                    handshake.on_frame(&frame, &*guard)?
                };
                match progress {
                    HandshakeProgress::Reply(reply) => {
                        stream.write_all(&reply.to_bytes()).await?;
                        stream.flush().await?;
                    }
                    HandshakeProgress::ReplyAndEstablished(reply) => {
                        stream.write_all(&reply.to_bytes()).await?;
                        stream.flush().await?;
                        return handshake.into_session().map(|session| (session, frames));
                    }
                    HandshakeProgress::Established => {
                        return handshake.into_session().map(|session| (session, frames));
                    }
                }
            }
        }
    };

    match tokio::time::timeout(deadline, exchange).await {
        Ok(result) => result,
        Err(_) => Err(NetworkError::Timeout.into()),
    }
}

#[derive(Clone)]
struct Ctx {
    peer: Fingerprint,
    max_file_bytes: u64,
    heartbeat: Duration,
    shared: Arc<Shared>,
    events: EventBus,
    log: Arc<TokioMutex<MessageLog>>,
    files: Arc<FileStore>,
    outbound_tx: mpsc::Sender<Outbound>,
    teardown: mpsc::Sender<DisconnectReason>,
    stop: Arc<watch::Sender<bool>>,
}

/// Run an established session until it ends; returns why it ended.
///
/// Owns the socket and the three pipeline tasks. On exit the socket is
/// shut down, remaining writer work is drained (BYE only), and session
/// bookkeeping is written.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_session(
    stream: TcpStream,
    established: EstablishedSession,
    leftover: FrameReader,
    cfg: &Config,
    events: EventBus,
    log: Arc<TokioMutex<MessageLog>>,
    files: Arc<FileStore>,
    outbound_rx: mpsc::Receiver<Outbound>,
    outbound_tx: mpsc::Sender<Outbound>,
    stop: Arc<watch::Sender<bool>>,
) -> DisconnectReason {
    let peer = established.peer_fingerprint;
    let session_row = {
        let guard = log.lock().await;
        guard.session_started(&peer).ok()
    };

    let shared = Arc::new(Shared {
        channel: StdMutex::new(established.channel),
        rekey_done: Notify::new(),
        last_inbound: StdMutex::new(Instant::now()),
        last_outbound: StdMutex::new(Instant::now()),
    });
    let (teardown_tx, mut teardown_rx) = mpsc::channel::<DisconnectReason>(4);
    let (read_half, write_half) = stream.into_split();

    // The external flag means "the user asked to stop"; the session flag
    // is what actually halts the pipeline tasks, including on internal
    // teardown. Conflating them would make every teardown look
    // user-initiated to the caller (and kill dialer reconnects).
    let (session_stop, _) = watch::channel(false);
    let session_stop = Arc::new(session_stop);
    let forwarder = {
        let session_stop = session_stop.clone();
        let mut external = stop.subscribe();
        tokio::spawn(async move {
            loop {
                if *external.borrow() {
                    let _ = session_stop.send_replace(true);
                    return;
                }
                if external.changed().await.is_err() {
                    return;
                }
            }
        })
    };

    let ctx = Ctx {
        peer,
        max_file_bytes: cfg.max_file_bytes,
        heartbeat: cfg.heartbeat_interval(),
        shared: shared.clone(),
        events,
        log: log.clone(),
        files,
        outbound_tx,
        teardown: teardown_tx,
        stop: session_stop.clone(),
    };

    let reader = tokio::spawn(reader_loop(read_half, leftover, ctx.clone()));
    let writer = tokio::spawn(writer_loop(write_half, outbound_rx, ctx.clone()));
    let heartbeat = tokio::spawn(heartbeat_loop(ctx.clone()));
    drop(ctx);

    let mut stop_rx = stop.subscribe();
    let reason = if *stop_rx.borrow() {
        DisconnectReason::LocalClose
    } else {
        tokio::select! {
            received = teardown_rx.recv() => received.unwrap_or(DisconnectReason::LocalClose),
            _ = stop_rx.changed() => DisconnectReason::LocalClose,
        }
    };

    // Wake every task; they exit at their next suspension point.
    let _ = session_stop.send_replace(true);
    let _ = tokio::join!(reader, writer, heartbeat);
    forwarder.abort();

    let exchanged = {
        let channel = lock(&shared.channel);
        (channel.total_sent() + channel.total_received()) as i64
    };
    if let Some(id) = session_row {
        let guard = log.lock().await;
        if let Err(e) = guard.session_ended(id, exchanged) {
            warn!(error = %e, "failed to record session end");
        }
    }

    debug!(?reason, "session ended");
    reason
}

async fn reader_loop(mut read_half: OwnedReadHalf, mut frames: FrameReader, ctx: Ctx) {
    let stop_rx = ctx.stop.subscribe();
    let mut buf = vec![0u8; 4096];

    loop {
        // Drain whatever is buffered (the handshake may have left record
        // bytes behind) before blocking on the socket again.
        loop {
            match frames.try_read() {
                Ok(None) => break,
                Ok(Some(frame)) => match handle_frame(&ctx, &frame).await {
                    Ok(None) => {}
                    Ok(Some(reason)) => {
                        let _ = ctx.teardown.try_send(reason);
                        return;
                    }
                    Err(e) => {
                        if let Some(reason) = classify_inbound_error(&ctx, &e) {
                            let _ = ctx.teardown.try_send(reason);
                            return;
                        }
                    }
                },
                Err(e) => {
                    warn!(error = %e, "malformed frame");
                    let _ = ctx.teardown.try_send(DisconnectReason::Protocol);
                    return;
                }
            }
        }

        if *stop_rx.borrow() {
            return;
        }
        let read = match tokio::time::timeout(Duration::from_secs(1), read_half.read(&mut buf)).await
        {
            Err(_) => continue,
            Ok(result) => result,
        };

        match read {
            Ok(0) => {
                debug!("peer closed the connection");
                let _ = ctx.teardown.try_send(DisconnectReason::Transport);
                return;
            }
            Err(e) => {
                if !*stop_rx.borrow() {
                    warn!(error = %e, "socket read failed");
                    let _ = ctx.teardown.try_send(DisconnectReason::Transport);
                }
                return;
            }
            Ok(n) => frames.push(&buf[..n]),
        }
    }
}

/// Map an inbound-processing error to a teardown reason, or `None` when
/// the session survives (replays are dropped, storage hiccups surface as
/// error events).
fn classify_inbound_error(ctx: &Ctx, e: &Error) -> Option<DisconnectReason> {
    match e {
        Error::Protocol(ProtocolError::Replay) => None,
        Error::Protocol(ProtocolError::AuthFail) => Some(DisconnectReason::AuthFail),
        Error::Protocol(_) => Some(DisconnectReason::Protocol),
        Error::Network(_) => Some(DisconnectReason::Transport),
        Error::Storage(_) | Error::User(_) => {
            ctx.events.emit(Event::Error {
                kind: e.kind().into(),
                detail: e.to_string(),
            });
            None
        }
        _ => Some(DisconnectReason::Protocol),
    }
}

async fn handle_frame(ctx: &Ctx, frame: &Frame) -> Result<Option<DisconnectReason>> {
    *lock(&ctx.shared.last_inbound) = Instant::now();

    match frame.frame_type {
        MessageType::Text => {
            let plaintext = {
                let mut channel = lock(&ctx.shared.channel);
                channel.open(frame)?
            };
            let body = String::from_utf8_lossy(&plaintext).into_owned();
            let timestamp = chrono::Utc::now().timestamp();

            {
                let guard = ctx.log.lock().await;
                if let Err(e) = guard.append_message(
                    &ctx.peer,
                    Direction::Received,
                    MessageKind::Text,
                    body.as_bytes(),
                    timestamp,
                    None,
                    None,
                ) {
                    warn!(error = %e, "failed to store received message");
                    ctx.events.emit(Event::Error {
                        kind: e.kind().into(),
                        detail: e.to_string(),
                    });
                }
            }

            ctx.events.emit(Event::MessageReceived {
                kind: MessageKind::Text,
                body,
                timestamp,
            });
            Ok(None)
        }
        MessageType::File => {
            let plaintext = {
                let mut channel = lock(&ctx.shared.channel);
                channel.open(frame)?
            };
            let content = FileContent::from_bytes(&plaintext)?;
            if content.data.len() as u64 > ctx.max_file_bytes {
                return Err(UserError::FileTooLarge(content.data.len() as u64).into());
            }

            let path = ctx.files.save(&ctx.peer, &content.name, &content.data)?;
            let stored = ctx.files.relative_path(&path);
            let timestamp = chrono::Utc::now().timestamp();

            {
                let guard = ctx.log.lock().await;
                if let Err(e) = guard.append_message(
                    &ctx.peer,
                    Direction::Received,
                    MessageKind::File,
                    stored.as_bytes(),
                    timestamp,
                    Some(&content.name),
                    Some(content.data.len() as i64),
                ) {
                    warn!(error = %e, "failed to store received file record");
                    ctx.events.emit(Event::Error {
                        kind: e.kind().into(),
                        detail: e.to_string(),
                    });
                }
            }

            info!(bytes = content.data.len(), "file received");
            ctx.events.emit(Event::MessageReceived {
                kind: MessageKind::File,
                body: content.name,
                timestamp,
            });
            Ok(None)
        }
        MessageType::Heartbeat => {
            let mut channel = lock(&ctx.shared.channel);
            let _ = channel.open(frame)?;
            Ok(None)
        }
        MessageType::RekeyRequest => {
            let plaintext = {
                let mut channel = lock(&ctx.shared.channel);
                channel.open(frame)?
            };
            ctx.outbound_tx
                .send(Outbound::RekeyAck {
                    plaintext: plaintext.to_vec(),
                })
                .await
                .map_err(|_| Error::from(NetworkError::Io("writer gone".into())))?;
            Ok(None)
        }
        MessageType::RekeyAck => {
            let mut channel = lock(&ctx.shared.channel);
            let plaintext = channel.open(frame)?;
            channel.handle_rekey_ack(&plaintext)?;
            drop(channel);
            ctx.shared.rekey_done.notify_one();
            Ok(None)
        }
        MessageType::Bye => {
            let reason = frame
                .payload
                .first()
                .map(|b| ByeReason::from_byte(*b))
                .unwrap_or(ByeReason::UserClose);
            debug!(?reason, "peer said goodbye");
            Ok(Some(DisconnectReason::PeerClose))
        }
        MessageType::Hello
        | MessageType::HelloAck
        | MessageType::ChallengeResponse
        | MessageType::Ready => Err(ProtocolError::UnexpectedState.into()),
    }
}

async fn writer_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Outbound>, ctx: Ctx) {
    let mut stop_rx = ctx.stop.subscribe();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
            item = rx.recv() => match item {
                None => break,
                Some(item) => {
                    if let Err(e) = process_outbound(&mut write_half, &ctx, item).await {
                        let reason = match e {
                            Error::Network(_) => DisconnectReason::Transport,
                            _ => DisconnectReason::Protocol,
                        };
                        warn!(error = %e, "outbound processing failed");
                        let _ = ctx.teardown.try_send(reason);
                        break;
                    }
                }
            }
        }
    }

    // Drain a pending goodbye, drop everything else, then close our half.
    while let Ok(item) = rx.try_recv() {
        if matches!(item, Outbound::Bye { .. }) {
            let _ = process_outbound(&mut write_half, &ctx, item).await;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn process_outbound(
    write_half: &mut OwnedWriteHalf,
    ctx: &Ctx,
    item: Outbound,
) -> Result<()> {
    match item {
        Outbound::Record {
            kind,
            plaintext,
            meta,
        } => {
            send_record(write_half, ctx, kind, &plaintext).await?;

            if let Some(meta) = meta {
                let timestamp = chrono::Utc::now().timestamp();
                {
                    let guard = ctx.log.lock().await;
                    if let Err(e) = guard.append_message(
                        &ctx.peer,
                        Direction::Sent,
                        meta.kind,
                        &meta.log_body,
                        timestamp,
                        meta.file_name.as_deref(),
                        meta.file_size,
                    ) {
                        warn!(error = %e, "failed to store sent message");
                        ctx.events.emit(Event::Error {
                            kind: e.kind().into(),
                            detail: e.to_string(),
                        });
                    }
                }
                ctx.events.emit(Event::MessageSent {
                    kind: meta.kind,
                    body: meta.event_body,
                    timestamp,
                });
            }
            Ok(())
        }
        Outbound::RekeyAck { plaintext } => {
            let frame = {
                let mut channel = lock(&ctx.shared.channel);
                channel.handle_rekey_request(&plaintext)?
            };
            write_frame(write_half, ctx, &frame).await
        }
        Outbound::Bye { reason } => {
            let frame = Frame::new(MessageType::Bye, vec![reason.to_byte()])?;
            write_frame(write_half, ctx, &frame).await
        }
    }
}

/// Seal and transmit one record, pausing while a rekey we requested is in
/// flight (nothing may be sealed under the old key after our
/// REKEY_REQUEST).
async fn send_record(
    write_half: &mut OwnedWriteHalf,
    ctx: &Ctx,
    kind: MessageType,
    plaintext: &[u8],
) -> Result<()> {
    loop {
        let sealed = {
            let mut channel = lock(&ctx.shared.channel);
            if channel.awaiting_rekey_ack() {
                None
            } else {
                let frame = channel.seal(kind, plaintext)?;
                let rekey = if channel.should_request_rekey() {
                    Some(channel.begin_rekey()?)
                } else {
                    None
                };
                Some((frame, rekey))
            }
        };

        match sealed {
            None => {
                // Wait for the rekey ACK, but stay cancellable.
                let mut stop_rx = ctx.stop.subscribe();
                if *stop_rx.borrow() {
                    return Err(NetworkError::Io("session stopping".into()).into());
                }
                tokio::select! {
                    _ = ctx.shared.rekey_done.notified() => {}
                    _ = stop_rx.changed() => {
                        return Err(NetworkError::Io("session stopping".into()).into());
                    }
                }
            }
            Some((frame, rekey)) => {
                write_frame(write_half, ctx, &frame).await?;
                if let Some(request) = rekey {
                    write_frame(write_half, ctx, &request).await?;
                }
                return Ok(());
            }
        }
    }
}

async fn write_frame(write_half: &mut OwnedWriteHalf, ctx: &Ctx, frame: &Frame) -> Result<()> {
    write_half.write_all(&frame.to_bytes()).await?;
    write_half.flush().await?;
    *lock(&ctx.shared.last_outbound) = Instant::now();
    Ok(())
}

async fn heartbeat_loop(ctx: Ctx) {
    let mut stop_rx = ctx.stop.subscribe();
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return;
                }
            }
            _ = tick.tick() => {
                let idle_inbound = lock(&ctx.shared.last_inbound).elapsed();
                let idle_outbound = lock(&ctx.shared.last_outbound).elapsed();

                if idle_inbound >= ctx.heartbeat * 3 {
                    warn!("no inbound traffic for three heartbeat intervals");
                    let _ = ctx.teardown.try_send(DisconnectReason::PeerUnreachable);
                    return;
                }
                if idle_outbound >= ctx.heartbeat {
                    // Best-effort: a full queue means traffic is flowing.
                    let _ = ctx.outbound_tx.try_send(Outbound::Record {
                        kind: MessageType::Heartbeat,
                        plaintext: Vec::new(),
                        meta: None,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validation() {
        assert!(validate_address("127.0.0.1").is_ok());
        assert!(validate_address("::1").is_ok());
        assert!(validate_address("peer.example.org").is_ok());
        assert!(validate_address("host-name").is_ok());

        assert!(validate_address("").is_err());
        assert!(validate_address("bad host").is_err());
        assert!(validate_address("under_score").is_err());
        assert!(validate_address("trailing.").is_err());
    }

    #[test]
    fn port_validation() {
        assert!(validate_port(1).is_ok());
        assert!(validate_port(65535).is_ok());
        assert!(validate_port(0).is_err());
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_refused() {
        // Bind then drop to find a port that is almost certainly closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        match connect("127.0.0.1", port, Duration::from_secs(2)).await {
            Err(Error::Network(NetworkError::ConnectRefused)) => {}
            Err(Error::Network(NetworkError::Timeout)) => {} // some sandboxes drop instead
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn accept_honours_stop_within_a_second() {
        let listener = bind_listener(0).expect("bind");
        let (stop_tx, _) = watch::channel(false);
        let stop = Arc::new(stop_tx);

        let stop_clone = stop.clone();
        let waiter = tokio::spawn(async move {
            let started = Instant::now();
            let accepted = accept_one(&listener, &stop_clone).await.expect("accept");
            (accepted.is_none(), started.elapsed())
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = stop.send_replace(true);

        let (stopped, elapsed) = waiter.await.expect("join");
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(3));
    }
}
