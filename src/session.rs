//! Per-client session engine: one WebSocket, one child process on a PTY.
//!
//! Lifecycle: the three handshake frames go out first (window title,
//! reconnect hint, preferences), then the session waits for the client's
//! JSON control message (which carries the auth token when a credential
//! is configured), spawns the child, and relays bytes both ways until
//! either side goes away. Teardown signals the child, escalates to
//! SIGKILL if it lingers, reaps it, and releases the registry slot.
//!
//! The PTY side runs on two blocking threads per session. The reader
//! hands chunks to the WebSocket task through a channel of capacity 1, so
//! at most one chunk is ever in flight: when the browser is slow the
//! reader stalls on the full channel instead of buffering, and output
//! reaches the client in exactly the order it was read.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ServerConfig, Signal};
use crate::protocol::{self, ClientMessage, ServerMessage, WindowSize};
use crate::pty::{self, PtyError, PtyProcess};
use crate::registry::ClientGuard;

/// Chunk size for PTY master reads.
const PTY_READ_BUF: usize = 4096;

/// Queue depth for keystrokes headed to the PTY writer thread.
const INPUT_QUEUE: usize = 64;

/// How long the configured signal gets to take effect before teardown
/// escalates to SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Geometry used when the client never sent a resize before the spawn.
const DEFAULT_SIZE: WindowSize = WindowSize {
    columns: 80,
    rows: 24,
};

/// Why a session ended; determines the WebSocket close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The child exited and the PTY reached end of stream.
    Normal,
    /// Authentication failed.
    PolicyViolation,
    /// Spawn failure, PTY read/write error, or a broken handshake write.
    Unexpected,
    /// The client closed or vanished; there is nobody to notify.
    PeerGone,
    /// The server is shutting down.
    ServerClosing,
}

impl CloseReason {
    fn close_frame(self) -> Option<CloseFrame<'static>> {
        let (code, reason) = match self {
            CloseReason::Normal => (close_code::NORMAL, ""),
            CloseReason::PolicyViolation => (close_code::POLICY, "authentication failed"),
            CloseReason::Unexpected => (close_code::ERROR, ""),
            CloseReason::PeerGone => return None,
            CloseReason::ServerClosing => (close_code::NORMAL, "server shutting down"),
        };
        Some(CloseFrame {
            code,
            reason: reason.into(),
        })
    }
}

/// Events flowing from the PTY reader thread to the session task.
#[derive(Debug)]
pub enum PtyEvent {
    Output(Bytes),
    Eof,
    ReadError(std::io::Error),
}

/// Counters published by the relay threads.
#[derive(Clone, Debug, Default)]
pub struct RelayMetrics {
    stalled_nanos: Arc<AtomicU64>,
}

impl RelayMetrics {
    /// Total time the PTY reader has spent blocked waiting for the
    /// WebSocket side to drain the previous chunk.
    pub fn stalled(&self) -> Duration {
        Duration::from_nanos(self.stalled_nanos.load(Ordering::Relaxed))
    }

    fn record_stall(&self, elapsed: Duration) {
        self.stalled_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }
}

/// A spawned child plus the threads relaying its PTY.
pub struct ChildHandle {
    proc: PtyProcess,
    input_tx: mpsc::Sender<Bytes>,
    metrics: RelayMetrics,
}

impl ChildHandle {
    /// Start the reader and writer threads for a freshly spawned PTY.
    /// Returns the handle and the event channel the session drains.
    pub fn start(proc: PtyProcess) -> Result<(Self, mpsc::Receiver<PtyEvent>), PtyError> {
        let reader = proc.take_reader()?;
        let writer = proc.take_writer()?;
        let metrics = RelayMetrics::default();

        let (event_tx, event_rx) = mpsc::channel::<PtyEvent>(1);
        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(INPUT_QUEUE);

        // Reader thread: PTY -> session, one chunk in flight.
        let stall = metrics.clone();
        tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut reader = reader;
            let mut buf = [0u8; PTY_READ_BUF];
            loop {
                let event = match reader.read(&mut buf) {
                    Ok(0) => PtyEvent::Eof,
                    Ok(n) => PtyEvent::Output(Bytes::copy_from_slice(&buf[..n])),
                    // EIO is how the master reports a hung-up slave: the
                    // child is gone, which is an orderly end of stream.
                    Err(e) if e.raw_os_error() == Some(libc::EIO) => PtyEvent::Eof,
                    Err(e) => PtyEvent::ReadError(e),
                };
                let terminal = !matches!(event, PtyEvent::Output(_));
                match event_tx.try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(event)) => {
                        let started = Instant::now();
                        if event_tx.blocking_send(event).is_err() {
                            break;
                        }
                        stall.record_stall(started.elapsed());
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
                if terminal {
                    break;
                }
            }
        });

        // Writer thread: session -> PTY. A write failure ends the thread,
        // closing the channel; the session sees the closed channel as a
        // fatal PTY write error.
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut writer = writer;
            while let Some(data) = input_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data) {
                    tracing::warn!(error = %e, "PTY write failed");
                    break;
                }
                let _ = writer.flush();
            }
        });

        Ok((
            Self {
                proc,
                input_tx,
                metrics,
            },
            event_rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.proc.pid()
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    pub fn resize(&self, size: WindowSize) -> Result<(), PtyError> {
        self.proc.resize(size.rows, size.columns)
    }

    /// Queue bytes for the PTY. Fails once the writer thread has died,
    /// i.e. after a PTY write error.
    pub async fn write(&self, data: Bytes) -> Result<(), mpsc::error::SendError<Bytes>> {
        self.input_tx.send(data).await
    }

    /// Signal, then reap the child: deliver the configured signal, wait
    /// up to the grace period, and escalate to SIGKILL if it is ignored.
    /// The PTY master closes when the process handle drops after the
    /// reap.
    pub async fn shutdown(self, signal: &Signal) {
        let ChildHandle {
            mut proc, input_tx, ..
        } = self;
        // Writer thread drains and exits once the sender is gone.
        drop(input_tx);

        let pid = proc.pid();
        tracing::info!(?pid, signal = %signal, "terminating child process");
        if let Err(e) = proc.signal(signal.code) {
            tracing::warn!(?pid, error = %e, "failed to signal child");
        }

        let mut reap = tokio::task::spawn_blocking(move || proc.wait());
        tokio::select! {
            res = &mut reap => log_child_exit(pid, res),
            _ = tokio::time::sleep(KILL_GRACE) => {
                tracing::warn!(?pid, signal = %signal, "child ignored signal, sending SIGKILL");
                if let Some(pid) = pid {
                    if let Err(e) = pty::send_signal(pid, libc::SIGKILL) {
                        tracing::warn!(pid, error = %e, "SIGKILL failed");
                    }
                }
                log_child_exit(pid, reap.await);
            }
        }
    }
}

fn log_child_exit(
    pid: Option<u32>,
    res: Result<Result<portable_pty::ExitStatus, PtyError>, tokio::task::JoinError>,
) {
    match res {
        Ok(Ok(status)) => tracing::info!(?pid, ?status, "child process exited"),
        Ok(Err(e)) => tracing::error!(?pid, error = %e, "failed to reap child"),
        Err(e) => tracing::error!(?pid, error = %e, "child reaper task panicked"),
    }
}

/// State for one admitted WebSocket client.
pub struct ClientSession {
    config: Arc<ServerConfig>,
    peer: SocketAddr,
    authenticated: bool,
    winsize: Option<WindowSize>,
    child: Option<ChildHandle>,
}

/// Drive one admitted client to completion: handshake, relay, close
/// frame, teardown, registry release.
pub async fn run(socket: WebSocket, config: Arc<ServerConfig>, guard: ClientGuard) {
    // The upgrade is complete: the reserved slot is now a live session.
    guard.establish();
    let peer = guard.peer();
    let cancel = guard.cancelled();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut session = ClientSession {
        config,
        peer,
        authenticated: false,
        winsize: None,
        child: None,
    };

    let reason = session.serve(&mut ws_tx, &mut ws_rx, cancel).await;
    tracing::debug!(peer = %peer, ?reason, "session ended");

    if let Some(frame) = reason.close_frame() {
        let _ = ws_tx.send(Message::Close(Some(frame))).await;
        let _ = ws_tx.flush().await;
    }

    session.teardown().await;
    drop(guard);
}

impl ClientSession {
    async fn serve(
        &mut self,
        ws_tx: &mut SplitSink<WebSocket, Message>,
        ws_rx: &mut SplitStream<WebSocket>,
        cancel: CancellationToken,
    ) -> CloseReason {
        // Fixed greeting, always ahead of any terminal output.
        for msg in self.handshake() {
            if ws_tx.send(Message::Binary(msg.encode())).await.is_err() {
                tracing::warn!(peer = %self.peer, "handshake write failed");
                return CloseReason::Unexpected;
            }
        }

        // Armed once the child exists; until then this arm pends forever.
        let mut events: Option<mpsc::Receiver<PtyEvent>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return CloseReason::ServerClosing,

                event = next_event(&mut events) => match event {
                    Some(PtyEvent::Output(chunk)) => {
                        let frame = ServerMessage::Output(chunk).encode();
                        if ws_tx.send(Message::Binary(frame)).await.is_err() {
                            return CloseReason::PeerGone;
                        }
                    }
                    Some(PtyEvent::Eof) => return CloseReason::Normal,
                    Some(PtyEvent::ReadError(e)) => {
                        tracing::warn!(peer = %self.peer, error = %e, "PTY read failed");
                        return CloseReason::Unexpected;
                    }
                    // Reader thread died without a verdict.
                    None => return CloseReason::Unexpected,
                },

                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(reason) =
                            self.handle_message(Bytes::from(data), &mut events).await
                        {
                            return reason;
                        }
                    }
                    // The browser client always sends binary; accept text
                    // for hand-driven clients.
                    Some(Ok(Message::Text(text))) => {
                        if let Err(reason) = self
                            .handle_message(Bytes::from(text.into_bytes()), &mut events)
                            .await
                        {
                            return reason;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return CloseReason::PeerGone,
                    Some(Ok(_)) => {} // ping/pong handled by the library
                    Some(Err(e)) => {
                        tracing::debug!(peer = %self.peer, error = %e, "WebSocket receive error");
                        return CloseReason::PeerGone;
                    }
                },
            }
        }
    }

    fn handshake(&self) -> [ServerMessage; 3] {
        [
            ServerMessage::WindowTitle(self.config.window_title()),
            ServerMessage::Reconnect(self.config.reconnect),
            ServerMessage::Preferences(self.config.prefs_json.clone()),
        ]
    }

    async fn handle_message(
        &mut self,
        data: Bytes,
        events: &mut Option<mpsc::Receiver<PtyEvent>>,
    ) -> Result<(), CloseReason> {
        let Some(msg) = ClientMessage::parse(data) else {
            tracing::warn!(peer = %self.peer, "ignoring empty message");
            return Ok(());
        };

        // With a credential configured nothing but the auth message
        // counts until authentication succeeds.
        if self.config.credential.is_some()
            && !self.authenticated
            && !matches!(msg, ClientMessage::JsonData(_))
        {
            tracing::warn!(peer = %self.peer, "client not authenticated, dropping message");
            return Ok(());
        }

        match msg {
            ClientMessage::Input(payload) => self.on_input(payload).await,
            ClientMessage::Resize(payload) => {
                self.on_resize(&payload);
                Ok(())
            }
            ClientMessage::JsonData(raw) => self.on_json_data(&raw, events),
            ClientMessage::Unknown(tag) => {
                tracing::warn!(peer = %self.peer, tag, "ignoring unknown command");
                Ok(())
            }
        }
    }

    async fn on_input(&mut self, payload: Bytes) -> Result<(), CloseReason> {
        let Some(child) = &self.child else {
            // Keystrokes before the child exists go nowhere.
            return Ok(());
        };
        if self.config.readonly {
            return Ok(());
        }
        if child.write(payload).await.is_err() {
            tracing::warn!(peer = %self.peer, "PTY writer is gone, closing session");
            return Err(CloseReason::Unexpected);
        }
        Ok(())
    }

    fn on_resize(&mut self, payload: &[u8]) {
        let size = match protocol::parse_window_size(payload) {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "bad resize payload");
                return;
            }
        };
        self.winsize = Some(size);
        if let Some(child) = &self.child {
            if let Err(e) = child.resize(size) {
                tracing::warn!(peer = %self.peer, error = %e, "PTY resize failed");
            }
        }
    }

    /// First JSON control message authenticates (when required) and
    /// spawns the child; any later one is ignored.
    fn on_json_data(
        &mut self,
        raw: &[u8],
        events: &mut Option<mpsc::Receiver<PtyEvent>>,
    ) -> Result<(), CloseReason> {
        if self.child.is_some() {
            return Ok(());
        }

        if let Some(credential) = &self.config.credential {
            let presented = protocol::auth_token(raw);
            let ok = presented
                .as_deref()
                .is_some_and(|token| bool::from(token.as_bytes().ct_eq(credential.as_bytes())));
            if !ok {
                tracing::warn!(peer = %self.peer, "WS authentication failed");
                return Err(CloseReason::PolicyViolation);
            }
            self.authenticated = true;
        }

        // A resize received before authentication seeds the spawn size.
        let size = self.winsize.unwrap_or(DEFAULT_SIZE);
        let proc = PtyProcess::spawn(&self.config.command, size.rows, size.columns)
            .map_err(|e| {
                tracing::error!(peer = %self.peer, error = %e, "failed to spawn child");
                CloseReason::Unexpected
            })?;
        tracing::info!(
            peer = %self.peer,
            pid = ?proc.pid(),
            command = %self.config.command[0],
            "child process started"
        );

        let (child, event_rx) = ChildHandle::start(proc).map_err(|e| {
            tracing::error!(peer = %self.peer, error = %e, "failed to start PTY relay");
            CloseReason::Unexpected
        })?;
        self.child = Some(child);
        *events = Some(event_rx);
        Ok(())
    }

    async fn teardown(&mut self) {
        if let Some(child) = self.child.take() {
            child.shutdown(&self.config.term_signal).await;
        }
    }
}

/// Await the next PTY event once the relay exists; before the spawn the
/// select loop only sees WebSocket traffic.
async fn next_event(events: &mut Option<mpsc::Receiver<PtyEvent>>) -> Option<PtyEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
