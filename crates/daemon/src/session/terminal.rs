//! Terminal session.
//!
//! A [`Session`] binds one shell process, its PTY and one duplex connection.
//! Three tasks run per session:
//!
//! - the output pump forwards PTY output as `output` envelopes,
//! - the input pump dispatches client envelopes to the PTY,
//! - the monitor waits for the shell to exit and reports its code.
//!
//! Whichever of them finishes first calls [`Session::close`], which tears
//! everything down exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use portable_pty::ChildKiller;
use protocol::{Inbound, Message, Notice, CLOSED_MESSAGE};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::commands::{interpret, CommandAction};
use super::connection::{Connection, ConnectionError, EnvelopeSink, EnvelopeStream};
use super::pty::{
    spawn_reader, spawn_shell, spawn_waiter, spawn_writer, PtyDevice, SessionError, SessionId,
    SessionOptions, SpawnedShell, Utf8Decoder,
};

/// Payload of the `pong` reply.
pub const PONG_MESSAGE: &str = "terminal connection healthy";

/// Chunks buffered between the PTY reader thread and the output pump.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Inputs buffered ahead of the PTY writer thread.
const INPUT_CHANNEL_CAPACITY: usize = 256;

/// How long the output pump waits at end-of-stream for the exit notice.
const EXIT_NOTICE_WAIT: Duration = Duration::from_millis(500);

/// How long the monitor waits for remaining output before reporting exit.
const OUTPUT_DRAIN_WAIT: Duration = Duration::from_millis(500);

/// Bound on the farewell and exit sends.
const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// A live terminal session.
pub struct Session {
    id: SessionId,
    target_id: String,
    created_at: DateTime<Utc>,
    pid: Option<u32>,
    kill_grace: Duration,

    device: Mutex<Option<PtyDevice>>,
    input: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    sink: tokio::sync::Mutex<EnvelopeSink>,

    /// Fired once when teardown starts.
    shutdown: CancellationToken,
    /// Fired once the output pump has seen end-of-stream.
    output_drained: CancellationToken,
    /// Fired once the child has been reaped, its exit reported and the
    /// session closed.
    exit_reported: CancellationToken,
    closing: AtomicBool,
    process_exited: Arc<AtomicBool>,
}

impl Session {
    /// Spawns the shell and starts the pumps over `connection`.
    ///
    /// If the shell cannot be spawned an `error` envelope is sent, the
    /// connection is closed and no session exists afterwards.
    pub async fn start(
        connection: Connection,
        id: SessionId,
        target_id: impl Into<String>,
        options: &SessionOptions,
    ) -> Result<Arc<Session>, SessionError> {
        let target_id = target_id.into();

        let SpawnedShell {
            device,
            reader,
            writer,
            child,
            pid,
        } = match spawn_shell(options) {
            Ok(shell) => shell,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to start terminal");
                reject(connection, &e).await;
                return Err(e);
            }
        };

        let killer = child.clone_killer();
        let (sink, stream) = connection.into_parts();
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);

        let session = Arc::new(Session {
            id,
            target_id,
            created_at: Utc::now(),
            pid,
            kill_grace: options.kill_grace,
            device: Mutex::new(Some(device)),
            input: Mutex::new(Some(input_tx)),
            killer: Mutex::new(killer),
            sink: tokio::sync::Mutex::new(sink),
            shutdown: CancellationToken::new(),
            output_drained: CancellationToken::new(),
            exit_reported: CancellationToken::new(),
            closing: AtomicBool::new(false),
            process_exited: Arc::new(AtomicBool::new(false)),
        });

        let (exit_tx, exit_rx) = oneshot::channel();
        if let Err(e) = spawn_waiter(
            session.id.clone(),
            child,
            Arc::clone(&session.process_exited),
            exit_tx,
        ) {
            let err = SessionError::SpawnFailed(e.to_string());
            let _ = session.lock_killer().kill();
            session.close().await;
            return Err(err);
        }

        if let Err(e) = spawn_writer(session.id.clone(), writer, input_rx) {
            session.close().await;
            return Err(SessionError::SpawnFailed(e.to_string()));
        }

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Err(e) = spawn_reader(session.id.clone(), reader, output_tx) {
            session.close().await;
            return Err(SessionError::SpawnFailed(e.to_string()));
        }

        tokio::spawn(Arc::clone(&session).pump_output(output_rx));
        tokio::spawn(Arc::clone(&session).pump_input(stream));
        tokio::spawn(Arc::clone(&session).monitor(exit_rx));

        info!(
            session_id = %session.id,
            target_id = %session.target_id,
            pid = ?session.pid,
            shell = %options.shell,
            "Terminal session started"
        );

        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// False once teardown has started. Does not query the OS.
    pub fn is_alive(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Resolves once teardown has started.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Resolves once the shell has been reaped, its exit reported and the
    /// session torn down.
    pub async fn wait_for_exit(&self) {
        self.exit_reported.cancelled().await
    }

    /// Changes the terminal geometry.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        match self.lock_device().as_ref() {
            Some(device) => device.resize(cols, rows),
            None => Err(SessionError::NotInitialized(self.id.clone())),
        }
    }

    /// Current terminal geometry as `(cols, rows)`.
    pub fn geometry(&self) -> Result<(u16, u16), SessionError> {
        match self.lock_device().as_ref() {
            Some(device) => device.geometry(),
            None => Err(SessionError::NotInitialized(self.id.clone())),
        }
    }

    /// Queues text, verbatim, for the shell's input.
    ///
    /// Waits while the writer's queue is full, but never past teardown.
    pub async fn write_raw(&self, text: &str) -> Result<(), SessionError> {
        let Some(input) = self.lock_input().clone() else {
            return Err(SessionError::NotInitialized(self.id.clone()));
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(SessionError::NotInitialized(self.id.clone())),
            sent = input.send(text.as_bytes().to_vec()) => {
                sent.map_err(|_| SessionError::Device("PTY writer stopped".to_string()))
            }
        }
    }

    /// Sends one envelope to the client.
    pub async fn send_envelope(&self, message: Message) -> Result<(), SessionError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed(self.id.clone()).into());
        }
        let mut sink = self.sink.lock().await;
        sink.send(message).await.map_err(SessionError::from)
    }

    /// Tears the session down.
    ///
    /// Only the first call does anything; it returns `true`, later and
    /// concurrent calls return `false`.
    pub async fn close(&self) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!(session_id = %self.id, "Closing terminal session");
        self.shutdown.cancel();

        drop(self.lock_input().take());
        drop(self.lock_device().take());
        self.terminate_process();

        let farewell = Message::System(Notice::new(CLOSED_MESSAGE).with_session(self.id.clone()));
        let result = tokio::time::timeout(CLOSE_SEND_TIMEOUT, async {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(farewell).await;
            sink.close().await
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(session_id = %self.id, error = %e, "Connection close failed"),
            Err(_) => debug!(session_id = %self.id, "Timed out closing connection"),
        }

        true
    }

    /// SIGTERM to the shell's terminal session now, SIGKILL to whatever is
    /// left of it after the grace period.
    #[cfg(unix)]
    fn terminate_process(&self) {
        use super::pty::signal_session;
        use nix::sys::signal::Signal;

        let Some(pid) = self.pid else {
            if !self.process_exited.load(Ordering::SeqCst) {
                if let Err(e) = self.lock_killer().kill() {
                    debug!(session_id = %self.id, error = %e, "Failed to kill shell");
                }
            }
            return;
        };

        let signalled = signal_session(pid, Signal::SIGTERM);
        debug!(session_id = %self.id, signalled, "Sent SIGTERM to terminal session");
        if signalled == 0 {
            return;
        }

        let exited = Arc::clone(&self.process_exited);
        let grace = self.kill_grace;
        let id = self.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !exited.load(Ordering::SeqCst) {
                warn!(session_id = %id, "Shell still running after SIGTERM, sending SIGKILL");
            }
            let killed = signal_session(pid, Signal::SIGKILL);
            debug!(session_id = %id, killed, "Sent SIGKILL to terminal session");
        });
    }

    #[cfg(not(unix))]
    fn terminate_process(&self) {
        if self.process_exited.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.lock_killer().kill() {
            debug!(session_id = %self.id, error = %e, "Failed to kill shell");
        }
    }

    async fn pump_output(self: Arc<Self>, mut output_rx: mpsc::Receiver<Vec<u8>>) {
        let mut decoder = Utf8Decoder::default();

        loop {
            let chunk = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                chunk = output_rx.recv() => chunk,
            };

            let Some(bytes) = chunk else {
                let tail = decoder.finish();
                if !tail.is_empty() {
                    let _ = self.send_envelope(Message::Output(tail)).await;
                }
                self.output_drained.cancel();
                let _ = tokio::time::timeout(EXIT_NOTICE_WAIT, self.exit_reported.cancelled()).await;
                break;
            };

            let text = decoder.push(&bytes);
            if text.is_empty() {
                continue;
            }
            if let Err(e) = self.send_envelope(Message::Output(text)).await {
                debug!(session_id = %self.id, error = %e, "Output send failed");
                break;
            }
        }

        self.close().await;
    }

    async fn pump_input(self: Arc<Self>, mut stream: EnvelopeStream) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(Inbound::Message(message))) => {
                    if let Err(e) = self.dispatch(message).await {
                        debug!(session_id = %self.id, error = %e, "Input dispatch failed");
                        break;
                    }
                }
                Some(Ok(Inbound::Unknown(kind))) => {
                    warn!(session_id = %self.id, kind = %kind, "Ignoring unknown message type");
                }
                Some(Ok(Inbound::Invalid { kind, reason })) => {
                    warn!(
                        session_id = %self.id,
                        kind = %kind,
                        reason = %reason,
                        "Ignoring malformed message payload"
                    );
                }
                Some(Err(e)) => {
                    debug!(session_id = %self.id, error = %e, "Connection read failed");
                    break;
                }
                None => {
                    debug!(session_id = %self.id, "Client disconnected");
                    break;
                }
            }
        }

        self.close().await;
    }

    async fn dispatch(&self, message: Message) -> Result<(), SessionError> {
        match message {
            Message::Input(data) => self.write_raw(&data).await,
            Message::Resize(size) => {
                if let Err(e) = self.resize(size.cols, size.rows) {
                    warn!(
                        session_id = %self.id,
                        cols = size.cols,
                        rows = size.rows,
                        error = %e,
                        "Resize failed"
                    );
                }
                Ok(())
            }
            Message::Ping(_) => {
                self.send_envelope(Message::Pong(PONG_MESSAGE.to_string()))
                    .await
            }
            Message::Command(command) => match interpret(&command) {
                CommandAction::Shell(input) => self.write_raw(&input).await,
                CommandAction::Reply(text) => self.send_envelope(Message::Output(text)).await,
            },
            other => {
                debug!(session_id = %self.id, kind = other.kind(), "Ignoring client message");
                Ok(())
            }
        }
    }

    async fn monitor(self: Arc<Self>, exit_rx: oneshot::Receiver<i32>) {
        let code = exit_rx.await.unwrap_or(0);
        info!(session_id = %self.id, code, "Shell exited");

        let _ = tokio::time::timeout(OUTPUT_DRAIN_WAIT, self.output_drained.cancelled()).await;

        let notice = Message::exit(code, self.id.clone());
        match tokio::time::timeout(CLOSE_SEND_TIMEOUT, self.send_envelope(notice)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(session_id = %self.id, error = %e, "Exit notice not delivered"),
            Err(_) => debug!(session_id = %self.id, "Timed out sending exit notice"),
        }

        self.close().await;
        self.exit_reported.cancel();
    }

    fn lock_device(&self) -> MutexGuard<'_, Option<PtyDevice>> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_input(&self) -> MutexGuard<'_, Option<mpsc::Sender<Vec<u8>>>> {
        self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_killer(&self) -> MutexGuard<'_, Box<dyn ChildKiller + Send + Sync>> {
        self.killer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tells the client why its terminal could not start, then closes.
async fn reject(connection: Connection, error: &SessionError) {
    let (mut sink, _stream) = connection.into_parts();
    let message = Message::error(format!("failed to start terminal: {error}"));
    let result = tokio::time::timeout(CLOSE_SEND_TIMEOUT, async {
        sink.send(message).await?;
        sink.close().await
    })
    .await;
    if let Ok(Err(e)) = result {
        debug!(error = %e, "Failed to report spawn failure");
    }
}
