//! Pseudo-terminal device.
//!
//! This module wraps `portable-pty`: it spawns the shell attached to a fresh
//! PTY, exposes the master side for geometry control, and runs the blocking
//! reader, writer and waiter on dedicated OS threads.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::connection::ConnectionError;
use crate::config::SessionConfig;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No shell or PTY could be obtained.
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    /// Read or write on the PTY failed.
    #[error("PTY I/O failed: {0}")]
    Device(String),

    /// Read, write or decode on the client connection failed.
    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),

    /// The PTY rejected the geometry change.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Geometry with a zero dimension.
    #[error("invalid terminal size {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    /// The PTY device is gone (never created or already closed).
    #[error("terminal not initialized: {0}")]
    NotInitialized(SessionId),
}

/// Size of each PTY read; larger bursts become several `output` envelopes.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Largest single write to the PTY master.
const WRITE_CHUNK_SIZE: usize = 512;

/// Default terminal width.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height.
pub const DEFAULT_ROWS: u16 = 24;

/// Environment applied to every spawned shell.
pub const SHELL_ENV: &[(&str, &str)] = &[
    ("TERM", "xterm-256color"),
    ("PS1", "container:$ "),
    ("LANG", "en_US.UTF-8"),
];

/// Parameters for spawning a session's shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Shell executable.
    pub shell: String,
    /// Initial terminal width.
    pub cols: u16,
    /// Initial terminal height.
    pub rows: u16,
    /// Delay between SIGTERM and SIGKILL on teardown.
    pub kill_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            shell: detect_shell(None),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            shell: detect_shell(config.shell.as_deref()),
            cols: config.cols,
            rows: config.rows,
            kill_grace: Duration::from_millis(config.kill_grace_ms),
        }
    }
}

/// The master side of a PTY.
///
/// Input goes through the writer thread (see [`spawn_writer`]), so nothing
/// here blocks on the shell.
pub struct PtyDevice {
    master: Box<dyn MasterPty + Send>,
}

impl PtyDevice {
    /// Changes the terminal geometry.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidGeometry { cols, rows });
        }

        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    /// Queries the current geometry from the OS as `(cols, rows)`.
    pub fn geometry(&self) -> Result<(u16, u16), SessionError> {
        let size = self
            .master
            .get_size()
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        Ok((size.cols, size.rows))
    }
}

/// Everything produced by a successful spawn.
pub struct SpawnedShell {
    /// Master side of the PTY.
    pub device: PtyDevice,
    /// Output reader, independent of the device's lifetime.
    pub reader: Box<dyn Read + Send>,
    /// Input writer, handed to [`spawn_writer`].
    pub writer: Box<dyn Write + Send>,
    /// The shell process.
    pub child: Box<dyn Child + Send + Sync>,
    /// Process ID, when the platform reports one.
    pub pid: Option<u32>,
}

/// Spawns the shell attached to a new PTY.
///
/// On failure nothing is left running: a child that was already spawned is
/// killed and reaped before the error is returned.
pub fn spawn_shell(options: &SessionOptions) -> Result<SpawnedShell, SessionError> {
    let pty_system = native_pty_system();

    let pair = pty_system
        .openpty(PtySize {
            rows: options.rows,
            cols: options.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&options.shell);
    for (key, value) in SHELL_ENV {
        cmd.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

    // Only the child may hold the slave, otherwise the reader never sees EOF.
    drop(pair.slave);

    let handles = pair
        .master
        .try_clone_reader()
        .and_then(|reader| Ok((reader, pair.master.take_writer()?)));

    let (reader, writer) = match handles {
        Ok(handles) => handles,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SessionError::SpawnFailed(e.to_string()));
        }
    };

    let pid = child.process_id();

    tracing::debug!(shell = %options.shell, pid = ?pid, "Spawned shell on PTY");

    Ok(SpawnedShell {
        device: PtyDevice {
            master: pair.master,
        },
        reader,
        writer,
        child,
        pid,
    })
}

/// Starts the blocking read loop on its own thread.
///
/// Chunks of at most [`READ_BUFFER_SIZE`] bytes are handed to `output_tx`.
/// The thread ends on EOF, on a read error, or once the receiver is dropped;
/// in every case the channel closes, which the output pump treats as
/// end-of-stream.
pub fn spawn_reader(
    session_id: SessionId,
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::Sender<Vec<u8>>,
) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("pty-read-{session_id}"))
        .spawn(move || {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::debug!(session_id = %session_id, "PTY EOF");
                        break;
                    }
                    Ok(n) => {
                        if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // Linux reports EIO once the slave side is gone.
                        tracing::debug!(
                            session_id = %session_id,
                            error = %e,
                            "PTY read ended"
                        );
                        break;
                    }
                }
            }
        })
        .map(|_| ())
}

/// Starts the blocking write loop on its own thread.
///
/// Each buffer from `input_rx` is written verbatim and in order, in chunks of
/// at most 512 bytes. A write that blocks because the shell is not reading
/// stalls only this thread. The thread ends once every sender is dropped or
/// a write fails; the receiver is dropped with it, so later sends fail.
pub fn spawn_writer(
    session_id: SessionId,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("pty-write-{session_id}"))
        .spawn(move || {
            while let Some(data) = input_rx.blocking_recv() {
                for chunk in data.chunks(WRITE_CHUNK_SIZE) {
                    if let Err(e) = writer.write_all(chunk).and_then(|_| writer.flush()) {
                        tracing::debug!(
                            session_id = %session_id,
                            error = %e,
                            "PTY write failed"
                        );
                        return;
                    }
                }
            }
            tracing::debug!(session_id = %session_id, "PTY writer finished");
        })
        .map(|_| ())
}

/// Reaps the shell on its own thread.
///
/// `exited` is raised as soon as the child has been reaped, then the exit
/// code (0 when unavailable) is sent on `exit_tx`.
pub fn spawn_waiter(
    session_id: SessionId,
    mut child: Box<dyn Child + Send + Sync>,
    exited: Arc<AtomicBool>,
    exit_tx: oneshot::Sender<i32>,
) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("pty-wait-{session_id}"))
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => i32::try_from(status.exit_code()).unwrap_or(0),
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "Failed to wait for shell process"
                    );
                    0
                }
            };
            exited.store(true, Ordering::SeqCst);
            let _ = exit_tx.send(code);
        })
        .map(|_| ())
}

/// Sends `signal` to every process in the terminal session led by `leader`.
///
/// The shell is the session leader of its PTY, so this also reaches jobs it
/// moved into their own process groups. Those would otherwise keep the slave
/// open and the reader thread parked. Returns how many processes were
/// signalled.
#[cfg(unix)]
pub fn signal_session(leader: u32, signal: nix::sys::signal::Signal) -> usize {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(leader) = i32::try_from(leader).map(Pid::from_raw) else {
        return 0;
    };

    session_members(leader)
        .into_iter()
        .filter(|pid| kill(*pid, signal).is_ok())
        .count()
}

#[cfg(target_os = "linux")]
fn session_members(leader: nix::unistd::Pid) -> Vec<nix::unistd::Pid> {
    use nix::unistd::{getsid, Pid};

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return vec![leader];
    };

    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .map(Pid::from_raw)
        .filter(|pid| matches!(getsid(Some(*pid)), Ok(sid) if sid == leader))
        .collect()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn session_members(leader: nix::unistd::Pid) -> Vec<nix::unistd::Pid> {
    vec![leader]
}

/// Incremental UTF-8 decoder for PTY output.
///
/// A multi-byte sequence split across two reads is held back until the rest
/// arrives; genuinely invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Feeds a chunk and returns the text that is complete so far.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flushes whatever is still held back.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// Picks the shell to run.
///
/// Returns, in order of preference:
/// 1. The configured shell if non-empty
/// 2. `cmd` on Windows
/// 3. `/bin/bash` if present
/// 4. `/bin/sh`
pub fn detect_shell(configured: Option<&str>) -> String {
    if let Some(shell) = configured.filter(|s| !s.trim().is_empty()) {
        return shell.to_string();
    }

    if cfg!(windows) {
        return "cmd".to_string();
    }

    if Path::new("/bin/bash").exists() {
        "/bin/bash".to_string()
    } else {
        "/bin/sh".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh_options() -> SessionOptions {
        SessionOptions {
            shell: "/bin/sh".to_string(),
            ..SessionOptions::default()
        }
    }

    #[test]
    fn test_detect_shell_with_configured() {
        assert_eq!(detect_shell(Some("/bin/zsh")), "/bin/zsh");
    }

    #[test]
    fn test_detect_shell_ignores_blank() {
        let shell = detect_shell(Some("  "));
        assert!(!shell.trim().is_empty());
        assert_eq!(shell, detect_shell(None));
    }

    #[test]
    #[cfg(unix)]
    fn test_detect_shell_prefers_bash() {
        let shell = detect_shell(None);
        if Path::new("/bin/bash").exists() {
            assert_eq!(shell, "/bin/bash");
        } else {
            assert_eq!(shell, "/bin/sh");
        }
    }

    #[test]
    fn test_options_from_config() {
        let config = SessionConfig {
            shell: Some("/bin/sh".to_string()),
            cols: 100,
            rows: 30,
            kill_grace_ms: 500,
            ..SessionConfig::default()
        };
        let options = SessionOptions::from(&config);
        assert_eq!(options.shell, "/bin/sh");
        assert_eq!((options.cols, options.rows), (100, 30));
        assert_eq!(options.kill_grace, Duration::from_millis(500));
    }

    #[test]
    fn test_utf8_decoder_passes_ascii() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push(b"hello"), "hello");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_utf8_decoder_joins_split_sequence() {
        let bytes = "héllo".as_bytes();
        // 'é' is two bytes starting at index 1; split inside it.
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push(&bytes[..2]), "h");
        assert_eq!(decoder.push(&bytes[2..]), "éllo");
    }

    #[test]
    fn test_utf8_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push(&[b'a', 0xff, b'b']), "a\u{FFFD}b");
    }

    #[test]
    fn test_utf8_decoder_finish_flushes_incomplete_tail() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push(&[b'x', 0xe2, 0x82]), "x");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_spawn_missing_shell_fails() {
        let options = SessionOptions {
            shell: "/nonexistent/shellport-shell".to_string(),
            ..SessionOptions::default()
        };
        let result = spawn_shell(&options);
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[test]
    #[cfg(unix)]
    fn test_device_resize_and_geometry() {
        let shell = spawn_shell(&sh_options()).unwrap();
        assert_eq!(shell.device.geometry().unwrap(), (DEFAULT_COLS, DEFAULT_ROWS));

        shell.device.resize(120, 40).unwrap();
        assert_eq!(shell.device.geometry().unwrap(), (120, 40));

        assert!(matches!(
            shell.device.resize(0, 40),
            Err(SessionError::InvalidGeometry { cols: 0, rows: 40 })
        ));

        let mut child = shell.child;
        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    #[cfg(unix)]
    fn test_reader_and_waiter_threads() {
        let SpawnedShell {
            reader,
            writer,
            child,
            ..
        } = spawn_shell(&sh_options()).unwrap();

        let (output_tx, mut output_rx) = mpsc::channel(64);
        spawn_reader("test".to_string(), reader, output_tx).unwrap();

        let (input_tx, input_rx) = mpsc::channel(8);
        spawn_writer("test".to_string(), writer, input_rx).unwrap();

        let exited = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = oneshot::channel();
        spawn_waiter("test".to_string(), child, Arc::clone(&exited), exit_tx).unwrap();

        input_tx
            .blocking_send(b"echo marker_$((40+2)); exit 7\n".to_vec())
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = String::new();
        while let Some(chunk) = output_rx.blocking_recv() {
            assert!(chunk.len() <= READ_BUFFER_SIZE);
            seen.push_str(&String::from_utf8_lossy(&chunk));
            assert!(Instant::now() < deadline, "reader did not reach EOF");
        }
        assert!(seen.contains("marker_42"), "output was: {seen:?}");

        assert_eq!(exit_rx.blocking_recv().unwrap(), 7);
        assert!(exited.load(Ordering::SeqCst));
    }

    #[tokio::test]
    #[cfg(target_os = "linux")]
    async fn test_signal_session_reaches_background_jobs() {
        use nix::sys::signal::Signal;

        let SpawnedShell {
            reader,
            writer,
            child,
            pid,
            ..
        } = spawn_shell(&sh_options()).unwrap();
        let pid = pid.unwrap();

        let (output_tx, mut output_rx) = mpsc::channel(64);
        spawn_reader("test".to_string(), reader, output_tx).unwrap();
        let (input_tx, input_rx) = mpsc::channel(8);
        spawn_writer("test".to_string(), writer, input_rx).unwrap();
        let (exit_tx, _exit_rx) = oneshot::channel();
        spawn_waiter("test".to_string(), child, Arc::new(AtomicBool::new(false)), exit_tx)
            .unwrap();

        // The job inherits the slave, so killing only the shell leaves it open.
        input_tx
            .send(b"sleep 1000 & echo job_$((1+1))\n".to_vec())
            .await
            .unwrap();
        let mut seen = String::new();
        while !seen.contains("job_2") {
            let chunk = tokio::time::timeout(Duration::from_secs(10), output_rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }

        assert!(signal_session(pid, Signal::SIGKILL) >= 2);

        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while output_rx.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "reader thread still parked on the PTY");
    }

    #[test]
    #[cfg(unix)]
    fn test_signal_session_unknown_leader() {
        assert_eq!(signal_session(u32::MAX, nix::sys::signal::Signal::SIGTERM), 0);
    }
}
