//! PTY Process Manager: spawns a child under a fresh pseudo-terminal and
//! exposes asynchronous read/write/resize/pause/resume/kill for an
//! arbitrary configured argv, including a pause/resume backpressure gate
//! so output is only read from the child once a client is ready for it.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use crate::error::PtyError;

/// Parameters for `PtyProcess::spawn`.
#[derive(Debug, Clone)]
pub struct PtySpawnConfig {
    pub argv: Vec<String>,
    pub envp: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub columns: u16,
    pub rows: u16,
}

/// Events delivered from the PTY's reader and waiter threads back to the
/// owning session. Exactly one `Exit` is ever sent; zero or more `Output`,
/// optionally followed by one `Eof`.
#[derive(Debug)]
pub enum PtyEvent {
    Output(Vec<u8>),
    Eof,
    Exit { code: i32 },
}

/// Gate implementing the read callback's stop/start contract: after a read
/// delivers a buffer the reader blocks here until `resume()` is called.
/// Starts closed (paused), matching "the initial post-spawn state is
/// paused".
struct ResumeGate {
    paused: Mutex<bool>,
    cv: Condvar,
    shutdown: AtomicBool,
}

impl ResumeGate {
    fn new() -> Self {
        Self {
            paused: Mutex::new(true),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Blocks while paused, waking early once `shutdown()` fires. Returns
    /// `false` when the caller should stop reading instead of proceeding —
    /// otherwise a reader parked here while paused would never notice
    /// `free()` dropping the master and would block `join()` forever.
    fn wait_if_paused(&self) -> bool {
        let mut paused = self.paused.lock().unwrap();
        while *paused && !self.shutdown.load(Ordering::Acquire) {
            paused = self.cv.wait(paused).unwrap();
        }
        !self.shutdown.load(Ordering::Acquire)
    }

    fn pause(&self) {
        *self.paused.lock().unwrap() = true;
    }

    fn resume(&self) {
        *self.paused.lock().unwrap() = false;
        self.cv.notify_all();
    }

    fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap()
    }

    /// Wakes a reader parked in `wait_if_paused` so it observes shutdown and
    /// exits instead of blocking a future `join()` forever.
    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        *self.paused.lock().unwrap() = false;
        self.cv.notify_all();
    }
}

/// One spawned child attached to a PTY master. Owned exclusively by a
/// single `Session` — never shared across sessions.
pub struct PtyProcess {
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    pid: i32,
    #[cfg(unix)]
    pgid: i32,
    gate: Arc<ResumeGate>,
    exit_code: Arc<AtomicI32>,
    exited: Arc<AtomicBool>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    waiter_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PtyProcess {
    /// Creates the PTY pair, forks the configured argv, and returns the
    /// handle together with the event channel the session polls. The
    /// reader is paused; call `resume()` once the session is ready for
    /// output (after the handshake's initial messages have gone out).
    pub fn spawn(config: PtySpawnConfig) -> Result<(Self, mpsc::UnboundedReceiver<PtyEvent>), PtyError> {
        if config.columns == 0 || config.rows == 0 {
            return Err(PtyError::SpawnFailed("columns*rows must be > 0".into()));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.columns,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let Some((program, args)) = config.argv.split_first() else {
            return Err(PtyError::SpawnFailed("empty argv".into()));
        };
        let mut cmd = CommandBuilder::new(program);
        for arg in args {
            cmd.arg(arg);
        }
        for (k, v) in &config.envp {
            cmd.env(k, v);
        }
        if let Some(cwd) = &config.cwd {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let pid = child
            .process_id()
            .map(|p| p as i32)
            .ok_or_else(|| PtyError::SpawnFailed("could not obtain child pid".into()))?;

        #[cfg(unix)]
        let pgid = pair.master.process_group_leader().unwrap_or(pid);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        drop(pair.slave);

        let (tx, rx) = mpsc::unbounded_channel::<PtyEvent>();
        let gate = Arc::new(ResumeGate::new());
        let exit_code = Arc::new(AtomicI32::new(-1));
        let exited = Arc::new(AtomicBool::new(false));

        let reader_handle = spawn_reader_thread(reader, gate.clone(), tx.clone());
        let waiter_handle = spawn_waiter_thread(child, exit_code.clone(), exited.clone(), tx);

        Ok((
            Self {
                writer: Mutex::new(writer),
                master: Mutex::new(pair.master),
                pid,
                #[cfg(unix)]
                pgid,
                gate,
                exit_code,
                exited,
                reader_handle: Mutex::new(Some(reader_handle)),
                waiter_handle: Mutex::new(Some(waiter_handle)),
            },
            rx,
        ))
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Asynchronous write; the caller's buffer is consumed (and its backing
    /// allocation freed) once this returns, same as the C original freeing
    /// `pty_buf_t` after the write completes — here that's just normal
    /// Rust ownership, not a manual free list.
    pub fn write(&self, buf: &[u8]) -> Result<(), PtyError> {
        if self.exited.load(Ordering::Acquire) {
            return Err(PtyError::NoProcess);
        }
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .write_all(buf)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer.flush().map_err(|e| PtyError::WriteFailed(e.to_string()))
    }

    pub fn resize(&self, columns: u16, rows: u16) -> bool {
        if columns == 0 || rows == 0 {
            return false;
        }
        let master = match self.master.lock() {
            Ok(m) => m,
            Err(_) => return false,
        };
        master
            .resize(PtySize {
                rows,
                cols: columns,
                pixel_width: 0,
                pixel_height: 0,
            })
            .is_ok()
    }

    /// Idempotent: stops the reader from delivering further output until
    /// `resume()` is called.
    pub fn pause(&self) {
        self.gate.pause();
    }

    /// Idempotent: restarts the reader.
    pub fn resume(&self) {
        self.gate.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// Delivers `signal` to the child's process group (negative pid), so
    /// the whole job tree receives it, not just the immediate child.
    pub fn kill(&self, signal: i32) -> bool {
        #[cfg(unix)]
        {
            unsafe { libc::kill(-self.pgid, signal) == 0 }
        }
        #[cfg(not(unix))]
        {
            let _ = signal;
            false
        }
    }

    /// True while the process exists and responds to `kill(pid, 0)`.
    pub fn running(&self) -> bool {
        if self.exited.load(Ordering::Acquire) {
            return false;
        }
        #[cfg(unix)]
        {
            unsafe { libc::kill(self.pid, 0) == 0 }
        }
        #[cfg(not(unix))]
        {
            !self.exited.load(Ordering::Acquire)
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Releases the PTY's file descriptors and joins the reader/waiter
    /// threads. `gate.shutdown()` runs first so a reader parked in
    /// `wait_if_paused` (the common case: it just delivered a buffer and
    /// auto-paused, and nobody called `resume()` before the session tore
    /// down) wakes immediately instead of waiting on a `Condvar` that
    /// dropping the master/writer can never signal. Dropping the
    /// master/writer afterward closes the PTY fd, unblocking a reader
    /// that's instead parked in a blocking `read()`. Joins run off the
    /// async runtime via `spawn_blocking` so we never block the reactor on
    /// another thread's teardown.
    pub async fn free(self) {
        self.gate.shutdown();
        drop(self.writer);
        drop(self.master);

        let reader_handle = self.reader_handle.lock().ok().and_then(|mut h| h.take());
        if let Some(h) = reader_handle {
            let _ = tokio::task::spawn_blocking(move || h.join()).await;
        }
        let waiter_handle = self.waiter_handle.lock().ok().and_then(|mut h| h.take());
        if let Some(h) = waiter_handle {
            let _ = tokio::task::spawn_blocking(move || h.join()).await;
        }
    }
}

fn spawn_reader_thread(
    mut reader: Box<dyn Read + Send>,
    gate: Arc<ResumeGate>,
    tx: mpsc::UnboundedSender<PtyEvent>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("pty-reader".into())
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                if !gate.wait_if_paused() {
                    break;
                }
                match reader.read(&mut buf) {
                    Ok(0) => {
                        let _ = tx.send(PtyEvent::Eof);
                        break;
                    }
                    Ok(n) => {
                        // Spurious zero-length sends can't happen here since
                        // n > 0 is checked, matching the "drop spurious
                        // zero-length events" contract at the call site.
                        if tx.send(PtyEvent::Output(buf[..n].to_vec())).is_err() {
                            break;
                        }
                        // Auto-stop: the session must call resume().
                        gate.pause();
                    }
                    Err(e) => {
                        #[cfg(unix)]
                        {
                            let raw = e.raw_os_error().unwrap_or(0);
                            if raw == libc::EAGAIN || raw == libc::EINTR {
                                continue;
                            }
                        }
                        log::debug!("pty reader error: {e}");
                        let _ = tx.send(PtyEvent::Eof);
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn pty reader thread")
}

fn spawn_waiter_thread(
    mut child: Box<dyn Child + Send + Sync>,
    exit_code: Arc<AtomicI32>,
    exited: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<PtyEvent>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("pty-waiter".into())
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(e) => {
                    log::warn!("waitpid failed: {e}");
                    -1
                }
            };
            exit_code.store(code, Ordering::Release);
            exited.store(true, Ordering::Release);
            let _ = tx.send(PtyEvent::Exit { code });
        })
        .expect("failed to spawn pty waiter thread")
}
