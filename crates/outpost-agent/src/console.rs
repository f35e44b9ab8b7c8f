//! Interactive shell sessions on pseudo-terminals
//!
//! Each session owns a child shell attached to a PTY. A blocking reader thread
//! pulls output off the PTY and an async forwarding task emits every chunk as
//! `console_output` immediately. When the reader ends, the task reaps the
//! child, reports its exit code and releases the session.

use crate::error::{AgentError, Result};
use crate::lifecycle::Lifecycle;
use crate::task::spawn_supervised;
use bytes::Bytes;
use outpost_proto::{Outbound, TransportWriter};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Columns used when the controller sends none
pub const DEFAULT_COLS: u16 = 120;
/// Rows used when the controller sends none
pub const DEFAULT_ROWS: u16 = 36;
/// Reported when the exit status cannot be obtained
pub const EXIT_CODE_UNAVAILABLE: i32 = -1;

const READ_CHUNK_SIZE: usize = 4096;
const REPLACE_WAIT: Duration = Duration::from_secs(3);
const KILL_GRACE: Duration = Duration::from_secs(2);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Clamp controller-supplied dimensions to a usable PTY size
pub fn clamp_size(cols: i64, rows: i64) -> PtySize {
    let clamp = |value: i64, default: u16| match u16::try_from(value) {
        Ok(v) if v > 0 => v,
        _ => default,
    };
    PtySize {
        rows: clamp(rows, DEFAULT_ROWS),
        cols: clamp(cols, DEFAULT_COLS),
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Shell argv for the host platform
pub fn default_shell() -> Vec<String> {
    if cfg!(windows) {
        let comspec = std::env::var("COMSPEC").unwrap_or_default();
        let shell = if comspec.trim().is_empty() { "cmd.exe".to_string() } else { comspec };
        return vec![shell];
    }

    let login = |shell: String| vec![shell, "-l".to_string()];
    match std::env::var("SHELL") {
        Ok(shell) if !shell.trim().is_empty() => login(shell),
        _ if cfg!(target_os = "macos") => login("/bin/zsh".to_string()),
        _ => login("/bin/bash".to_string()),
    }
}

/// Registry of live console sessions
#[derive(Clone)]
pub struct ConsoleHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    writer: Arc<dyn TransportWriter>,
    shell: Vec<String>,
    sessions: RwLock<HashMap<String, Arc<ConsoleSession>>>,
    next_serial: AtomicU64,
}

struct ConsoleSession {
    id: String,
    serial: u64,
    pid: Option<u32>,
    master: StdMutex<Option<Box<dyn MasterPty + Send>>>,
    input: StdMutex<Option<Box<dyn Write + Send>>>,
    child: StdMutex<Box<dyn Child + Send + Sync>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    cancel: CancellationToken,
    lifecycle: Lifecycle,
    superseded: AtomicBool,
    done: watch::Sender<bool>,
}

struct SpawnedShell {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    input: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl ConsoleHub {
    /// Hub spawning `shell` for every session
    pub fn new(writer: Arc<dyn TransportWriter>, shell: Vec<String>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                writer,
                shell,
                sessions: RwLock::new(HashMap::new()),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    /// Start a session, replacing any live session with the same id
    ///
    /// A spawn failure is also emitted as a session error event.
    pub async fn start(&self, session_id: &str, cols: i64, rows: i64) -> Result<()> {
        if session_id.is_empty() {
            return Err(AgentError::InvalidInput("session id is required".to_string()));
        }

        let previous = self.inner.sessions.write().await.remove(session_id);
        if let Some(previous) = previous {
            debug!(session = %session_id, "replacing live console session");
            previous.superseded.store(true, Ordering::Release);
            previous.close();
            if !previous.wait_done(REPLACE_WAIT).await {
                warn!(session = %session_id, "previous shell did not exit in time");
            }
        }

        let size = clamp_size(cols, rows);
        let (cols, rows) = (size.cols, size.rows);
        let shell = self.inner.shell.clone();
        let spawned = match tokio::task::spawn_blocking(move || spawn_shell(&shell, size)).await {
            Ok(Ok(spawned)) => spawned,
            Ok(Err(e)) => {
                let error = AgentError::Process(format!("failed to start shell: {:#}", e));
                self.inner.emit(Outbound::console_error(session_id, error.to_string())).await;
                return Err(error);
            }
            Err(e) => {
                let error = AgentError::Panic(format!("shell spawn task failed: {}", e));
                self.inner.emit(Outbound::console_error(session_id, error.to_string())).await;
                return Err(error);
            }
        };

        let SpawnedShell { master, reader, input, child } = spawned;
        let pid = child.process_id();
        let killer = child.clone_killer();
        let (done, _) = watch::channel(false);
        let session = Arc::new(ConsoleSession {
            id: session_id.to_string(),
            serial: self.inner.next_serial.fetch_add(1, Ordering::Relaxed),
            pid,
            master: StdMutex::new(Some(master)),
            input: StdMutex::new(Some(input)),
            child: StdMutex::new(child),
            killer: StdMutex::new(killer),
            cancel: CancellationToken::new(),
            lifecycle: Lifecycle::new(),
            superseded: AtomicBool::new(false),
            done,
        });

        // A concurrent start for the same id may have registered meanwhile
        let displaced = self
            .inner
            .sessions
            .write()
            .await
            .insert(session_id.to_string(), Arc::clone(&session));
        if let Some(displaced) = displaced {
            displaced.superseded.store(true, Ordering::Release);
            displaced.close();
        }

        info!(session = %session_id, pid = ?pid, cols, rows, "console session started");
        self.start_forwarding(session, reader);
        Ok(())
    }

    /// Send raw input to a session
    pub async fn write(&self, session_id: &str, data: Vec<u8>) -> Result<()> {
        let session = self.session(session_id).await?;
        tokio::task::spawn_blocking(move || session.write_input(&data))
            .await
            .map_err(|e| AgentError::Panic(e.to_string()))?
    }

    /// Apply a new terminal size
    pub async fn resize(&self, session_id: &str, cols: i64, rows: i64) -> Result<()> {
        let session = self.session(session_id).await?;
        session.resize(clamp_size(cols, rows))
    }

    /// Remove and close a session; unknown ids are ignored
    pub async fn stop(&self, session_id: &str) {
        let removed = self.inner.sessions.write().await.remove(session_id);
        match removed {
            Some(session) => {
                info!(session = %session_id, "stopping console session");
                session.close();
            }
            None => debug!(session = %session_id, "stop for unknown console session"),
        }
    }

    /// Close every session
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.inner.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }

    /// Whether a session id is live
    pub async fn contains(&self, session_id: &str) -> bool {
        self.inner.sessions.read().await.contains_key(session_id)
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Whether no session is live
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// OS process id of a session's shell
    pub async fn process_id(&self, session_id: &str) -> Option<u32> {
        self.inner.sessions.read().await.get(session_id).and_then(|s| s.pid)
    }

    async fn session(&self, session_id: &str) -> Result<Arc<ConsoleSession>> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))
    }

    fn start_forwarding(&self, session: Arc<ConsoleSession>, reader: Box<dyn Read + Send>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<std::io::Result<Bytes>>();
        let thread_name = format!("console-{}", session.id);
        let spawned = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || read_pty(reader, tx));
        if let Err(e) = spawned {
            warn!(session = %session.id, "failed to start PTY reader: {}", e);
            session.close();
        }

        let inner = Arc::clone(&self.inner);
        spawn_supervised(thread_name, async move {
            loop {
                tokio::select! {
                    chunk = rx.recv() => match chunk {
                        Some(Ok(data)) => {
                            inner.emit(Outbound::console_data(&session.id, data)).await;
                        }
                        Some(Err(e)) => {
                            inner.emit(Outbound::console_error(&session.id, e.to_string())).await;
                        }
                        None => break,
                    },
                    _ = session.cancel.cancelled() => break,
                }
            }

            let exit_code = session.wait_exit().await;
            if !session.superseded.load(Ordering::Acquire) {
                inner.emit(Outbound::console_exit(&session.id, exit_code)).await;
            }
            info!(session = %session.id, exit_code, "console session ended");

            inner.remove_if_current(&session).await;
            session.release();
            session.done.send_replace(true);
        });
    }
}

impl HubInner {
    async fn emit(&self, message: Outbound) {
        if let Err(e) = self.writer.send(&message).await {
            warn!("failed to send console output: {}", e);
        }
    }

    async fn remove_if_current(&self, session: &ConsoleSession) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(&session.id).is_some_and(|s| s.serial == session.serial) {
            sessions.remove(&session.id);
        }
    }
}

impl ConsoleSession {
    fn write_input(&self, data: &[u8]) -> Result<()> {
        let mut input = self.input.lock().unwrap_or_else(|e| e.into_inner());
        let writer = input
            .as_mut()
            .ok_or_else(|| AgentError::SessionNotFound(self.id.clone()))?;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| AgentError::Process(format!("console write failed: {}", e)))
    }

    fn resize(&self, size: PtySize) -> Result<()> {
        let master = self.master.lock().unwrap_or_else(|e| e.into_inner());
        let master = master
            .as_ref()
            .ok_or_else(|| AgentError::SessionNotFound(self.id.clone()))?;
        master
            .resize(size)
            .map_err(|e| AgentError::Process(format!("console resize failed: {:#}", e)))
    }

    /// Stop the session: hang up the shell and release the PTY
    fn close(&self) {
        if !self.lifecycle.begin_close() {
            return;
        }
        self.cancel.cancel();
        if let Err(e) = self.killer.lock().unwrap_or_else(|e| e.into_inner()).kill() {
            debug!(session = %self.id, "kill after exit: {}", e);
        }
        self.drop_handles();
        self.lifecycle.finish_close();
    }

    /// Release handles after the shell exited on its own
    fn release(&self) {
        if !self.lifecycle.begin_close() {
            return;
        }
        self.cancel.cancel();
        self.drop_handles();
        self.lifecycle.finish_close();
    }

    fn drop_handles(&self) {
        self.input.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.master.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Reap the child, escalating to a hard kill if a stopped shell lingers
    async fn wait_exit(self: &Arc<Self>) -> i32 {
        let mut waited = Duration::ZERO;
        let mut escalated = false;
        loop {
            let status = self.child.lock().unwrap_or_else(|e| e.into_inner()).try_wait();
            match status {
                Ok(Some(status)) => return i32::try_from(status.exit_code()).unwrap_or(EXIT_CODE_UNAVAILABLE),
                Ok(None) => {}
                Err(e) => {
                    warn!(session = %self.id, "failed to query shell status: {}", e);
                    return EXIT_CODE_UNAVAILABLE;
                }
            }

            if self.cancel.is_cancelled() && !escalated && waited >= KILL_GRACE {
                escalated = true;
                warn!(session = %self.id, "shell ignored hangup, killing");
                // Child::kill sleeps between signals
                let session = Arc::clone(self);
                let killed = tokio::task::spawn_blocking(move || {
                    session.child.lock().unwrap_or_else(|e| e.into_inner()).kill()
                })
                .await;
                match killed {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(session = %self.id, "hard kill failed: {}", e),
                    Err(e) => warn!(session = %self.id, "hard kill task failed: {}", e),
                }
            }

            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            waited += EXIT_POLL_INTERVAL;
        }
    }

    async fn wait_done(&self, timeout: Duration) -> bool {
        let mut done = self.done.subscribe();
        tokio::time::timeout(timeout, done.wait_for(|finished| *finished))
            .await
            .is_ok_and(|result| result.is_ok())
    }
}

fn spawn_shell(shell: &[String], size: PtySize) -> anyhow::Result<SpawnedShell> {
    let (program, args) = shell
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("no shell configured"))?;

    let pair = native_pty_system().openpty(size)?;
    let mut command = CommandBuilder::new(program);
    command.args(args);
    if let Ok(cwd) = std::env::current_dir() {
        command.cwd(cwd);
    }

    let child = pair.slave.spawn_command(command)?;
    // The child holds its own copy of the slave side
    drop(pair.slave);

    let reader = pair.master.try_clone_reader()?;
    let input = pair.master.take_writer()?;

    Ok(SpawnedShell {
        master: pair.master,
        reader,
        input,
        child,
    })
}

fn read_pty(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<std::io::Result<Bytes>>) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is how Linux reports a hung-up PTY once the shell exits
                if !is_hangup(&e) {
                    let _ = tx.send(Err(e));
                }
                break;
            }
        }
    }
}

fn is_hangup(error: &std::io::Error) -> bool {
    const EIO: i32 = 5;
    cfg!(unix) && error.raw_os_error() == Some(EIO)
}
