//! Child process supervision for a JSON-RPC backend: spawn, read until exit, fail pending
//! requests, back off, respawn. Runs until the channel's lifecycle is stopped.

use super::{read_frames, RpcConnection};
use crate::channels::lifecycle::{ConnectionEvent, Lifecycle, StopWatcher};
use crate::error::ChannelError;
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::mpsc;

/// Program and arguments to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// Per-request response timeout.
    pub request_timeout: Duration,
    /// Fixed delay before respawning an exited process.
    pub restart_delay: Duration,
    /// Time allowed between the termination signal and a forced kill.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            restart_delay: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

type Connection = RpcConnection<ChildStdin>;

pub struct RpcSupervisor {
    name: String,
    command: CommandSpec,
    options: SupervisorOptions,
    lifecycle: Lifecycle,
    connection: Mutex<Option<Arc<Connection>>>,
    spawns: AtomicU64,
}

impl RpcSupervisor {
    pub fn new(
        name: impl Into<String>,
        command: CommandSpec,
        options: SupervisorOptions,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            options,
            lifecycle,
            connection: Mutex::new(None),
            spawns: AtomicU64::new(0),
        }
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    /// Number of process instances spawned so far.
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::SeqCst)
    }

    /// The live process's connection, if one is up.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_connection(&self, conn: Option<Arc<Connection>>) {
        *self.connection.lock().unwrap_or_else(|e| e.into_inner()) = conn;
    }

    /// Issue a request on the current process. Fails immediately when no process is up.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ChannelError> {
        let conn = self.connection().ok_or_else(|| {
            ChannelError::connection(format!("{} process not running", self.name))
        })?;
        conn.request(method, params).await
    }

    /// Fail every request pending on the current process.
    pub fn fail_pending(&self, make_error: impl Fn() -> ChannelError) -> usize {
        self.connection()
            .map(|c| c.pending().fail_all(make_error))
            .unwrap_or(0)
    }

    /// Supervision loop. Event payloads from the process are sent to `events`; the sender is
    /// dropped when the loop ends, which ends the consumer too.
    pub async fn run(self: Arc<Self>, events: mpsc::Sender<Value>) {
        let mut watcher = self.lifecycle.watcher();
        while watcher.is_running() {
            match self.spawn_child() {
                Ok(mut child) => {
                    self.spawns.fetch_add(1, Ordering::SeqCst);
                    self.lifecycle.transition(ConnectionEvent::Established);
                    log::info!("{}: subprocess started", self.name);
                    self.supervise(&mut child, &events, &mut watcher).await;
                    self.shutdown_child(child).await;
                }
                Err(e) => log::error!("{}: failed to spawn {}: {}", self.name, self.command.program, e),
            }
            if !watcher.is_running() {
                break;
            }
            self.lifecycle.transition(ConnectionEvent::Failed);
            log::info!(
                "{}: restarting subprocess in {:?}",
                self.name,
                self.options.restart_delay
            );
            if !watcher.sleep(self.options.restart_delay).await {
                break;
            }
            self.lifecycle.transition(ConnectionEvent::BackoffElapsed);
        }
        log::info!("{}: supervisor stopped", self.name);
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    /// Wire up one process instance and read its output until EOF or stop.
    async fn supervise(
        &self,
        child: &mut Child,
        events: &mpsc::Sender<Value>,
        watcher: &mut StopWatcher,
    ) {
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            log::error!("{}: subprocess stdio not captured", self.name);
            return;
        };
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(self.name.clone(), stderr)));

        let conn = Arc::new(RpcConnection::new(stdin, self.options.request_timeout));
        self.set_connection(Some(conn.clone()));

        tokio::select! {
            res = read_frames(&self.name, BufReader::new(stdout), conn.pending(), events) => {
                match res {
                    Ok(()) => log::warn!("{}: subprocess stdout closed", self.name),
                    Err(e) => log::warn!("{}: reading subprocess output failed: {}", self.name, e),
                }
            }
            _ = watcher.stopped() => {}
        }

        self.set_connection(None);
        let name = self.name.clone();
        let failed = conn
            .pending()
            .fail_all(|| ChannelError::ProcessExited(format!("{} process exited", name)));
        if failed > 0 {
            log::warn!("{}: failed {} pending request(s)", self.name, failed);
        }
        conn.close().await;
        if let Some(task) = stderr_task {
            task.abort();
        }
    }

    /// Terminate (if still alive), wait out the grace period, then force kill.
    async fn shutdown_child(&self, mut child: Child) {
        if matches!(child.try_wait(), Ok(None)) {
            terminate(&mut child);
        }
        match tokio::time::timeout(self.options.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => log::debug!("{}: subprocess exited with {}", self.name, status),
            Ok(Err(e)) => log::warn!("{}: waiting for subprocess failed: {}", self.name, e),
            Err(_) => {
                log::warn!("{}: subprocess did not exit, killing", self.name);
                let _ = child.kill().await;
            }
        }
    }
}

/// Send SIGTERM. `id()` is `None` once the child has been reaped, and an unreaped child
/// keeps its pid, so the signal cannot reach a recycled process.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        log::debug!("SIGTERM to {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

async fn drain_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if !line.is_empty() {
            log::debug!("{}: {}", name, line);
        }
    }
}
