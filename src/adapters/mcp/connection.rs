use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::framing::LineDecoder;
use super::protocol::{parse_response_line, InitializeParams, JsonRpcRequest, JsonRpcResponse};
use crate::core::error::{ToolError, TransportError};

const STDERR_LIMIT: usize = 16 * 1024;
const STDERR_DRAIN_GRACE: Duration = Duration::from_millis(250);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<JsonRpcResponse, TransportError>>>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderCommand {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl ProviderCommand {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::default()
        }
    }
}

/// A request written to the provider whose response has not been awaited yet.
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Result<JsonRpcResponse, TransportError>>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// One live provider process speaking newline-delimited JSON-RPC on stdio.
///
/// Request ids are allocated monotonically per connection and every response
/// is routed to its waiter by id, so an early or late `initialize` ack can
/// never be mistaken for a call result.
pub struct ProviderConnection {
    name: String,
    child: tokio::sync::Mutex<Child>,
    /// Process group led by the provider; wrappers like `sh -c` or `npx`
    /// leave their workers in it.
    process_group: Option<u32>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    stderr: Arc<Mutex<String>>,
    reader: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn append_stderr(buffer: &Mutex<String>, chunk: &[u8]) {
    let mut stderr = lock(buffer);
    stderr.push_str(&String::from_utf8_lossy(chunk));
    if stderr.len() > STDERR_LIMIT {
        let mut cut = stderr.len() - STDERR_LIMIT;
        while !stderr.is_char_boundary(cut) {
            cut += 1;
        }
        stderr.drain(..cut);
    }
}

fn fail_pending(pending: &PendingMap, stderr: &Mutex<String>) {
    let waiters: Vec<_> = lock(pending).drain().map(|(_, tx)| tx).collect();
    if waiters.is_empty() {
        return;
    }
    let stderr = lock(stderr).clone();
    for tx in waiters {
        let _ = tx.send(Err(TransportError::Exited {
            stderr: stderr.clone(),
        }));
    }
}

fn dispatch_line(name: &str, line: &str, pending: &PendingMap) {
    match parse_response_line(line) {
        Some(response) => {
            let Some(id) = response.id else {
                return;
            };
            match lock(pending).remove(&id) {
                Some(tx) => {
                    let _ = tx.send(Ok(response));
                }
                None => log::debug!("[{name}] dropping response for unknown id {id}"),
            }
        }
        None => log::debug!("[{name}] stdout: {line}"),
    }
}

impl ProviderConnection {
    pub fn spawn(name: &str, launch: &ProviderCommand) -> Result<Self, TransportError> {
        let mut cmd = Command::new(&launch.command);
        cmd.args(&launch.args)
            .envs(&launch.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &launch.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            command: launch.command.clone(),
            source,
        })?;
        let process_group = if cfg!(unix) { child.id() } else { None };

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Protocol("provider stdin unavailable".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Protocol("provider stdout unavailable".to_string()))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Protocol("provider stderr unavailable".to_string()))?;

        let stderr = Arc::new(Mutex::new(String::new()));
        let stderr_writer = Arc::clone(&stderr);
        let stderr_task = tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match stderr_pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => append_stderr(&stderr_writer, &chunk[..n]),
                }
            }
        });

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let pending_reader = Arc::clone(&pending);
        let alive_reader = Arc::clone(&alive);
        let stderr_reader = Arc::clone(&stderr);
        let reader_name = name.to_string();
        let reader = tokio::spawn(async move {
            let mut decoder = LineDecoder::new();
            let mut chunk = [0u8; 8192];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in decoder.push(&chunk[..n]) {
                            dispatch_line(&reader_name, &line, &pending_reader);
                        }
                    }
                    Err(e) => {
                        log::warn!("[{reader_name}] stdout read error: {e}");
                        break;
                    }
                }
            }
            if let Some(line) = decoder.finish() {
                dispatch_line(&reader_name, &line, &pending_reader);
            }

            alive_reader.store(false, Ordering::SeqCst);
            // Let the stderr pipe drain so waiters see why the process died.
            let _ = tokio::time::timeout(STDERR_DRAIN_GRACE, stderr_task).await;
            fail_pending(&pending_reader, &stderr_reader);
        });

        Ok(Self {
            name: name.to_string(),
            child: tokio::sync::Mutex::new(child),
            process_group,
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            stderr,
            reader,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn stderr_tail(&self) -> String {
        lock(&self.stderr).clone()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.id()
    }

    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<PendingCall, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Exited {
                stderr: self.stderr_tail(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = JsonRpcRequest::new(id, method, params)
            .to_line()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            lock(&self.pending).remove(&id);
            return Err(if self.is_alive() {
                TransportError::Io(e)
            } else {
                TransportError::Exited {
                    stderr: self.stderr_tail(),
                }
            });
        }

        Ok(PendingCall { id, rx })
    }

    /// Writes `initialize`; the ack is collected later through the returned
    /// handle so the next request does not have to wait for it.
    pub async fn send_initialize(&self) -> Result<PendingCall, TransportError> {
        let params = serde_json::to_value(InitializeParams::default())
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.send("initialize", Some(params)).await
    }

    pub async fn recv(&self, call: PendingCall) -> Result<Value, ToolError> {
        let PendingCall { id, rx } = call;
        match rx.await {
            Ok(Ok(response)) => response
                .into_result()
                .map_err(|error| ToolError::Execution(error.message)),
            Ok(Err(transport)) => Err(ToolError::Transport(transport)),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(ToolError::Transport(TransportError::Closed))
            }
        }
    }

    pub async fn recv_handshake(&self, call: PendingCall) -> Result<(), ToolError> {
        match self.recv(call).await {
            Ok(_) => Ok(()),
            Err(ToolError::Execution(message)) => {
                Err(ToolError::Transport(TransportError::Handshake(message)))
            }
            Err(other) => Err(other),
        }
    }

    /// Kills the provider's whole process group and fails every in-flight
    /// call.
    pub async fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.kill_process_group();
        {
            let mut child = self.child.lock().await;
            if let Err(e) = child.kill().await {
                log::debug!("[{}] kill failed: {e}", self.name);
            }
        }
        fail_pending(&self.pending, &self.stderr);
    }

    #[cfg(unix)]
    fn kill_process_group(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pgid) = self.process_group.and_then(|id| i32::try_from(id).ok()) else {
            return;
        };
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => log::debug!("[{}] killpg {pgid} failed: {e}", self.name),
        }
    }

    #[cfg(not(unix))]
    fn kill_process_group(&self) {}

    pub fn timeout_error(&self, after: Duration) -> ToolError {
        ToolError::Timeout {
            after,
            stderr: self.stderr_tail(),
        }
    }
}

impl Drop for ProviderConnection {
    fn drop(&mut self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.kill_process_group();
        }
        self.reader.abort();
    }
}
