//! Stdio transport — request/response correlation over a child
//! process's standard streams.
//!
//! One JSON message per newline-terminated line. Outstanding requests
//! are correlated by id, never by arrival order, so the server may
//! answer out of order. Each call carries its own timeout. Process
//! exit rejects everything still pending and is reported exactly once
//! on the event channel; the error stream is surfaced as diagnostics
//! and never parsed as protocol data.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;

use tether_domain::config::ToolServerConfig;

use crate::protocol::{WireMessage, WireRequest};

/// Default per-request timeout, overridable per server and per call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period between closing stdin and force-killing on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tool server process exited with code {code}")]
    Exited { code: i32 },

    #[error("timed out after {}s waiting for {method} response", timeout.as_secs())]
    Timeout { method: String, timeout: Duration },

    #[error("{0}")]
    Rpc(crate::protocol::WireError),
}

/// Out-of-band events surfaced by a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A message that matched no pending request.
    Notification(WireMessage),
    /// A line the server wrote to its error stream.
    Stderr(String),
    /// The process terminated. Emitted exactly once per transport.
    Exit { code: i32 },
}

type ResponseSlot = oneshot::Sender<Result<Value, TransportError>>;

/// Pending requests plus the exit flag, behind one lock so that
/// reject-all-on-exit is atomic with respect to new calls.
#[derive(Default)]
struct PendingTable {
    exited: Option<i32>,
    slots: HashMap<String, ResponseSlot>,
}

struct Inner {
    server_name: String,
    pending: parking_lot::Mutex<PendingTable>,
    events: mpsc::UnboundedSender<TransportEvent>,
    exited_tx: watch::Sender<Option<i32>>,
}

impl Inner {
    /// Record the exit and reject everything pending. The first caller
    /// wins; the second stream closing later is a no-op.
    fn finalize_exit(&self, code: i32) {
        let slots = {
            let mut pending = self.pending.lock();
            if pending.exited.is_some() {
                return;
            }
            pending.exited = Some(code);
            std::mem::take(&mut pending.slots)
        };
        for slot in slots.into_values() {
            let _ = slot.send(Err(TransportError::Exited { code }));
        }
        tracing::debug!(server = %self.server_name, code, "tool server transport closed");
        let _ = self.events.send(TransportEvent::Exit { code });
        let _ = self.exited_tx.send(Some(code));
    }

    fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let msg: WireMessage = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(e) => {
                // Tolerate servers that log to stdout: drop the line,
                // keep the stream.
                tracing::debug!(
                    server = %self.server_name,
                    error = %e,
                    line = %line,
                    "dropping unparseable line from tool server stdout"
                );
                return;
            }
        };

        let slot = msg
            .id
            .as_ref()
            .and_then(|id| self.pending.lock().slots.remove(id));
        match slot {
            Some(slot) => {
                let outcome = match msg.error {
                    Some(err) => Err(TransportError::Rpc(err)),
                    None => Ok(msg.result.unwrap_or(Value::Null)),
                };
                let _ = slot.send(outcome);
            }
            None => {
                let _ = self.events.send(TransportEvent::Notification(msg));
            }
        }
    }
}

/// A live connection to one tool-server subprocess.
///
/// Supports overlapping in-flight calls on the same connection; the id
/// is the only correlation mechanism.
pub struct StdioTransport {
    inner: Arc<Inner>,
    stdin: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    kill: CancellationToken,
    exited_rx: watch::Receiver<Option<i32>>,
    default_timeout: Duration,
}

impl StdioTransport {
    /// Spawn the configured subprocess and connect a transport over its
    /// standard streams. The config's env entries are overlaid on the
    /// ambient environment.
    pub fn spawn(
        name: &str,
        config: &ToolServerConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(TransportError::Io)?;
        let stdin = child.stdin.take().ok_or_else(|| pipe_error("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_error("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| pipe_error("stderr"))?;

        let timeout = config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        // The exit watcher below reports the real exit code, so reader
        // EOF alone must not finalize.
        let (transport, events, reader_done) =
            Self::build(name, Box::new(stdin), Box::new(stdout), timeout, false);

        // stderr is diagnostics only.
        let inner = transport.inner.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %inner.server_name, line = %line, "tool server stderr");
                let _ = inner.events.send(TransportEvent::Stderr(line));
            }
        });

        // The exit watcher owns the child; the kill token lets
        // shutdown() force-terminate without a handle to the process.
        let inner = transport.inner.clone();
        let kill = transport.kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
            // Let the reader drain responses still buffered in the pipe
            // before rejecting what is pending.
            let _ = tokio::time::timeout(Duration::from_secs(1), reader_done).await;
            inner.finalize_exit(code);
        });

        Ok((transport, events))
    }

    /// Connect a transport over arbitrary stream halves — no process
    /// attached. Reader EOF counts as an exit with code 0. Used by
    /// tests and in-memory tool servers.
    pub fn from_io<W, R>(
        name: &str,
        writer: W,
        reader: R,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (transport, events, _reader_done) = Self::build(
            name,
            Box::new(writer),
            Box::new(reader),
            DEFAULT_REQUEST_TIMEOUT,
            true,
        );
        (transport, events)
    }

    fn build(
        name: &str,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        default_timeout: Duration,
        finalize_on_eof: bool,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<TransportEvent>,
        oneshot::Receiver<()>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = watch::channel(None);
        let (reader_done_tx, reader_done_rx) = oneshot::channel();
        let inner = Arc::new(Inner {
            server_name: name.to_string(),
            pending: parking_lot::Mutex::new(PendingTable::default()),
            events: events_tx,
            exited_tx,
        });

        let reader_inner = inner.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => reader_inner.handle_line(&line),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(
                            server = %reader_inner.server_name,
                            error = %e,
                            "error reading tool server stdout"
                        );
                        break;
                    }
                }
            }
            if finalize_on_eof {
                reader_inner.finalize_exit(0);
            }
            let _ = reader_done_tx.send(());
        });

        let transport = Arc::new(Self {
            inner,
            stdin: Mutex::new(Some(writer)),
            kill: CancellationToken::new(),
            exited_rx,
            default_timeout,
        });
        (transport, events_rx, reader_done_rx)
    }

    /// Send one request and await its response.
    ///
    /// `timeout` of `None` uses the transport default. On timeout the
    /// slot is freed and the transport stays usable; once the process
    /// has exited every call fails fast.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, TransportError> {
        let id = uuid::Uuid::new_v4().to_string();
        let req = WireRequest::new(id.clone(), method, params);
        let json = serde_json::to_string(&req)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if let Some(code) = pending.exited {
                return Err(TransportError::Exited { code });
            }
            pending.slots.insert(id.clone(), tx);
        }

        tracing::debug!(server = %self.inner.server_name, %method, id = %id, "sending request");
        if let Err(e) = self.write_line(&json).await {
            self.inner.pending.lock().slots.remove(&id);
            return Err(e);
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                // Slot dropped without a value; only happens around exit.
                let code = self.inner.pending.lock().exited.unwrap_or(-1);
                Err(TransportError::Exited { code })
            }
            Err(_) => {
                self.inner.pending.lock().slots.remove(&id);
                tracing::warn!(
                    server = %self.inner.server_name,
                    %method,
                    secs = timeout.as_secs(),
                    "request timed out"
                );
                Err(TransportError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Whether the underlying process (or stream) is still up.
    pub fn is_alive(&self) -> bool {
        self.inner.pending.lock().exited.is_none()
    }

    /// Graceful shutdown: close stdin, give the process the grace
    /// period to exit on its own, then force-kill.
    pub async fn shutdown(&self) {
        {
            let mut stdin = self.stdin.lock().await;
            if let Some(mut writer) = stdin.take() {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!(
                        server = %self.inner.server_name,
                        error = %e,
                        "error closing tool server stdin"
                    );
                }
            }
        }
        if self.wait_exited(SHUTDOWN_GRACE).await {
            return;
        }
        tracing::warn!(
            server = %self.inner.server_name,
            "tool server did not exit within grace period, killing"
        );
        self.kill.cancel();
        self.wait_exited(Duration::from_secs(2)).await;
    }

    async fn wait_exited(&self, timeout: Duration) -> bool {
        let mut rx = self.exited_rx.clone();
        if rx.borrow().is_some() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while rx.changed().await.is_ok() {
                if rx.borrow().is_some() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        let mut stdin = self.stdin.lock().await;
        let Some(writer) = stdin.as_mut() else {
            let code = self.inner.pending.lock().exited.unwrap_or(-1);
            return Err(TransportError::Exited { code });
        };
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

fn pipe_error(stream: &str) -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("failed to capture child {stream}"),
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
