// One request and one response per connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use crate::sync::{with_engine, SharedEngine};
use crate::telemetry::{HttpStats, SyncStats};

pub const MAX_REQUEST_BYTES: usize = 64 * 1024;
const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTooLarge {
    pub len: usize,
    pub max: usize,
}

impl std::fmt::Display for RequestTooLarge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request of {} bytes exceeds limit of {}", self.len, self.max)
    }
}

impl std::error::Error for RequestTooLarge {}

/// On the wire a request is a single-key object, `{"<command>": <args>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct CommandRequest {
    pub command: String,
    pub args: Value,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Value::Null,
        }
    }
}

impl TryFrom<Map<String, Value>> for CommandRequest {
    type Error = String;

    fn try_from(map: Map<String, Value>) -> std::result::Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!("expected exactly one command, got {}", map.len()));
        }
        let Some((command, args)) = map.into_iter().next() else {
            return Err("empty request".to_string());
        };
        Ok(Self { command, args })
    }
}

impl From<CommandRequest> for Map<String, Value> {
    fn from(req: CommandRequest) -> Self {
        let mut map = Map::new();
        map.insert(req.command, req.args);
        map
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub message: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FilesArgs {
    #[serde(default)]
    prefix: Option<String>,
}

/// 4-byte big-endian length, then that many bytes of JSON.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).context("frame too long")?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > max {
        return Err(RequestTooLarge { len, max }.into());
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

struct ControlState {
    engine: SharedEngine,
    stats: Arc<SyncStats>,
    http_stats: Arc<HttpStats>,
    sync_now: Notify,
    shutdown: Option<Arc<Notify>>,
    timeout: Duration,
    started_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ControlPlane {
    state: Arc<ControlState>,
}

/// Bound listener; the socket file is removed when this is dropped.
pub struct ControlSocket {
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
    path: PathBuf,
}

impl ControlSocket {
    /// Bind at `path`, replacing a stale socket file left by a previous run.
    pub fn bind(path: &Path) -> Result<Self> {
        #[cfg(unix)]
        {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("remove {}", path.display()));
                }
            }
            let listener = tokio::net::UnixListener::bind(path)
                .with_context(|| format!("bind command socket {}", path.display()))?;
            Ok(Self {
                listener,
                path: path.to_path_buf(),
            })
        }
        #[cfg(not(unix))]
        {
            anyhow::bail!(
                "command socket {} needs unix domain sockets, unsupported on this platform",
                path.display()
            )
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl ControlPlane {
    pub fn new(
        engine: SharedEngine,
        stats: Arc<SyncStats>,
        http_stats: Arc<HttpStats>,
        timeout: Duration,
        shutdown: Option<Arc<Notify>>,
    ) -> Self {
        Self {
            state: Arc::new(ControlState {
                engine,
                stats,
                http_stats,
                sync_now: Notify::new(),
                shutdown,
                timeout,
                started_at: Utc::now(),
            }),
        }
    }

    pub async fn wait_sync_now(&self) {
        self.state.sync_now.notified().await;
    }

    /// Accept connections until the listener fails.
    pub async fn serve(&self, socket: ControlSocket) -> Result<()> {
        #[cfg(unix)]
        {
            crate::logging::info_kv(
                "command socket listening",
                &[("path", &socket.path().display().to_string())],
            );
            loop {
                let (stream, _) = socket
                    .listener
                    .accept()
                    .await
                    .context("accept command connection")?;
                let plane = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = plane.handle_connection(stream).await {
                        crate::logging::warn(format!("command connection error: {err:#}"));
                    }
                });
            }
        }
        #[cfg(not(unix))]
        {
            let _ = socket;
            anyhow::bail!("command socket unsupported on this platform")
        }
    }

    async fn handle_connection<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let timeout = self.state.timeout;
        let read = tokio::time::timeout(timeout, read_frame(&mut stream, MAX_REQUEST_BYTES)).await;
        let mut stop_after_reply = false;
        let response = match read {
            Err(_) => CommandResponse::error("timed out reading request"),
            Ok(Err(err)) => {
                if let Some(too_large) = err.downcast_ref::<RequestTooLarge>() {
                    CommandResponse::error(too_large.to_string())
                } else if is_disconnect(&err) {
                    return Ok(());
                } else {
                    CommandResponse::error(format!("read request: {err:#}"))
                }
            }
            Ok(Ok(bytes)) => match serde_json::from_slice::<CommandRequest>(&bytes) {
                Ok(req) => {
                    stop_after_reply = req.command == "stop";
                    self.dispatch(req).await
                }
                Err(err) => CommandResponse::error(format!("malformed request: {err}")),
            },
        };

        let payload = serde_json::to_vec(&response)?;
        tokio::time::timeout(timeout, write_frame(&mut stream, &payload))
            .await
            .context("timed out writing response")??;
        if stop_after_reply && !response.error {
            self.request_stop();
        }
        Ok(())
    }

    /// Wake the daemon's shutdown waiter, if this plane was given one.
    pub fn request_stop(&self) {
        if let Some(shutdown) = &self.state.shutdown {
            crate::logging::info("stop requested over command socket");
            shutdown.notify_one();
        }
    }

    pub async fn dispatch(&self, req: CommandRequest) -> CommandResponse {
        let result = match req.command.as_str() {
            "status" => self.status().await,
            "sync_now" => {
                self.state.sync_now.notify_one();
                Ok("sync requested".to_string())
            }
            "files" => self.files(req.args).await,
            // The shutdown itself fires once the reply is on the wire.
            "stop" => match &self.state.shutdown {
                Some(_) => Ok("stopping".to_string()),
                None => Err(anyhow::anyhow!("stop is not available")),
            },
            other => Err(anyhow::anyhow!("unknown command: {other}")),
        };
        match result {
            Ok(message) => CommandResponse::ok(message),
            Err(err) => CommandResponse::error(format!("{err:#}")),
        }
    }

    async fn status(&self) -> Result<String> {
        let (tracked, state) = with_engine(&self.state.engine, |e| {
            Ok((e.snapshot().len(), e.state().clone()))
        })
        .await?;
        let stats = self.state.stats.snapshot();
        Ok(format!(
            "tracked_files={} last_timestamp={} global_md5={}\nstarted_at={} bytes_sent={} bytes_recv={}\n{}",
            tracked,
            state.last_timestamp,
            state.global_md5,
            self.state.started_at.to_rfc3339(),
            self.state.http_stats.bytes_sent(),
            self.state.http_stats.bytes_recv(),
            stats.render()
        ))
    }

    async fn files(&self, args: Value) -> Result<String> {
        let args: FilesArgs = if args.is_null() {
            FilesArgs::default()
        } else {
            serde_json::from_value(args).context("files args")?
        };
        let paths = with_engine(&self.state.engine, move |e| {
            Ok(e.snapshot()
                .sorted()
                .into_iter()
                .map(|(p, _)| p.to_string())
                .filter(|p| match args.prefix.as_deref() {
                    Some(prefix) => p.starts_with(prefix),
                    None => true,
                })
                .collect::<Vec<_>>())
        })
        .await?;
        Ok(paths.join("\n"))
    }
}

fn is_disconnect(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .map(|e| e.kind() == std::io::ErrorKind::UnexpectedEof)
        .unwrap_or(false)
}

/// Send one request to a running daemon and wait for its reply.
pub async fn send_command(
    socket_path: &Path,
    request: &CommandRequest,
    timeout: Duration,
) -> Result<CommandResponse> {
    #[cfg(unix)]
    {
        let exchange = async {
            let mut stream = tokio::net::UnixStream::connect(socket_path)
                .await
                .with_context(|| format!("connect {}", socket_path.display()))?;
            let payload = serde_json::to_vec(request)?;
            write_frame(&mut stream, &payload).await?;
            let reply = read_frame(&mut stream, MAX_RESPONSE_BYTES).await?;
            let response: CommandResponse =
                serde_json::from_slice(&reply).context("decode response")?;
            Ok::<_, anyhow::Error>(response)
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .with_context(|| format!("timed out talking to {}", socket_path.display()))?
    }
    #[cfg(not(unix))]
    {
        let _ = (request, timeout);
        anyhow::bail!(
            "command socket {} unsupported on this platform",
            socket_path.display()
        )
    }
}
