use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::{Client as HttpClient, ClientBuilder, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::snapshot::Snapshot;
use crate::telemetry::HttpStats;

/// Server snapshot together with the server clock at the time it was taken.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerState {
    pub timestamp: i64,
    #[serde(rename = "files")]
    pub snapshot: Snapshot,
}

/// Acknowledgement returned by every mutating call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Ack {
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
struct PathPair<'a> {
    src: &'a str,
    dst: &'a str,
}

#[derive(Clone)]
pub struct ApiClient {
    base: String,
    http: HttpClient,
    stats: Arc<HttpStats>,
}

impl ApiClient {
    pub fn new(
        base: &str,
        auth_token: Option<&str>,
        timeout: Duration,
        stats: Arc<HttpStats>,
    ) -> Result<Self> {
        let mut builder = ClientBuilder::new()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("treesync/", env!("CARGO_PKG_VERSION")))
            .no_proxy();

        if let Some(token) = auth_token {
            builder = builder.default_headers({
                let mut h = reqwest::header::HeaderMap::new();
                let value = format!("Bearer {token}");
                h.insert(
                    reqwest::header::AUTHORIZATION,
                    reqwest::header::HeaderValue::from_str(&value)?,
                );
                h
            });
        }

        let http = builder.build()?;
        Ok(ApiClient {
            base: base.trim_end_matches('/').to_string(),
            http,
            stats,
        })
    }

    pub async fn get_server_state(&self) -> Result<ServerState> {
        let url = format!("{}/api/v1/snapshot", self.base);
        let resp = self.http.get(url).send().await?;
        map_error(resp, "snapshot").await
    }

    pub async fn upload(&self, path: &str, local: &Path) -> Result<Ack> {
        let req = self.http.post(self.files_url()).query(&[("path", path)]);
        self.send_file(req, local, "upload").await
    }

    pub async fn modify(&self, path: &str, local: &Path) -> Result<Ack> {
        let req = self.http.put(self.files_url()).query(&[("path", path)]);
        self.send_file(req, local, "modify").await
    }

    pub async fn delete(&self, path: &str) -> Result<Ack> {
        let resp = self
            .http
            .delete(self.files_url())
            .query(&[("path", path)])
            .send()
            .await?;
        map_error(resp, "delete").await
    }

    pub async fn copy_path(&self, src: &str, dst: &str) -> Result<Ack> {
        self.send_pair("copy", src, dst).await
    }

    pub async fn move_path(&self, src: &str, dst: &str) -> Result<Ack> {
        self.send_pair("move", src, dst).await
    }

    /// Stream the server's copy of `path` into a hidden temp file next to
    /// `dest`. The caller renames it into place.
    pub async fn download_to_temp(&self, path: &str, dest: &Path) -> Result<PathBuf> {
        let resp = self
            .http
            .get(self.files_url())
            .query(&[("path", path)])
            .send()
            .await?;
        let resp = check_status(resp, "download").await?;

        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
        let tmp = download_temp_path(dest);

        let written = self.stream_into(resp, &tmp).await;
        if written.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        written?;
        Ok(tmp)
    }

    async fn stream_into(&self, resp: Response, tmp: &Path) -> Result<()> {
        let mut file = tokio::fs::File::create(tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("download body")?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("write {}", tmp.display()))?;
            self.stats.on_recv(chunk.len() as i64);
        }
        file.flush().await?;
        Ok(())
    }

    async fn send_file(&self, req: RequestBuilder, local: &Path, op: &str) -> Result<Ack> {
        let form = reqwest::multipart::Form::new()
            .file("file", local)
            .await
            .with_context(|| format!("open {}", local.display()))?;
        let resp = req.multipart(form).send().await?;
        if let Ok(meta) = std::fs::metadata(local) {
            self.stats.on_send(meta.len() as i64);
        }
        map_error(resp, op).await
    }

    async fn send_pair(&self, op: &str, src: &str, dst: &str) -> Result<Ack> {
        let url = format!("{}/api/v1/files/{op}", self.base);
        let resp = self
            .http
            .post(url)
            .json(&PathPair { src, dst })
            .send()
            .await?;
        map_error(resp, op).await
    }

    fn files_url(&self) -> String {
        format!("{}/api/v1/files", self.base)
    }
}

/// `.<name>.tmp-<uuid>` beside `dest`; matched by the default ignore rules.
pub fn download_temp_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    dest.with_file_name(format!(".{name}.tmp-{}", uuid::Uuid::new_v4()))
}

async fn map_error<T: for<'de> Deserialize<'de>>(resp: Response, op: &str) -> Result<T> {
    let resp = check_status(resp, op).await?;
    let val = resp
        .json::<T>()
        .await
        .with_context(|| format!("{op} response"))?;
    Ok(val)
}

async fn check_status(resp: Response, op: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => anyhow::bail!("{op} unauthorized: {text}"),
        StatusCode::FORBIDDEN => anyhow::bail!("{op} forbidden: {text}"),
        StatusCode::NOT_FOUND => anyhow::bail!("{op} not found: {text}"),
        _ => anyhow::bail!("{op} failed: {status} {text}"),
    }
}
