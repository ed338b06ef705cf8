//! Docker Engine API image service
//!
//! Speaks the Engine HTTP API directly over the daemon socket (unix or
//! TCP). Pull progress arrives as NDJSON and is decoded into
//! [`PullProgress`] events; an in-stream `error` field terminates the
//! stream. Short metadata operations (list, remove) are bounded by a
//! fixed deadline; the pull itself is bounded only by the caller's
//! progress watchdog.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE as BASE64_URL;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use kindling_common::{Error, Result};

use super::{parse_registry, ImageInfo, ImageService, ProgressStream, PullProgress};
use crate::creds::RegistryAuth;

/// Default Docker Engine endpoint
pub const DEFAULT_RUNTIME_ENDPOINT: &str = "unix:///var/run/docker.sock";

/// Deadline for short metadata operations. Slightly offset from two
/// minutes so timeouts due to this constant are recognizable.
const SHORT_OP_TIMEOUT: Duration = Duration::from_secs(119);

enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

/// Docker Engine implementation of [`ImageService`]
pub struct DockerImageService {
    endpoint: Endpoint,
}

impl DockerImageService {
    /// Create a service for a `unix://`, `tcp://`, or `http://` endpoint
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = if let Some(path) = endpoint.strip_prefix("unix://") {
            Endpoint::Unix(PathBuf::from(path))
        } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
            Endpoint::Tcp(addr.to_string())
        } else if let Some(addr) = endpoint.strip_prefix("http://") {
            Endpoint::Tcp(addr.to_string())
        } else {
            return Err(Error::config(format!(
                "unsupported runtime endpoint: {} (expected unix:// or tcp://)",
                endpoint
            )));
        };
        Ok(Self { endpoint })
    }

    fn build_request(
        &self,
        method: &str,
        path_and_query: &str,
        auth_header: Option<String>,
    ) -> Result<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path_and_query)
            .header(hyper::header::HOST, "docker");
        if let Some(auth) = auth_header {
            builder = builder.header("X-Registry-Auth", auth);
        }
        builder
            .body(Full::new(Bytes::new()))
            .map_err(|e| Error::internal("docker", e.to_string()))
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        match &self.endpoint {
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await.map_err(|e| {
                    Error::runtime("connect", format!("{}: {}", path.display(), e))
                })?;
                send_over(stream, request).await
            }
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr)
                    .await
                    .map_err(|e| Error::runtime("connect", format!("{}: {}", addr, e)))?;
                send_over(stream, request).await
            }
        }
    }
}

#[async_trait]
impl ImageService for DockerImageService {
    async fn pull(&self, image_ref: &str, auth: Option<RegistryAuth>) -> Result<ProgressStream> {
        let path = format!("/images/create?fromImage={}", image_ref);
        let auth_header = auth
            .as_ref()
            .map(|a| registry_auth_header(a, parse_registry(image_ref)));

        let response = self.send(self.build_request("POST", &path, auth_header)?).await?;
        let status = response.status();
        if !status.is_success() {
            let body = read_body(response).await.unwrap_or_default();
            return Err(Error::runtime(
                "pull",
                format!("status {}: {}", status, String::from_utf8_lossy(&body).trim()),
            ));
        }
        Ok(progress_stream(response.into_body()))
    }

    async fn list(&self) -> Result<Vec<ImageInfo>> {
        let request = self.build_request("GET", "/images/json?all=1", None)?;
        let response = tokio::time::timeout(SHORT_OP_TIMEOUT, self.send(request))
            .await
            .map_err(|_| Error::runtime("list", "operation timeout"))??;
        let status = response.status();
        let body = tokio::time::timeout(SHORT_OP_TIMEOUT, read_body(response))
            .await
            .map_err(|_| Error::runtime("list", "operation timeout"))??;
        if !status.is_success() {
            return Err(Error::runtime(
                "list",
                format!("status {}: {}", status, String::from_utf8_lossy(&body).trim()),
            ));
        }
        let summaries: Vec<ImageSummary> = serde_json::from_slice(&body)
            .map_err(|e| Error::serialization(format!("invalid image list: {}", e)))?;
        Ok(summaries.into_iter().map(ImageInfo::from).collect())
    }

    async fn remove(&self, image_ref: &str) -> Result<()> {
        let path = format!("/images/{}?force=1", image_ref);
        let request = self.build_request("DELETE", &path, None)?;
        let response = tokio::time::timeout(SHORT_OP_TIMEOUT, self.send(request))
            .await
            .map_err(|_| Error::runtime("remove", "operation timeout"))??;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::runtime(
                "remove",
                format!("no such image: {}", image_ref),
            ));
        }
        if !status.is_success() {
            let body = read_body(response).await.unwrap_or_default();
            return Err(Error::runtime(
                "remove",
                format!("status {}: {}", status, String::from_utf8_lossy(&body).trim()),
            ));
        }
        Ok(())
    }
}

async fn send_over<T>(stream: T, request: Request<Full<Bytes>>) -> Result<Response<Incoming>>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| Error::runtime("handshake", e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "runtime connection closed");
        }
    });
    sender
        .send_request(request)
        .await
        .map_err(|e| Error::runtime("request", e.to_string()))
}

async fn read_body(response: Response<Incoming>) -> Result<Bytes> {
    let collected = response
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::runtime("read", e.to_string()))?;
    Ok(collected.to_bytes())
}

/// Turn the streaming NDJSON pull body into a [`ProgressStream`].
///
/// Dropping the returned stream drops the body and with it the daemon
/// connection, which is how a cancelled pull aborts the transfer.
fn progress_stream(mut body: Incoming) -> ProgressStream {
    let (tx, rx) = mpsc::channel::<Result<PullProgress>>(16);
    tokio::spawn(async move {
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            match body.frame().await {
                None => break,
                Some(Err(e)) => {
                    let _ = tx.send(Err(Error::runtime("pull", e.to_string()))).await;
                    return;
                }
                Some(Ok(frame)) => {
                    let Some(data) = frame.data_ref() else { continue };
                    buffer.extend_from_slice(data);
                    while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=newline).collect();
                        if !forward_line(&tx, &line).await {
                            return;
                        }
                    }
                }
            }
        }
        if !buffer.is_empty() {
            let trailing = buffer.clone();
            let _ = forward_line(&tx, &trailing).await;
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

/// Decode and forward one NDJSON line; false stops the decoder task
async fn forward_line(tx: &mpsc::Sender<Result<PullProgress>>, line: &[u8]) -> bool {
    match decode_progress_line(line) {
        Ok(None) => true,
        Ok(Some(event)) => tx.send(Ok(event)).await.is_ok(),
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            false
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PullMessage {
    status: Option<String>,
    id: Option<String>,
    progress: Option<String>,
    error: Option<String>,
}

/// Decode one NDJSON progress line; blank lines yield None, an `error`
/// field yields the terminal pull error
fn decode_progress_line(line: &[u8]) -> Result<Option<PullProgress>> {
    let text = std::str::from_utf8(line)
        .map_err(|e| Error::serialization(format!("invalid pull progress: {}", e)))?
        .trim();
    if text.is_empty() {
        return Ok(None);
    }
    let message: PullMessage = serde_json::from_str(text)
        .map_err(|e| Error::serialization(format!("invalid pull progress: {}", e)))?;
    if let Some(error) = message.error {
        return Err(Error::runtime("pull", error));
    }
    Ok(Some(PullProgress {
        id: message.id,
        status: message.status.unwrap_or_default(),
        detail: message.progress,
    }))
}

/// `X-Registry-Auth` header value: base64url of the auth config JSON
fn registry_auth_header(auth: &RegistryAuth, registry: &str) -> String {
    let payload = serde_json::json!({
        "username": auth.username,
        "password": auth.password,
        "serveraddress": registry,
    });
    BASE64_URL.encode(payload.to_string())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ImageSummary {
    id: String,
    repo_tags: Option<Vec<String>>,
    repo_digests: Option<Vec<String>>,
    size: i64,
}

impl From<ImageSummary> for ImageInfo {
    fn from(summary: ImageSummary) -> Self {
        ImageInfo {
            id: summary.id,
            repo_tags: summary.repo_tags.unwrap_or_default(),
            repo_digests: summary.repo_digests.unwrap_or_default(),
            size: summary.size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert!(DockerImageService::new("unix:///var/run/docker.sock").is_ok());
        assert!(DockerImageService::new("tcp://127.0.0.1:2375").is_ok());
        assert!(DockerImageService::new("http://127.0.0.1:2375").is_ok());
        assert!(DockerImageService::new("ssh://host").is_err());
    }

    #[test]
    fn decode_status_line() {
        let event = decode_progress_line(
            br#"{"status":"Downloading","id":"a1b2","progress":"[=> ] 1MB/5MB"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.id.as_deref(), Some("a1b2"));
        assert_eq!(event.status, "Downloading");
        assert_eq!(event.detail.as_deref(), Some("[=> ] 1MB/5MB"));
    }

    #[test]
    fn decode_error_line_is_terminal() {
        let err = decode_progress_line(br#"{"error":"manifest unknown"}"#).unwrap_err();
        assert!(err.to_string().contains("manifest unknown"));
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert!(decode_progress_line(b"  \n").unwrap().is_none());
        assert!(decode_progress_line(b"").unwrap().is_none());
    }

    #[test]
    fn garbage_line_is_a_serialization_error() {
        assert!(decode_progress_line(b"not json").is_err());
    }

    #[test]
    fn auth_header_encodes_credentials_for_the_registry() {
        let auth = RegistryAuth {
            username: "alice".to_string(),
            password: "s3cret".to_string(),
        };
        let header = registry_auth_header(&auth, "quay.io");
        let decoded = BASE64_URL.decode(header).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["username"], "alice");
        assert_eq!(value["serveraddress"], "quay.io");
    }

    #[test]
    fn image_summary_maps_engine_fields() {
        let raw = r#"[{"Id":"sha256:123","RepoTags":["library/redis:7"],"RepoDigests":null,"Size":117}]"#;
        let summaries: Vec<ImageSummary> = serde_json::from_str(raw).unwrap();
        let info = ImageInfo::from(summaries.into_iter().next().unwrap());
        assert_eq!(info.id, "sha256:123");
        assert_eq!(info.repo_tags, vec!["library/redis:7"]);
        assert!(info.repo_digests.is_empty());
        assert_eq!(info.size, 117);
    }
}
