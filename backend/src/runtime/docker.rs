//! Docker Engine API client over the local Unix socket.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{StreamExt, stream};
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, Response, StatusCode, body::Incoming, header};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, de::DeserializeOwned};
use tokio::{net::UnixStream, sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};
use url::form_urlencoded;

use super::{
    ByteStream, ContainerDetails, ContainerQuery, ContainerRuntime, ContainerSummary, EventFilter,
    EventMessage, EventSubscription, ImageDetails, ImageSummary, LogOptions, ProcessList,
    SystemInfo, VolumeSummary, types::VolumeListResponse,
};
use crate::{error::AppError, stream::LineBuffer};

const EVENT_BUFFER: usize = 32;
const FRAME_HEADER_LEN: usize = 8;
const MULTIPLEXED_CONTENT_TYPE: &str = "application/vnd.docker.multiplexed-stream";
const RAW_CONTENT_TYPE: &str = "application/vnd.docker.raw-stream";

pub struct DockerClient {
    socket_path: PathBuf,
}

impl DockerClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AppError> {
        let (response, _connection) = self.send(path).await?;
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| AppError::Runtime(format!("failed to read {path}: {err}")))?
            .to_bytes();
        serde_json::from_slice(&body)
            .map_err(|err| AppError::Runtime(format!("failed to parse {path}: {err}")))
    }

    /// Sends a GET request on a fresh connection. The returned guard owns the
    /// connection task; dropping it closes the connection.
    async fn send(&self, path: &str) -> Result<(Response<Incoming>, ConnectionGuard), AppError> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|err| {
            AppError::Runtime(format!(
                "failed to connect to {}: {err}",
                self.socket_path.display()
            ))
        })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|err| AppError::Runtime(format!("HTTP handshake failed: {err}")))?;

        let connection = ConnectionGuard(tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(error = %err, "runtime connection closed");
            }
        }));

        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("http://localhost{path}"))
            .header(header::HOST, "localhost")
            .body(Empty::<Bytes>::new())
            .map_err(|err| AppError::Runtime(format!("failed to build request: {err}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|err| AppError::Runtime(format!("request {path} failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();
            let message = error_message(&body);
            if status == StatusCode::NOT_FOUND {
                return Err(AppError::NotFound(message));
            }
            return Err(AppError::Runtime(format!("{path} returned {status}: {message}")));
        }

        Ok((response, connection))
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn list_containers(
        &self,
        query: &ContainerQuery,
    ) -> Result<Vec<ContainerSummary>, AppError> {
        self.get_json(&containers_path(query)).await
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, AppError> {
        self.get_json("/images/json").await
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>, AppError> {
        let response: VolumeListResponse = self.get_json("/volumes").await?;
        Ok(response.volumes.unwrap_or_default())
    }

    async fn info(&self) -> Result<SystemInfo, AppError> {
        self.get_json("/info").await
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, AppError> {
        self.get_json(&format!("/containers/{}/json", container_segment(id)?))
            .await
    }

    async fn container_top(&self, id: &str) -> Result<ProcessList, AppError> {
        self.get_json(&format!("/containers/{}/top", container_segment(id)?))
            .await
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails, AppError> {
        self.get_json(&format!("/images/{}/json", image_segment(reference)?))
            .await
    }

    async fn container_logs(&self, id: &str, options: &LogOptions) -> Result<ByteStream, AppError> {
        let path = logs_path(id, options)?;
        let (response, connection) = self.send(&path).await?;
        let decoder = LogFrameDecoder::for_content_type(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
        );
        let body = Box::pin(response.into_body().into_data_stream());

        let frames = stream::unfold(
            LogBodyState {
                body,
                decoder,
                done: false,
                _connection: connection,
            },
            |mut state| async move {
                loop {
                    if let Some(payload) = state.decoder.next_payload() {
                        return Some((Ok(payload), state));
                    }
                    if state.done {
                        return None;
                    }
                    match state.body.next().await {
                        Some(Ok(chunk)) => state.decoder.push(&chunk),
                        Some(Err(err)) => {
                            state.done = true;
                            let err = AppError::Runtime(format!("log stream interrupted: {err}"));
                            return Some((Err(err), state));
                        }
                        None => {
                            state.done = true;
                            if let Some(rest) = state.decoder.finish() {
                                return Some((Ok(rest), state));
                            }
                            return None;
                        }
                    }
                }
            },
        );

        Ok(Box::pin(frames))
    }

    async fn events(&self, filter: &EventFilter) -> Result<EventSubscription, AppError> {
        let path = format!(
            "/events?{}",
            form_urlencoded::Serializer::new(String::new())
                .append_pair("filters", &filter.filters_json())
                .finish()
        );
        let (response, connection) = self.send(&path).await?;
        let (message_tx, messages) = mpsc::channel(EVENT_BUFFER);
        let (error_tx, errors) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            let _connection = connection;
            let mut body = Box::pin(response.into_body().into_data_stream());
            let mut lines = LineBuffer::default();

            'read: loop {
                let chunk = tokio::select! {
                    _ = message_tx.closed() => break,
                    chunk = body.next() => chunk,
                };
                match chunk {
                    Some(Ok(chunk)) => {
                        for line in lines.push(&chunk) {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<EventMessage>(&line) {
                                Ok(message) => {
                                    if message_tx.send(message).await.is_err() {
                                        break 'read;
                                    }
                                }
                                Err(err) => {
                                    let _ = error_tx.try_send(AppError::Runtime(format!(
                                        "undecodable event: {err}"
                                    )));
                                }
                            }
                        }
                    }
                    Some(Err(err)) => {
                        let _ = error_tx
                            .send(AppError::Runtime(format!("event stream interrupted: {err}")))
                            .await;
                        break;
                    }
                    None => break,
                }
            }
            debug!("runtime event subscription released");
        });

        Ok(EventSubscription { messages, errors })
    }
}

struct ConnectionGuard(JoinHandle<()>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct LogBodyState<B> {
    body: B,
    decoder: LogFrameDecoder,
    done: bool,
    _connection: ConnectionGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameMode {
    /// stdout/stderr framed with an 8-byte header per chunk.
    Multiplexed,
    /// TTY containers: bytes are passed through untouched.
    Raw,
}

/// Strips the docker stdout/stderr stream headers from a log body.
///
/// Newer engines announce the framing through the content type; otherwise the
/// first header is sniffed.
#[derive(Debug, Default)]
struct LogFrameDecoder {
    buffer: BytesMut,
    mode: Option<FrameMode>,
}

impl LogFrameDecoder {
    fn for_content_type(content_type: Option<&str>) -> Self {
        let mode = match content_type {
            Some(MULTIPLEXED_CONTENT_TYPE) => Some(FrameMode::Multiplexed),
            Some(RAW_CONTENT_TYPE) => Some(FrameMode::Raw),
            _ => None,
        };
        Self {
            buffer: BytesMut::new(),
            mode,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    fn next_payload(&mut self) -> Option<Bytes> {
        let mode = match self.mode {
            Some(mode) => mode,
            None => {
                if self.buffer.len() < FRAME_HEADER_LEN {
                    return None;
                }
                let mode = if looks_like_frame_header(&self.buffer) {
                    FrameMode::Multiplexed
                } else {
                    FrameMode::Raw
                };
                self.mode = Some(mode);
                mode
            }
        };

        match mode {
            FrameMode::Raw => {
                if self.buffer.is_empty() {
                    None
                } else {
                    Some(self.buffer.split().freeze())
                }
            }
            FrameMode::Multiplexed => loop {
                if self.buffer.len() < FRAME_HEADER_LEN {
                    return None;
                }
                let size = u32::from_be_bytes([
                    self.buffer[4],
                    self.buffer[5],
                    self.buffer[6],
                    self.buffer[7],
                ]) as usize;
                if self.buffer.len() < FRAME_HEADER_LEN + size {
                    return None;
                }
                self.buffer.advance(FRAME_HEADER_LEN);
                let payload = self.buffer.split_to(size).freeze();
                if !payload.is_empty() {
                    return Some(payload);
                }
            },
        }
    }

    /// Remaining bytes at end of body.
    fn finish(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        if self.mode == Some(FrameMode::Multiplexed) {
            warn!(
                bytes = self.buffer.len(),
                "log stream ended inside a frame, dropping partial frame"
            );
            self.buffer.clear();
            return None;
        }
        Some(self.buffer.split().freeze())
    }
}

fn looks_like_frame_header(buffer: &[u8]) -> bool {
    buffer.len() >= FRAME_HEADER_LEN && buffer[0] <= 2 && buffer[1..4] == [0, 0, 0]
}

fn containers_path(query: &ContainerQuery) -> String {
    let mut params = form_urlencoded::Serializer::new(String::new());
    if query.all {
        params.append_pair("all", "1");
    }
    if let Some(filters) = query.filters_json() {
        params.append_pair("filters", &filters);
    }
    let params = params.finish();
    if params.is_empty() {
        "/containers/json".to_string()
    } else {
        format!("/containers/json?{params}")
    }
}

/// A container id or name, checked so it stays one path segment.
fn container_segment(id: &str) -> Result<&str, AppError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-'));
    if !valid {
        return Err(AppError::BadRequest(format!("invalid container id: {id}")));
    }
    Ok(id)
}

/// An image id or reference. The engine routes `/images/{name}/json` with
/// slashes in `name`, so `/` is kept but `..` segments are refused.
fn image_segment(reference: &str) -> Result<&str, AppError> {
    let valid = !reference.is_empty()
        && !reference.starts_with('/')
        && reference.split('/').all(|part| !part.is_empty() && part != "." && part != "..")
        && reference
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-' | ':' | '/' | '@'));
    if !valid {
        return Err(AppError::BadRequest(format!("invalid image reference: {reference}")));
    }
    Ok(reference)
}

fn logs_path(id: &str, options: &LogOptions) -> Result<String, AppError> {
    let id = container_segment(id)?;
    let flag = |on: bool| if on { "1" } else { "0" };
    let params = form_urlencoded::Serializer::new(String::new())
        .append_pair("follow", flag(options.follow))
        .append_pair("stdout", flag(options.stdout))
        .append_pair("stderr", flag(options.stderr))
        .append_pair("timestamps", flag(options.timestamps))
        .finish();
    Ok(format!("/containers/{id}/logs?{params}"))
}

fn error_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }

    serde_json::from_slice::<ErrorBody>(body)
        .map(|parsed| parsed.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}
