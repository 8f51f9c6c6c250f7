use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio::sync::watch;

use super::state::{FilePayload, TransportError};

/// Default chunk size for the chunked wire format.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;
/// Default number of chunk requests in flight for one file.
pub const DEFAULT_MAX_PARALLEL: usize = 3;

const BODY_SLICE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WireFormat {
    Legacy,
    Standard,
    Chunked,
}

#[derive(Clone, Debug)]
pub struct HttpUploadConfig {
    pub endpoint: String,
    pub format: WireFormat,
    pub field_name: String,
    pub chunk_size: u64,
    pub max_parallel: usize,
}

impl HttpUploadConfig {
    pub fn new(endpoint: impl Into<String>, format: WireFormat) -> Self {
        Self {
            endpoint: endpoint.into(),
            format,
            field_name: "file".into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProgressTick {
    /// Bytes of the current file transferred so far.
    pub loaded: u64,
    pub current_chunk: Option<u32>,
    pub total_chunks: Option<u32>,
}

pub(super) type ProgressSink = Arc<dyn Fn(ProgressTick) + Send + Sync>;

/// Per-file handle a transport uses to report progress and observe the
/// engine's pause/cancel signals.
pub struct TransferContext {
    pub(super) progress: ProgressSink,
    pub(super) cancel: watch::Receiver<bool>,
    pub(super) pause: watch::Receiver<bool>,
}

impl TransferContext {
    /// A context with no observers and signals that never fire.
    pub fn detached() -> Self {
        let (_, cancel) = watch::channel(false);
        let (_, pause) = watch::channel(false);
        Self {
            progress: Arc::new(|_| {}),
            cancel,
            pause,
        }
    }

    pub fn report(&self, tick: ProgressTick) {
        (self.progress)(tick);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the upload is cancelled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
            futures::future::pending::<()>().await;
        }
    }

    /// Waits until the engine is not paused. Cooperative: callers check this
    /// before starting a chunk, never mid-request.
    pub async fn paused_gate(&self) {
        let mut pause = self.pause.clone();
        let _ = pause.wait_for(|paused| !*paused).await;
    }
}

/// One wire format's byte transfer for a single file: token out, or a
/// transport error carrying the offending file. Cancellation arrives through
/// the context; the error state never throws past the engine.
pub trait UploadTransport: Send + Sync {
    fn upload<'a>(
        &'a self,
        file: &'a FilePayload,
        ctx: &'a TransferContext,
    ) -> BoxFuture<'a, Result<String, TransportError>>;
}

impl<T: UploadTransport + ?Sized> UploadTransport for Box<T> {
    fn upload<'a>(
        &'a self,
        file: &'a FilePayload,
        ctx: &'a TransferContext,
    ) -> BoxFuture<'a, Result<String, TransportError>> {
        (**self).upload(file, ctx)
    }
}

pub fn http_transport(config: HttpUploadConfig) -> Box<dyn UploadTransport> {
    match config.format {
        WireFormat::Legacy => Box::new(LegacyTransport::new(config.endpoint)),
        WireFormat::Standard => {
            Box::new(StandardTransport::new(config.endpoint, config.field_name))
        }
        WireFormat::Chunked => Box::new(ChunkedTransport::new(
            HttpChunkClient::new(config.endpoint),
            config.chunk_size,
            config.max_parallel,
        )),
    }
}

fn network_error(file: &FilePayload, error: impl Display) -> TransportError {
    TransportError::Network {
        file: file.name.clone(),
        message: error.to_string(),
    }
}

async fn with_cancel<T>(
    file: &FilePayload,
    ctx: &TransferContext,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(TransportError::Cancelled {
            file: file.name.clone(),
        }),
        result = fut => result,
    }
}

/// Streams the file body in small slices so the progress sink ticks as bytes
/// are pulled off the wire.
fn progress_body(file: &FilePayload, ctx: &TransferContext) -> reqwest::Body {
    let bytes = file.bytes().clone();
    let progress = ctx.progress.clone();
    let total = bytes.len();
    let stream = futures::stream::iter((0..total).step_by(BODY_SLICE).map(move |start| {
        let end = usize::min(start + BODY_SLICE, total);
        let part = bytes[start..end].to_vec();
        progress(ProgressTick {
            loaded: end as u64,
            current_chunk: None,
            total_chunks: None,
        });
        Ok::<_, std::convert::Infallible>(part)
    }));
    reqwest::Body::wrap_stream(stream)
}

#[derive(Deserialize)]
pub(super) struct TokenResponse {
    token: Option<String>,
    id: Option<String>,
}

impl TokenResponse {
    pub(super) fn into_token(self) -> Option<String> {
        self.token.or(self.id)
    }
}

pub(super) fn require_success(
    file: &FilePayload,
    status: reqwest::StatusCode,
) -> Result<(), TransportError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(TransportError::Status {
            file: file.name.clone(),
            status: status.as_u16(),
        })
    }
}

pub(super) fn token_or_missing(
    file: &FilePayload,
    token: Option<String>,
) -> Result<String, TransportError> {
    token.ok_or_else(|| TransportError::MissingToken {
        file: file.name.clone(),
    })
}

pub(super) fn legacy_token(body: &serde_json::Value) -> Option<String> {
    body.pointer("/result/token")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
}

/// Single multipart request with the fixed field names an older server-side
/// form-object convention expects; the token comes back nested.
pub struct LegacyTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl LegacyTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

impl UploadTransport for LegacyTransport {
    fn upload<'a>(
        &'a self,
        file: &'a FilePayload,
        ctx: &'a TransferContext,
    ) -> BoxFuture<'a, Result<String, TransportError>> {
        Box::pin(async move {
            let part = Part::stream_with_length(progress_body(file, ctx), file.len())
                .file_name(file.name.clone())
                .mime_str(&file.mime)
                .map_err(|error| network_error(file, error))?;
            let form = Form::new()
                .part("upload_file", part)
                .text("file_name", file.name.clone())
                .text("file_size", file.len().to_string());

            let request = self.client.post(&self.endpoint).multipart(form).send();
            let response = with_cancel(file, ctx, async {
                request.await.map_err(|error| network_error(file, error))
            })
            .await?;

            require_success(file, response.status())?;
            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|error| network_error(file, error))?;
            token_or_missing(file, legacy_token(&body))
        })
    }
}

/// Single multipart request with a generic field name; accepts `token` or
/// `id` from the response.
pub struct StandardTransport {
    client: reqwest::Client,
    endpoint: String,
    field_name: String,
}

impl StandardTransport {
    pub fn new(endpoint: impl Into<String>, field_name: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            field_name: field_name.into(),
        }
    }
}

impl UploadTransport for StandardTransport {
    fn upload<'a>(
        &'a self,
        file: &'a FilePayload,
        ctx: &'a TransferContext,
    ) -> BoxFuture<'a, Result<String, TransportError>> {
        Box::pin(async move {
            let part = Part::stream_with_length(progress_body(file, ctx), file.len())
                .file_name(file.name.clone())
                .mime_str(&file.mime)
                .map_err(|error| network_error(file, error))?;
            let form = Form::new().part(self.field_name.clone(), part);

            let request = self.client.post(&self.endpoint).multipart(form).send();
            let response = with_cancel(file, ctx, async {
                request.await.map_err(|error| network_error(file, error))
            })
            .await?;

            require_success(file, response.status())?;
            let body: TokenResponse = response
                .json()
                .await
                .map_err(|error| network_error(file, error))?;
            token_or_missing(file, body.into_token())
        })
    }
}

/// Wire calls the chunked transport needs. The trait is the seam between
/// chunk orchestration and the actual HTTP requests.
pub trait ChunkClient: Send + Sync {
    fn send_chunk<'a>(
        &'a self,
        file: &'a FilePayload,
        index: u32,
        total: u32,
        bytes: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    fn finalize<'a>(
        &'a self,
        file: &'a FilePayload,
        chunk_count: u32,
    ) -> BoxFuture<'a, Result<String, TransportError>>;
}

impl<C: ChunkClient + ?Sized> ChunkClient for Arc<C> {
    fn send_chunk<'a>(
        &'a self,
        file: &'a FilePayload,
        index: u32,
        total: u32,
        bytes: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        (**self).send_chunk(file, index, total, bytes)
    }

    fn finalize<'a>(
        &'a self,
        file: &'a FilePayload,
        chunk_count: u32,
    ) -> BoxFuture<'a, Result<String, TransportError>> {
        (**self).finalize(file, chunk_count)
    }
}

pub struct HttpChunkClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpChunkClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

impl ChunkClient for HttpChunkClient {
    fn send_chunk<'a>(
        &'a self,
        file: &'a FilePayload,
        index: u32,
        total: u32,
        bytes: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let part = Part::bytes(bytes)
                .file_name(file.name.clone())
                .mime_str("application/octet-stream")
                .map_err(|error| network_error(file, error))?;
            let form = Form::new()
                .part("chunk", part)
                .text("index", index.to_string())
                .text("total", total.to_string())
                .text("name", file.name.clone());

            let response = self
                .client
                .post(&self.endpoint)
                .multipart(form)
                .send()
                .await
                .map_err(|error| network_error(file, error))?;
            require_success(file, response.status())
        })
    }

    fn finalize<'a>(
        &'a self,
        file: &'a FilePayload,
        chunk_count: u32,
    ) -> BoxFuture<'a, Result<String, TransportError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(format!("{}/finalize", self.endpoint))
                .json(&serde_json::json!({
                    "name": file.name,
                    "chunks": chunk_count,
                }))
                .send()
                .await
                .map_err(|error| TransportError::Finalize {
                    file: file.name.clone(),
                    message: error.to_string(),
                })?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Finalize {
                    file: file.name.clone(),
                    message: format!("status {}", status.as_u16()),
                });
            }
            let body: TokenResponse = response
                .json()
                .await
                .map_err(|error| network_error(file, error))?;
            token_or_missing(file, body.into_token())
        })
    }
}

/// `(start, end)` byte ranges covering `len` in `chunk_size` steps.
pub(super) fn chunk_spans(len: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let chunk_size = chunk_size.max(1);
    let mut spans = Vec::with_capacity(len.div_ceil(chunk_size) as usize);
    let mut start = 0;
    while start < len {
        let end = u64::min(start + chunk_size, len);
        spans.push((start, end));
        start = end;
    }
    spans
}

/// Slices a file into fixed-size ranges and uploads them in batches bounded
/// by `max_parallel`; each batch is awaited fully before the next starts. Any
/// chunk failure aborts the whole file. After all chunks succeed, exactly one
/// finalize call produces the token.
pub struct ChunkedTransport<C: ChunkClient> {
    client: C,
    chunk_size: u64,
    max_parallel: usize,
}

impl<C: ChunkClient> ChunkedTransport<C> {
    pub fn new(client: C, chunk_size: u64, max_parallel: usize) -> Self {
        Self {
            client,
            chunk_size,
            max_parallel: max_parallel.max(1),
        }
    }
}

impl<C: ChunkClient> UploadTransport for ChunkedTransport<C> {
    fn upload<'a>(
        &'a self,
        file: &'a FilePayload,
        ctx: &'a TransferContext,
    ) -> BoxFuture<'a, Result<String, TransportError>> {
        Box::pin(async move {
            let spans: Vec<(u32, (u64, u64))> = chunk_spans(file.len(), self.chunk_size)
                .into_iter()
                .enumerate()
                .map(|(index, span)| (index as u32, span))
                .collect();
            let total_chunks = spans.len() as u32;
            let completed = AtomicU64::new(0);

            for batch in spans.chunks(self.max_parallel) {
                let completed = &completed;
                let uploads = batch.iter().map(|(index, (start, end))| async move {
                    ctx.paused_gate().await;
                    if ctx.is_cancelled() {
                        return Err(TransportError::Cancelled {
                            file: file.name.clone(),
                        });
                    }
                    let bytes = file.slice(*start, *end);
                    with_cancel(
                        file,
                        ctx,
                        self.client.send_chunk(file, *index, total_chunks, bytes),
                    )
                    .await?;
                    let size = end - start;
                    let loaded = completed.fetch_add(size, Ordering::SeqCst) + size;
                    ctx.report(ProgressTick {
                        loaded,
                        current_chunk: Some(*index),
                        total_chunks: Some(total_chunks),
                    });
                    Ok(())
                });
                for result in futures::future::join_all(uploads).await {
                    result?;
                }
            }

            with_cancel(file, ctx, self.client.finalize(file, total_chunks)).await
        })
    }
}
