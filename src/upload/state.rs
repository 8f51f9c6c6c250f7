use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

/// An in-memory file handed to the upload pipeline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilePayload {
    pub name: String,
    pub mime: String,
    bytes: Arc<Vec<u8>>,
}

impl FilePayload {
    pub fn new(
        name: impl Into<String>,
        mime: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            bytes: Arc::new(bytes.into()),
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &Arc<Vec<u8>> {
        &self.bytes
    }

    pub fn slice(&self, start: u64, end: u64) -> Vec<u8> {
        self.bytes[start as usize..end as usize].to_vec()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UploadPhase {
    Idle,
    Uploading,
    Paused,
    Completed,
    Error,
}

/// Byte-level progress of the current `upload()` call. `speed` and
/// `remaining` are derived from elapsed time since the call began, not since
/// the last tick, to avoid jitter from bursty callbacks.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UploadProgress {
    pub loaded: u64,
    pub total: u64,
    pub percent: u8,
    /// Bytes per second since the upload began.
    pub speed: f64,
    /// Estimated seconds until completion; `0` while speed is unknown.
    pub remaining: u64,
    pub current_chunk: Option<u32>,
    pub total_chunks: Option<u32>,
}

/// Endpoint token(s) for a completed upload, in file order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UploadOutcome {
    Single(String),
    Many(Vec<String>),
}

impl UploadOutcome {
    pub fn tokens(&self) -> Vec<String> {
        match self {
            Self::Single(token) => vec![token.clone()],
            Self::Many(tokens) => tokens.clone(),
        }
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    #[error("upload of {file} failed with status {status}")]
    Status { file: String, status: u16 },
    #[error("network failure while uploading {file}: {message}")]
    Network { file: String, message: String },
    #[error("upload response for {file} is missing a token")]
    MissingToken { file: String },
    #[error("finalize failed for {file}: {message}")]
    Finalize { file: String, message: String },
    #[error("upload of {file} was cancelled")]
    Cancelled { file: String },
}

impl TransportError {
    /// The file the failure belongs to.
    pub fn file(&self) -> &str {
        match self {
            Self::Status { file, .. }
            | Self::Network { file, .. }
            | Self::MissingToken { file }
            | Self::Finalize { file, .. }
            | Self::Cancelled { file } => file,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UploadState {
    pub phase: UploadPhase,
    pub progress: UploadProgress,
    pub outcome: Option<UploadOutcome>,
    pub error: Option<TransportError>,
    pub(super) started_at: Option<Instant>,
}

impl UploadState {
    pub(super) fn idle() -> Self {
        Self {
            phase: UploadPhase::Idle,
            progress: UploadProgress::default(),
            outcome: None,
            error: None,
            started_at: None,
        }
    }
}
