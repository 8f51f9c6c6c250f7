mod bridge;
mod engine;
mod state;
mod transport;

#[cfg(test)]
mod tests;

pub use bridge::PendingUpload;
pub use engine::{UploadEngine, UploadOptions};
pub use state::{
    FilePayload, TransportError, UploadOutcome, UploadPhase, UploadProgress, UploadState,
};
pub use transport::{
    ChunkClient, ChunkedTransport, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_PARALLEL, HttpChunkClient,
    HttpUploadConfig, LegacyTransport, ProgressTick, StandardTransport, TransferContext,
    UploadTransport, WireFormat, http_transport,
};
