pub use crate::form::{
    FieldMeta, FieldName, FieldProps, FieldValidator, FormEngine, FormError, FormHelpers,
    FormOptions, FormResult, FormSnapshot, FormStatus, RevalidateMode, SubscriptionId,
    ValidateMode, ValidationError, ValidationTicket, Value, ValueMap,
};
pub use crate::upload::{
    ChunkClient, ChunkedTransport, FilePayload, HttpChunkClient, HttpUploadConfig, LegacyTransport,
    PendingUpload, ProgressTick, StandardTransport, TransferContext, TransportError, UploadEngine,
    UploadOptions, UploadOutcome, UploadPhase, UploadProgress, UploadState, UploadTransport,
    WireFormat, http_transport,
};
