use derive_more::Display;

pub type Result<T> = std::result::Result<T, Error>;

/// Canonical error code, closed set per the external error contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[allow(non_camel_case_types)]
pub enum Code {
    INVALID_REQUEST_BODY,
    INVALID_CREATE_UPLOAD_REQUEST,
    INVALID_FILE_SIZE,
    FILE_TOO_LARGE,
    INVALID_FILENAME,
    INVALID_CONTENT_TYPE,
    INVALID_CHUNK_SIZE,
    INVALID_TOTAL_CHUNKS,
    TOO_MANY_CHUNKS,
    UPLOAD_CAPACITY_REACHED,
    INVALID_UPLOAD_ID,
    UPLOAD_NOT_FOUND,
    UPLOAD_ALREADY_COMPLETED,
    UPLOAD_INCOMPLETE,
    UPLOAD_FINALIZATION_IN_PROGRESS,
    INVALID_CHUNK,
    CHUNK_STREAM_ERROR,
    CHUNK_UPLOAD_FAILED,
    CHUNK_IN_PROGRESS,
    SESSION_CREATE_FAILED,
    UPLOAD_FAILED,
    INVALID_EPOCHS,
    RATE_LIMITED,
    INTERNAL_ERROR,
    FILE_NOT_FOUND,
    SUI_UNAVAILABLE,
    INVALID_FILE_METADATA,
    INVALID_RANGE,
    WALRUS_RANGE_UNSUPPORTED,
    WALRUS_READ_FAILED,
}

/// Service-wide error type. Every variant carries enough context to log
/// internally while rendering a sanitized, canonically-coded envelope to
/// the client.
#[derive(Debug, Display)]
pub enum Error {
    #[display("invalid request body: {msg}")]
    InvalidRequestBody { msg: String },
    #[display("invalid create-upload request: {msg}")]
    InvalidCreateUploadRequest { msg: String },
    #[display("invalid file size: {msg}")]
    InvalidFileSize { msg: String },
    #[display("file too large: {msg}")]
    FileTooLarge { msg: String },
    #[display("invalid filename: {msg}")]
    InvalidFilename { msg: String },
    #[display("invalid content type: {msg}")]
    InvalidContentType { msg: String },
    #[display("invalid chunk size: {msg}")]
    InvalidChunkSize { msg: String },
    #[display("invalid total chunks: {msg}")]
    InvalidTotalChunks { msg: String },
    #[display("too many chunks: {msg}")]
    TooManyChunks { msg: String },
    #[display("upload capacity reached")]
    UploadCapacityReached,
    #[display("invalid upload id: {upload_id}")]
    InvalidUploadId { upload_id: String },
    #[display("upload not found: {upload_id}")]
    UploadNotFound { upload_id: String },
    #[display("upload already completed: {upload_id}")]
    UploadAlreadyCompleted { upload_id: String },
    #[display("upload incomplete: missing {missing:?}")]
    UploadIncomplete { missing: Vec<u32> },
    #[display("finalization in progress for {upload_id}")]
    UploadFinalizationInProgress { upload_id: String },
    #[display("invalid chunk: {reason}")]
    InvalidChunk { reason: String },
    #[display("chunk stream error: {msg}")]
    ChunkStreamError { msg: String },
    #[display("chunk upload failed: {msg}")]
    ChunkUploadFailed { msg: String },
    #[display("chunk in progress")]
    ChunkInProgress,
    #[display("session create failed: {msg}")]
    SessionCreateFailed { msg: String },
    #[display("upload failed: {msg}")]
    UploadFailed { msg: String },
    #[display("invalid epochs: {epochs}")]
    InvalidEpochs { epochs: i64 },
    #[display("rate limited")]
    RateLimited,
    #[display("internal error: {msg}")]
    Internal { msg: String },
    #[display("file not found: {file_id}")]
    FileNotFound { file_id: String },
    #[display("registry unavailable: {msg}")]
    RegistryUnavailable { msg: String },
    #[display("invalid file metadata: {msg}")]
    InvalidFileMetadata { msg: String },
    #[display("invalid range: {msg}")]
    InvalidRange { msg: String },
    #[display("range unsupported by upstream")]
    RangeUnsupported,
    #[display("object store read failed: {msg}")]
    ReadFailed { msg: String },
    #[display("object store unavailable: {msg}")]
    ReadUnavailable { msg: String },
    #[display("corrupt upload session: {upload_id}")]
    CorruptSession { upload_id: String },
    #[display("corrupt completed upload: {upload_id}")]
    CorruptCompletedUpload { upload_id: String },
    #[display("io error at {path}: {error}")]
    Io {
        error: std::io::Error,
        path: String,
    },
    #[display("configuration error: {msg}")]
    Config { msg: String },
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io {
            error,
            path: "<unknown>".to_string(),
        }
    }
}

impl Error {
    pub fn code(&self) -> Code {
        use Error::*;
        match self {
            InvalidRequestBody { .. } => Code::INVALID_REQUEST_BODY,
            InvalidCreateUploadRequest { .. } => Code::INVALID_CREATE_UPLOAD_REQUEST,
            InvalidFileSize { .. } => Code::INVALID_FILE_SIZE,
            FileTooLarge { .. } => Code::FILE_TOO_LARGE,
            InvalidFilename { .. } => Code::INVALID_FILENAME,
            InvalidContentType { .. } => Code::INVALID_CONTENT_TYPE,
            InvalidChunkSize { .. } => Code::INVALID_CHUNK_SIZE,
            InvalidTotalChunks { .. } => Code::INVALID_TOTAL_CHUNKS,
            TooManyChunks { .. } => Code::TOO_MANY_CHUNKS,
            UploadCapacityReached => Code::UPLOAD_CAPACITY_REACHED,
            InvalidUploadId { .. } => Code::INVALID_UPLOAD_ID,
            UploadNotFound { .. } => Code::UPLOAD_NOT_FOUND,
            UploadAlreadyCompleted { .. } => Code::UPLOAD_ALREADY_COMPLETED,
            UploadIncomplete { .. } => Code::UPLOAD_INCOMPLETE,
            UploadFinalizationInProgress { .. } => Code::UPLOAD_FINALIZATION_IN_PROGRESS,
            InvalidChunk { .. } => Code::INVALID_CHUNK,
            ChunkStreamError { .. } => Code::CHUNK_STREAM_ERROR,
            ChunkUploadFailed { .. } => Code::CHUNK_UPLOAD_FAILED,
            ChunkInProgress => Code::CHUNK_IN_PROGRESS,
            SessionCreateFailed { .. } => Code::SESSION_CREATE_FAILED,
            UploadFailed { .. } => Code::UPLOAD_FAILED,
            InvalidEpochs { .. } => Code::INVALID_EPOCHS,
            RateLimited => Code::RATE_LIMITED,
            Internal { .. } | Io { .. } | Config { .. } => Code::INTERNAL_ERROR,
            FileNotFound { .. } => Code::FILE_NOT_FOUND,
            RegistryUnavailable { .. } => Code::SUI_UNAVAILABLE,
            InvalidFileMetadata { .. } => Code::INVALID_FILE_METADATA,
            InvalidRange { .. } => Code::INVALID_RANGE,
            RangeUnsupported => Code::WALRUS_RANGE_UNSUPPORTED,
            ReadFailed { .. } | ReadUnavailable { .. } => Code::WALRUS_READ_FAILED,
            CorruptSession { .. } | CorruptCompletedUpload { .. } => Code::INTERNAL_ERROR,
        }
    }

    /// Whether the client's correct response is to retry the same idempotent
    /// operation.
    pub fn retryable(&self) -> bool {
        use Error::*;
        matches!(
            self,
            ChunkInProgress
                | UploadFinalizationInProgress { .. }
                | RateLimited
                | Internal { .. }
                | Io { .. }
                | RegistryUnavailable { .. }
                | ReadFailed { .. }
                | ReadUnavailable { .. }
                | UploadFailed { .. }
                | ChunkUploadFailed { .. }
        )
    }

    fn status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode as S;
        use Error::*;
        match self {
            InvalidRequestBody { .. }
            | InvalidCreateUploadRequest { .. }
            | InvalidFileSize { .. }
            | InvalidFilename { .. }
            | InvalidContentType { .. }
            | InvalidChunkSize { .. }
            | InvalidTotalChunks { .. }
            | TooManyChunks { .. }
            | InvalidUploadId { .. }
            | UploadIncomplete { .. }
            | InvalidChunk { .. }
            | InvalidEpochs { .. } => S::BAD_REQUEST,
            FileTooLarge { .. } => S::PAYLOAD_TOO_LARGE,
            UploadNotFound { .. } | FileNotFound { .. } => S::NOT_FOUND,
            UploadAlreadyCompleted { .. }
            | UploadFinalizationInProgress { .. }
            | ChunkInProgress => S::CONFLICT,
            UploadCapacityReached | RateLimited => S::TOO_MANY_REQUESTS,
            InvalidRange { .. } => S::RANGE_NOT_SATISFIABLE,
            RegistryUnavailable { .. } | ReadUnavailable { .. } => S::SERVICE_UNAVAILABLE,
            InvalidFileMetadata { .. } | RangeUnsupported | ReadFailed { .. } => S::BAD_GATEWAY,
            ChunkStreamError { .. }
            | ChunkUploadFailed { .. }
            | SessionCreateFailed { .. }
            | UploadFailed { .. }
            | Internal { .. }
            | Io { .. }
            | Config { .. }
            | CorruptSession { .. }
            | CorruptCompletedUpload { .. } => S::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let code = self.code();
        let retryable = self.retryable();

        if status.is_server_error() {
            tracing::error!(error = %self, code = %code, "request failed");
        } else {
            tracing::warn!(error = %self, code = %code, "request rejected");
        }

        let message = match &self {
            Error::Io { .. } | Error::Internal { .. } | Error::Config { .. } => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = axum::Json(serde_json::json!({
            "error": {
                "code": code.to_string(),
                "message": message,
                "retryable": retryable,
            }
        }));

        (status, body).into_response()
    }
}

/// Extension trait for converting I/O errors to custom errors with path context
pub trait ResultIoExt<T> {
    fn map_io_err(self, path: &std::path::Path) -> Result<T>;
}

impl<T> ResultIoExt<T> for std::result::Result<T, std::io::Error> {
    fn map_io_err(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|error| Error::Io {
            error,
            path: path.display().to_string(),
        })
    }
}
