use thiserror::Error;

/// Crate-wide error type. Variants follow the taxonomy in the error-handling
/// design: transient I/O, worker-local execution, framing/merge corruption,
/// memory exhaustion, cancellation, and restart.
#[derive(Error, Debug)]
pub enum QservError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transient network error: {0}")]
    Network(String),

    #[error("worker execution error: {0}")]
    Execution(String),

    #[error("missing table: {0}")]
    MissingTable(String),

    #[error("framing or merge corruption: {0}")]
    Corruption(String),

    #[error("result row exceeds frame size limit: {0}")]
    ResultTooLarge(String),

    #[error("memory reservation exhausted: {0}")]
    MemoryExhausted(String),

    #[error("memory manager error: {0}")]
    MemMan(String),

    #[error("cancelled")]
    Cancelled,

    #[error("chunk unavailable: {0}")]
    ChunkUnavailable(i64),

    #[error("worker restarted: {0}")]
    WorkerRestarted(String),

    #[error("czar restarted: {0}")]
    CzarRestarted(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, QservError>;

impl From<serde_json::Error> for QservError {
    fn from(e: serde_json::Error) -> Self {
        QservError::Serialization(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for QservError {
    fn from(e: bincode::error::EncodeError) -> Self {
        QservError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for QservError {
    fn from(e: bincode::error::DecodeError) -> Self {
        QservError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for QservError {
    fn from(e: reqwest::Error) -> Self {
        QservError::Network(e.to_string())
    }
}

impl QservError {
    /// Short tag used as the `errortype` field in the worker/czar HTTP envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            QservError::Io(_) => "io",
            QservError::Serialization(_) => "serialization",
            QservError::Network(_) => "network",
            QservError::Execution(_) => "execution",
            QservError::MissingTable(_) => "missing_table",
            QservError::Corruption(_) => "corruption",
            QservError::ResultTooLarge(_) => "result_too_large",
            QservError::MemoryExhausted(_) => "memory_exhausted",
            QservError::MemMan(_) => "memman",
            QservError::Cancelled => "cancelled",
            QservError::ChunkUnavailable(_) => "chunk_unavailable",
            QservError::WorkerRestarted(_) => "worker_restarted",
            QservError::CzarRestarted(_) => "czar_restarted",
            QservError::NotFound(_) => "not_found",
            QservError::InvalidArgument(_) => "invalid_argument",
            QservError::Configuration(_) => "configuration",
            QservError::AuthFailed => "auth_failed",
            QservError::QueryFailed(_) => "query_failed",
            QservError::Internal(_) => "internal",
        }
    }
}

/// Maps internal errors onto the worker/czar HTTP API's `{success, errortype?, note?}`
/// envelope (spec.md section 6).
impl axum::response::IntoResponse for QservError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        let status = match &self {
            QservError::NotFound(_) | QservError::ChunkUnavailable(_) => StatusCode::NOT_FOUND,
            QservError::AuthFailed => StatusCode::UNAUTHORIZED,
            QservError::InvalidArgument(_) | QservError::Configuration(_) => StatusCode::BAD_REQUEST,
            QservError::MemoryExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = axum::Json(serde_json::json!({
            "success": 0,
            "errortype": self.error_type(),
            "note": self.to_string(),
        }));
        (status, body).into_response()
    }
}
