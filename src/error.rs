use thiserror::Error;

/// Every way a `get_homologs` call can fail. Each variant maps to exactly one
/// JSON-RPC error name and code.
#[derive(Debug, Error)]
pub enum HomologyError {
    #[error("Invalid workspace reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Carries the upstream access-control message verbatim.
    #[error("{0}")]
    Unauthorized(String),

    #[error("Genome '{reference}' has no assembly or contigset references")]
    MissingAssemblyReference { reference: String },

    #[error("Could not build sketch: {0}")]
    SketchBuild(String),

    #[error("{message}")]
    BackendUnavailable {
        service: &'static str,
        message: String,
    },

    #[error("Request to {service} timed out: {message}")]
    Timeout {
        service: &'static str,
        message: String,
    },

    #[error("Could not translate result identifiers: {0}")]
    TranslationPartialFailure(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl HomologyError {
    pub fn invalid_reference(reference: &str, reason: impl Into<String>) -> Self {
        HomologyError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    pub fn backend(service: &'static str, message: impl Into<String>) -> Self {
        HomologyError::BackendUnavailable {
            service,
            message: message.into(),
        }
    }

    /// Translates a transport error from an outbound call, keeping timeouts
    /// distinguishable from other failures.
    pub fn from_transport(service: &'static str, context: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HomologyError::Timeout {
                service,
                message: format!("{context}: {err}"),
            }
        } else {
            HomologyError::BackendUnavailable {
                service,
                message: format!("{context}: {err}"),
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HomologyError::InvalidReference { .. } => "InvalidReference",
            HomologyError::Unauthorized(_) => "Unauthorized",
            HomologyError::MissingAssemblyReference { .. } => "MissingAssemblyReference",
            HomologyError::SketchBuild(_) => "SketchBuildError",
            HomologyError::BackendUnavailable { .. } => "BackendUnavailable",
            HomologyError::Timeout { .. } => "Timeout",
            HomologyError::TranslationPartialFailure(_) => "TranslationPartialFailure",
            HomologyError::InvalidParams(_) => "InvalidParams",
            HomologyError::Internal(_) | HomologyError::Io(_) | HomologyError::Serde(_) => {
                "InternalError"
            }
        }
    }

    pub fn rpc_code(&self) -> i64 {
        match self {
            HomologyError::InvalidReference { .. } => -32001,
            HomologyError::Unauthorized(_) => -32002,
            HomologyError::MissingAssemblyReference { .. } => -32003,
            HomologyError::SketchBuild(_) => -32004,
            HomologyError::BackendUnavailable { .. } => -32005,
            HomologyError::Timeout { .. } => -32006,
            HomologyError::TranslationPartialFailure(_) => -32007,
            HomologyError::InvalidParams(_) => -32602,
            HomologyError::Internal(_) | HomologyError::Io(_) | HomologyError::Serde(_) => {
                -32603
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, HomologyError>;
