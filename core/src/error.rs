use crate::DocId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the engine. Ingest and query errors are recoverable and
/// scoped to one document or one request; `GraphBuild` aborts the graph step.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("ingest failed for document {doc} ({key}): {reason}")]
    Ingest { doc: DocId, key: String, reason: String },

    #[error("pattern `{pattern}` exceeded its evaluation budget after {elapsed_ms} ms")]
    PatternTimeout { pattern: String, elapsed_ms: u64 },

    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("malformed query `{query}`: {reason}")]
    MalformedQuery { query: String, reason: String },

    #[error("invalid value `{value}` for parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, value: String, reason: String },

    #[error("graph build failed: {reason}")]
    GraphBuild { reason: String },

    #[error("query service busy ({capacity} requests in flight or queued), retry later")]
    ServiceBusy { capacity: usize },

    #[error("index inconsistent: {reason}")]
    IndexInconsistent { reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// True for errors that only affect the request or document that raised them.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            EngineError::GraphBuild { .. } | EngineError::IndexInconsistent { .. } | EngineError::Config(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Ingest { .. } => "ingest",
            EngineError::PatternTimeout { .. } => "pattern_timeout",
            EngineError::InvalidPattern { .. } => "invalid_pattern",
            EngineError::MalformedQuery { .. } => "malformed_query",
            EngineError::InvalidParameter { .. } => "invalid_parameter",
            EngineError::GraphBuild { .. } => "graph_build",
            EngineError::ServiceBusy { .. } => "service_busy",
            EngineError::IndexInconsistent { .. } => "index_inconsistent",
            EngineError::Config(_) => "config",
        }
    }
}
