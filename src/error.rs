use thiserror::Error;

/// Main error type for the policy server
#[derive(Error, Debug)]
pub enum ParleyError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Request validation errors
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    // Policy persistence errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // Brain contract violations (bad snapshot shape, update without a decision)
    #[error("Brain error: {0}")]
    Brain(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ParleyError {
    /// Errors caused by a single malformed request rather than by the process
    pub fn is_request_error(&self) -> bool {
        matches!(self, ParleyError::Protocol(_) | ParleyError::Validation(_))
    }
}

/// Result type alias for ParleyError
pub type Result<T> = std::result::Result<T, ParleyError>;

/// Malformed wire messages
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Unknown field: {key}")]
    UnknownField { key: String },

    #[error("Malformed clause (expected key=value): {clause}")]
    MalformedClause { clause: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Message is not valid UTF-8")]
    InvalidEncoding,

    #[error("Frame too large: {size} bytes > {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },
}

/// Well-formed requests that violate the session invariants
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Feature count mismatch: got {got}, expected {expected}")]
    FeatureCount { got: usize, expected: usize },

    #[error("Unknown agent: {agent} (agents: {agents})")]
    UnknownAgent { agent: i64, agents: usize },

    #[error("Empty action mask")]
    EmptyActionMask,

    #[error("Action out of range: {action} not in [0, {num_actions})")]
    ActionOutOfRange { action: i64, num_actions: usize },
}
