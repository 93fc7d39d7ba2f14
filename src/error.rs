use thiserror::Error;

/// Pipeline error types
#[derive(Debug, Error)]
pub enum EtlError {
    /// A join or load referenced a column its relation does not carry
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Empty input: {0}")]
    EmptyInput(String),

    /// A row inside a batch was rejected; the batch transaction was rolled back
    #[error("Batch load failure: {0}")]
    BatchLoadFailure(String),

    #[error("Connection error: {0}")]
    ConnectionFailure(String),

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EtlError {
    /// Short machine-readable code, used in structured log fields
    pub fn code(&self) -> &'static str {
        match self {
            EtlError::SchemaMismatch(_) => "SCHEMA_MISMATCH",
            EtlError::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            EtlError::EmptyInput(_) => "EMPTY_INPUT",
            EtlError::BatchLoadFailure(_) => "BATCH_LOAD_FAILURE",
            EtlError::ConnectionFailure(_) => "CONNECTION_FAILURE",
            EtlError::IntegrityViolation(_) => "INTEGRITY_VIOLATION",
            EtlError::Extraction(_) => "EXTRACTION_ERROR",
            EtlError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the loader may retry the failed operation on a fresh connection
    pub fn is_retryable(&self) -> bool {
        matches!(self, EtlError::ConnectionFailure(_))
    }
}

/// Convert config::ConfigError to EtlError
impl From<config::ConfigError> for EtlError {
    fn from(err: config::ConfigError) -> Self {
        EtlError::InvalidConfiguration(err.to_string())
    }
}

/// Convert csv::Error to EtlError
impl From<csv::Error> for EtlError {
    fn from(err: csv::Error) -> Self {
        EtlError::Extraction(err.to_string())
    }
}

impl From<std::io::Error> for EtlError {
    fn from(err: std::io::Error) -> Self {
        EtlError::Extraction(err.to_string())
    }
}

/// Convert anyhow::Error to EtlError
impl From<anyhow::Error> for EtlError {
    fn from(err: anyhow::Error) -> Self {
        EtlError::Internal(err.to_string())
    }
}
