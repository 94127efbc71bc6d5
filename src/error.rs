use std::fmt;

/// Result type for gridrl operations
pub type Result<T> = std::result::Result<T, GridRlError>;

/// Main error type for the gridrl library
#[derive(Debug, Clone)]
pub enum GridRlError {
    /// Invalid dimensions for operations
    DimensionMismatch {
        expected: String,
        actual: String,
    },

    /// Invalid parameter value
    InvalidParameter {
        name: String,
        reason: String,
    },

    /// IO errors (file operations)
    IoError(String),

    /// Serialization/deserialization errors
    SerializationError(String),

    /// Empty buffer or container
    EmptyBuffer(String),

    /// Encoded action index outside the converter's catalogue
    InvalidAction {
        action: usize,
        max_actions: usize,
    },

    /// Observation attribute not exposed by the environment
    UnknownAttribute(String),

    /// Training error
    TrainingError(String),
}

impl fmt::Display for GridRlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridRlError::DimensionMismatch { expected, actual } => {
                write!(f, "Dimension mismatch: expected {}, got {}", expected, actual)
            }
            GridRlError::InvalidParameter { name, reason } => {
                write!(f, "Invalid parameter '{}': {}", name, reason)
            }
            GridRlError::IoError(msg) => write!(f, "IO error: {}", msg),
            GridRlError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            GridRlError::EmptyBuffer(msg) => write!(f, "Empty buffer: {}", msg),
            GridRlError::InvalidAction { action, max_actions } => {
                write!(f, "Invalid action {}: must be less than {}", action, max_actions)
            }
            GridRlError::UnknownAttribute(name) => {
                write!(f, "Unknown observation attribute '{}'", name)
            }
            GridRlError::TrainingError(msg) => write!(f, "Training error: {}", msg),
        }
    }
}

impl std::error::Error for GridRlError {}

// Conversion from std::io::Error
impl From<std::io::Error> for GridRlError {
    fn from(err: std::io::Error) -> Self {
        GridRlError::IoError(err.to_string())
    }
}

// Conversion from bincode::Error
impl From<bincode::Error> for GridRlError {
    fn from(err: bincode::Error) -> Self {
        GridRlError::SerializationError(err.to_string())
    }
}

// Conversion from serde_json::Error
impl From<serde_json::Error> for GridRlError {
    fn from(err: serde_json::Error) -> Self {
        GridRlError::SerializationError(err.to_string())
    }
}

// Helper functions for common error patterns
impl GridRlError {
    pub fn dimension_mismatch<S: Into<String>>(expected: S, actual: S) -> Self {
        GridRlError::DimensionMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn invalid_parameter<S: Into<String>>(name: S, reason: S) -> Self {
        GridRlError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
