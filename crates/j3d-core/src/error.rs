//! Error types for j3d-rs.

use thiserror::Error;

/// The main error type for scene and configuration operations.
#[derive(Error, Debug)]
pub enum J3dError {
    /// A face references a vertex that does not exist on its object.
    #[error("vertex index {index} out of range (object has {count} vertices)")]
    VertexIndexOutOfRange { index: usize, count: usize },

    /// A grid was configured with a non-positive cell size.
    #[error("invalid grid cell size: {0}")]
    InvalidCellSize(i32),

    /// A background gradient must have zero or four corner colors.
    #[error("background gradient needs 0 or 4 colors, got {0}")]
    InvalidGradient(usize),

    /// A configuration value is outside its accepted range.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// A specialized Result type for j3d-core operations.
pub type Result<T> = std::result::Result<T, J3dError>;
