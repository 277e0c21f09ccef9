use thiserror::Error;

/// Shared error type for every stage of marker-driven feature learning.
///
/// The five categories mirror the failure classes of the system: bad
/// configuration (architecture files, geometry, manifests), missing or
/// inconsistent training data (markers, images, labels), shape or channel
/// mismatches between layers, exhausted resources (memory budgets, absent
/// devices, iteration limits), and plain I/O failures surfaced from the
/// parameter store and helper readers.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("bad or missing data: {0}")]
    Data(String),

    #[error("dimension mismatch in {context}: expected {expected:?}, got {got:?}")]
    Dimension {
        expected: Vec<usize>,
        got: Vec<usize>,
        context: String,
    },

    #[error("resource limit: {0}")]
    Resource(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
