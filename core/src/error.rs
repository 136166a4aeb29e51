use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file-system corrupt: {0}")]
    Corrupt(String),

    #[error("unsupported volume: {0}")]
    Unsupported(String),

    #[error("write rejected: {0}")]
    WriteRejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// True for the "file not found" surface; everything structural is corrupt.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}
