//! Error types shared across the workspace

/// Rejected request shapes (bad fields, empty target set...)
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// Checksum parsing and verification failures
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("invalid checksum '{0}'")]
    Invalid(String),
    #[error("unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Block-wise transfer failures. Any of these aborts the whole transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid block size exponent {0} (expected 0..=6)")]
    InvalidSzx(u8),
    #[error("block number {0} out of range")]
    BlockOutOfRange(u32),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("block source error: {0}")]
    Source(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
