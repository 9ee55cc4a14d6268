//! Error types for the DOS drive layer.

use thiserror::Error;

/// DOS error codes surfaced by every drive operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DosError {
    #[error("Function number invalid")]
    FunctionNumberInvalid,

    #[error("File not found")]
    FileNotFound,

    #[error("Path not found")]
    PathNotFound,

    #[error("Access denied")]
    AccessDenied,

    #[error("Invalid handle")]
    InvalidHandle,

    #[error("Access code invalid")]
    AccessCodeInvalid,

    #[error("Data invalid")]
    DataInvalid,

    #[error("No more files")]
    NoMoreFiles,

    #[error("File already exists")]
    FileAlreadyExists,
}

impl DosError {
    /// Numeric DOS error code as returned in AX by INT 21h.
    pub fn code(self) -> u16 {
        match self {
            DosError::FunctionNumberInvalid => 0x01,
            DosError::FileNotFound => 0x02,
            DosError::PathNotFound => 0x03,
            DosError::AccessDenied => 0x05,
            DosError::InvalidHandle => 0x06,
            DosError::AccessCodeInvalid => 0x0c,
            DosError::DataInvalid => 0x0d,
            DosError::NoMoreFiles => 0x12,
            DosError::FileAlreadyExists => 0x50,
        }
    }
}

/// Result type for drive operations.
pub type DriveResult<T> = Result<T, DosError>;

/// Errors produced while applying a binary patch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("Unknown patch format")]
    UnknownFormat,

    #[error("Patch stream truncated")]
    Truncated,

    #[error("Source size mismatch: expected {expected}, got {actual}")]
    SourceSizeMismatch { expected: u64, actual: u64 },

    #[error("Target size mismatch: expected {expected}, got {actual}")]
    TargetSizeMismatch { expected: u64, actual: u64 },

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Copy out of range at offset {0}")]
    OutOfRange(u64),

    #[error("Unsupported patch feature: {0}")]
    Unsupported(&'static str),
}

impl From<PatchError> for DosError {
    fn from(_: PatchError) -> Self {
        DosError::DataInvalid
    }
}

/// Host-side errors (configuration, archives, real filesystem).
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("DOS error: {0}")]
    Dos(#[from] DosError),

    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Result type for host-side operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dos_error_codes() {
        assert_eq!(DosError::FileNotFound.code(), 2);
        assert_eq!(DosError::AccessDenied.code(), 5);
        assert_eq!(DosError::NoMoreFiles.code(), 18);
        assert_eq!(DosError::FileAlreadyExists.code(), 80);
    }

    #[test]
    fn test_patch_error_maps_to_data_invalid() {
        let e: DosError = PatchError::Truncated.into();
        assert_eq!(e, DosError::DataInvalid);
    }
}
