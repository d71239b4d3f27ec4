//! Error taxonomy shared by the router and the list service.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ordering::StructuralCorruption;
use crate::storage::StorageError;

/// Message sent to a client in place of the details of a fatal error.
pub const GENERIC_ERROR_MESSAGE: &str =
    "There was an error processing your request, please try again.";

/// Integer codes carried by error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum ErrorCode {
    /// Unexpected fault, e.g. storage failure
    Internal = 1,
    /// Observed by clients only
    Timeout = 10,
    /// Referenced list or item absent
    NotFound = 20,
    /// Uncategorized
    Unknown = 30,
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code as i32
    }
}

impl TryFrom<i32> for ErrorCode {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ErrorCode::Internal),
            10 => Ok(ErrorCode::Timeout),
            20 => Ok(ErrorCode::NotFound),
            30 => Ok(ErrorCode::Unknown),
            other => Err(format!("unknown error code {other}")),
        }
    }
}

/// Failures of a list operation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Corrupted(#[from] StructuralCorruption),
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::NotFound(_) => ErrorCode::NotFound,
            SyncError::InvalidRequest(_) => ErrorCode::Unknown,
            SyncError::Corrupted(_) | SyncError::Storage(_) | SyncError::Internal(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// Fatal errors close the originating connection after it is notified.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Storage(_) | SyncError::Internal(_))
    }

    /// The text a client is allowed to see.
    pub fn client_message(&self) -> String {
        if self.is_fatal() {
            GENERIC_ERROR_MESSAGE.to_string()
        } else {
            self.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_values() {
        assert_eq!(i32::from(ErrorCode::Internal), 1);
        assert_eq!(i32::from(ErrorCode::Timeout), 10);
        assert_eq!(i32::from(ErrorCode::NotFound), 20);
        assert_eq!(i32::from(ErrorCode::Unknown), 30);
        assert_eq!(ErrorCode::try_from(20), Ok(ErrorCode::NotFound));
        assert!(ErrorCode::try_from(2).is_err());
    }

    #[test]
    fn test_not_found_is_recoverable() {
        let err = SyncError::NotFound("No such list".into());
        assert!(!err.is_fatal());
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.client_message(), "No such list");
    }

    #[test]
    fn test_storage_failure_is_fatal_and_hidden() {
        let err = SyncError::from(StorageError::Database("disk on fire".into()));
        assert!(err.is_fatal());
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(err.client_message(), GENERIC_ERROR_MESSAGE);
    }

    #[test]
    fn test_corruption_is_reported_but_not_fatal() {
        let err = SyncError::from(StructuralCorruption { defects: Vec::new() });
        assert!(!err.is_fatal());
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[test]
    fn test_code_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&ErrorCode::NotFound).unwrap(), "20");
        let code: ErrorCode = serde_json::from_str("10").unwrap();
        assert_eq!(code, ErrorCode::Timeout);
    }
}
