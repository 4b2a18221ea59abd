use thiserror::Error;

#[derive(Debug, Error)]
pub enum TesseraError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid expression: {0}")]
    InvalidExpression(String),
    #[error("invalid data type: {0}")]
    InvalidDataType(String),
    #[error("no permission: {0}")]
    NoPermission(String),
    #[error("duplicate identifier")]
    DuplicateIdentifier,
    #[error("lock not available")]
    LockNotAvailable,
    #[error("recursive data detected")]
    RecursiveDataDetected,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
}

impl TesseraError {
    /// Message safe to show to the caller. Denials never reveal which check failed.
    pub fn public_message(&self) -> &'static str {
        match self {
            TesseraError::NoPermission(_)
            | TesseraError::InvalidPath(_)
            | TesseraError::InvalidExpression(_) => "request denied",
            TesseraError::InvalidDataType(_) | TesseraError::RecursiveDataDetected => {
                "invalid request"
            }
            TesseraError::DuplicateIdentifier => "duplicate identifier",
            TesseraError::LockNotAvailable => "resource busy",
            TesseraError::Database(_) | TesseraError::Json(_) | TesseraError::Config(_) => {
                "internal error"
            }
        }
    }

    pub fn is_retryable_duplicate(&self) -> bool {
        matches!(self, TesseraError::DuplicateIdentifier)
    }
}

pub type Result<T> = std::result::Result<T, TesseraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denials_share_one_public_message() {
        let a = TesseraError::NoPermission("field secret".into());
        let b = TesseraError::InvalidPath("Note.nope".into());
        assert_eq!(a.public_message(), b.public_message());
        assert!(!a.public_message().contains("secret"));
    }
}
