use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriveError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("lock conflict: {0}")]
    Conflict(String),
    #[error("lock expired: {0}")]
    Expired(String),

    /// Retry-eligible backing store failure (timeout, rate limited, 5xx).
    #[error("transient I/O error: {0}")]
    Transient(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    /// Non-retryable backing store failure that fits no narrower kind.
    #[error("permanent I/O error: {0}")]
    Permanent(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DriveError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DriveError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriveError::NotFound(_))
    }

    /// Classify an HTTP status returned by the backing store.
    pub fn from_http_status(code: u16, info: String) -> Self {
        match code {
            404 | 410 => DriveError::NotFound(info),
            401 | 403 => DriveError::PermissionDenied(info),
            400 | 411 | 413 | 416 => DriveError::InvalidParam(info),
            408 | 429 => DriveError::Transient(info),
            409 | 412 => DriveError::AlreadyExists(info),
            500..=599 => DriveError::Transient(format!("HTTP {} for {}", code, info)),
            _ => DriveError::Permanent(format!("HTTP {} for {}", code, info)),
        }
    }
}

pub type DriveResult<T> = std::result::Result<T, DriveError>;

impl From<std::io::Error> for DriveError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => DriveError::NotFound(err.to_string()),
            ErrorKind::AlreadyExists => DriveError::AlreadyExists(err.to_string()),
            ErrorKind::PermissionDenied => DriveError::PermissionDenied(err.to_string()),
            ErrorKind::InvalidInput => DriveError::InvalidParam(err.to_string()),
            ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => DriveError::Transient(err.to_string()),
            _ => DriveError::Permanent(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for DriveError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return DriveError::Transient(err.to_string());
        }
        if let Some(status) = err.status() {
            return DriveError::from_http_status(status.as_u16(), err.to_string());
        }
        if err.is_decode() {
            return DriveError::Permanent(format!("decode response failed: {}", err));
        }
        DriveError::Permanent(err.to_string())
    }
}

impl From<DriveError> for std::io::Error {
    fn from(err: DriveError) -> Self {
        use std::io::ErrorKind;
        let kind = match &err {
            DriveError::NotFound(_) => ErrorKind::NotFound,
            DriveError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            DriveError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            DriveError::InvalidParam(_) => ErrorKind::InvalidInput,
            DriveError::Transient(_) => ErrorKind::TimedOut,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
