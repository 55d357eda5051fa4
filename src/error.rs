use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Unimplemented,
    FailedPrecondition,
    Conflict,
    Backend,
    Internal,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::Unimplemented => "unimplemented",
            ErrorCode::FailedPrecondition => "failed_precondition",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Backend => "backend",
            ErrorCode::Internal => "internal",
            ErrorCode::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoKvError {
    #[error("record not found")]
    NotFound,
    #[error("record already exists")]
    AlreadyExists,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0} not implemented")]
    Unimplemented(&'static str),
    #[error("{0}")]
    FailedPrecondition(String),
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl ProtoKvError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtoKvError::NotFound => ErrorCode::NotFound,
            ProtoKvError::AlreadyExists => ErrorCode::AlreadyExists,
            ProtoKvError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            ProtoKvError::Unimplemented(_) => ErrorCode::Unimplemented,
            ProtoKvError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            ProtoKvError::Conflict(_) => ErrorCode::Conflict,
            ProtoKvError::Backend(_) => ErrorCode::Backend,
            ProtoKvError::Internal(_) => ErrorCode::Internal,
            ProtoKvError::Cancelled => ErrorCode::Cancelled,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        ProtoKvError::InvalidArgument(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProtoKvError::NotFound)
    }
}

impl From<prost::DecodeError> for ProtoKvError {
    fn from(err: prost::DecodeError) -> Self {
        ProtoKvError::Internal(format!("decode: {err}"))
    }
}

impl From<rusqlite::Error> for ProtoKvError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::DatabaseBusy
                    || code.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                ProtoKvError::Conflict(err.to_string())
            }
            _ => ProtoKvError::Backend(err.to_string()),
        }
    }
}

impl From<mysql::Error> for ProtoKvError {
    fn from(err: mysql::Error) -> Self {
        // 1213 = deadlock victim, 1205 = lock wait timeout; both are
        // retry-needed conditions rather than hard backend failures.
        if let mysql::Error::MySqlError(server) = &err {
            if server.code == 1213 || server.code == 1205 {
                return ProtoKvError::Conflict(err.to_string());
            }
        }
        ProtoKvError::Backend(err.to_string())
    }
}

impl From<r2d2::Error> for ProtoKvError {
    fn from(err: r2d2::Error) -> Self {
        ProtoKvError::Backend(format!("connection pool: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, ProtoKvError};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(ErrorCode::NotFound.as_str(), "not_found");
        assert_eq!(ErrorCode::AlreadyExists.as_str(), "already_exists");
        assert_eq!(ErrorCode::FailedPrecondition.as_str(), "failed_precondition");
        assert_eq!(ErrorCode::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn error_code_matches_variant() {
        assert_eq!(ProtoKvError::NotFound.code(), ErrorCode::NotFound);
        assert_eq!(
            ProtoKvError::invalid_argument("bad").code_str(),
            "invalid_argument"
        );
        assert!(ProtoKvError::NotFound.is_not_found());
        assert!(!ProtoKvError::Cancelled.is_not_found());
    }
}
