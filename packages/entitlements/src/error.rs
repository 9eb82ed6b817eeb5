use serde::{Serialize, Serializer, ser::SerializeStruct};

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Conflict,
    ProviderUnavailable,
    MalformedRecord,
    Store,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            ErrorKind::MalformedRecord => "MALFORMED_RECORD",
            ErrorKind::Store => "STORE_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// Errors that must abort a whole request instead of being collected
    /// into a per-identity result.
    pub fn aborts_request(&self) -> bool {
        matches!(self, ErrorKind::Forbidden)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileError {
    kind: ErrorKind,
    message: String,
}

// Associated constants for enum-like usage without a message
impl ReconcileError {
    pub const NOT_FOUND: ReconcileError = ReconcileError {
        kind: ErrorKind::NotFound,
        message: String::new(),
    };

    pub const FORBIDDEN: ReconcileError = ReconcileError {
        kind: ErrorKind::Forbidden,
        message: String::new(),
    };
}

impl ReconcileError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        if self.message.is_empty() {
            self.kind.code()
        } else {
            &self.message
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::debug!("Not found: {}", msg);
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Forbidden: {}", msg);
        Self::new(ErrorKind::Forbidden, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Conflict: {}", msg);
        Self::new(ErrorKind::Conflict, msg)
    }

    pub fn provider_unavailable(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Provider unavailable: {}", msg);
        Self::new(ErrorKind::ProviderUnavailable, msg)
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Malformed record: {}", msg);
        Self::new(ErrorKind::MalformedRecord, msg)
    }

    pub fn store(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!("Store error: {}", msg);
        Self::new(ErrorKind::Store, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!("Internal error: {}", msg);
        Self::new(ErrorKind::Internal, msg)
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::not_found(what),
            StoreError::Malformed(what) => Self::malformed(what),
            other => Self::store(other.to_string()),
        }
    }
}

impl From<sea_orm::DbErr> for ReconcileError {
    fn from(err: sea_orm::DbErr) -> Self {
        tracing::error!("Database error: {:?}", err);
        Self::new(ErrorKind::Store, err.to_string())
    }
}

impl From<stripe::StripeError> for ReconcileError {
    fn from(err: stripe::StripeError) -> Self {
        // Provider failures degrade resolution instead of failing it
        Self::provider_unavailable(format!("Stripe error: {}", err))
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed(format!("JSON error: {}", err))
    }
}

impl Serialize for ReconcileError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut body = serializer.serialize_struct("ReconcileError", 2)?;
        body.serialize_field("code", self.code())?;
        body.serialize_field("message", self.message())?;
        body.end()
    }
}

impl std::error::Error for ReconcileError {}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;

// Convenience macros for quick error creation
#[macro_export]
macro_rules! not_found {
    ($($arg:tt)*) => { $crate::error::ReconcileError::not_found(format!($($arg)*)) };
}

#[macro_export]
macro_rules! forbidden {
    ($($arg:tt)*) => { $crate::error::ReconcileError::forbidden(format!($($arg)*)) };
}

#[macro_export]
macro_rules! conflict {
    ($($arg:tt)*) => { $crate::error::ReconcileError::conflict(format!($($arg)*)) };
}

#[macro_export]
macro_rules! internal {
    ($($arg:tt)*) => { $crate::error::ReconcileError::internal(format!($($arg)*)) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serializes_as_code_and_message() {
        let err = ReconcileError::conflict("transaction 42 belongs to someone else");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "CONFLICT");
        assert_eq!(json["message"], "transaction 42 belongs to someone else");
    }

    #[test]
    fn test_constant_errors_fall_back_to_code() {
        assert_eq!(ReconcileError::FORBIDDEN.message(), "FORBIDDEN");
        assert!(ReconcileError::FORBIDDEN.kind().aborts_request());
        assert!(!ReconcileError::NOT_FOUND.kind().aborts_request());
    }

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err: ReconcileError = StoreError::NotFound("identity abc".into()).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
