//! The single error taxonomy all paygate services speak.
//!
//! Every expected failure surfaces as an [`Error`]: a stable [`ErrorKind`]
//! plus a user-facing message. Kinds map to a numeric `code` for the
//! `{code, message, data}` envelope and to an HTTP status for the admin
//! surface. Unexpected failures are folded into [`ErrorKind::Internal`]
//! with a correlation id logged on the way through.

use std::borrow::Cow;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Stable envelope code; `0` is reserved for success.
pub type ErrorCode = u16;

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Bad payload, decode failure, missing fields, validation failure.
    InvalidRequest,
    /// Bad signature, disallowed sign type, expired session.
    Unauthorized,
    /// Merchant / order / refund / account not found.
    NotFound,
    /// Duplicate key, idempotency mismatch, status-transition rejection.
    Conflict,
    /// A wallet debit would go negative.
    InsufficientFunds,
    /// Blacklist hit or daily cap exceeded.
    RiskBlocked,
    /// Selector found no eligible channel.
    NoAvailableChannel,
    /// Selector found channels but exhausted every sub-account.
    NoAvailableAccount,
    /// Upstream driver returned non-success or communication failed.
    GatewayError,
    /// Unexpected; details live in the server log, not the response.
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> ErrorCode {
        use ErrorKind::*;
        match self {
            InvalidRequest => 1001,
            Unauthorized => 1002,
            NotFound => 1003,
            Conflict => 1004,
            InsufficientFunds => 1005,
            RiskBlocked => 1006,
            NoAvailableChannel => 1007,
            NoAvailableAccount => 1008,
            GatewayError => 1009,
            Internal => 1000,
        }
    }

    /// HTTP status for surfaces that use statuses (admin, callbacks).
    /// The merchant API returns HTTP 200 regardless; this mapping is not
    /// consulted there.
    pub fn http_status(self) -> StatusCode {
        use ErrorKind::*;
        match self {
            InvalidRequest => StatusCode::BAD_REQUEST,
            Unauthorized => StatusCode::UNAUTHORIZED,
            NotFound => StatusCode::NOT_FOUND,
            Conflict => StatusCode::CONFLICT,
            InsufficientFunds => StatusCode::CONFLICT,
            RiskBlocked => StatusCode::FORBIDDEN,
            NoAvailableChannel => StatusCode::SERVICE_UNAVAILABLE,
            NoAvailableAccount => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError => StatusCode::BAD_GATEWAY,
            Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// An expected failure: taxonomy kind + user-facing message.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{msg}")]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: Cow<'static, str>,
}

impl Error {
    pub fn new(
        kind: ErrorKind,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self { kind, msg: msg.into() }
    }

    pub fn invalid_request(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::InvalidRequest, msg)
    }

    pub fn unauthorized(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Unauthorized, msg)
    }

    pub fn not_found(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn conflict(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Conflict, msg)
    }

    pub fn insufficient_funds(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::InsufficientFunds, msg)
    }

    pub fn risk_blocked(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::RiskBlocked, msg)
    }

    pub fn gateway_error(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::GatewayError, msg)
    }

    /// Fold an unexpected error into [`ErrorKind::Internal`], logging the
    /// chain under a correlation id. The id (not the chain) is surfaced to
    /// the caller.
    pub fn internal(err: anyhow::Error) -> Self {
        let correlation_id = uuid::Uuid::new_v4();
        error!(%correlation_id, err = ?err, "internal error");
        Self::new(
            ErrorKind::Internal,
            format!("internal error (ref {correlation_id})"),
        )
    }

    pub fn code(&self) -> ErrorCode {
        self.kind.code()
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        // An `Error` wrapped in anyhow context comes back out as itself.
        match err.downcast::<Error>() {
            Ok(e) => e,
            Err(err) => Self::internal(err),
        }
    }
}

/// Convenience alias used across engine and store code.
pub type PayResult<T> = Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_are_stable_and_distinct() {
        use ErrorKind::*;
        let kinds = [
            InvalidRequest,
            Unauthorized,
            NotFound,
            Conflict,
            InsufficientFunds,
            RiskBlocked,
            NoAvailableChannel,
            NoAvailableAccount,
            GatewayError,
            Internal,
        ];
        let mut codes: Vec<u16> = kinds.iter().map(|k| k.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn anyhow_roundtrip_preserves_kind() {
        let e = Error::conflict("duplicate order");
        let any: anyhow::Error = e.clone().into();
        let back = Error::from(any);
        assert_eq!(back, e);
    }
}
