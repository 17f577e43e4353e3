//! The `{code, message, data}` envelope.
//!
//! Every merchant- and admin-facing endpoint answers HTTP 200 with this
//! shape; `code` 0 is success and anything else is an
//! [`ErrorKind`](paygate_common::ErrorKind) code. Only the webhook
//! routes use HTTP status semantics.

use axum::{Json, response::{IntoResponse, Response}};
use paygate_common::Error;
use serde::Serialize;

pub const CODE_OK: u16 = 0;

#[derive(Clone, Debug, Serialize)]
pub struct Envelope {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Envelope {
    pub fn ok(data: impl Serialize) -> Self {
        Self {
            code: CODE_OK,
            message: "success".to_owned(),
            data: Some(
                serde_json::to_value(data)
                    .expect("response projections always serialize"),
            ),
        }
    }

    pub fn ok_empty() -> Self {
        Self { code: CODE_OK, message: "success".to_owned(), data: None }
    }
}

impl From<Error> for Envelope {
    fn from(err: Error) -> Self {
        Self { code: err.code(), message: err.msg.into_owned(), data: None }
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Fold a handler result into the envelope.
pub fn respond(result: Result<Envelope, Error>) -> Envelope {
    result.unwrap_or_else(Envelope::from)
}
