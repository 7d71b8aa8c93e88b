//! Response shaping: the error envelope and success helpers.
//!
//! Every error leaving the service renders as
//! `{"status":"error","message":"…"}` with the status code from
//! [`Error::status`]. Internal detail never reaches the wire; it is logged
//! here, once, with the request path for correlation.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, warn};

use crate::Error;

/// Handler result type: any `crate::Error` renders as the envelope.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Newtype that lets `crate::Error` implement `IntoResponse`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            error!(error = %err, "Request failed");
        } else {
            warn!(error = %err, status = status.as_u16(), "Request rejected");
        }

        let body = Json(json!({
            "status": "error",
            "message": err.public_message(),
        }));

        if status == StatusCode::UNAUTHORIZED {
            (status, [("WWW-Authenticate", "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

/// `{"status":"success", …fields}` with 200.
#[must_use]
pub fn success(mut fields: serde_json::Value) -> Response {
    if let Some(map) = fields.as_object_mut() {
        map.insert("status".to_string(), json!("success"));
    }
    Json(fields).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_shape() {
        let response = ApiError(Error::NotFound("tenant 'acme'".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn unauthenticated_carries_challenge_header() {
        let response = ApiError(Error::Authentication("bad token".into())).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("WWW-Authenticate"));
    }

    #[test]
    fn success_injects_status_field() {
        let response = success(json!({"allowed": true}));
        assert_eq!(response.status(), StatusCode::OK);
    }
}
