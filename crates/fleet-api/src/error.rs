//! Error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use fleet_core::Error;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// An orchestrator error on its way to the client.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Orchestrator(Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Orchestrator(e) => match e {
                Error::ResultParse(_) => StatusCode::UNPROCESSABLE_ENTITY,
                Error::NodeNotFound(_) | Error::ConfigurationMismatch { .. } => {
                    StatusCode::NOT_FOUND
                }
                Error::Storage(_) | Error::Network(_) | Error::EventSource(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Orchestrator(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::Unauthorized => ErrorBody {
                error: "missing or invalid callback token".to_string(),
                error_code: None,
            },
            ApiError::Orchestrator(e) => ErrorBody {
                error: e.to_string(),
                error_code: matches!(e, Error::ResultParse(_)).then(|| e.error_code().to_string()),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let status = |e: Error| ApiError::from(e).status();
        assert_eq!(status(Error::ResultParse("bad".into())), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status(Error::NodeNotFound("n1".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status(Error::ConfigurationMismatch {
                kind: "runtime",
                name: "lab".into()
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status(Error::Storage("down".into())), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status(Error::Internal("bug".into())), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }
}
