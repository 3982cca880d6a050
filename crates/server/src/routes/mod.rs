//! API route handlers.

pub mod rooms;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use storetalk_shared::ProblemDetails;

/// `application/problem+json` error response
pub struct ApiProblem(pub ProblemDetails);

impl IntoResponse for ApiProblem {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(self.0)).into_response();
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<ProblemDetails> for ApiProblem {
    fn from(problem: ProblemDetails) -> Self {
        Self(problem)
    }
}
