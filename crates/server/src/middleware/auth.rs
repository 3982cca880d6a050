//! Bearer token check for `/api/*` requests.

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use storetalk_shared::ProblemDetails;

use crate::routes::ApiProblem;
use crate::state::AppState;

/// Proof that the request carried the configured token, or that the server
/// runs without one.
#[derive(Debug, Clone, Copy)]
pub struct Authorized;

impl<S> FromRequestParts<S> for Authorized
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = ApiProblem;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let app_state = AppState::from_ref(state);
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        async move {
            if app_state.config.accepts(header.as_deref()) {
                Ok(Authorized)
            } else {
                tracing::warn!("Rejected request without a valid bearer token");
                Err(ProblemDetails::unauthorized("missing or invalid bearer token").into())
            }
        }
    }
}
