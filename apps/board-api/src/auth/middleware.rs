//! Bearer identity extraction.

use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::AppState;

use super::Identity;

/// Authenticated user extracted from `Authorization: Bearer <token>`, or from a
/// `token` query parameter (browsers cannot set headers on WebSocket upgrades).
#[derive(Debug, Clone)]
pub struct AuthUser(pub Identity);

/// Rejection returned when the bearer token is missing or invalid.
pub struct AuthError {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let code = if self.status == StatusCode::UNAUTHORIZED {
            "UNAUTHORIZED"
        } else {
            "UNAVAILABLE"
        };
        let body = serde_json::json!({
            "error": {
                "code": code,
                "message": self.message
            }
        });
        (self.status, Json(body)).into_response()
    }
}

fn unauthorized(message: &'static str) -> AuthError {
    AuthError {
        status: StatusCode::UNAUTHORIZED,
        message,
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(parts: &Parts) -> Result<String, AuthError> {
    if let Some(header) = parts.headers.get(AUTHORIZATION) {
        let header = header
            .to_str()
            .map_err(|_| unauthorized("Invalid Authorization header format"))?;
        return header
            .strip_prefix("Bearer ")
            .map(str::to_string)
            .ok_or_else(|| unauthorized("Invalid Authorization header format"));
    }

    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(query)| query.token)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| unauthorized("Missing Authorization header"))
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;

        let identity = state
            .auth
            .authenticate(&token)
            .await
            .map_err(|err| {
                tracing::warn!(?err, "identity lookup failed");
                AuthError {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    message: "Token lookup failed",
                }
            })?
            .ok_or_else(|| unauthorized("Invalid or expired token"))?;

        Ok(AuthUser(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(uri: &str, bearer: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn query_token_is_percent_decoded() {
        let parts = parts("/ws/boards/brd_1?board=x&token=ses%5Fabc%2Bdef", None);
        assert_eq!(bearer_token(&parts).ok().as_deref(), Some("ses_abc+def"));
    }

    #[test]
    fn header_wins_over_query() {
        let parts = parts("/ws/boards/brd_1?token=ses_query", Some("ses_header"));
        assert_eq!(bearer_token(&parts).ok().as_deref(), Some("ses_header"));
    }

    #[test]
    fn missing_or_empty_token_is_unauthorized() {
        for uri in ["/ws/boards/brd_1", "/ws/boards/brd_1?token=", "/ws/boards/brd_1?other=1"] {
            let err = bearer_token(&parts(uri, None)).err().expect("rejected");
            assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        }
    }
}
