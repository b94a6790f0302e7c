//! Caller identity extraction.
//!
//! Authentication happens upstream (a trusted proxy or an issued api key);
//! this extractor only materializes the already-validated identity. Missing
//! or malformed identity is 401; authorization proper is the service's job.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use std::collections::HashMap;

use super::error::ApiError;
use super::state::AppState;
use crate::domain::models::{CallerIdentity, Role};
use crate::infrastructure::config::ApiKeyIdentity;

/// Extractor wrapper around the caller identity.
#[derive(Debug, Clone)]
pub struct Caller(pub CallerIdentity);

/// Resolve an identity from headers: `authorization: Bearer <api-key>`
/// first, then the trusted `x-user-*` headers.
pub fn identity_from_headers(
    headers: &HeaderMap,
    api_keys: &HashMap<String, ApiKeyIdentity>,
) -> Result<CallerIdentity, ApiError> {
    if let Some(value) = headers.get("authorization") {
        let value = value
            .to_str()
            .map_err(|_| ApiError::unauthorized("malformed authorization header"))?;
        let key = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .ok_or_else(|| ApiError::unauthorized("expected bearer authorization"))?;
        return identity_from_api_key(key, api_keys);
    }

    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing caller identity"))?;
    let team = headers
        .get("x-user-team")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing x-user-team header"))?;
    let role = headers
        .get("x-user-role")
        .and_then(|v| v.to_str().ok())
        .and_then(Role::from_str)
        .ok_or_else(|| ApiError::unauthorized("missing or unknown x-user-role header"))?;

    Ok(CallerIdentity::new(user_id, team, role))
}

/// Resolve an identity from a configured api key.
pub fn identity_from_api_key(
    key: &str,
    api_keys: &HashMap<String, ApiKeyIdentity>,
) -> Result<CallerIdentity, ApiError> {
    let identity = api_keys.get(key).ok_or_else(|| ApiError::unauthorized("unknown api key"))?;
    let role = Role::from_str(&identity.role)
        .ok_or_else(|| ApiError::unauthorized("api key has an unknown role"))?;
    Ok(CallerIdentity::new(&identity.user_id, &identity.team, role))
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        identity_from_headers(&parts.headers, &state.api_keys).map(Caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn keys() -> HashMap<String, ApiKeyIdentity> {
        let mut keys = HashMap::new();
        keys.insert(
            "secret-key".to_string(),
            ApiKeyIdentity {
                user_id: "svc".to_string(),
                team: "infra".to_string(),
                role: "operator".to_string(),
            },
        );
        keys
    }

    #[test]
    fn test_bearer_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret-key"));
        let identity = identity_from_headers(&headers, &keys()).unwrap();
        assert_eq!(identity.user_id, "svc");
        assert_eq!(identity.role, Role::Operator);
    }

    #[test]
    fn test_trusted_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("alice"));
        headers.insert("x-user-team", HeaderValue::from_static("platform"));
        headers.insert("x-user-role", HeaderValue::from_static("designer"));
        let identity = identity_from_headers(&headers, &keys()).unwrap();
        assert_eq!(identity.user_id, "alice");
        assert_eq!(identity.role, Role::Designer);
    }

    #[test]
    fn test_missing_identity_is_unauthorized() {
        let headers = HeaderMap::new();
        assert!(identity_from_headers(&headers, &keys()).is_err());

        let mut bad_key = HeaderMap::new();
        bad_key.insert("authorization", HeaderValue::from_static("Bearer wrong"));
        assert!(identity_from_headers(&bad_key, &keys()).is_err());

        let mut bad_role = HeaderMap::new();
        bad_role.insert("x-user-id", HeaderValue::from_static("alice"));
        bad_role.insert("x-user-team", HeaderValue::from_static("platform"));
        bad_role.insert("x-user-role", HeaderValue::from_static("wizard"));
        assert!(identity_from_headers(&bad_role, &keys()).is_err());
    }
}
