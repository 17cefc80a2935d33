use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::Request;
use axum::response::IntoResponse;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use tracing::debug;

use super::{Handler, Stage};
use crate::config::AuthConfig;
use crate::error::GatewayError;

/// Authenticates requests with either a known `X-API-Key` or an
/// `Authorization: Bearer <jwt>` token signed with the configured secret.
/// A present-but-wrong API key is rejected outright, without falling back
/// to JWT.
pub struct AuthStage {
    api_keys: HashSet<String>,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AuthStage {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // exp is honored when present, but tokens without one still verify.
        validation.required_spec_claims = HashSet::new();

        Self {
            api_keys: config.api_keys.iter().cloned().collect(),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        }
    }

    fn authorize(&self, req: &Request) -> Result<(), GatewayError> {
        if let Some(key) = req.headers().get("x-api-key").and_then(|v| v.to_str().ok()) {
            if self.api_keys.contains(key) {
                return Ok(());
            }
            return Err(GatewayError::Unauthorized("invalid API key".to_string()));
        }

        let Some(auth_header) = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
        else {
            return Err(GatewayError::Unauthorized("missing credentials".to_string()));
        };

        let Some(token) = auth_header.strip_prefix("Bearer ") else {
            return Err(GatewayError::Unauthorized(
                "invalid authorization header".to_string(),
            ));
        };

        decode::<serde_json::Value>(token, &self.decoding_key, &self.validation)
            .map(|_| ())
            .map_err(|e| GatewayError::Unauthorized(format!("invalid token: {e}")))
    }
}

impl Stage for AuthStage {
    fn wrap(&self, next: Handler) -> Handler {
        let stage = Arc::new(Self {
            api_keys: self.api_keys.clone(),
            decoding_key: self.decoding_key.clone(),
            validation: self.validation.clone(),
        });
        Handler::new(move |req| {
            let next = next.clone();
            let stage = stage.clone();
            async move {
                if let Err(err) = stage.authorize(&req) {
                    debug!(path = %req.uri().path(), error = %err, "request rejected");
                    return err.into_response();
                }
                next.call(req).await
            }
        })
    }
}
