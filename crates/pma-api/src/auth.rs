//! PIN + JWT authentication
//!
//! A single PIN protects the gateway. Its salted hash lives in the
//! config store; a correct PIN at login yields an HS256 JWT with
//! `{authorized, exp, iat}` claims. While no PIN is configured the
//! surface is open and the session endpoint says so.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use pma_core::CoreError;
use pma_store::ConfigStore;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{ApiError, ApiResponse, ApiResult, AppState};

/// Config-store key holding the salted PIN hash.
pub const PIN_HASH_KEY: &str = "auth.pin_hash";

/// Token lifetime.
pub const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

/// JWT claims.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub authorized: bool,
    pub exp: i64,
    pub iat: i64,
}

/// PIN storage and token issuing over the config store.
pub struct AuthService {
    store: Arc<dyn ConfigStore>,
    jwt_secret: String,
}

impl AuthService {
    pub fn new(store: Arc<dyn ConfigStore>, jwt_secret: String) -> Self {
        Self { store, jwt_secret }
    }

    /// Whether a PIN is configured; without one the surface is open.
    pub fn auth_required(&self) -> bool {
        matches!(self.store.get(PIN_HASH_KEY), Ok(Some(_)))
    }

    /// Set the PIN. Conflicts when one already exists.
    pub fn set_pin(&self, pin: &str) -> Result<(), CoreError> {
        validate_pin(pin)?;
        if self.auth_required() {
            return Err(CoreError::Conflict {
                kind: "pin",
                id: PIN_HASH_KEY.to_string(),
                reason: "a PIN is already configured".to_string(),
            });
        }

        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let stored = format!("{}${}", hex(&salt), hex(&hash_pin(&salt, pin)));
        self.store
            .set(PIN_HASH_KEY, &stored, false)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        info!("Authentication PIN configured");
        Ok(())
    }

    pub fn verify_pin(&self, pin: &str) -> Result<bool, CoreError> {
        let Some(stored) = self
            .store
            .get(PIN_HASH_KEY)
            .map_err(|e| CoreError::Internal(e.to_string()))?
        else {
            return Ok(false);
        };

        let Some((salt_hex, hash_hex)) = stored.split_once('$') else {
            warn!("Stored PIN hash is malformed");
            return Ok(false);
        };
        let Some(salt) = unhex(salt_hex) else {
            return Ok(false);
        };
        Ok(hex(&hash_pin(&salt, pin)) == hash_hex)
    }

    /// Exchange a correct PIN for a bearer token.
    pub fn login(&self, pin: &str) -> Result<(String, DateTime<Utc>), CoreError> {
        if !self.auth_required() {
            return Err(CoreError::Conflict {
                kind: "pin",
                id: PIN_HASH_KEY.to_string(),
                reason: "no PIN is configured".to_string(),
            });
        }
        if !self.verify_pin(pin)? {
            return Err(CoreError::Unauthenticated("invalid PIN".to_string()));
        }

        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(TOKEN_TTL_SECS);
        let claims = Claims {
            authorized: true,
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok((token, expires_at))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, CoreError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| CoreError::Unauthenticated(format!("invalid token: {e}")))?;

        if !data.claims.authorized {
            return Err(CoreError::Unauthenticated("token not authorized".to_string()));
        }
        Ok(data.claims)
    }
}

fn validate_pin(pin: &str) -> Result<(), CoreError> {
    if pin.len() < 4 || pin.len() > 8 || !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(CoreError::validation("pin", "must be 4 to 8 digits"));
    }
    Ok(())
}

fn hash_pin(salt: &[u8], pin: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(pin.as_bytes());
    hasher.finalize().to_vec()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn unhex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

// ==================== Middleware ====================

/// Bearer token from the Authorization header or, for WebSocket/SSE
/// clients that cannot set headers, a `token` query parameter.
fn extract_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    request
        .uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(|token| token.to_string())
}

/// Gate every protected route behind a valid token while a PIN is set.
pub async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.auth.auth_required() {
        return next.run(request).await;
    }

    let verified = extract_token(&request)
        .and_then(|token| state.auth.verify_token(&token).ok())
        .is_some();
    if verified {
        next.run(request).await
    } else {
        ApiError(CoreError::Unauthenticated(
            "missing or invalid bearer token".to_string(),
        ))
        .into_response()
    }
}

// ==================== Handlers ====================

#[derive(Debug, Deserialize)]
pub struct PinRequest {
    pub pin: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub valid: bool,
    pub auth_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// POST /api/auth/pin
pub async fn set_pin(
    State(state): State<AppState>,
    Json(body): Json<PinRequest>,
) -> ApiResult<Json<ApiResponse<&'static str>>> {
    state.auth.set_pin(&body.pin)?;
    Ok(ApiResponse::ok("pin configured"))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<PinRequest>,
) -> ApiResult<Json<ApiResponse<LoginResponse>>> {
    let (token, expires_at) = state.auth.login(&body.pin)?;
    Ok(ApiResponse::ok(LoginResponse { token, expires_at }))
}

/// GET /api/auth/session
pub async fn session(
    State(state): State<AppState>,
    request: Request,
) -> Json<ApiResponse<SessionInfo>> {
    let auth_required = state.auth.auth_required();
    let claims = extract_token(&request).and_then(|token| state.auth.verify_token(&token).ok());

    ApiResponse::ok(SessionInfo {
        valid: !auth_required || claims.is_some(),
        auth_required,
        expires_at: claims.map(|c| Utc.timestamp_opt(c.exp, 0).single().unwrap_or_else(Utc::now)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{body_json, make_gateway};
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_open_gateway_until_pin_is_set() {
        let gateway = make_gateway().await;
        let app = crate::create_router(gateway.state);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::get("/api/auth/session")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"]["auth_required"], false);
        assert_eq!(body["data"]["valid"], true);

        // Protected routes are reachable without a token
        let response = app
            .oneshot(HttpRequest::get("/api/entities").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_pin_login_flow() {
        let gateway = make_gateway().await;
        let app = crate::create_router(gateway.state);

        // Set the PIN
        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/auth/pin")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"pin": "1234"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Setting it again conflicts
        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/auth/pin")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"pin": "5678"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // Protected routes now require a token
        let response = app
            .clone()
            .oneshot(HttpRequest::get("/api/entities").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Wrong PIN is rejected
        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"pin": "0000"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Correct PIN yields a working token
        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"pin": "1234"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let token = body["data"]["token"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                HttpRequest::get("/api/entities")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Session reports validity and expiry
        let response = app
            .oneshot(
                HttpRequest::get("/api/auth/session")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"]["valid"], true);
        assert!(body["data"]["expires_at"].is_string());
    }

    #[tokio::test]
    async fn test_pin_validation() {
        let gateway = make_gateway().await;
        assert!(gateway.state.auth.set_pin("12").is_err());
        assert!(gateway.state.auth.set_pin("123456789").is_err());
        assert!(gateway.state.auth.set_pin("12ab").is_err());
        assert!(gateway.state.auth.set_pin("123456").is_ok());
    }

    #[tokio::test]
    async fn test_token_query_parameter() {
        let gateway = make_gateway().await;
        gateway.state.auth.set_pin("1234").unwrap();
        let (token, _) = gateway.state.auth.login("1234").unwrap();
        let app = crate::create_router(gateway.state);

        let response = app
            .oneshot(
                HttpRequest::get(format!("/api/entities?token={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_hex_roundtrip() {
        let bytes = [0x00, 0x7f, 0xff, 0x10];
        assert_eq!(unhex(&hex(&bytes)).unwrap(), bytes);
        assert!(unhex("abc").is_none());
        assert!(unhex("zz").is_none());
    }
}
