//! Authentication middleware
//!
//! Validates bearer tokens issued by the external claims provider and
//! resolves the raw permission claims into a typed [`PermissionMap`] once
//! per request, at authentication time.

use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use shared::permissions::{AuthorizeContext, PermissionMap, Principal};

use crate::error::{AppError, AppResult, ErrorResponse};

/// Authenticated principal extracted from the bearer token
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub user_id: i64,
    pub organisation_id: i64,
    pub permissions: PermissionMap,
}

impl AuthUser {
    pub fn principal(&self) -> Principal {
        Principal {
            user_id: self.user_id,
            organisation_id: self.organisation_id,
        }
    }

    /// Authorize an action in the given context, failing with `Forbidden`
    pub fn authorize(
        &self,
        permission: Option<&str>,
        ctx: &AuthorizeContext<'_>,
    ) -> AppResult<()> {
        self.permissions
            .authorize(self.principal(), permission, ctx)
            .map_err(AppError::from)
    }
}

/// Authentication middleware that validates bearer tokens
///
/// The token validation is done inline to avoid state dependency issues;
/// the verification secret is read from the environment.
pub async fn auth_middleware(mut request: Request, next: Next) -> Response {
    // Extract Authorization header
    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(header) if header.starts_with("Bearer ") => &header[7..],
        _ => {
            return unauthorized_response("Missing or invalid Authorization header");
        }
    };

    let jwt_secret = std::env::var("AIDFLOW__JWT__SECRET")
        .or_else(|_| std::env::var("AIDFLOW_JWT_SECRET"))
        .unwrap_or_else(|_| "development-secret-key".to_string());

    let claims = match decode_jwt(token, &jwt_secret) {
        Ok(claims) => claims,
        Err(msg) => {
            return unauthorized_response(&msg);
        }
    };

    let user_id = match claims.sub.parse::<i64>() {
        Ok(id) => id,
        Err(_) => return unauthorized_response("Invalid user ID in token"),
    };

    // The "god" principal bypasses all permission checks
    let permissions = if claims.is_god {
        PermissionMap::god()
    } else {
        PermissionMap::from_claims(&claims.permissions)
    };

    let auth_user = AuthUser {
        user_id,
        organisation_id: claims.organisation_id,
        permissions,
    };

    request.extensions_mut().insert(auth_user);

    next.run(request).await
}

/// Claims supplied by the external claims provider
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Claims {
    sub: String,
    organisation_id: i64,
    #[serde(default)]
    is_god: bool,
    #[serde(default)]
    permissions: Vec<String>,
    exp: i64,
    iat: i64,
}

/// Decode and validate a bearer token
fn decode_jwt(token: &str, secret: &str) -> Result<Claims, String> {
    use jsonwebtoken::{decode, DecodingKey, Validation};

    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| format!("Invalid token: {}", e))
}

/// Create unauthorized response
fn unauthorized_response(message: &str) -> Response {
    let error = ErrorResponse {
        error: crate::error::ErrorDetail {
            code: "UNAUTHORIZED".to_string(),
            message: message.to_string(),
            field: None,
        },
    };

    (StatusCode::UNAUTHORIZED, Json(error)).into_response()
}

/// Extractor for the authenticated user
/// Use this in handlers to get the current principal
#[derive(Clone, Debug)]
pub struct CurrentUser(pub AuthUser);

#[axum::async_trait]
impl<S> axum::extract::FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .map(CurrentUser)
            .ok_or_else(|| {
                let error = ErrorResponse {
                    error: crate::error::ErrorDetail {
                        code: "UNAUTHORIZED".to_string(),
                        message: "Authentication required".to_string(),
                        field: None,
                    },
                };
                (StatusCode::UNAUTHORIZED, Json(error))
            })
    }
}
