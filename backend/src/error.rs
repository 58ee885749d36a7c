//! Error handling for the AidFlow backend
//!
//! Domain errors carry enough structure (expected state lists, conflicting
//! ids, rejected permissions) for the caller to correct the request.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use shared::models::{ShipmentState, TransferAgreementState};
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Authentication errors
    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {argument} {value} rejected")]
    Forbidden {
        /// The permission that was checked, if any
        permission: Option<String>,
        /// The deciding argument: permission, base, bases, organisation,
        /// organisations or user
        argument: &'static str,
        value: String,
    },

    // Agreement state/scope violations
    #[error("Invalid transfer agreement state: expected one of {expected:?}, got {actual:?}")]
    InvalidTransferAgreementState {
        expected: Vec<TransferAgreementState>,
        actual: TransferAgreementState,
    },

    #[error("Base {base_id} does not belong to organisation {organisation_id} or is deleted")]
    InvalidTransferAgreementBase { base_id: i64, organisation_id: i64 },

    #[error("Source and target organisation of a transfer agreement must differ")]
    InvalidTransferAgreementOrganisation,

    #[error("Invalid transfer agreement dates: {0}")]
    InvalidTransferAgreementDates(String),

    #[error("Partner organisation has no active bases")]
    NoActivePartnerBases,

    #[error("An equivalent transfer agreement already exists (id {existing_id})")]
    DuplicateTransferAgreement { existing_id: i64 },

    // Shipment state violations
    #[error("Invalid shipment state: expected one of {expected:?}, got {actual:?}")]
    InvalidShipmentState {
        expected: Vec<ShipmentState>,
        actual: ShipmentState,
    },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Label generation failed after {0} attempts")]
    LabelGenerationExhausted(u32),

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    // Internal errors
    #[error("Internal server error")]
    InternalError(#[from] anyhow::Error),
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl From<shared::permissions::AuthorizeFailure> for AppError {
    fn from(failure: shared::permissions::AuthorizeFailure) -> Self {
        AppError::Forbidden {
            permission: failure.permission,
            argument: failure.argument,
            value: failure.value,
        }
    }
}

impl From<shared::validation::StateGuardFailure<TransferAgreementState>> for AppError {
    fn from(failure: shared::validation::StateGuardFailure<TransferAgreementState>) -> Self {
        AppError::InvalidTransferAgreementState {
            expected: failure.expected,
            actual: failure.actual,
        }
    }
}

impl From<shared::validation::StateGuardFailure<ShipmentState>> for AppError {
    fn from(failure: shared::validation::StateGuardFailure<ShipmentState>) -> Self {
        AppError::InvalidShipmentState {
            expected: failure.expected,
            actual: failure.actual,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_detail) = match &self {
            AppError::TokenExpired => (
                StatusCode::UNAUTHORIZED,
                ErrorDetail {
                    code: "TOKEN_EXPIRED".to_string(),
                    message: "Token has expired".to_string(),
                    field: None,
                },
            ),
            AppError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                ErrorDetail {
                    code: "INVALID_TOKEN".to_string(),
                    message: "Invalid token".to_string(),
                    field: None,
                },
            ),
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                ErrorDetail {
                    code: "UNAUTHORIZED".to_string(),
                    message: msg.clone(),
                    field: None,
                },
            ),
            AppError::Forbidden {
                permission,
                argument,
                value,
            } => (
                StatusCode::FORBIDDEN,
                ErrorDetail {
                    code: "FORBIDDEN".to_string(),
                    message: match permission {
                        Some(p) => format!(
                            "Permission {} denied for {} {}",
                            p, argument, value
                        ),
                        None => format!("Access denied for {} {}", argument, value),
                    },
                    field: Some(argument.to_string()),
                },
            ),
            AppError::InvalidTransferAgreementState { expected, actual } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorDetail {
                    code: "INVALID_TRANSFER_AGREEMENT_STATE".to_string(),
                    message: format!(
                        "Expected agreement state to be one of {:?}, got {:?}",
                        expected, actual
                    ),
                    field: None,
                },
            ),
            AppError::InvalidTransferAgreementBase {
                base_id,
                organisation_id,
            } => (
                StatusCode::BAD_REQUEST,
                ErrorDetail {
                    code: "INVALID_TRANSFER_AGREEMENT_BASE".to_string(),
                    message: format!(
                        "Base {} is not an active base of organisation {}",
                        base_id, organisation_id
                    ),
                    field: None,
                },
            ),
            AppError::InvalidTransferAgreementOrganisation => (
                StatusCode::BAD_REQUEST,
                ErrorDetail {
                    code: "INVALID_TRANSFER_AGREEMENT_ORGANISATION".to_string(),
                    message: "Source and target organisation must differ".to_string(),
                    field: None,
                },
            ),
            AppError::InvalidTransferAgreementDates(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail {
                    code: "INVALID_TRANSFER_AGREEMENT_DATES".to_string(),
                    message: msg.clone(),
                    field: None,
                },
            ),
            AppError::NoActivePartnerBases => (
                StatusCode::BAD_REQUEST,
                ErrorDetail {
                    code: "NO_ACTIVE_PARTNER_BASES".to_string(),
                    message: "Partner organisation has no active bases".to_string(),
                    field: None,
                },
            ),
            AppError::DuplicateTransferAgreement { existing_id } => (
                StatusCode::CONFLICT,
                ErrorDetail {
                    code: "DUPLICATE_TRANSFER_AGREEMENT".to_string(),
                    message: format!(
                        "An agreement covering these bases and dates already exists (id {})",
                        existing_id
                    ),
                    field: None,
                },
            ),
            AppError::InvalidShipmentState { expected, actual } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorDetail {
                    code: "INVALID_SHIPMENT_STATE".to_string(),
                    message: format!(
                        "Expected shipment state to be one of {:?}, got {:?}",
                        expected, actual
                    ),
                    field: None,
                },
            ),
            AppError::ValidationError(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail {
                    code: "VALIDATION_ERROR".to_string(),
                    message: msg.clone(),
                    field: None,
                },
            ),
            AppError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                ErrorDetail {
                    code: "NOT_FOUND".to_string(),
                    message: format!("{} not found", resource),
                    field: None,
                },
            ),
            AppError::LabelGenerationExhausted(attempts) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail {
                    code: "LABEL_GENERATION_EXHAUSTED".to_string(),
                    message: format!(
                        "Could not generate a unique box label in {} attempts",
                        attempts
                    ),
                    field: None,
                },
            ),
            AppError::DatabaseError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail {
                    code: "DATABASE_ERROR".to_string(),
                    message: "A database error occurred".to_string(),
                    field: None,
                },
            ),
            AppError::InternalError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail {
                    code: "INTERNAL_ERROR".to_string(),
                    message: "An internal server error occurred".to_string(),
                    field: None,
                },
            ),
        };

        // Log the error for debugging
        tracing::error!("Error: {:?}", self);

        (status, Json(ErrorResponse { error: error_detail })).into_response()
    }
}

/// Result type alias for handlers
pub type AppResult<T> = Result<T, AppError>;
