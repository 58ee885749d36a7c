//! Transfer agreement handlers

use axum::{
    extract::{Path, State},
    Json,
};

use shared::permissions::AuthorizeContext;

use crate::error::AppResult;
use crate::middleware::CurrentUser;
use crate::services::agreement::{
    CreateTransferAgreementInput, TransferAgreementService, TransferAgreementWithDetails,
};
use crate::AppState;

/// Create a transfer agreement on behalf of the caller's organisation
pub async fn create_transfer_agreement(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(input): Json<CreateTransferAgreementInput>,
) -> AppResult<Json<TransferAgreementWithDetails>> {
    user.authorize(
        Some("transfer_agreement:create"),
        &AuthorizeContext::for_organisation(user.organisation_id),
    )?;

    let service = TransferAgreementService::new(state.db.clone());
    let agreement = service
        .create(user.organisation_id, user.user_id, input)
        .await?;
    Ok(Json(agreement))
}

pub async fn accept_transfer_agreement(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(agreement_id): Path<i64>,
) -> AppResult<Json<TransferAgreementWithDetails>> {
    user.authorize(
        Some("transfer_agreement:edit"),
        &AuthorizeContext::for_organisation(user.organisation_id),
    )?;

    let service = TransferAgreementService::new(state.db.clone());
    let agreement = service
        .accept(agreement_id, user.organisation_id, user.user_id)
        .await?;
    Ok(Json(agreement))
}

pub async fn reject_transfer_agreement(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(agreement_id): Path<i64>,
) -> AppResult<Json<TransferAgreementWithDetails>> {
    user.authorize(
        Some("transfer_agreement:edit"),
        &AuthorizeContext::for_organisation(user.organisation_id),
    )?;

    let service = TransferAgreementService::new(state.db.clone());
    let agreement = service
        .reject(agreement_id, user.organisation_id, user.user_id)
        .await?;
    Ok(Json(agreement))
}

pub async fn cancel_transfer_agreement(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(agreement_id): Path<i64>,
) -> AppResult<Json<TransferAgreementWithDetails>> {
    user.authorize(
        Some("transfer_agreement:edit"),
        &AuthorizeContext::for_organisation(user.organisation_id),
    )?;

    let service = TransferAgreementService::new(state.db.clone());
    let agreement = service
        .cancel(agreement_id, user.organisation_id, user.user_id)
        .await?;
    Ok(Json(agreement))
}

pub async fn get_transfer_agreement(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(agreement_id): Path<i64>,
) -> AppResult<Json<TransferAgreementWithDetails>> {
    user.authorize(
        Some("transfer_agreement:read"),
        &AuthorizeContext::for_organisation(user.organisation_id),
    )?;

    let service = TransferAgreementService::new(state.db.clone());
    let agreement = service.get(agreement_id).await?;
    Ok(Json(agreement))
}
