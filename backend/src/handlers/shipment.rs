//! Shipment handlers
//!
//! Authorization is base-scoped: preparing-side operations check against
//! the shipment's source base, receiving-side operations against its
//! target base.

use axum::{
    extract::{Path, State},
    Json,
};

use shared::permissions::AuthorizeContext;

use crate::error::AppResult;
use crate::middleware::CurrentUser;
use crate::services::shipment::{
    CreateShipmentInput, ShipmentService, ShipmentUpdateOutcome, ShipmentWithDetails,
    UpdateShipmentWhenPreparingInput, UpdateShipmentWhenReceivingInput,
};
use crate::AppState;

pub async fn create_shipment(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(input): Json<CreateShipmentInput>,
) -> AppResult<Json<ShipmentWithDetails>> {
    user.authorize(
        Some("shipment:create"),
        &AuthorizeContext::for_base(input.source_base_id),
    )?;

    let service = ShipmentService::new(state.db.clone());
    let shipment = service.create(user.user_id, input).await?;
    Ok(Json(shipment))
}

pub async fn get_shipment(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(shipment_id): Path<i64>,
) -> AppResult<Json<ShipmentWithDetails>> {
    let service = ShipmentService::new(state.db.clone());
    let shipment = service.get(shipment_id).await?;

    user.authorize(
        Some("shipment:read"),
        &AuthorizeContext::for_bases(&[
            shipment.shipment.source_base_id,
            shipment.shipment.target_base_id,
        ]),
    )?;

    Ok(Json(shipment))
}

pub async fn update_shipment_when_preparing(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(shipment_id): Path<i64>,
    Json(input): Json<UpdateShipmentWhenPreparingInput>,
) -> AppResult<Json<ShipmentUpdateOutcome>> {
    let service = ShipmentService::new(state.db.clone());
    let shipment = service.get(shipment_id).await?;

    user.authorize(
        Some("shipment:edit"),
        &AuthorizeContext::for_base(shipment.shipment.source_base_id),
    )?;

    let outcome = service
        .update_when_preparing(shipment_id, user.user_id, input)
        .await?;
    Ok(Json(outcome))
}

pub async fn send_shipment(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(shipment_id): Path<i64>,
) -> AppResult<Json<ShipmentWithDetails>> {
    let service = ShipmentService::new(state.db.clone());
    let shipment = service.get(shipment_id).await?;

    user.authorize(
        Some("shipment:edit"),
        &AuthorizeContext::for_base(shipment.shipment.source_base_id),
    )?;

    let shipment = service.send(shipment_id, user.user_id).await?;
    Ok(Json(shipment))
}

pub async fn start_receiving_shipment(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(shipment_id): Path<i64>,
) -> AppResult<Json<ShipmentWithDetails>> {
    let service = ShipmentService::new(state.db.clone());
    let shipment = service.get(shipment_id).await?;

    user.authorize(
        Some("shipment:edit"),
        &AuthorizeContext::for_base(shipment.shipment.target_base_id),
    )?;

    let shipment = service.start_receiving(shipment_id, user.user_id).await?;
    Ok(Json(shipment))
}

pub async fn update_shipment_when_receiving(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(shipment_id): Path<i64>,
    Json(input): Json<UpdateShipmentWhenReceivingInput>,
) -> AppResult<Json<ShipmentUpdateOutcome>> {
    let service = ShipmentService::new(state.db.clone());
    let shipment = service.get(shipment_id).await?;

    user.authorize(
        Some("shipment:edit"),
        &AuthorizeContext::for_base(shipment.shipment.target_base_id),
    )?;

    let outcome = service
        .update_when_receiving(shipment_id, user.user_id, input)
        .await?;
    Ok(Json(outcome))
}

pub async fn cancel_shipment(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(shipment_id): Path<i64>,
) -> AppResult<Json<ShipmentWithDetails>> {
    let service = ShipmentService::new(state.db.clone());
    let shipment = service.get(shipment_id).await?;

    // Either side may cancel while the shipment is being prepared
    user.authorize(
        Some("shipment:edit"),
        &AuthorizeContext::for_bases(&[
            shipment.shipment.source_base_id,
            shipment.shipment.target_base_id,
        ]),
    )?;

    let shipment = service.cancel(shipment_id, user.user_id).await?;
    Ok(Json(shipment))
}

pub async fn mark_shipment_lost(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(shipment_id): Path<i64>,
) -> AppResult<Json<ShipmentWithDetails>> {
    let service = ShipmentService::new(state.db.clone());
    let shipment = service.get(shipment_id).await?;

    user.authorize(
        Some("shipment:edit"),
        &AuthorizeContext::for_bases(&[
            shipment.shipment.source_base_id,
            shipment.shipment.target_base_id,
        ]),
    )?;

    let shipment = service.mark_lost(shipment_id, user.user_id).await?;
    Ok(Json(shipment))
}
