//! Stock box handlers

use axum::{
    extract::{Path, State},
    Json,
};

use shared::permissions::AuthorizeContext;

use crate::models::StockBox;

use crate::error::AppResult;
use crate::middleware::CurrentUser;
use crate::services::stock::{BoxService, CreateBoxInput};
use crate::AppState;

pub async fn create_box(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(input): Json<CreateBoxInput>,
) -> AppResult<Json<StockBox>> {
    let service = BoxService::new(state.db.clone());

    // The box lives at its location's base
    let base_id: i64 = sqlx::query_scalar(
        "SELECT base_id FROM locations WHERE id = $1 AND deleted_on IS NULL",
    )
    .bind(input.location_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| crate::error::AppError::NotFound("Location".to_string()))?;

    user.authorize(Some("stock:write"), &AuthorizeContext::for_base(base_id))?;

    let stock_box = service.create(user.user_id, input).await?;
    Ok(Json(stock_box))
}

pub async fn get_box(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(label_identifier): Path<String>,
) -> AppResult<Json<StockBox>> {
    let service = BoxService::new(state.db.clone());
    let stock_box = service.get_by_label(&label_identifier).await?;

    let base_id: i64 = sqlx::query_scalar("SELECT base_id FROM locations WHERE id = $1")
        .bind(stock_box.location_id)
        .fetch_one(&state.db)
        .await?;

    user.authorize(Some("stock:read"), &AuthorizeContext::for_base(base_id))?;

    Ok(Json(stock_box))
}
