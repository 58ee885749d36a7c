//! Stock box service
//!
//! Boxes are identified by an 8-digit label printed on a QR sticker. Labels
//! are drawn at random and retried on collision; the keyspace is large
//! enough that a handful of attempts always suffices in practice.

use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use sqlx::PgPool;

use shared::models::{BoxState, StockBox};

use crate::error::{AppError, AppResult};
use crate::services::history::{snapshot, HistoryService};

const LABEL_ATTEMPTS: u32 = 10;

/// Stock box service
#[derive(Clone)]
pub struct BoxService {
    db: PgPool,
}

/// Input for creating a box
#[derive(Debug, Deserialize)]
pub struct CreateBoxInput {
    pub product_id: i64,
    pub location_id: i64,
    pub size_id: i64,
    pub number_of_items: i32,
    pub comment: Option<String>,
}

impl BoxService {
    /// Create a new BoxService instance
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Create a box in stock with a freshly generated label
    pub async fn create(&self, user_id: i64, input: CreateBoxInput) -> AppResult<StockBox> {
        if input.number_of_items < 0 {
            return Err(AppError::ValidationError(
                "number_of_items must not be negative".to_string(),
            ));
        }

        let product_base: Option<i64> =
            sqlx::query_scalar("SELECT base_id FROM products WHERE id = $1 AND deleted_on IS NULL")
                .bind(input.product_id)
                .fetch_optional(&self.db)
                .await?;
        let location_base: Option<i64> =
            sqlx::query_scalar("SELECT base_id FROM locations WHERE id = $1 AND deleted_on IS NULL")
                .bind(input.location_id)
                .fetch_optional(&self.db)
                .await?;

        match (product_base, location_base) {
            (Some(p), Some(l)) if p == l => {}
            (None, _) => return Err(AppError::NotFound("Product".to_string())),
            (_, None) => return Err(AppError::NotFound("Location".to_string())),
            _ => {
                return Err(AppError::ValidationError(
                    "product and location must belong to the same base".to_string(),
                ))
            }
        }

        let label_identifier = self.generate_label().await?;

        let mut tx = self.db.begin().await?;

        let stock_box = sqlx::query_as::<_, StockBox>(
            r#"
            INSERT INTO boxes (
                label_identifier, product_id, location_id, size_id, number_of_items,
                state, comment, created_by, created_on, last_modified_by, last_modified_on
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $8, $9)
            RETURNING id, label_identifier, product_id, location_id, size_id, number_of_items,
                      state, comment, created_by, created_on, last_modified_by, last_modified_on,
                      deleted_on
            "#,
        )
        .bind(&label_identifier)
        .bind(input.product_id)
        .bind(input.location_id)
        .bind(input.size_id)
        .bind(input.number_of_items)
        .bind(BoxState::InStock)
        .bind(&input.comment)
        .bind(user_id)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        HistoryService::record_creation(&mut tx, "boxes", stock_box.id, user_id, &snapshot(&stock_box)?)
            .await?;

        tx.commit().await?;

        Ok(stock_box)
    }

    /// Get a box by its label identifier
    pub async fn get_by_label(&self, label_identifier: &str) -> AppResult<StockBox> {
        sqlx::query_as::<_, StockBox>(
            r#"
            SELECT id, label_identifier, product_id, location_id, size_id, number_of_items,
                   state, comment, created_by, created_on, last_modified_by, last_modified_on,
                   deleted_on
            FROM boxes
            WHERE label_identifier = $1 AND deleted_on IS NULL
            "#,
        )
        .bind(label_identifier)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound("Box".to_string()))
    }

    /// Draw random 8-digit labels until one is free
    async fn generate_label(&self) -> AppResult<String> {
        for _ in 0..LABEL_ATTEMPTS {
            let candidate = {
                let mut rng = rand::thread_rng();
                format!("{:08}", rng.gen_range(0..=99_999_999u32))
            };
            let taken: Option<i64> =
                sqlx::query_scalar("SELECT id FROM boxes WHERE label_identifier = $1")
                    .bind(&candidate)
                    .fetch_optional(&self.db)
                    .await?;
            if taken.is_none() {
                return Ok(candidate);
            }
            tracing::debug!(label = %candidate, "box label collision, retrying");
        }
        Err(AppError::LabelGenerationExhausted(LABEL_ATTEMPTS))
    }
}
