//! Shipment service
//!
//! Creates shipments under accepted transfer agreements and moves them
//! through Preparing → Sent → Receiving → Completed/Lost (Canceled only
//! from Preparing, Lost also from Sent). Bulk box operations have
//! silent-discard semantics: ineligible entries are skipped, never errors.
//!
//! Whenever a shipment detail is opened or closed, the owning box's state
//! is updated in the same transaction (see `open_detail`/`close_detail_*`);
//! no transition leaves a box pointing at a closed-but-unreconciled detail.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};

use shared::models::{
    BoxState, Shipment, ShipmentDetail, ShipmentState, TransferAgreement,
    TransferAgreementState, TransferAgreementType,
};
use shared::types::BulkOutcome;
use shared::validation::{
    box_eligible_for_preparation, box_eligible_for_receiving, box_eligible_for_removal,
    ensure_shipment_state, resolve_shipment_outcome, shipment_bases_permitted, shipment_label,
    SHIPMENT_IN_TRANSIT_STATES, SHIPMENT_PREPARATION_STATES, SHIPMENT_RECONCILIATION_STATES,
};

use crate::error::{AppError, AppResult};
use crate::services::agreement::TransferAgreementService;
use crate::services::history::{snapshot, HistoryService};

/// Shipment service
#[derive(Clone)]
pub struct ShipmentService {
    db: PgPool,
}

/// Input for creating a shipment
#[derive(Debug, Deserialize)]
pub struct CreateShipmentInput {
    pub source_base_id: i64,
    pub target_base_id: i64,
    pub transfer_agreement_id: i64,
}

/// Input for updating a shipment while it is being prepared
#[derive(Debug, Deserialize)]
pub struct UpdateShipmentWhenPreparingInput {
    #[serde(default)]
    pub prepared_box_label_identifiers: Vec<String>,
    #[serde(default)]
    pub removed_box_label_identifiers: Vec<String>,
    pub target_base_id: Option<i64>,
}

/// One received-box reconciliation entry
#[derive(Debug, Deserialize)]
pub struct ShipmentDetailUpdateInput {
    pub id: i64,
    pub target_product_id: i64,
    pub target_location_id: i64,
    pub target_size_id: i64,
}

/// Input for updating a shipment while it is being received
#[derive(Debug, Deserialize)]
pub struct UpdateShipmentWhenReceivingInput {
    #[serde(default)]
    pub received_shipment_detail_updates: Vec<ShipmentDetailUpdateInput>,
    #[serde(default)]
    pub lost_box_label_identifiers: Vec<String>,
}

/// A shipment with its human-readable label and per-box details
#[derive(Debug, Clone, Serialize)]
pub struct ShipmentWithDetails {
    #[serde(flatten)]
    pub shipment: Shipment,
    pub label: String,
    pub details: Vec<ShipmentDetail>,
}

/// Result of a bulk shipment update: the updated aggregate plus which box
/// label identifiers were applied and which were silently skipped
#[derive(Debug, Serialize)]
pub struct ShipmentUpdateOutcome {
    pub shipment: ShipmentWithDetails,
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

/// Candidate box with the base its current location belongs to
#[derive(Debug, FromRow)]
struct BoxRow {
    id: i64,
    label_identifier: String,
    product_id: i64,
    location_id: i64,
    size_id: i64,
    state: BoxState,
    base_id: i64,
}

/// Open shipment detail joined with its box
#[derive(Debug, FromRow)]
struct DetailBoxRow {
    detail_id: i64,
    box_id: i64,
    label_identifier: String,
    box_state: BoxState,
}

/// Reconciliation candidate: the detail's box plus whether the detail is
/// still open
#[derive(Debug, FromRow)]
struct ReceiveCandidateRow {
    detail_id: i64,
    box_id: i64,
    label_identifier: String,
    box_state: BoxState,
    open: bool,
}

impl ShipmentService {
    /// Create a new ShipmentService instance
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    fn agreements(&self) -> TransferAgreementService {
        TransferAgreementService::new(self.db.clone())
    }

    /// Create a shipment under an accepted agreement
    pub async fn create(&self, user_id: i64, input: CreateShipmentInput) -> AppResult<ShipmentWithDetails> {
        let agreements = self.agreements();
        let agreement = agreements.fetch_agreement(input.transfer_agreement_id).await?;
        if agreement.state != TransferAgreementState::Accepted {
            return Err(AppError::InvalidTransferAgreementState {
                expected: vec![TransferAgreementState::Accepted],
                actual: agreement.state,
            });
        }
        // An accepted agreement past its validity window no longer covers
        // new shipments
        if agreement.valid_until.is_some_and(|until| until < Utc::now()) {
            return Err(AppError::InvalidTransferAgreementState {
                expected: vec![TransferAgreementState::Accepted],
                actual: TransferAgreementState::Expired,
            });
        }

        self.validate_shipment_bases(&agreement, input.source_base_id, input.target_base_id)
            .await?;

        let mut tx = self.db.begin().await?;

        let shipment = sqlx::query_as::<_, Shipment>(
            r#"
            INSERT INTO shipments (source_base_id, target_base_id, transfer_agreement_id, state, started_by, started_on)
            VALUES ($1, $2, $3, 'preparing', $4, $5)
            RETURNING id, source_base_id, target_base_id, transfer_agreement_id, state,
                      started_by, started_on, sent_by, sent_on, receiving_started_by, receiving_started_on,
                      completed_by, completed_on, canceled_by, canceled_on
            "#,
        )
        .bind(input.source_base_id)
        .bind(input.target_base_id)
        .bind(input.transfer_agreement_id)
        .bind(user_id)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        HistoryService::record_creation(
            &mut tx,
            "shipments",
            shipment.id,
            user_id,
            &snapshot(&shipment)?,
        )
        .await?;

        tx.commit().await?;

        self.aggregate(shipment).await
    }

    /// Update a shipment while it is being prepared: pull boxes in, return
    /// boxes to stock, optionally re-target the shipment
    pub async fn update_when_preparing(
        &self,
        shipment_id: i64,
        user_id: i64,
        input: UpdateShipmentWhenPreparingInput,
    ) -> AppResult<ShipmentUpdateOutcome> {
        let shipment = self.fetch_shipment(shipment_id).await?;
        ensure_shipment_state(SHIPMENT_PREPARATION_STATES, shipment.state)?;

        // Re-validate a changed target base against the agreement before
        // touching anything
        let new_target = match input.target_base_id {
            Some(target) if target != shipment.target_base_id => {
                let agreement = self
                    .agreements()
                    .fetch_agreement(shipment.transfer_agreement_id)
                    .await?;
                self.validate_shipment_bases(&agreement, shipment.source_base_id, target)
                    .await?;
                Some(target)
            }
            _ => None,
        };

        let mut outcome = BulkOutcome::new();
        let mut tx = self.db.begin().await?;

        if let Some(target) = new_target {
            sqlx::query("UPDATE shipments SET target_base_id = $1 WHERE id = $2")
                .bind(target)
                .bind(shipment.id)
                .execute(&mut *tx)
                .await?;
            HistoryService::record(
                &mut tx,
                "shipments",
                shipment.id,
                user_id,
                "target_base_id",
                &serde_json::json!(shipment.target_base_id),
                &serde_json::json!(target),
            )
            .await?;
        }

        self.prepare_boxes(
            &mut tx,
            &shipment,
            user_id,
            &input.prepared_box_label_identifiers,
            &mut outcome,
        )
        .await?;
        self.remove_prepared_boxes(
            &mut tx,
            &shipment,
            user_id,
            &input.removed_box_label_identifiers,
            &mut outcome,
        )
        .await?;

        tx.commit().await?;

        if outcome.is_noop() {
            tracing::debug!(shipment_id, "bulk shipment update applied no boxes");
        }

        let shipment = self.fetch_shipment(shipment_id).await?;
        Ok(ShipmentUpdateOutcome {
            shipment: self.aggregate(shipment).await?,
            applied: outcome.applied,
            skipped: outcome.skipped,
        })
    }

    /// Dispatch a prepared shipment
    pub async fn send(&self, shipment_id: i64, user_id: i64) -> AppResult<ShipmentWithDetails> {
        let shipment = self.fetch_shipment(shipment_id).await?;
        ensure_shipment_state(SHIPMENT_PREPARATION_STATES, shipment.state)?;

        self.transition(
            &shipment,
            user_id,
            "UPDATE shipments SET state = 'sent', sent_by = $1, sent_on = $2 WHERE id = $3",
        )
        .await
    }

    /// Start receiving a sent shipment; every box still marked for shipment
    /// moves into the receiving state
    pub async fn start_receiving(
        &self,
        shipment_id: i64,
        user_id: i64,
    ) -> AppResult<ShipmentWithDetails> {
        let shipment = self.fetch_shipment(shipment_id).await?;
        ensure_shipment_state(SHIPMENT_IN_TRANSIT_STATES, shipment.state)?;

        let mut tx = self.db.begin().await?;

        sqlx::query(
            "UPDATE shipments SET state = 'receiving', receiving_started_by = $1, receiving_started_on = $2 WHERE id = $3",
        )
        .bind(user_id)
        .bind(Utc::now())
        .bind(shipment.id)
        .execute(&mut *tx)
        .await?;

        for row in open_details(&mut tx, shipment.id).await? {
            if row.box_state != BoxState::MarkedForShipment {
                continue;
            }
            update_box_state(&mut tx, row.box_id, BoxState::Receiving, user_id).await?;
            HistoryService::record(
                &mut tx,
                "boxes",
                row.box_id,
                user_id,
                "state",
                &serde_json::json!(row.box_state),
                &serde_json::json!(BoxState::Receiving),
            )
            .await?;
        }

        let updated = fetch_shipment_tx(&mut tx, shipment.id).await?;
        HistoryService::diff_and_record(
            &mut tx,
            "shipments",
            shipment.id,
            user_id,
            &snapshot(&shipment)?,
            &snapshot(&updated)?,
        )
        .await?;

        tx.commit().await?;

        self.aggregate(updated).await
    }

    /// Update a shipment while it is being received: reconcile boxes into
    /// the target base or mark them lost. After every mutation the shipment
    /// is checked for auto-completion.
    pub async fn update_when_receiving(
        &self,
        shipment_id: i64,
        user_id: i64,
        input: UpdateShipmentWhenReceivingInput,
    ) -> AppResult<ShipmentUpdateOutcome> {
        let shipment = self.fetch_shipment(shipment_id).await?;
        ensure_shipment_state(SHIPMENT_RECONCILIATION_STATES, shipment.state)?;

        let mut outcome = BulkOutcome::new();
        let mut tx = self.db.begin().await?;

        self.receive_boxes(
            &mut tx,
            &shipment,
            user_id,
            &input.received_shipment_detail_updates,
            &mut outcome,
        )
        .await?;
        self.mark_boxes_lost(
            &mut tx,
            shipment.id,
            user_id,
            &input.lost_box_label_identifiers,
            &mut outcome,
        )
        .await?;

        self.complete_if_applicable(&mut tx, &shipment, user_id).await?;

        tx.commit().await?;

        if outcome.is_noop() {
            tracing::debug!(shipment_id, "bulk shipment update applied no boxes");
        }

        let shipment = self.fetch_shipment(shipment_id).await?;
        Ok(ShipmentUpdateOutcome {
            shipment: self.aggregate(shipment).await?,
            applied: outcome.applied,
            skipped: outcome.skipped,
        })
    }

    /// Cancel a shipment that is still being prepared; every prepared box
    /// returns to stock
    pub async fn cancel(&self, shipment_id: i64, user_id: i64) -> AppResult<ShipmentWithDetails> {
        let shipment = self.fetch_shipment(shipment_id).await?;
        ensure_shipment_state(SHIPMENT_PREPARATION_STATES, shipment.state)?;

        let mut tx = self.db.begin().await?;

        for row in open_details(&mut tx, shipment.id).await? {
            close_detail_removed(&mut tx, row.detail_id, user_id).await?;
            update_box_state(&mut tx, row.box_id, BoxState::InStock, user_id).await?;
            HistoryService::record(
                &mut tx,
                "boxes",
                row.box_id,
                user_id,
                "state",
                &serde_json::json!(row.box_state),
                &serde_json::json!(BoxState::InStock),
            )
            .await?;
        }

        sqlx::query(
            "UPDATE shipments SET state = 'canceled', canceled_by = $1, canceled_on = $2 WHERE id = $3",
        )
        .bind(user_id)
        .bind(Utc::now())
        .bind(shipment.id)
        .execute(&mut *tx)
        .await?;

        let updated = fetch_shipment_tx(&mut tx, shipment.id).await?;
        HistoryService::diff_and_record(
            &mut tx,
            "shipments",
            shipment.id,
            user_id,
            &snapshot(&shipment)?,
            &snapshot(&updated)?,
        )
        .await?;

        tx.commit().await?;

        self.aggregate(updated).await
    }

    /// Declare a sent shipment lost in transit; every box still marked for
    /// shipment is marked lost
    pub async fn mark_lost(&self, shipment_id: i64, user_id: i64) -> AppResult<ShipmentWithDetails> {
        let shipment = self.fetch_shipment(shipment_id).await?;
        ensure_shipment_state(SHIPMENT_IN_TRANSIT_STATES, shipment.state)?;

        let mut tx = self.db.begin().await?;

        for row in open_details(&mut tx, shipment.id).await? {
            if row.box_state != BoxState::MarkedForShipment {
                continue;
            }
            close_detail_lost(&mut tx, row.detail_id, user_id).await?;
            update_box_state(&mut tx, row.box_id, BoxState::Lost, user_id).await?;
            HistoryService::record(
                &mut tx,
                "boxes",
                row.box_id,
                user_id,
                "state",
                &serde_json::json!(row.box_state),
                &serde_json::json!(BoxState::Lost),
            )
            .await?;
        }

        sqlx::query("UPDATE shipments SET state = 'lost' WHERE id = $1")
            .bind(shipment.id)
            .execute(&mut *tx)
            .await?;

        let updated = fetch_shipment_tx(&mut tx, shipment.id).await?;
        HistoryService::diff_and_record(
            &mut tx,
            "shipments",
            shipment.id,
            user_id,
            &snapshot(&shipment)?,
            &snapshot(&updated)?,
        )
        .await?;

        tx.commit().await?;

        self.aggregate(updated).await
    }

    /// Get a shipment with its label and details
    pub async fn get(&self, shipment_id: i64) -> AppResult<ShipmentWithDetails> {
        let shipment = self.fetch_shipment(shipment_id).await?;
        self.aggregate(shipment).await
    }

    // ------------------------------------------------------------------
    // Bulk box operations (silent-discard semantics)
    // ------------------------------------------------------------------

    /// Pull eligible boxes into the shipment: box must be in stock at the
    /// shipment's source base; everything else is skipped
    async fn prepare_boxes(
        &self,
        tx: &mut PgConnection,
        shipment: &Shipment,
        user_id: i64,
        label_identifiers: &[String],
        outcome: &mut BulkOutcome<String>,
    ) -> AppResult<()> {
        if label_identifiers.is_empty() {
            return Ok(());
        }

        let candidates = fetch_boxes_by_label(tx, label_identifiers).await?;
        let by_label: HashMap<&str, &BoxRow> = candidates
            .iter()
            .map(|b| (b.label_identifier.as_str(), b))
            .collect();

        for label in label_identifiers {
            let Some(box_row) = by_label.get(label.as_str()) else {
                outcome.skipped.push(label.clone());
                continue;
            };
            if !box_eligible_for_preparation(box_row.state, box_row.base_id, shipment.source_base_id)
            {
                outcome.skipped.push(label.clone());
                continue;
            }

            // The state predicate doubles as the optimistic race guard: a
            // concurrent prepare sees zero affected rows and skips
            let claimed = sqlx::query(
                "UPDATE boxes SET state = 'marked_for_shipment', last_modified_by = $1, last_modified_on = $2 WHERE id = $3 AND state = 'in_stock'",
            )
            .bind(user_id)
            .bind(Utc::now())
            .bind(box_row.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if claimed == 0 {
                outcome.skipped.push(label.clone());
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO shipment_details (
                    shipment_id, box_id, source_product_id, source_location_id, source_size_id,
                    created_by, created_on
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(shipment.id)
            .bind(box_row.id)
            .bind(box_row.product_id)
            .bind(box_row.location_id)
            .bind(box_row.size_id)
            .bind(user_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

            HistoryService::record(
                &mut *tx,
                "boxes",
                box_row.id,
                user_id,
                "state",
                &serde_json::json!(BoxState::InStock),
                &serde_json::json!(BoxState::MarkedForShipment),
            )
            .await?;

            outcome.applied.push(label.clone());
        }

        Ok(())
    }

    /// Return prepared boxes to stock; boxes not currently marked for this
    /// shipment are skipped
    async fn remove_prepared_boxes(
        &self,
        tx: &mut PgConnection,
        shipment: &Shipment,
        user_id: i64,
        label_identifiers: &[String],
        outcome: &mut BulkOutcome<String>,
    ) -> AppResult<()> {
        if label_identifiers.is_empty() {
            return Ok(());
        }

        let rows = open_details_by_label(tx, shipment.id, label_identifiers).await?;
        let by_label: HashMap<&str, &DetailBoxRow> = rows
            .iter()
            .map(|r| (r.label_identifier.as_str(), r))
            .collect();

        for label in label_identifiers {
            let Some(row) = by_label.get(label.as_str()) else {
                outcome.skipped.push(label.clone());
                continue;
            };
            if !box_eligible_for_removal(row.box_state) {
                outcome.skipped.push(label.clone());
                continue;
            }

            close_detail_removed(&mut *tx, row.detail_id, user_id).await?;
            update_box_state(&mut *tx, row.box_id, BoxState::InStock, user_id).await?;
            HistoryService::record(
                &mut *tx,
                "boxes",
                row.box_id,
                user_id,
                "state",
                &serde_json::json!(row.box_state),
                &serde_json::json!(BoxState::InStock),
            )
            .await?;

            outcome.applied.push(label.clone());
        }

        Ok(())
    }

    /// Reconcile received boxes into the target base; entries whose
    /// resources do not belong to the target base or whose box is not in
    /// the receiving state are skipped
    async fn receive_boxes(
        &self,
        tx: &mut PgConnection,
        shipment: &Shipment,
        user_id: i64,
        updates: &[ShipmentDetailUpdateInput],
        outcome: &mut BulkOutcome<String>,
    ) -> AppResult<()> {
        for update in updates {
            // Fetch without the open predicate so a closed detail still
            // yields its box label for uniform skipped reporting
            let row = sqlx::query_as::<_, ReceiveCandidateRow>(
                r#"
                SELECT d.id AS detail_id, b.id AS box_id, b.label_identifier, b.state AS box_state,
                       (d.removed_on IS NULL AND d.lost_on IS NULL AND d.received_on IS NULL) AS open
                FROM shipment_details d
                JOIN boxes b ON b.id = d.box_id
                WHERE d.id = $1 AND d.shipment_id = $2
                "#,
            )
            .bind(update.id)
            .bind(shipment.id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                outcome.skipped.push(update.id.to_string());
                continue;
            };
            if !row.open {
                outcome.skipped.push(row.label_identifier.clone());
                continue;
            }

            let product_base: Option<i64> = sqlx::query_scalar(
                "SELECT base_id FROM products WHERE id = $1 AND deleted_on IS NULL",
            )
            .bind(update.target_product_id)
            .fetch_optional(&mut *tx)
            .await?;
            let location_base: Option<i64> = sqlx::query_scalar(
                "SELECT base_id FROM locations WHERE id = $1 AND deleted_on IS NULL",
            )
            .bind(update.target_location_id)
            .fetch_optional(&mut *tx)
            .await?;

            let eligible = match (product_base, location_base) {
                (Some(product_base), Some(location_base)) => box_eligible_for_receiving(
                    row.box_state,
                    product_base,
                    location_base,
                    shipment.target_base_id,
                ),
                _ => false,
            };
            if !eligible {
                outcome.skipped.push(row.label_identifier.clone());
                continue;
            }

            sqlx::query(
                r#"
                UPDATE shipment_details
                SET target_product_id = $1, target_location_id = $2, target_size_id = $3
                WHERE id = $4
                "#,
            )
            .bind(update.target_product_id)
            .bind(update.target_location_id)
            .bind(update.target_size_id)
            .bind(row.detail_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE boxes
                SET product_id = $1, location_id = $2, size_id = $3, state = 'in_stock',
                    last_modified_by = $4, last_modified_on = $5
                WHERE id = $6 AND state = 'receiving'
                "#,
            )
            .bind(update.target_product_id)
            .bind(update.target_location_id)
            .bind(update.target_size_id)
            .bind(user_id)
            .bind(Utc::now())
            .bind(row.box_id)
            .execute(&mut *tx)
            .await?;

            // Tags are base-scoped and must not leak across organisations
            sqlx::query("DELETE FROM box_tags WHERE box_id = $1")
                .bind(row.box_id)
                .execute(&mut *tx)
                .await?;

            HistoryService::record(
                &mut *tx,
                "boxes",
                row.box_id,
                user_id,
                "state",
                &serde_json::json!(BoxState::Receiving),
                &serde_json::json!(BoxState::InStock),
            )
            .await?;

            outcome.applied.push(row.label_identifier.clone());
        }

        Ok(())
    }

    /// Mark receiving boxes lost; the detail is soft-closed and the box is
    /// never reassigned a location
    async fn mark_boxes_lost(
        &self,
        tx: &mut PgConnection,
        shipment_id: i64,
        user_id: i64,
        label_identifiers: &[String],
        outcome: &mut BulkOutcome<String>,
    ) -> AppResult<()> {
        if label_identifiers.is_empty() {
            return Ok(());
        }

        let rows = open_details_by_label(tx, shipment_id, label_identifiers).await?;
        let by_label: HashMap<&str, &DetailBoxRow> = rows
            .iter()
            .map(|r| (r.label_identifier.as_str(), r))
            .collect();

        for label in label_identifiers {
            let Some(row) = by_label.get(label.as_str()) else {
                outcome.skipped.push(label.clone());
                continue;
            };
            if row.box_state != BoxState::Receiving {
                outcome.skipped.push(label.clone());
                continue;
            }

            close_detail_lost(&mut *tx, row.detail_id, user_id).await?;
            update_box_state(&mut *tx, row.box_id, BoxState::Lost, user_id).await?;
            HistoryService::record(
                &mut *tx,
                "boxes",
                row.box_id,
                user_id,
                "state",
                &serde_json::json!(row.box_state),
                &serde_json::json!(BoxState::Lost),
            )
            .await?;

            outcome.applied.push(label.clone());
        }

        Ok(())
    }

    /// After receive/lost mutations, transition the shipment into Completed
    /// or Lost if no box remains to be reconciled
    async fn complete_if_applicable(
        &self,
        tx: &mut PgConnection,
        shipment: &Shipment,
        user_id: i64,
    ) -> AppResult<()> {
        let non_removed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM shipment_details WHERE shipment_id = $1 AND removed_on IS NULL",
        )
        .bind(shipment.id)
        .fetch_one(&mut *tx)
        .await?;
        if non_removed == 0 {
            return Ok(());
        }

        let open = open_details(&mut *tx, shipment.id).await?;
        let states: Vec<BoxState> = open.iter().map(|r| r.box_state).collect();

        match resolve_shipment_outcome(&states) {
            Some(ShipmentState::Completed) => {
                // Soft-close every non-lost open detail as received
                for row in &open {
                    if row.box_state == BoxState::Lost {
                        continue;
                    }
                    sqlx::query(
                        "UPDATE shipment_details SET received_by = $1, received_on = $2 WHERE id = $3",
                    )
                    .bind(user_id)
                    .bind(Utc::now())
                    .bind(row.detail_id)
                    .execute(&mut *tx)
                    .await?;
                }
                sqlx::query(
                    "UPDATE shipments SET state = 'completed', completed_by = $1, completed_on = $2 WHERE id = $3",
                )
                .bind(user_id)
                .bind(Utc::now())
                .bind(shipment.id)
                .execute(&mut *tx)
                .await?;
            }
            Some(ShipmentState::Lost) => {
                sqlx::query("UPDATE shipments SET state = 'lost' WHERE id = $1")
                    .bind(shipment.id)
                    .execute(&mut *tx)
                    .await?;
            }
            _ => return Ok(()),
        }

        let updated = fetch_shipment_tx(&mut *tx, shipment.id).await?;
        HistoryService::diff_and_record(
            &mut *tx,
            "shipments",
            shipment.id,
            user_id,
            &snapshot(shipment)?,
            &snapshot(&updated)?,
        )
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries and guards
    // ------------------------------------------------------------------

    async fn fetch_shipment(&self, shipment_id: i64) -> AppResult<Shipment> {
        sqlx::query_as::<_, Shipment>(
            r#"
            SELECT id, source_base_id, target_base_id, transfer_agreement_id, state,
                   started_by, started_on, sent_by, sent_on, receiving_started_by, receiving_started_on,
                   completed_by, completed_on, canceled_by, canceled_on
            FROM shipments
            WHERE id = $1
            "#,
        )
        .bind(shipment_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound("Shipment".to_string()))
    }

    /// Validate a (source, target) base pair against the agreement's
    /// covered base sets, honoring the agreement direction
    async fn validate_shipment_bases(
        &self,
        agreement: &TransferAgreement,
        source_base_id: i64,
        target_base_id: i64,
    ) -> AppResult<()> {
        let (source_set, target_set) = self.agreements().covered_base_sets(agreement).await?;
        if shipment_bases_permitted(
            agreement.agreement_type,
            &source_set,
            &target_set,
            source_base_id,
            target_base_id,
        ) {
            return Ok(());
        }

        let source_covered = match agreement.agreement_type {
            TransferAgreementType::Bidirectional => {
                source_set.contains(&source_base_id) || target_set.contains(&source_base_id)
            }
            _ => source_set.contains(&source_base_id),
        };
        let (base_id, organisation_id) = if source_covered {
            (target_base_id, agreement.target_organisation_id)
        } else {
            (source_base_id, agreement.source_organisation_id)
        };
        Err(AppError::InvalidTransferAgreementBase {
            base_id,
            organisation_id,
        })
    }

    /// Apply a simple state transition, recording the diff
    async fn transition(
        &self,
        shipment: &Shipment,
        user_id: i64,
        update_sql: &str,
    ) -> AppResult<ShipmentWithDetails> {
        let mut tx = self.db.begin().await?;

        sqlx::query(update_sql)
            .bind(user_id)
            .bind(Utc::now())
            .bind(shipment.id)
            .execute(&mut *tx)
            .await?;

        let updated = fetch_shipment_tx(&mut tx, shipment.id).await?;
        HistoryService::diff_and_record(
            &mut tx,
            "shipments",
            shipment.id,
            user_id,
            &snapshot(shipment)?,
            &snapshot(&updated)?,
        )
        .await?;

        tx.commit().await?;

        self.aggregate(updated).await
    }

    /// Assemble the shipment aggregate with its display label and details
    async fn aggregate(&self, shipment: Shipment) -> AppResult<ShipmentWithDetails> {
        let source_name: String = sqlx::query_scalar("SELECT name FROM bases WHERE id = $1")
            .bind(shipment.source_base_id)
            .fetch_one(&self.db)
            .await?;
        let target_name: String = sqlx::query_scalar("SELECT name FROM bases WHERE id = $1")
            .bind(shipment.target_base_id)
            .fetch_one(&self.db)
            .await?;

        let details = sqlx::query_as::<_, ShipmentDetail>(
            r#"
            SELECT id, shipment_id, box_id, source_product_id, source_location_id, source_size_id,
                   target_product_id, target_location_id, target_size_id,
                   created_by, created_on, removed_by, removed_on, lost_by, lost_on, received_by, received_on
            FROM shipment_details
            WHERE shipment_id = $1
            ORDER BY id
            "#,
        )
        .bind(shipment.id)
        .fetch_all(&self.db)
        .await?;

        let label = shipment_label(
            shipment.id,
            shipment.started_on.date_naive(),
            &source_name,
            &target_name,
        );

        Ok(ShipmentWithDetails {
            shipment,
            label,
            details,
        })
    }
}

async fn fetch_shipment_tx(conn: &mut PgConnection, shipment_id: i64) -> AppResult<Shipment> {
    sqlx::query_as::<_, Shipment>(
        r#"
        SELECT id, source_base_id, target_base_id, transfer_agreement_id, state,
               started_by, started_on, sent_by, sent_on, receiving_started_by, receiving_started_on,
               completed_by, completed_on, canceled_by, canceled_on
        FROM shipments
        WHERE id = $1
        "#,
    )
    .bind(shipment_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| AppError::NotFound("Shipment".to_string()))
}

async fn fetch_boxes_by_label(
    conn: &mut PgConnection,
    label_identifiers: &[String],
) -> AppResult<Vec<BoxRow>> {
    let rows = sqlx::query_as::<_, BoxRow>(
        r#"
        SELECT b.id, b.label_identifier, b.product_id, b.location_id, b.size_id, b.state, l.base_id
        FROM boxes b
        JOIN locations l ON l.id = b.location_id
        WHERE b.label_identifier = ANY($1) AND b.deleted_on IS NULL
        "#,
    )
    .bind(label_identifiers)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

/// All open details of a shipment with their boxes
async fn open_details(conn: &mut PgConnection, shipment_id: i64) -> AppResult<Vec<DetailBoxRow>> {
    let rows = sqlx::query_as::<_, DetailBoxRow>(
        r#"
        SELECT d.id AS detail_id, b.id AS box_id, b.label_identifier, b.state AS box_state
        FROM shipment_details d
        JOIN boxes b ON b.id = d.box_id
        WHERE d.shipment_id = $1
          AND d.removed_on IS NULL AND d.lost_on IS NULL AND d.received_on IS NULL
        ORDER BY d.id
        "#,
    )
    .bind(shipment_id)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

/// Open details of a shipment restricted to the given box labels
async fn open_details_by_label(
    conn: &mut PgConnection,
    shipment_id: i64,
    label_identifiers: &[String],
) -> AppResult<Vec<DetailBoxRow>> {
    let rows = sqlx::query_as::<_, DetailBoxRow>(
        r#"
        SELECT d.id AS detail_id, b.id AS box_id, b.label_identifier, b.state AS box_state
        FROM shipment_details d
        JOIN boxes b ON b.id = d.box_id
        WHERE d.shipment_id = $1 AND b.label_identifier = ANY($2)
          AND d.removed_on IS NULL AND d.lost_on IS NULL AND d.received_on IS NULL
        "#,
    )
    .bind(shipment_id)
    .bind(label_identifiers)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

async fn close_detail_removed(
    conn: &mut PgConnection,
    detail_id: i64,
    user_id: i64,
) -> AppResult<()> {
    sqlx::query(
        "UPDATE shipment_details SET removed_by = $1, removed_on = $2 WHERE id = $3 AND removed_on IS NULL",
    )
    .bind(user_id)
    .bind(Utc::now())
    .bind(detail_id)
    .execute(conn)
    .await?;
    Ok(())
}

async fn close_detail_lost(conn: &mut PgConnection, detail_id: i64, user_id: i64) -> AppResult<()> {
    sqlx::query(
        "UPDATE shipment_details SET lost_by = $1, lost_on = $2 WHERE id = $3 AND lost_on IS NULL",
    )
    .bind(user_id)
    .bind(Utc::now())
    .bind(detail_id)
    .execute(conn)
    .await?;
    Ok(())
}

async fn update_box_state(
    conn: &mut PgConnection,
    box_id: i64,
    state: BoxState,
    user_id: i64,
) -> AppResult<()> {
    sqlx::query(
        "UPDATE boxes SET state = $1, last_modified_by = $2, last_modified_on = $3 WHERE id = $4",
    )
    .bind(state)
    .bind(user_id)
    .bind(Utc::now())
    .bind(box_id)
    .execute(conn)
    .await?;
    Ok(())
}
