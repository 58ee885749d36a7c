//! Transfer agreement service
//!
//! Creates agreements between organisations and moves them through their
//! lifecycle (under review → accepted/rejected, canceled). All validation
//! runs before any mutation; every mutation commits as one transaction.

use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use serde::Deserialize;
use sqlx::{PgConnection, PgPool};

use shared::models::{TransferAgreement, TransferAgreementDetail, TransferAgreementType};
use shared::validation::{
    ensure_agreement_state, is_duplicate_agreement, validate_agreement_window, AgreementCoverage,
    AGREEMENT_CANCELABLE_STATES, AGREEMENT_REVIEWABLE_STATES,
};

use crate::error::{AppError, AppResult};
use crate::services::history::{snapshot, HistoryService};

/// Transfer agreement service
#[derive(Clone)]
pub struct TransferAgreementService {
    db: PgPool,
}

/// Input for creating a transfer agreement
#[derive(Debug, Deserialize)]
pub struct CreateTransferAgreementInput {
    pub partner_organisation_id: i64,
    pub agreement_type: TransferAgreementType,
    pub initiating_base_ids: Vec<i64>,
    /// Defaults to all active bases of the partner organisation
    pub partner_base_ids: Option<Vec<i64>>,
    /// Defaults to today in the caller's UTC offset
    pub valid_from: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
    /// Caller's UTC offset, e.g. "+02:00"; defaults to UTC. Dates are
    /// aligned to local midnight in this offset and stored as UTC.
    pub utc_offset: Option<String>,
    pub comment: Option<String>,
}

/// A transfer agreement with its covered base pairs
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransferAgreementWithDetails {
    #[serde(flatten)]
    pub agreement: TransferAgreement,
    pub details: Vec<TransferAgreementDetail>,
}

impl TransferAgreementService {
    /// Create a new TransferAgreementService instance
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Create a transfer agreement between the actor's organisation and a
    /// partner organisation
    pub async fn create(
        &self,
        organisation_id: i64,
        user_id: i64,
        input: CreateTransferAgreementInput,
    ) -> AppResult<TransferAgreementWithDetails> {
        if organisation_id == input.partner_organisation_id {
            return Err(AppError::InvalidTransferAgreementOrganisation);
        }
        if input.initiating_base_ids.is_empty() {
            return Err(AppError::ValidationError(
                "At least one initiating base is required".to_string(),
            ));
        }

        // Align the validity window to local midnight in the caller's
        // offset and store it as UTC
        let offset = parse_utc_offset(input.utc_offset.as_deref())?;
        let valid_from_date = input
            .valid_from
            .unwrap_or_else(|| Utc::now().with_timezone(&offset).date_naive());
        let valid_from = local_midnight_as_utc(valid_from_date, offset)?;
        let valid_until = input
            .valid_until
            .map(|d| local_midnight_as_utc(d, offset))
            .transpose()?;

        validate_agreement_window(valid_from, valid_until)
            .map_err(|msg| AppError::InvalidTransferAgreementDates(msg.to_string()))?;

        // Every supplied base must be an active base of its organisation
        self.validate_bases_of_organisation(organisation_id, &input.initiating_base_ids)
            .await?;
        let partner_base_ids = match input.partner_base_ids.filter(|ids| !ids.is_empty()) {
            Some(ids) => {
                self.validate_bases_of_organisation(input.partner_organisation_id, &ids)
                    .await?;
                ids
            }
            None => {
                let ids = self
                    .active_base_ids(input.partner_organisation_id)
                    .await?;
                if ids.is_empty() {
                    return Err(AppError::NoActivePartnerBases);
                }
                ids
            }
        };

        // ReceivingFrom swaps the sides: the partner becomes the source
        let (source_organisation_id, source_base_ids, target_organisation_id, target_base_ids) =
            match input.agreement_type {
                TransferAgreementType::ReceivingFrom => (
                    input.partner_organisation_id,
                    partner_base_ids,
                    organisation_id,
                    input.initiating_base_ids,
                ),
                _ => (
                    organisation_id,
                    input.initiating_base_ids,
                    input.partner_organisation_id,
                    partner_base_ids,
                ),
            };

        self.detect_duplicate(
            source_organisation_id,
            target_organisation_id,
            &source_base_ids,
            &target_base_ids,
            valid_from,
            valid_until,
        )
        .await?;

        if source_base_ids.len() > 1 || target_base_ids.len() > 1 {
            tracing::warn!(
                source_organisation_id,
                target_organisation_id,
                "creating multi-base transfer agreement"
            );
        }

        let mut tx = self.db.begin().await?;

        let agreement = sqlx::query_as::<_, TransferAgreement>(
            r#"
            INSERT INTO transfer_agreements (
                source_organisation_id, target_organisation_id, agreement_type, state,
                valid_from, valid_until, requested_by, requested_on, comment
            )
            VALUES ($1, $2, $3, 'under_review', $4, $5, $6, $7, $8)
            RETURNING id, source_organisation_id, target_organisation_id, agreement_type, state,
                      valid_from, valid_until, requested_by, requested_on, accepted_by, accepted_on,
                      terminated_by, terminated_on, comment
            "#,
        )
        .bind(source_organisation_id)
        .bind(target_organisation_id)
        .bind(input.agreement_type)
        .bind(valid_from)
        .bind(valid_until)
        .bind(user_id)
        .bind(Utc::now())
        .bind(&input.comment)
        .fetch_one(&mut *tx)
        .await?;

        // One detail row per (source base × target base) combination
        let mut details = Vec::with_capacity(source_base_ids.len() * target_base_ids.len());
        for source_base_id in &source_base_ids {
            for target_base_id in &target_base_ids {
                let detail = sqlx::query_as::<_, TransferAgreementDetail>(
                    r#"
                    INSERT INTO transfer_agreement_details (transfer_agreement_id, source_base_id, target_base_id)
                    VALUES ($1, $2, $3)
                    RETURNING id, transfer_agreement_id, source_base_id, target_base_id
                    "#,
                )
                .bind(agreement.id)
                .bind(source_base_id)
                .bind(target_base_id)
                .fetch_one(&mut *tx)
                .await?;
                details.push(detail);
            }
        }

        HistoryService::record_creation(
            &mut tx,
            "transfer_agreements",
            agreement.id,
            user_id,
            &snapshot(&agreement)?,
        )
        .await?;

        tx.commit().await?;

        Ok(TransferAgreementWithDetails { agreement, details })
    }

    /// Accept an agreement under review; only members of the reviewing side
    pub async fn accept(
        &self,
        agreement_id: i64,
        organisation_id: i64,
        user_id: i64,
    ) -> AppResult<TransferAgreementWithDetails> {
        let agreement = self.fetch_agreement(agreement_id).await?;
        ensure_reviewing_side(&agreement, organisation_id)?;
        ensure_agreement_state(AGREEMENT_REVIEWABLE_STATES, agreement.state)?;

        self.transition(
            &agreement,
            user_id,
            "UPDATE transfer_agreements SET state = 'accepted', accepted_by = $1, accepted_on = $2 WHERE id = $3",
        )
        .await
    }

    /// Reject an agreement under review; only members of the reviewing side
    pub async fn reject(
        &self,
        agreement_id: i64,
        organisation_id: i64,
        user_id: i64,
    ) -> AppResult<TransferAgreementWithDetails> {
        let agreement = self.fetch_agreement(agreement_id).await?;
        ensure_reviewing_side(&agreement, organisation_id)?;
        ensure_agreement_state(AGREEMENT_REVIEWABLE_STATES, agreement.state)?;

        self.transition(
            &agreement,
            user_id,
            "UPDATE transfer_agreements SET state = 'rejected', terminated_by = $1, terminated_on = $2 WHERE id = $3",
        )
        .await
    }

    /// Cancel an agreement; members of either side may cancel. Shipments
    /// already derived from the agreement are not affected.
    pub async fn cancel(
        &self,
        agreement_id: i64,
        organisation_id: i64,
        user_id: i64,
    ) -> AppResult<TransferAgreementWithDetails> {
        let agreement = self.fetch_agreement(agreement_id).await?;
        if !agreement.involves_organisation(organisation_id) {
            return Err(AppError::Forbidden {
                permission: None,
                argument: "organisation",
                value: organisation_id.to_string(),
            });
        }
        ensure_agreement_state(AGREEMENT_CANCELABLE_STATES, agreement.state)?;

        self.transition(
            &agreement,
            user_id,
            "UPDATE transfer_agreements SET state = 'canceled', terminated_by = $1, terminated_on = $2 WHERE id = $3",
        )
        .await
    }

    /// Get an agreement with its covered base pairs
    pub async fn get(&self, agreement_id: i64) -> AppResult<TransferAgreementWithDetails> {
        let agreement = self.fetch_agreement(agreement_id).await?;
        let details = self.fetch_details(agreement_id).await?;
        Ok(TransferAgreementWithDetails { agreement, details })
    }

    /// The concrete (source, target) base-id sets covered by an agreement,
    /// with legacy null wildcards expanded to all active bases of the
    /// respective organisation
    pub async fn covered_base_sets(
        &self,
        agreement: &TransferAgreement,
    ) -> AppResult<(HashSet<i64>, HashSet<i64>)> {
        let details = self.fetch_details(agreement.id).await?;

        let mut source_ids = HashSet::new();
        let mut target_ids = HashSet::new();
        let mut expand_source = false;
        let mut expand_target = false;
        for detail in &details {
            match detail.source_base_id {
                Some(id) => {
                    source_ids.insert(id);
                }
                None => expand_source = true,
            }
            match detail.target_base_id {
                Some(id) => {
                    target_ids.insert(id);
                }
                None => expand_target = true,
            }
        }
        if expand_source {
            source_ids.extend(self.active_base_ids(agreement.source_organisation_id).await?);
        }
        if expand_target {
            target_ids.extend(self.active_base_ids(agreement.target_organisation_id).await?);
        }

        Ok((source_ids, target_ids))
    }

    pub(crate) async fn fetch_agreement(&self, agreement_id: i64) -> AppResult<TransferAgreement> {
        sqlx::query_as::<_, TransferAgreement>(
            r#"
            SELECT id, source_organisation_id, target_organisation_id, agreement_type, state,
                   valid_from, valid_until, requested_by, requested_on, accepted_by, accepted_on,
                   terminated_by, terminated_on, comment
            FROM transfer_agreements
            WHERE id = $1
            "#,
        )
        .bind(agreement_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound("Transfer agreement".to_string()))
    }

    async fn fetch_details(&self, agreement_id: i64) -> AppResult<Vec<TransferAgreementDetail>> {
        let details = sqlx::query_as::<_, TransferAgreementDetail>(
            r#"
            SELECT id, transfer_agreement_id, source_base_id, target_base_id
            FROM transfer_agreement_details
            WHERE transfer_agreement_id = $1
            ORDER BY id
            "#,
        )
        .bind(agreement_id)
        .fetch_all(&self.db)
        .await?;
        Ok(details)
    }

    /// Validate that every supplied base id is an active base of the given
    /// organisation
    async fn validate_bases_of_organisation(
        &self,
        organisation_id: i64,
        base_ids: &[i64],
    ) -> AppResult<()> {
        let valid: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM bases WHERE id = ANY($1) AND organisation_id = $2 AND deleted_on IS NULL",
        )
        .bind(base_ids)
        .bind(organisation_id)
        .fetch_all(&self.db)
        .await?;

        let valid: HashSet<i64> = valid.into_iter().collect();
        if let Some(base_id) = base_ids.iter().find(|id| !valid.contains(id)) {
            return Err(AppError::InvalidTransferAgreementBase {
                base_id: *base_id,
                organisation_id,
            });
        }
        Ok(())
    }

    async fn active_base_ids(&self, organisation_id: i64) -> AppResult<Vec<i64>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM bases WHERE organisation_id = $1 AND deleted_on IS NULL ORDER BY id",
        )
        .bind(organisation_id)
        .fetch_all(&self.db)
        .await?;
        Ok(ids)
    }

    /// Fail with `DuplicateTransferAgreement` if an agreement between the
    /// same organisation pair, under review or accepted, covers a superset
    /// of the requested bases within a containing validity window
    async fn detect_duplicate(
        &self,
        source_organisation_id: i64,
        target_organisation_id: i64,
        source_base_ids: &[i64],
        target_base_ids: &[i64],
        valid_from: DateTime<Utc>,
        valid_until: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let candidates = sqlx::query_as::<_, TransferAgreement>(
            r#"
            SELECT id, source_organisation_id, target_organisation_id, agreement_type, state,
                   valid_from, valid_until, requested_by, requested_on, accepted_by, accepted_on,
                   terminated_by, terminated_on, comment
            FROM transfer_agreements
            WHERE state IN ('under_review', 'accepted')
              AND ((source_organisation_id = $1 AND target_organisation_id = $2)
                OR (source_organisation_id = $2 AND target_organisation_id = $1))
            "#,
        )
        .bind(source_organisation_id)
        .bind(target_organisation_id)
        .fetch_all(&self.db)
        .await?;

        let requested = AgreementCoverage {
            base_ids: source_base_ids
                .iter()
                .chain(target_base_ids.iter())
                .copied()
                .collect(),
            valid_from,
            valid_until,
        };

        for candidate in candidates {
            let (source_ids, target_ids) = self.covered_base_sets(&candidate).await?;
            let existing = AgreementCoverage {
                base_ids: source_ids.union(&target_ids).copied().collect(),
                valid_from: candidate.valid_from,
                valid_until: candidate.valid_until,
            };
            if is_duplicate_agreement(&existing, &requested) {
                return Err(AppError::DuplicateTransferAgreement {
                    existing_id: candidate.id,
                });
            }
        }

        Ok(())
    }

    /// Apply a state transition, recording the field-level diff in the same
    /// transaction
    async fn transition(
        &self,
        agreement: &TransferAgreement,
        user_id: i64,
        update_sql: &str,
    ) -> AppResult<TransferAgreementWithDetails> {
        let mut tx = self.db.begin().await?;

        sqlx::query(update_sql)
            .bind(user_id)
            .bind(Utc::now())
            .bind(agreement.id)
            .execute(&mut *tx)
            .await?;

        let updated = fetch_agreement_tx(&mut tx, agreement.id).await?;
        HistoryService::diff_and_record(
            &mut tx,
            "transfer_agreements",
            agreement.id,
            user_id,
            &snapshot(agreement)?,
            &snapshot(&updated)?,
        )
        .await?;

        tx.commit().await?;

        let details = self.fetch_details(agreement.id).await?;
        Ok(TransferAgreementWithDetails {
            agreement: updated,
            details,
        })
    }
}

async fn fetch_agreement_tx(
    conn: &mut PgConnection,
    agreement_id: i64,
) -> AppResult<TransferAgreement> {
    sqlx::query_as::<_, TransferAgreement>(
        r#"
        SELECT id, source_organisation_id, target_organisation_id, agreement_type, state,
               valid_from, valid_until, requested_by, requested_on, accepted_by, accepted_on,
               terminated_by, terminated_on, comment
        FROM transfer_agreements
        WHERE id = $1
        "#,
    )
    .bind(agreement_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| AppError::NotFound("Transfer agreement".to_string()))
}

/// Accept/reject are reserved to the receiving side of the agreement
fn ensure_reviewing_side(agreement: &TransferAgreement, organisation_id: i64) -> AppResult<()> {
    if agreement.reviewing_organisation_id() == organisation_id {
        Ok(())
    } else {
        Err(AppError::Forbidden {
            permission: None,
            argument: "organisation",
            value: organisation_id.to_string(),
        })
    }
}

fn parse_utc_offset(offset: Option<&str>) -> AppResult<FixedOffset> {
    use chrono::Offset;
    match offset {
        None => Ok(Utc.fix()),
        Some(s) => s.parse::<FixedOffset>().map_err(|_| {
            AppError::InvalidTransferAgreementDates(format!("Unrecognized UTC offset: {}", s))
        }),
    }
}

fn local_midnight_as_utc(date: NaiveDate, offset: FixedOffset) -> AppResult<DateTime<Utc>> {
    use chrono::TimeZone;
    offset
        .from_local_datetime(&date.and_time(NaiveTime::MIN))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| {
            AppError::InvalidTransferAgreementDates(format!("Invalid local date: {}", date))
        })
}
