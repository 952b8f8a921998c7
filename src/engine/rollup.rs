use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::conflict::now;
use super::{Engine, EngineError, SharedAggregate};

// ── Monthly effort rollup ────────────────────────────────────────

impl Engine {
    /// Best-effort rollup after a booking commits. Subjects unknown to the
    /// directory or not allowed to contribute are skipped; any other failure
    /// is logged and counted but never surfaces to the caller.
    pub(super) async fn roll_up_created(&self, booking: &Booking) {
        let subject = match self.resolve_subject(booking.subject_id).await {
            Ok(subject) => subject,
            Err(EngineError::NotFound(_)) => {
                tracing::debug!("rollup skipped: subject {} not in directory", booking.subject_id);
                return;
            }
            Err(e) => {
                tracing::warn!("rollup for booking {} failed: {e}", booking.id);
                metrics::counter!(observability::ROLLUP_FAILURES_TOTAL).increment(1);
                return;
            }
        };
        if !self.directory.can_act_as_contributor(&subject) {
            tracing::debug!("rollup skipped: subject {} does not contribute", subject.id);
            return;
        }
        if let Err(e) = self.accumulate(booking).await {
            tracing::warn!("rollup for booking {} failed: {e}", booking.id);
            metrics::counter!(observability::ROLLUP_FAILURES_TOTAL).increment(1);
        }
    }

    /// Add one session (and its hours) to the booking's rollup row, creating
    /// the row on first use. The per-key mutex keeps concurrent increments
    /// from losing updates.
    pub(super) async fn accumulate(&self, booking: &Booking) -> Result<MonthlyEffortAggregate, EngineError> {
        let key = RollupKey::for_booking(booking);
        let slot = self
            .rollups
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .value()
            .clone();
        let mut row_guard = slot.lock().await;

        let mut row = match row_guard.as_ref() {
            Some(row) => row.clone(),
            None => {
                let activity = self.resolve_activity(booking.activity_id).await?;
                MonthlyEffortAggregate::new(key, activity.category, now())
            }
        };
        row.accumulate(booking.window.duration_hours(), now());

        self.wal_append(&Event::AggregateUpserted {
            aggregate: row.clone(),
        })
        .await?;
        *row_guard = Some(row.clone());
        metrics::counter!(observability::ROLLUPS_APPLIED_TOTAL).increment(1);
        Ok(row)
    }

    async fn rows_matching(&self, keep: impl Fn(&RollupKey) -> bool) -> Vec<MonthlyEffortAggregate> {
        let slots: Vec<SharedAggregate> = self
            .rollups
            .iter()
            .filter(|e| keep(e.key()))
            .map(|e| e.value().clone())
            .collect();
        let mut rows = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(row) = slot.lock().await.as_ref() {
                rows.push(row.clone());
            }
        }
        rows.sort_by_key(|r| (r.month, r.subject_id, r.activity_id));
        rows
    }

    /// Rollup rows of a subject, optionally limited to one month.
    pub async fn aggregates_for(
        &self,
        subject_id: Ulid,
        month: Option<MonthYear>,
    ) -> Vec<MonthlyEffortAggregate> {
        self.rows_matching(|k| k.subject_id == subject_id && month.is_none_or(|m| k.month == m))
            .await
    }

    pub async fn aggregate(&self, key: RollupKey) -> Option<MonthlyEffortAggregate> {
        let slot = self.rollups.get(&key).map(|e| e.value().clone())?;
        slot.lock().await.clone()
    }

    /// Total hours for a subject in a month; zero when nothing was rolled up.
    pub async fn total_hours(&self, subject_id: Ulid, month: MonthYear) -> f64 {
        self.aggregates_for(subject_id, Some(month))
            .await
            .iter()
            .map(|r| r.total_hours)
            .sum()
    }

    pub async fn total_hours_in_category(
        &self,
        subject_id: Ulid,
        month: MonthYear,
        category: ActivityCategory,
    ) -> f64 {
        self.aggregates_for(subject_id, Some(month))
            .await
            .iter()
            .filter(|r| r.category == category)
            .map(|r| r.total_hours)
            .sum()
    }

    /// Per-category rollup of a subject's month, in category order.
    pub async fn category_distribution(&self, subject_id: Ulid, month: MonthYear) -> Vec<CategorySummary> {
        let mut by_category: BTreeMap<ActivityCategory, CategorySummary> = BTreeMap::new();
        for row in self.aggregates_for(subject_id, Some(month)).await {
            let summary = by_category.entry(row.category).or_insert(CategorySummary {
                category: row.category,
                activity_count: 0,
                total_hours: 0.0,
                total_sessions: 0,
            });
            summary.activity_count += 1;
            summary.total_hours += row.total_hours;
            summary.total_sessions += row.total_sessions;
        }
        by_category.into_values().collect()
    }

    /// Distinct subjects with at least one rollup row in `month`.
    pub async fn active_subjects(&self, month: MonthYear) -> Vec<Ulid> {
        let ids: BTreeSet<Ulid> = self
            .rollups
            .iter()
            .filter(|e| e.key().month == month)
            .map(|e| e.key().subject_id)
            .collect();
        // Slots created by a rollup whose catalog lookup failed stay empty.
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if !self.aggregates_for(id, Some(month)).await.is_empty() {
                out.push(id);
            }
        }
        out
    }

    /// Monthly report for one contributing subject.
    pub async fn effort_details(&self, subject_id: Ulid, month: MonthYear) -> Result<EffortDetails, EngineError> {
        let subject = self.resolve_subject(subject_id).await?;
        if !self.directory.can_act_as_contributor(&subject) {
            return Err(EngineError::InvalidInput(format!(
                "subject {subject_id} does not record effort"
            )));
        }
        Ok(self.details_of(subject, month).await)
    }

    async fn details_of(&self, subject: Subject, month: MonthYear) -> EffortDetails {
        let rows = self.aggregates_for(subject.id, Some(month)).await;
        let sessions_by_category = ActivityCategory::ALL
            .iter()
            .map(|c| {
                let sessions = rows
                    .iter()
                    .filter(|r| r.category == *c)
                    .map(|r| r.total_sessions)
                    .sum();
                (*c, sessions)
            })
            .collect();
        EffortDetails {
            subject_id: subject.id,
            name: subject.name,
            email: subject.email,
            month,
            sessions_by_category,
            total_hours: rows.iter().map(|r| r.total_hours).sum(),
            total_sessions: rows.iter().map(|r| r.total_sessions).sum(),
        }
    }

    /// Report over every SME in the directory.
    pub async fn consolidated_effort(&self, month: MonthYear) -> Result<ConsolidatedEffort, EngineError> {
        let smes = self
            .lookup("subjects_by_role", || self.directory.subjects_by_role(Role::Sme))
            .await?;
        Ok(self.consolidate(month, None, smes).await)
    }

    /// Report over the SMEs reporting directly to `supervisor_id`.
    pub async fn consolidated_effort_for_supervisor(
        &self,
        supervisor_id: Ulid,
        month: MonthYear,
    ) -> Result<ConsolidatedEffort, EngineError> {
        let supervisor = self.resolve_subject(supervisor_id).await?;
        if supervisor.role != Role::Supervisor {
            return Err(EngineError::InvalidInput(format!(
                "subject {supervisor_id} is not a supervisor"
            )));
        }
        let smes = self
            .lookup("subjects_by_role", || self.directory.subjects_by_role(Role::Sme))
            .await?;
        let mut reports = Vec::new();
        for sme in smes {
            let direct = self
                .lookup("is_direct_report", || self.directory.is_direct_report(sme.id, supervisor_id))
                .await?;
            if direct {
                reports.push(sme);
            }
        }
        Ok(self.consolidate(month, Some(supervisor_id), reports).await)
    }

    async fn consolidate(
        &self,
        month: MonthYear,
        supervisor_id: Option<Ulid>,
        mut subjects: Vec<Subject>,
    ) -> ConsolidatedEffort {
        subjects.sort_by_key(|s| s.id);
        let mut details = Vec::with_capacity(subjects.len());
        for subject in subjects {
            details.push(self.details_of(subject, month).await);
        }
        ConsolidatedEffort {
            month,
            supervisor_id,
            total_hours: details.iter().map(|d| d.total_hours).sum(),
            total_sessions: details.iter().map(|d| d.total_sessions).sum(),
            subjects: details,
        }
    }
}
