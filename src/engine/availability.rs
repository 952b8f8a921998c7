use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::{MAX_IN_CLAUSE_IDS, MAX_ROLE_FILTERS};
use crate::model::*;

use super::conflict::{find_overlapping_across, schedule_conflicts};
use super::{Engine, EngineError};

// ── Availability search ─────────────────────────────────────────

impl Engine {
    /// Read-only probe: would `window` collide with anything `subject_id` has booked?
    pub async fn has_conflict(&self, subject_id: Ulid, window: &Window) -> bool {
        let Some(slot) = self.schedule(&subject_id) else {
            return false;
        };
        let guard = slot.read().await;
        schedule_conflicts(&guard, window, None).next().is_some()
    }

    /// Bookings of `subject_id` colliding with `window`, by start date.
    pub async fn conflicts_for(&self, subject_id: Ulid, window: &Window) -> Vec<Booking> {
        let Some(slot) = self.schedule(&subject_id) else {
            return Vec::new();
        };
        let guard = slot.read().await;
        schedule_conflicts(&guard, window, None).cloned().collect()
    }

    /// Colliding bookings across several subjects at once. Repeated ids are
    /// scanned once.
    pub async fn conflicts_across(&self, subject_ids: &[Ulid], window: &Window) -> Vec<Booking> {
        let mut ids = subject_ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut out = Vec::new();
        for subject_id in &ids {
            let Some(slot) = self.schedule(subject_id) else { continue };
            let guard = slot.read().await;
            out.extend(find_overlapping_across(&ids, window, guard.date_candidates(window)));
        }
        out
    }

    /// Report every selected subject with its availability and, when busy,
    /// the bookings in the way. Explicit ids keep the caller's order; role and
    /// unfiltered searches are ordered by subject id.
    pub async fn search_availability(
        &self,
        query: &AvailabilityQuery,
    ) -> Result<Vec<SubjectAvailability>, EngineError> {
        if query.from_time > query.to_time {
            return Err(InvalidWindow::TimesReversed.into());
        }
        let window = query.window();
        let subjects = self.select_subjects(query).await?;

        let mut out = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let conflicts: Vec<ConflictRecord> = self
                .conflicts_for(subject.id, &window)
                .await
                .iter()
                .map(Booking::conflict_record)
                .collect();
            out.push(SubjectAvailability {
                subject_id: subject.id,
                name: subject.name,
                email: subject.email,
                role: subject.role,
                available: conflicts.is_empty(),
                conflicts,
            });
        }
        Ok(out)
    }

    /// [`Engine::search_availability`] narrowed to subjects that are free.
    pub async fn search_available(
        &self,
        query: &AvailabilityQuery,
    ) -> Result<Vec<SubjectAvailability>, EngineError> {
        let mut all = self.search_availability(query).await?;
        all.retain(|s| s.available);
        Ok(all)
    }

    /// Explicit ids win (unknown ids are skipped), then the role union, then
    /// everyone. Role tokens are parsed even when ids are given.
    async fn select_subjects(&self, query: &AvailabilityQuery) -> Result<Vec<Subject>, EngineError> {
        if query.roles.len() > MAX_ROLE_FILTERS {
            return Err(EngineError::LimitExceeded("too many roles"));
        }
        if query.subject_ids.len() > MAX_IN_CLAUSE_IDS {
            return Err(EngineError::LimitExceeded("too many subject ids"));
        }
        let mut roles: Vec<Role> = Vec::with_capacity(query.roles.len());
        for token in &query.roles {
            let role: Role = token.parse()?;
            if !roles.contains(&role) {
                roles.push(role);
            }
        }

        let mut selected = Vec::new();
        if !query.subject_ids.is_empty() {
            let mut seen = HashSet::new();
            for id in &query.subject_ids {
                if !seen.insert(*id) {
                    continue;
                }
                match self.resolve_subject(*id).await {
                    Ok(subject) => selected.push(subject),
                    Err(EngineError::NotFound(_)) => {
                        tracing::debug!("availability: skipping unknown subject {id}");
                    }
                    Err(e) => return Err(e),
                }
            }
        } else if !roles.is_empty() {
            let mut seen = HashSet::new();
            for role in roles {
                let found = self
                    .lookup("subjects_by_role", || self.directory.subjects_by_role(role))
                    .await?;
                selected.extend(found.into_iter().filter(|s| seen.insert(s.id)));
            }
            selected.sort_by_key(|s| s.id);
        } else {
            selected = self
                .lookup("all_subjects", || self.directory.all_subjects())
                .await?;
            selected.sort_by_key(|s| s.id);
        }
        Ok(selected)
    }
}
