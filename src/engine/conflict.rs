use std::collections::HashSet;

use chrono::Utc;
use ulid::Ulid;

use crate::limits::{MAX_ACTIVITY_NAME_LEN, MAX_DESCRIPTION_LEN};
use crate::model::*;
use crate::observability;

use super::EngineError;

pub(crate) fn now() -> Timestamp {
    Utc::now()
}

/// Two windows collide when their date ranges and their daily time ranges
/// both intersect. Endpoints are inclusive, so touching windows collide.
pub fn overlaps(a: &Window, b: &Window) -> bool {
    a.overlaps(b)
}

/// Bookings of `subject_id` among `existing` that collide with `candidate`.
pub fn find_overlapping<'a>(
    subject_id: Ulid,
    candidate: &Window,
    existing: impl IntoIterator<Item = &'a Booking>,
) -> Vec<Booking> {
    existing
        .into_iter()
        .filter(|b| b.subject_id == subject_id && b.window.overlaps(candidate))
        .cloned()
        .collect()
}

/// Batch form of [`find_overlapping`] over a set of subjects.
pub fn find_overlapping_across<'a>(
    subject_ids: &[Ulid],
    candidate: &Window,
    existing: impl IntoIterator<Item = &'a Booking>,
) -> Vec<Booking> {
    let wanted: HashSet<Ulid> = subject_ids.iter().copied().collect();
    existing
        .into_iter()
        .filter(|b| wanted.contains(&b.subject_id) && b.window.overlaps(candidate))
        .cloned()
        .collect()
}

/// Colliding bookings within one schedule, optionally ignoring one id
/// (the booking being updated).
pub(crate) fn schedule_conflicts<'a>(
    schedule: &'a SubjectSchedule,
    candidate: &'a Window,
    exclude: Option<Ulid>,
) -> impl Iterator<Item = &'a Booking> {
    schedule
        .date_candidates(candidate)
        .filter(move |b| Some(b.id) != exclude && b.window.times_intersect(candidate))
}

pub(crate) fn check_no_conflict(
    schedule: &SubjectSchedule,
    candidate: &Window,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let ids: Vec<Ulid> = schedule_conflicts(schedule, candidate, exclude)
        .map(|b| b.id)
        .collect();
    if ids.is_empty() {
        return Ok(());
    }
    metrics::counter!(observability::CONFLICTS_TOTAL).increment(1);
    Err(EngineError::Conflict(ids))
}

pub(crate) fn validate_draft(draft: &BookingDraft) -> Result<(), EngineError> {
    draft.window.validate()?;
    if draft.description.trim().is_empty() {
        return Err(EngineError::InvalidInput("description is required".into()));
    }
    if draft.description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    if let Some(name) = &draft.activity_name
        && name.len() > MAX_ACTIVITY_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("activity name too long"));
    }
    Ok(())
}
