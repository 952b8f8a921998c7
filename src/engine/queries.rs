use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedSchedule};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let owner = self.owner_of(&id).ok_or(EngineError::NotFound(id))?;
        let slot = self.schedule(&owner).ok_or(EngineError::NotFound(id))?;
        let guard = slot.read().await;
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// A subject's bookings ordered by start date.
    pub async fn bookings_for_subject(&self, subject_id: Ulid) -> Vec<Booking> {
        match self.schedule(&subject_id) {
            Some(slot) => slot.read().await.bookings.clone(),
            None => Vec::new(),
        }
    }

    /// A subject's bookings lying entirely inside `[start, end]`.
    pub async fn bookings_for_subject_between(
        &self,
        subject_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<Booking> {
        let mut out = self.bookings_for_subject(subject_id).await;
        out.retain(|b| b.window.from_date >= start && b.window.to_date <= end);
        out
    }

    /// Every booking lying entirely inside `[start, end]`, by start date then subject.
    pub async fn bookings_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<Booking> {
        self.collect_bookings(|b| b.window.from_date >= start && b.window.to_date <= end)
            .await
    }

    pub async fn bookings_for_activity(&self, activity_id: Ulid) -> Vec<Booking> {
        self.collect_bookings(|b| b.activity_id == activity_id).await
    }

    pub async fn all_bookings(&self) -> Vec<Booking> {
        self.collect_bookings(|_| true).await
    }

    /// Number of subjects that have a schedule in memory.
    pub fn subject_count(&self) -> usize {
        self.schedules.len()
    }

    async fn collect_bookings(&self, keep: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let slots: Vec<SharedSchedule> = self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for slot in slots {
            let guard = slot.read().await;
            out.extend(guard.bookings.iter().filter(|b| keep(b)).cloned());
        }
        out.sort_by_key(|b| (b.window.from_date, b.subject_id, b.id));
        out
    }
}
