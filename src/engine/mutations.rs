use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::MAX_BOOKINGS_PER_SUBJECT;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, now, validate_draft};
use super::{apply_to_schedule, Engine, EngineError, SharedSchedule};

impl Engine {
    /// Validate, conflict-check and persist a new booking, then fold it into
    /// the monthly rollup. A rollup failure never fails the booking.
    pub async fn create_booking(&self, draft: BookingDraft) -> Result<Booking, EngineError> {
        validate_draft(&draft)?;
        let _gate = self.compaction_gate.read().await;

        let booking = {
            let slot = self.schedule_or_create(draft.subject_id);
            let mut guard = slot.write().await;
            if guard.bookings.len() >= MAX_BOOKINGS_PER_SUBJECT {
                return Err(EngineError::LimitExceeded("too many bookings for subject"));
            }
            check_no_conflict(&guard, &draft.window, None)?;

            let booking = Booking::from_draft(Ulid::new(), draft, now());
            let event = Event::BookingCreated {
                booking: booking.clone(),
            };
            self.persist_and_apply(&mut guard, &event).await?;
            booking
        };
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);

        self.roll_up_created(&booking).await;
        Ok(booking)
    }

    /// Merge `patch` onto the stored booking and re-run validation and the
    /// conflict check (ignoring the booking itself). May move the booking to
    /// another subject; both schedules are then locked in id order.
    pub async fn update_booking(&self, id: Ulid, patch: BookingPatch) -> Result<Booking, EngineError> {
        if patch.is_empty() {
            return self.get_booking(id).await;
        }
        let _gate = self.compaction_gate.read().await;

        loop {
            let owner = self.owner_of(&id).ok_or(EngineError::NotFound(id))?;
            let target = patch.subject_id.unwrap_or(owner);

            let mut subject_ids = vec![owner, target];
            subject_ids.sort();
            subject_ids.dedup();
            // A target never seen before gets a detached schedule that is only
            // registered once the move is about to commit.
            let mut detached = None;
            let mut guards = Vec::with_capacity(subject_ids.len());
            for subject_id in &subject_ids {
                let slot = match self.schedule(subject_id) {
                    Some(slot) => slot,
                    None if *subject_id == owner => self.schedule_or_create(owner),
                    None => {
                        let slot: SharedSchedule = Arc::new(RwLock::new(SubjectSchedule::new(*subject_id)));
                        detached = Some(slot.clone());
                        slot
                    }
                };
                guards.push(slot.write_owned().await);
            }
            let slot_of = |subject_id: Ulid| usize::from(subject_ids[0] != subject_id);

            // Deleted or moved while we waited for the locks.
            let Some(current) = guards[slot_of(owner)].get(id).cloned() else {
                continue;
            };

            let merged = patch.merge(&current);
            validate_draft(&merged)?;
            let target_guard = &guards[slot_of(target)];
            if target != owner && target_guard.bookings.len() >= MAX_BOOKINGS_PER_SUBJECT {
                return Err(EngineError::LimitExceeded("too many bookings for subject"));
            }
            check_no_conflict(target_guard, &merged.window, Some(id))?;

            if let Some(slot) = detached {
                match self.schedules.entry(target) {
                    // Someone booked the target meanwhile; check against theirs.
                    Entry::Occupied(_) => continue,
                    Entry::Vacant(vacant) => {
                        vacant.insert(slot);
                    }
                }
            }

            let booking = Booking {
                id,
                subject_id: merged.subject_id,
                window: merged.window,
                activity_id: merged.activity_id,
                activity_name: merged.activity_name,
                description: merged.description,
                created_at: current.created_at,
                updated_at: now(),
            };
            let event = Event::BookingUpdated {
                previous_subject_id: owner,
                booking: booking.clone(),
            };
            self.wal_append(&event).await?;
            for guard in guards.iter_mut() {
                apply_to_schedule(guard, &event, &self.booking_owner);
            }
            return Ok(booking);
        }
    }

    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.compaction_gate.read().await;

        loop {
            let owner = self.owner_of(&id).ok_or(EngineError::NotFound(id))?;
            let slot = self.schedule(&owner).ok_or(EngineError::NotFound(id))?;
            let mut guard = slot.write().await;
            let Some(existing) = guard.get(id).cloned() else {
                if self.owner_of(&id).is_some_and(|now_owner| now_owner != owner) {
                    continue;
                }
                return Err(EngineError::NotFound(id));
            };

            let event = Event::BookingDeleted { id, subject_id: owner };
            self.persist_and_apply(&mut guard, &event).await?;
            return Ok(existing);
        }
    }
}
