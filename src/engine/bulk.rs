use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::MAX_BULK_SIZE;
use crate::model::*;

use super::{Engine, EngineError};

const NOT_OWNER: &str = "bookings can only be created for the calling subject";

impl Engine {
    /// Create a batch of bookings on behalf of `caller`, item by item.
    ///
    /// Every draft must belong to the caller. With `skip_conflicts` unset any
    /// ownership failure rejects the whole batch before anything is written;
    /// with it set the offending items are reported and the rest proceed.
    /// Items that fail validation or collide are always reported per item,
    /// including collisions with earlier items of the same batch.
    pub async fn bulk_create(
        &self,
        caller: Ulid,
        drafts: Vec<BookingDraft>,
        skip_conflicts: bool,
    ) -> Result<BulkResult, EngineError> {
        if drafts.len() > MAX_BULK_SIZE {
            return Err(EngineError::LimitExceeded("too many bookings in batch"));
        }
        let total_requested = drafts.len();

        let mut errors: Vec<BulkItemError> = drafts
            .iter()
            .enumerate()
            .filter(|(_, d)| d.subject_id != caller)
            .map(|(index, d)| BulkItemError {
                index,
                message: NOT_OWNER.to_string(),
                request: d.clone(),
            })
            .collect();
        if !errors.is_empty() && !skip_conflicts {
            tracing::debug!("bulk create by {caller} rejected: {} foreign item(s)", errors.len());
            return Err(EngineError::ValidationFailed {
                failures: errors.len(),
            });
        }
        let rejected: HashSet<usize> = errors.iter().map(|e| e.index).collect();

        let mut created = Vec::new();
        for (index, draft) in drafts.into_iter().enumerate() {
            if rejected.contains(&index) {
                continue;
            }
            let request = draft.clone();
            match self.create_booking(draft).await {
                Ok(booking) => created.push(booking),
                Err(e) => errors.push(BulkItemError {
                    index,
                    message: e.to_string(),
                    request,
                }),
            }
        }
        errors.sort_by_key(|e| e.index);

        Ok(BulkResult {
            total_requested,
            success_count: created.len(),
            failure_count: errors.len(),
            created,
            errors,
        })
    }
}
