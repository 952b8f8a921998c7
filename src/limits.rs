//! Hard limits enforced at the engine boundary.

/// Maximum description length in characters.
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Maximum denormalized activity name length in bytes.
pub const MAX_ACTIVITY_NAME_LEN: usize = 255;

/// Maximum number of drafts in one bulk request.
pub const MAX_BULK_SIZE: usize = 50;

/// Maximum bookings held by a single subject schedule.
pub const MAX_BOOKINGS_PER_SUBJECT: usize = 100_000;

/// Maximum ids accepted in one `IN (...)` list.
pub const MAX_IN_CLAUSE_IDS: usize = 1_000;

/// Maximum role tokens accepted in one availability query.
pub const MAX_ROLE_FILTERS: usize = 16;
