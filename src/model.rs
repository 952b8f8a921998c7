use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Wall-clock timestamp for audit fields.
pub type Timestamp = DateTime<Utc>;

/// A booking's calendar window: a date range plus a time-of-day range.
///
/// For conflict purposes the time-of-day range repeats on every day of the
/// date range. Duration, on the other hand, is measured across the continuous
/// span from `(from_date, from_time)` to `(to_date, to_time)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub from_time: NaiveTime,
    pub to_time: NaiveTime,
}

/// Why a window failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidWindow {
    DatesReversed,
    TimesReversed,
}

impl fmt::Display for InvalidWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidWindow::DatesReversed => {
                write!(f, "from date must be before or equal to to date")
            }
            InvalidWindow::TimesReversed => {
                write!(f, "from time must not be after to time on the same date")
            }
        }
    }
}

impl Window {
    pub fn new(
        from_date: NaiveDate,
        to_date: NaiveDate,
        from_time: NaiveTime,
        to_time: NaiveTime,
    ) -> Self {
        Self {
            from_date,
            to_date,
            from_time,
            to_time,
        }
    }

    pub fn single_day(date: NaiveDate, from_time: NaiveTime, to_time: NaiveTime) -> Self {
        Self::new(date, date, from_time, to_time)
    }

    /// Multi-day windows do not get their per-day time ordering checked.
    pub fn validate(&self) -> Result<(), InvalidWindow> {
        if self.from_date > self.to_date {
            return Err(InvalidWindow::DatesReversed);
        }
        if self.from_date == self.to_date && self.from_time > self.to_time {
            return Err(InvalidWindow::TimesReversed);
        }
        Ok(())
    }

    pub fn dates_intersect(&self, other: &Window) -> bool {
        self.from_date <= other.to_date && self.to_date >= other.from_date
    }

    pub fn times_intersect(&self, other: &Window) -> bool {
        self.from_time <= other.to_time && self.to_time >= other.from_time
    }

    /// Inclusive on both ends; dates and times are tested independently.
    pub fn overlaps(&self, other: &Window) -> bool {
        self.dates_intersect(other) && self.times_intersect(other)
    }

    /// Whole minutes between the start and end datetimes, truncated toward zero.
    pub fn duration_minutes(&self) -> i64 {
        let start = self.from_date.and_time(self.from_time);
        let end = self.to_date.and_time(self.to_time);
        (end - start).num_minutes()
    }

    pub fn duration_hours(&self) -> f64 {
        self.duration_minutes() as f64 / 60.0
    }

    pub fn month(&self) -> MonthYear {
        MonthYear::of(self.from_date)
    }
}

/// Calendar month token rendered as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonthYear {
    pub year: i32,
    pub month: u32,
}

impl MonthYear {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }
}

impl fmt::Display for MonthYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonthYear {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || UnknownToken {
            kind: "month",
            token: s.to_string(),
        };
        let (y, m) = s.trim().split_once('-').ok_or_else(bad)?;
        if y.len() != 4 || m.len() != 2 {
            return Err(bad());
        }
        let year: i32 = y.parse().map_err(|_| bad())?;
        let month: u32 = m.parse().map_err(|_| bad())?;
        MonthYear::new(year, month).ok_or_else(bad)
    }
}

/// A token that did not name a known role, category, or month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownToken {
    pub kind: &'static str,
    pub token: String,
}

impl fmt::Display for UnknownToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {:?}", self.kind, self.token)
    }
}

impl std::error::Error for UnknownToken {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Sme,
    Supervisor,
    Lead,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Sme => "SME",
            Role::Supervisor => "SUPERVISOR",
            Role::Lead => "LEAD",
        }
    }

    /// Supervisors and leads also act as subject-matter experts, so every
    /// role has its booked time rolled up.
    pub fn is_contributor(&self) -> bool {
        matches!(self, Role::Sme | Role::Supervisor | Role::Lead)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SME" => Ok(Role::Sme),
            "SUPERVISOR" => Ok(Role::Supervisor),
            "LEAD" => Ok(Role::Lead),
            _ => Err(UnknownToken {
                kind: "role",
                token: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityCategory {
    CalendarTraining,
    Blended,
    AdhocTraining,
    ByteSized,
    ContentDevelopment,
    Evaluation,
    SkillUpgrade,
    Management,
    TimeOff,
    Miscellaneous,
}

impl ActivityCategory {
    pub const ALL: [ActivityCategory; 10] = [
        ActivityCategory::CalendarTraining,
        ActivityCategory::Blended,
        ActivityCategory::AdhocTraining,
        ActivityCategory::ByteSized,
        ActivityCategory::ContentDevelopment,
        ActivityCategory::Evaluation,
        ActivityCategory::SkillUpgrade,
        ActivityCategory::Management,
        ActivityCategory::TimeOff,
        ActivityCategory::Miscellaneous,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityCategory::CalendarTraining => "CALENDAR_TRAINING",
            ActivityCategory::Blended => "BLENDED",
            ActivityCategory::AdhocTraining => "ADHOC_TRAINING",
            ActivityCategory::ByteSized => "BYTE_SIZED",
            ActivityCategory::ContentDevelopment => "CONTENT_DEVELOPMENT",
            ActivityCategory::Evaluation => "EVALUATION",
            ActivityCategory::SkillUpgrade => "SKILL_UPGRADE",
            ActivityCategory::Management => "MANAGEMENT",
            ActivityCategory::TimeOff => "TIME_OFF",
            ActivityCategory::Miscellaneous => "MISCELLANEOUS",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ActivityCategory::CalendarTraining => "Calendar Training",
            ActivityCategory::Blended => "Blended",
            ActivityCategory::AdhocTraining => "Adhoc Training",
            ActivityCategory::ByteSized => "Byte Sized",
            ActivityCategory::ContentDevelopment => "Content Development",
            ActivityCategory::Evaluation => "Evaluation",
            ActivityCategory::SkillUpgrade => "Skill Upgrade",
            ActivityCategory::Management => "Management",
            ActivityCategory::TimeOff => "Time Off",
            ActivityCategory::Miscellaneous => "Miscellaneous",
        }
    }
}

impl fmt::Display for ActivityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityCategory {
    type Err = UnknownToken;

    /// Accepts either the token (`BYTE_SIZED`) or the display name (`Byte Sized`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        ActivityCategory::ALL
            .into_iter()
            .find(|c| {
                c.as_str().eq_ignore_ascii_case(wanted)
                    || c.display_name().eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| UnknownToken {
                kind: "category",
                token: s.to_string(),
            })
    }
}

/// A person who can be booked. Owned by the identity directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub role: Role,
    #[serde(default)]
    pub supervisor_id: Option<Ulid>,
}

/// Catalog entry for something a subject can be booked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Ulid,
    pub name: String,
    pub category: ActivityCategory,
    #[serde(default)]
    pub duration_hours: Option<f64>,
    #[serde(default)]
    pub is_variable_duration: bool,
}

/// Caller-supplied booking fields. Ids and timestamps are assigned on create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDraft {
    pub subject_id: Ulid,
    pub window: Window,
    pub activity_id: Ulid,
    pub activity_name: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub subject_id: Ulid,
    pub window: Window,
    pub activity_id: Ulid,
    pub activity_name: Option<String>,
    pub description: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Booking {
    pub fn from_draft(id: Ulid, draft: BookingDraft, now: Timestamp) -> Self {
        Self {
            id,
            subject_id: draft.subject_id,
            window: draft.window,
            activity_id: draft.activity_id,
            activity_name: draft.activity_name,
            description: draft.description,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn conflict_record(&self) -> ConflictRecord {
        ConflictRecord {
            id: self.id,
            from_date: self.window.from_date,
            to_date: self.window.to_date,
            from_time: self.window.from_time,
            to_time: self.window.to_time,
            activity_name: self.activity_name.clone(),
            description: self.description.clone(),
        }
    }
}

/// Partial update. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub subject_id: Option<Ulid>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub from_time: Option<NaiveTime>,
    pub to_time: Option<NaiveTime>,
    pub activity_id: Option<Ulid>,
    pub activity_name: Option<String>,
    pub description: Option<String>,
}

impl BookingPatch {
    /// Merge onto `current`, producing the fields the updated booking will carry.
    pub fn merge(&self, current: &Booking) -> BookingDraft {
        BookingDraft {
            subject_id: self.subject_id.unwrap_or(current.subject_id),
            window: Window {
                from_date: self.from_date.unwrap_or(current.window.from_date),
                to_date: self.to_date.unwrap_or(current.window.to_date),
                from_time: self.from_time.unwrap_or(current.window.from_time),
                to_time: self.to_time.unwrap_or(current.window.to_time),
            },
            activity_id: self.activity_id.unwrap_or(current.activity_id),
            activity_name: self
                .activity_name
                .clone()
                .or_else(|| current.activity_name.clone()),
            description: self
                .description
                .clone()
                .unwrap_or_else(|| current.description.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == BookingPatch::default()
    }
}

/// All bookings of one subject, sorted by `window.from_date`.
#[derive(Debug, Clone)]
pub struct SubjectSchedule {
    pub subject_id: Ulid,
    pub bookings: Vec<Booking>,
}

impl SubjectSchedule {
    pub fn new(subject_id: Ulid) -> Self {
        Self {
            subject_id,
            bookings: Vec::new(),
        }
    }

    /// Insert maintaining sort order by from_date.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.window.from_date <= booking.window.from_date);
        self.bookings.insert(pos, booking);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings whose date range intersects `window`'s.
    /// Everything past the partition point starts after `window.to_date`.
    pub fn date_candidates(&self, window: &Window) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.window.from_date <= window.to_date);
        let from = window.from_date;
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.window.to_date >= from)
    }
}

/// Identity of one rollup row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RollupKey {
    pub subject_id: Ulid,
    pub activity_id: Ulid,
    pub month: MonthYear,
}

impl RollupKey {
    pub fn for_booking(booking: &Booking) -> Self {
        Self {
            subject_id: booking.subject_id,
            activity_id: booking.activity_id,
            month: booking.window.month(),
        }
    }
}

/// Accumulated monthly effort for one (subject, activity, month).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyEffortAggregate {
    pub subject_id: Ulid,
    pub activity_id: Ulid,
    pub month: MonthYear,
    /// Snapshot taken when the row was first created.
    pub category: ActivityCategory,
    pub total_hours: f64,
    pub total_sessions: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl MonthlyEffortAggregate {
    pub fn new(key: RollupKey, category: ActivityCategory, now: Timestamp) -> Self {
        Self {
            subject_id: key.subject_id,
            activity_id: key.activity_id,
            month: key.month,
            category,
            total_hours: 0.0,
            total_sessions: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> RollupKey {
        RollupKey {
            subject_id: self.subject_id,
            activity_id: self.activity_id,
            month: self.month,
        }
    }

    /// Count one session; only positive durations add hours.
    pub fn accumulate(&mut self, hours: f64, now: Timestamp) {
        self.total_sessions += 1;
        if hours > 0.0 {
            self.total_hours += hours;
        }
        self.updated_at = now;
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    BookingUpdated {
        previous_subject_id: Ulid,
        booking: Booking,
    },
    BookingDeleted {
        id: Ulid,
        subject_id: Ulid,
    },
    AggregateUpserted {
        aggregate: MonthlyEffortAggregate,
    },
}

// ── Query result types ───────────────────────────────────────────

/// Compact projection of a booking that blocks a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictRecord {
    pub id: Ulid,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub from_time: NaiveTime,
    pub to_time: NaiveTime,
    pub activity_name: Option<String>,
    pub description: String,
}

/// "Who is free on `date` between `from_time` and `to_time`?"
///
/// Subject ids take precedence over roles; with neither, every subject is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityQuery {
    pub date: NaiveDate,
    pub from_time: NaiveTime,
    pub to_time: NaiveTime,
    /// Raw role tokens; parsed by the search so unknown tokens surface as errors.
    pub roles: Vec<String>,
    pub subject_ids: Vec<Ulid>,
}

impl AvailabilityQuery {
    pub fn new(date: NaiveDate, from_time: NaiveTime, to_time: NaiveTime) -> Self {
        Self {
            date,
            from_time,
            to_time,
            roles: Vec::new(),
            subject_ids: Vec::new(),
        }
    }

    pub fn window(&self) -> Window {
        Window::single_day(self.date, self.from_time, self.to_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectAvailability {
    pub subject_id: Ulid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub available: bool,
    pub conflicts: Vec<ConflictRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemError {
    pub index: usize,
    pub message: String,
    pub request: BookingDraft,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkResult {
    pub total_requested: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub created: Vec<Booking>,
    pub errors: Vec<BulkItemError>,
}

/// One category's share of a subject's month.
#[derive(Debug, Clone, PartialEq)]
pub struct CategorySummary {
    pub category: ActivityCategory,
    /// Number of (activity) rows rolled into this category.
    pub activity_count: u64,
    pub total_hours: f64,
    pub total_sessions: u64,
}

impl CategorySummary {
    pub fn average_hours_per_session(&self) -> f64 {
        if self.total_sessions > 0 {
            self.total_hours / self.total_sessions as f64
        } else {
            0.0
        }
    }
}

/// Monthly effort report for one subject.
#[derive(Debug, Clone, PartialEq)]
pub struct EffortDetails {
    pub subject_id: Ulid,
    pub name: String,
    pub email: String,
    pub month: MonthYear,
    pub sessions_by_category: Vec<(ActivityCategory, u64)>,
    pub total_hours: f64,
    pub total_sessions: u64,
}

impl EffortDetails {
    pub fn sessions_in(&self, category: ActivityCategory) -> u64 {
        self.sessions_by_category
            .iter()
            .find(|(c, _)| *c == category)
            .map_or(0, |(_, n)| *n)
    }
}

/// Monthly report across several subjects with grand totals.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidatedEffort {
    pub month: MonthYear,
    pub supervisor_id: Option<Ulid>,
    pub subjects: Vec<EffortDetails>,
    pub total_hours: f64,
    pub total_sessions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn t(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M").unwrap()
    }

    fn w(from: &str, to: &str, ft: &str, tt: &str) -> Window {
        Window::new(d(from), d(to), t(ft), t(tt))
    }

    #[test]
    fn reversed_dates_always_invalid() {
        let a = w("2025-07-16", "2025-07-15", "09:00", "17:00");
        assert_eq!(a.validate(), Err(InvalidWindow::DatesReversed));
        let b = w("2025-07-16", "2025-07-15", "17:00", "09:00");
        assert_eq!(b.validate(), Err(InvalidWindow::DatesReversed));
    }

    #[test]
    fn same_day_reversed_times_invalid() {
        let a = w("2025-07-15", "2025-07-15", "11:00", "09:00");
        assert_eq!(a.validate(), Err(InvalidWindow::TimesReversed));
    }

    #[test]
    fn multi_day_reversed_times_valid() {
        let a = w("2025-07-15", "2025-07-16", "22:00", "06:00");
        assert_eq!(a.validate(), Ok(()));
    }

    #[test]
    fn zero_length_window_valid() {
        let a = w("2025-07-15", "2025-07-15", "09:00", "09:00");
        assert!(a.validate().is_ok());
        assert_eq!(a.duration_hours(), 0.0);
    }

    #[test]
    fn overlap_is_reflexive_and_symmetric() {
        let a = w("2025-07-15", "2025-07-15", "09:00", "11:00");
        let b = w("2025-07-15", "2025-07-15", "10:00", "12:00");
        let c = w("2025-07-16", "2025-07-18", "13:00", "14:00");
        for x in [a, b, c] {
            assert!(x.overlaps(&x));
            for y in [a, b, c] {
                assert_eq!(x.overlaps(&y), y.overlaps(&x));
            }
        }
    }

    #[test]
    fn touching_endpoints_overlap() {
        let a = w("2025-07-15", "2025-07-15", "09:00", "11:00");
        let b = w("2025-07-15", "2025-07-15", "11:00", "13:00");
        assert!(a.overlaps(&b));
    }

    #[test]
    fn disjoint_times_same_day_do_not_overlap() {
        let a = w("2025-07-15", "2025-07-15", "09:00", "10:59");
        let b = w("2025-07-15", "2025-07-15", "11:00", "13:00");
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn time_window_is_tested_per_day() {
        // Multi-day bookings whose daily windows intersect conflict.
        let a = w("2025-07-14", "2025-07-18", "09:00", "10:00");
        let b = w("2025-07-17", "2025-07-20", "09:30", "09:45");
        assert!(a.overlaps(&b));

        // An overnight booking runs 15th 22:00 → 16th 06:00 and really does cover
        // 23:00 on the 15th, but its 22:00-06:00 time range never satisfies the
        // per-day test, so no conflict is reported.
        let overnight = w("2025-07-15", "2025-07-16", "22:00", "06:00");
        let late = w("2025-07-15", "2025-07-15", "23:00", "23:30");
        assert!(!overnight.overlaps(&late));
        assert!(!late.overlaps(&overnight));
    }

    #[test]
    fn duration_spans_days() {
        let a = w("2025-07-15", "2025-07-16", "22:00", "06:00");
        assert_eq!(a.duration_minutes(), 8 * 60);
        assert_eq!(a.duration_hours(), 8.0);

        let b = w("2025-07-15", "2025-07-15", "09:00", "10:30");
        assert_eq!(b.duration_hours(), 1.5);
    }

    #[test]
    fn month_token_format() {
        let a = w("2025-07-15", "2025-08-02", "09:00", "10:00");
        assert_eq!(a.month().to_string(), "2025-07");
        assert_eq!("2025-07".parse::<MonthYear>().unwrap(), a.month());
        assert!("2025-13".parse::<MonthYear>().is_err());
        assert!("2025-7".parse::<MonthYear>().is_err());
        assert!("July".parse::<MonthYear>().is_err());
    }

    #[test]
    fn role_tokens() {
        assert_eq!("sme".parse::<Role>().unwrap(), Role::Sme);
        assert_eq!("LEAD".parse::<Role>().unwrap(), Role::Lead);
        assert!("ADMIN".parse::<Role>().is_err());
        assert!(Role::Supervisor.is_contributor());
    }

    #[test]
    fn category_accepts_token_or_display_name() {
        assert_eq!(
            "BYTE_SIZED".parse::<ActivityCategory>().unwrap(),
            ActivityCategory::ByteSized
        );
        assert_eq!(
            "Time Off".parse::<ActivityCategory>().unwrap(),
            ActivityCategory::TimeOff
        );
        assert!("Gardening".parse::<ActivityCategory>().is_err());
    }

    #[test]
    fn schedule_keeps_from_date_order() {
        let now = Utc::now();
        let mut s = SubjectSchedule::new(Ulid::new());
        for day in ["2025-07-20", "2025-07-10", "2025-07-15"] {
            let draft = BookingDraft {
                subject_id: s.subject_id,
                window: w(day, day, "09:00", "10:00"),
                activity_id: Ulid::new(),
                activity_name: None,
                description: "x".into(),
            };
            s.insert(Booking::from_draft(Ulid::new(), draft, now));
        }
        let days: Vec<_> = s.bookings.iter().map(|b| b.window.from_date).collect();
        assert_eq!(days, vec![d("2025-07-10"), d("2025-07-15"), d("2025-07-20")]);

        let probe = w("2025-07-14", "2025-07-16", "00:00", "23:59");
        let hits: Vec<_> = s.date_candidates(&probe).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].window.from_date, d("2025-07-15"));
    }

    #[test]
    fn patch_merges_onto_current() {
        let now = Utc::now();
        let current = Booking::from_draft(
            Ulid::new(),
            BookingDraft {
                subject_id: Ulid::new(),
                window: w("2025-07-15", "2025-07-15", "09:00", "10:00"),
                activity_id: Ulid::new(),
                activity_name: Some("Intro".into()),
                description: "first".into(),
            },
            now,
        );
        let patch = BookingPatch {
            to_time: Some(t("12:00")),
            description: Some("longer".into()),
            ..Default::default()
        };
        let merged = patch.merge(&current);
        assert_eq!(merged.window.to_time, t("12:00"));
        assert_eq!(merged.window.from_time, t("09:00"));
        assert_eq!(merged.description, "longer");
        assert_eq!(merged.activity_name.as_deref(), Some("Intro"));
        assert!(BookingPatch::default().is_empty());
    }

    #[test]
    fn aggregate_counts_sessions_but_skips_non_positive_hours() {
        let now = Utc::now();
        let key = RollupKey {
            subject_id: Ulid::new(),
            activity_id: Ulid::new(),
            month: MonthYear::new(2025, 7).unwrap(),
        };
        let mut row = MonthlyEffortAggregate::new(key, ActivityCategory::Evaluation, now);
        row.accumulate(2.0, now);
        row.accumulate(0.0, now);
        row.accumulate(-3.0, now);
        assert_eq!(row.total_sessions, 3);
        assert_eq!(row.total_hours, 2.0);
        assert_eq!(row.key(), key);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let now = Utc::now();
        let booking = Booking::from_draft(
            Ulid::new(),
            BookingDraft {
                subject_id: Ulid::new(),
                window: w("2025-07-15", "2025-07-15", "09:00", "10:00"),
                activity_id: Ulid::new(),
                activity_name: None,
                description: "Review".into(),
            },
            now,
        );
        let event = Event::BookingCreated { booking };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
