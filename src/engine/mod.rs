mod availability;
mod bulk;
mod conflict;
mod error;
mod mutations;
mod queries;
mod rollup;

pub use conflict::{find_overlapping, find_overlapping_across, overlaps};
pub use error::{EngineError, ErrorKind};

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::directory::{ActivityCatalog, Directory, LookupError};
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedSchedule = Arc<RwLock<SubjectSchedule>>;

/// `None` until the first contributing booking for the key lands.
pub type SharedAggregate = Arc<Mutex<Option<MonthlyEffortAggregate>>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and group-commits appends: block for the
/// first append, drain whatever else is already queued, fsync once, answer all.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Compaction must see the batch on disk first.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after an append error so half-written bytes don't ride along
    // with the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// How the engine talks to its external collaborators.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-attempt deadline for a directory or catalog call.
    pub lookup_timeout: Duration,
    pub lookup_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lookup_timeout: Duration::from_secs(2),
            lookup_attempts: 2,
        }
    }
}

pub struct Engine {
    /// One schedule per subject; its write lock serializes check-then-write.
    pub(super) schedules: DashMap<Ulid, SharedSchedule>,
    /// Reverse lookup: booking id → owning subject id.
    pub(super) booking_owner: DashMap<Ulid, Ulid>,
    pub(super) rollups: DashMap<RollupKey, SharedAggregate>,
    /// Mutations hold this shared; compaction holds it exclusively so its
    /// snapshot can't miss an in-flight append.
    pub(super) compaction_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) directory: Arc<dyn Directory>,
    pub(super) catalog: Arc<dyn ActivityCatalog>,
    pub(super) config: EngineConfig,
}

/// Apply a booking event to one schedule (caller holds the lock).
///
/// An update that moves a booking between subjects is applied to both
/// schedules: the old one drops it, the new one inserts it.
fn apply_to_schedule(s: &mut SubjectSchedule, event: &Event, owners: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingCreated { booking } => {
            s.insert(booking.clone());
            owners.insert(booking.id, booking.subject_id);
        }
        Event::BookingUpdated { booking, .. } => {
            s.remove(booking.id);
            if booking.subject_id == s.subject_id {
                s.insert(booking.clone());
                owners.insert(booking.id, booking.subject_id);
            }
        }
        Event::BookingDeleted { id, .. } => {
            s.remove(*id);
            owners.remove(id);
        }
        // Aggregates live outside subject schedules.
        Event::AggregateUpserted { .. } => {}
    }
}

/// Subjects whose schedules an event touches.
fn event_subject_ids(event: &Event) -> Vec<Ulid> {
    match event {
        Event::BookingCreated { booking } => vec![booking.subject_id],
        Event::BookingUpdated {
            previous_subject_id,
            booking,
        } => {
            if *previous_subject_id == booking.subject_id {
                vec![booking.subject_id]
            } else {
                vec![*previous_subject_id, booking.subject_id]
            }
        }
        Event::BookingDeleted { subject_id, .. } => vec![*subject_id],
        Event::AggregateUpserted { .. } => Vec::new(),
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        directory: Arc<dyn Directory>,
        catalog: Arc<dyn ActivityCatalog>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            schedules: DashMap::new(),
            booking_owner: DashMap::new(),
            rollups: DashMap::new(),
            compaction_gate: RwLock::new(()),
            wal_tx,
            directory,
            catalog,
            config,
        };

        // Sole owner of every Arc during replay, so try_write never contends.
        for event in &events {
            if let Event::AggregateUpserted { aggregate } = event {
                engine
                    .rollups
                    .insert(aggregate.key(), Arc::new(Mutex::new(Some(aggregate.clone()))));
                continue;
            }
            for subject_id in event_subject_ids(event) {
                let slot = engine.schedule_or_create(subject_id);
                let mut guard = slot
                    .try_write()
                    .map_err(|_| io::Error::other("replay: schedule lock contended"))?;
                apply_to_schedule(&mut guard, event, &engine.booking_owner);
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn schedule(&self, subject_id: &Ulid) -> Option<SharedSchedule> {
        self.schedules.get(subject_id).map(|e| e.value().clone())
    }

    pub(super) fn schedule_or_create(&self, subject_id: Ulid) -> SharedSchedule {
        self.schedules
            .entry(subject_id)
            .or_insert_with(|| Arc::new(RwLock::new(SubjectSchedule::new(subject_id))))
            .value()
            .clone()
    }

    pub fn owner_of(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_owner.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append then apply, under the caller's schedule lock.
    pub(super) async fn persist_and_apply(
        &self,
        schedule: &mut SubjectSchedule,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_schedule(schedule, event, &self.booking_owner);
        Ok(())
    }

    /// Run a collaborator call with a per-attempt timeout. `NotFound` is
    /// final; timeouts and `Unavailable` are retried up to the configured
    /// attempt count.
    pub(super) async fn lookup<T, F, Fut>(&self, what: &'static str, mut call: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LookupError>>,
    {
        let attempts = self.config.lookup_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.lookup_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(LookupError::NotFound(id))) => return Err(EngineError::NotFound(id)),
                Ok(Err(LookupError::Unavailable(e))) => last = e,
                Err(_) => last = format!("timed out after {:?}", self.config.lookup_timeout),
            }
            tracing::debug!("{what} attempt {attempt}/{attempts} failed: {last}");
        }
        metrics::counter!(observability::LOOKUP_FAILURES_TOTAL, "lookup" => what).increment(1);
        Err(EngineError::Unavailable(format!("{what}: {last}")))
    }

    pub(super) async fn resolve_subject(&self, id: Ulid) -> Result<Subject, EngineError> {
        self.lookup("resolve_subject", || self.directory.resolve_subject(id))
            .await
    }

    pub(super) async fn resolve_activity(&self, id: Ulid) -> Result<Activity, EngineError> {
        self.lookup("get_activity", || self.catalog.get_activity(id)).await
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;

        let mut events = Vec::new();
        let mut subject_ids: Vec<Ulid> = self.schedules.iter().map(|e| *e.key()).collect();
        subject_ids.sort();
        for subject_id in subject_ids {
            let Some(slot) = self.schedule(&subject_id) else { continue };
            let guard = slot.read().await;
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated { booking: b.clone() }));
        }

        let mut slots: Vec<(RollupKey, SharedAggregate)> = self
            .rollups
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        slots.sort_by_key(|(key, _)| *key);
        for (_, slot) in slots {
            if let Some(row) = slot.lock().await.as_ref() {
                events.push(Event::AggregateUpserted { aggregate: row.clone() });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
