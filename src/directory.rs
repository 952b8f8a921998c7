//! Identity directory and activity catalog: the collaborators the engine
//! consults but does not own.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use ulid::Ulid;

use crate::model::{Activity, Role, Subject};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    NotFound(Ulid),
    /// Transient failure; the caller may retry.
    Unavailable(String),
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::NotFound(id) => write!(f, "not found: {id}"),
            LookupError::Unavailable(e) => write!(f, "lookup unavailable: {e}"),
        }
    }
}

impl std::error::Error for LookupError {}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn resolve_subject(&self, id: Ulid) -> Result<Subject, LookupError>;

    async fn subjects_by_role(&self, role: Role) -> Result<Vec<Subject>, LookupError>;

    async fn all_subjects(&self) -> Result<Vec<Subject>, LookupError>;

    async fn is_direct_report(
        &self,
        subject_id: Ulid,
        supervisor_id: Ulid,
    ) -> Result<bool, LookupError>;

    /// Whether bookings of this subject are rolled into monthly aggregates.
    fn can_act_as_contributor(&self, subject: &Subject) -> bool {
        subject.role.is_contributor()
    }
}

#[async_trait]
pub trait ActivityCatalog: Send + Sync {
    async fn get_activity(&self, id: Ulid) -> Result<Activity, LookupError>;
}

/// Directory held in memory, keyed by subject id.
#[derive(Default)]
pub struct InMemoryDirectory {
    subjects: DashMap<Ulid, Subject>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subject: Subject) {
        self.subjects.insert(subject.id, subject);
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    fn sorted(&self, filter: impl Fn(&Subject) -> bool) -> Vec<Subject> {
        let mut out: Vec<Subject> = self
            .subjects
            .iter()
            .filter(|e| filter(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn resolve_subject(&self, id: Ulid) -> Result<Subject, LookupError> {
        self.subjects
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(LookupError::NotFound(id))
    }

    async fn subjects_by_role(&self, role: Role) -> Result<Vec<Subject>, LookupError> {
        Ok(self.sorted(|s| s.role == role))
    }

    async fn all_subjects(&self) -> Result<Vec<Subject>, LookupError> {
        Ok(self.sorted(|_| true))
    }

    async fn is_direct_report(
        &self,
        subject_id: Ulid,
        supervisor_id: Ulid,
    ) -> Result<bool, LookupError> {
        Ok(self
            .subjects
            .get(&subject_id)
            .is_some_and(|s| s.supervisor_id == Some(supervisor_id)))
    }
}

/// Activity catalog held in memory.
#[derive(Default)]
pub struct InMemoryCatalog {
    activities: DashMap<Ulid, Activity>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, activity: Activity) {
        self.activities.insert(activity.id, activity);
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}

#[async_trait]
impl ActivityCatalog for InMemoryCatalog {
    async fn get_activity(&self, id: Ulid) -> Result<Activity, LookupError> {
        self.activities
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(LookupError::NotFound(id))
    }
}

/// Seed file layout: `{ "subjects": [...], "activities": [...] }`.
#[derive(Debug, Default, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub activities: Vec<Activity>,
}

impl DirectorySeed {
    pub fn from_json(text: &str) -> std::io::Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn into_collaborators(self) -> (InMemoryDirectory, InMemoryCatalog) {
        let directory = InMemoryDirectory::new();
        for s in self.subjects {
            directory.insert(s);
        }
        let catalog = InMemoryCatalog::new();
        for a in self.activities {
            catalog.insert(a);
        }
        (directory, catalog)
    }
}
