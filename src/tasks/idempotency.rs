use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::model::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub task_id: TaskId,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The mapping was written by this call
    Recorded,
    /// A live mapping already existed and was left untouched
    Existing(TaskId),
}

/// Result of [`IdempotencyStore::resolve_with`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    /// A live mapping was found
    Existing(T),
    /// No usable mapping; `create` ran
    Created(T),
}

impl<T> Resolution<T> {
    pub fn into_inner(self) -> T {
        match self {
            Resolution::Existing(value) | Resolution::Created(value) => value,
        }
    }
}

type Key = (String, String);

/// Maps `(submitter, idempotency key)` to the task created for it
#[derive(Debug)]
pub struct IdempotencyStore {
    records: DashMap<Key, IdempotencyRecord>,
    ttl: Option<Duration>,
}

impl IdempotencyStore {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    fn key(submitter: &str, key: &str) -> Key {
        (submitter.to_string(), key.to_string())
    }

    fn is_expired(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> bool {
        match self.ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok()) {
            Some(ttl) => now - record.recorded_at >= ttl,
            None => false,
        }
    }

    pub fn lookup(&self, submitter: &str, key: &str) -> Option<TaskId> {
        let record = *self.records.get(&Self::key(submitter, key))?;
        if self.is_expired(&record, Utc::now()) {
            None
        } else {
            Some(record.task_id)
        }
    }

    /// First writer wins; an expired mapping is replaced.
    pub fn record(&self, submitter: &str, key: &str, task_id: TaskId) -> RecordOutcome {
        self.resolve_with(
            submitter,
            key,
            |existing| Some(RecordOutcome::Existing(*existing)),
            || (Some(task_id), RecordOutcome::Recorded),
        )
        .into_inner()
    }

    /// Resolve a key while holding its entry lock.
    ///
    /// A live mapping is handed to `existing`; when that returns `None`, or
    /// the mapping is expired or absent, `create` runs and the id it returns
    /// is recorded. Concurrent callers for the same key run one at a time.
    /// Neither closure may touch this store.
    pub fn resolve_with<T, E, C>(
        &self,
        submitter: &str,
        key: &str,
        existing: E,
        create: C,
    ) -> Resolution<T>
    where
        E: FnOnce(&TaskId) -> Option<T>,
        C: FnOnce() -> (Option<TaskId>, T),
    {
        let now = Utc::now();
        match self.records.entry(Self::key(submitter, key)) {
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                if !self.is_expired(&current, now) {
                    if let Some(found) = existing(&current.task_id) {
                        debug!(
                            submitter,
                            key,
                            existing = %current.task_id,
                            "Idempotency key already mapped"
                        );
                        return Resolution::Existing(found);
                    }
                }
                debug!(
                    submitter,
                    key,
                    stale = %current.task_id,
                    "Replacing stale idempotency mapping"
                );
                let (recorded, created) = create();
                match recorded {
                    Some(task_id) => {
                        entry.insert(IdempotencyRecord {
                            task_id,
                            recorded_at: Utc::now(),
                        });
                    }
                    None => {
                        entry.remove();
                    }
                }
                Resolution::Created(created)
            }
            Entry::Vacant(entry) => {
                let (recorded, created) = create();
                if let Some(task_id) = recorded {
                    entry.insert(IdempotencyRecord {
                        task_id,
                        recorded_at: Utc::now(),
                    });
                }
                Resolution::Created(created)
            }
        }
    }

    pub fn purge_expired(&self) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let now = Utc::now();
        let before = self.records.len();
        self.records.retain(|_, record| !self.is_expired(record, now));
        let purged = before.saturating_sub(self.records.len());
        if purged > 0 {
            info!(purged, "Purged expired idempotency records");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
