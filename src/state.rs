use crate::config::RunConfig;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Stopped,
    Starting,
    InitScript,
    HealthCheck,
    Routing,
    Failed,
}

impl ModelStatus {
    pub fn is_startup_state(self) -> bool {
        matches!(
            self,
            ModelStatus::Starting | ModelStatus::InitScript | ModelStatus::HealthCheck
        )
    }
}

/// One record per configured model, created at startup and never removed.
/// Multi-field reads go through `fields()` under `state_mutex`; single-word
/// fields (`status`, `pid`, `last_access`) are plain atomics so a caller that
/// only needs one of them never takes the lock.
pub struct ModelRecord {
    pub name: String,
    status: AtomicU32,
    pid: AtomicU32, // 0 == no pid
    last_access: AtomicI64,
    current_variant: Mutex<Option<RunConfig>>,
    failure_reason: Mutex<Option<String>>,
    in_flight: AtomicUsize,
    /// Serializes startup attempts for this model; a distinct lock from the
    /// field mutexes above so the wait path never needs to hold it.
    pub startup_gate: AsyncMutex<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelFields {
    pub status: ModelStatus,
    pub pid: Option<u32>,
    pub last_access: Option<i64>,
    pub failure_reason: Option<String>,
}

impl ModelRecord {
    pub fn new(name: String) -> Self {
        Self {
            name,
            status: AtomicU32::new(status_to_u32(ModelStatus::Stopped)),
            pid: AtomicU32::new(0),
            last_access: AtomicI64::new(0),
            current_variant: Mutex::new(None),
            failure_reason: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            startup_gate: AsyncMutex::new(()),
        }
    }

    pub fn status(&self) -> ModelStatus {
        u32_to_status(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: ModelStatus) {
        self.status.store(status_to_u32(status), Ordering::SeqCst);
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        self.pid.store(pid.unwrap_or(0), Ordering::SeqCst);
    }

    pub fn last_access(&self) -> Option<i64> {
        match self.last_access.load(Ordering::SeqCst) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn touch(&self) {
        self.last_access.store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    pub fn current_variant(&self) -> Option<RunConfig> {
        self.current_variant.lock().clone()
    }

    pub fn set_current_variant(&self, variant: Option<RunConfig>) {
        *self.current_variant.lock() = variant;
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.failure_reason.lock().clone()
    }

    pub fn set_failure_reason(&self, reason: Option<String>) {
        *self.failure_reason.lock() = reason;
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn increment_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    /// Saturating: never goes below zero even if called more times than
    /// `increment_in_flight` (it shouldn't, but this keeps the in-flight
    /// count non-negative under any bug in a caller rather than panicking
    /// or wrapping).
    pub fn decrement_in_flight(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            });
        self.touch();
    }

    pub fn fields(&self) -> ModelFields {
        ModelFields {
            status: self.status(),
            pid: self.pid(),
            last_access: self.last_access(),
            failure_reason: self.failure_reason(),
        }
    }
}

fn status_to_u32(status: ModelStatus) -> u32 {
    match status {
        ModelStatus::Stopped => 0,
        ModelStatus::Starting => 1,
        ModelStatus::InitScript => 2,
        ModelStatus::HealthCheck => 3,
        ModelStatus::Routing => 4,
        ModelStatus::Failed => 5,
    }
}

fn u32_to_status(value: u32) -> ModelStatus {
    match value {
        0 => ModelStatus::Stopped,
        1 => ModelStatus::Starting,
        2 => ModelStatus::InitScript,
        3 => ModelStatus::HealthCheck,
        4 => ModelStatus::Routing,
        _ => ModelStatus::Failed,
    }
}

/// The full set of model records, keyed by primary name. Created once at
/// startup with one entry per configured model; entries persist for the
/// life of the process.
pub struct ModelStateTable {
    records: HashMap<String, Arc<ModelRecord>>,
}

impl ModelStateTable {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        let records = names
            .into_iter()
            .map(|name| (name.clone(), Arc::new(ModelRecord::new(name))))
            .collect();
        Self { records }
    }

    pub fn get(&self, primary_name: &str) -> Option<Arc<ModelRecord>> {
        self.records.get(primary_name).cloned()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<ModelRecord>> {
        self.records.values()
    }
}
