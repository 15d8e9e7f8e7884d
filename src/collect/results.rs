//! Result aggregator
//!
//! Bounded event buffer, progress counters and job lifecycle state, shared by both
//! pipeline stages and observed by the HTTP/WebSocket layer. Observers either poll
//! `snapshot()`, receive `PropertyChange`s from `subscribe()`, or register a
//! synchronous listener that runs on the thread that caused the change.

use super::{JobState, LogEvent};
use crate::error::CollectError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Property {
    JobState,
    FilesToProcess,
    ProcessedFiles,
    SelectedFiles,
    Events,
}

impl Property {
    pub fn as_str(&self) -> &'static str {
        match self {
            Property::JobState => "jobState",
            Property::FilesToProcess => "filesToProcess",
            Property::ProcessedFiles => "processedFiles",
            Property::SelectedFiles => "selectedFiles",
            Property::Events => "events",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "property", rename_all = "camelCase")]
pub enum PropertyChange {
    JobState { old: JobState, new: JobState },
    FilesToProcess { old: u64, new: u64 },
    ProcessedFiles { old: u64, new: u64 },
    SelectedFiles { old: u64, new: u64 },
    /// `added` events appended in one batch, buffer now holds `len`
    Events { added: usize, len: usize },
}

impl PropertyChange {
    pub fn property(&self) -> Property {
        match self {
            PropertyChange::JobState { .. } => Property::JobState,
            PropertyChange::FilesToProcess { .. } => Property::FilesToProcess,
            PropertyChange::ProcessedFiles { .. } => Property::ProcessedFiles,
            PropertyChange::SelectedFiles { .. } => Property::SelectedFiles,
            PropertyChange::Events { .. } => Property::Events,
        }
    }
}

pub type Listener = Arc<dyn Fn(&PropertyChange) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Point-in-time view for pollers and new WebSocket clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_state: JobState,
    pub files_to_process: u64,
    pub processed_files: u64,
    pub selected_files: u64,
    /// Events currently buffered
    pub events: usize,
    /// Events produced by the job, buffered or already evicted
    pub total_events: u64,
    pub capacity: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub success: bool,
}

#[derive(Debug, Default)]
struct Lifecycle {
    state: JobState,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    error: Option<String>,
}

struct Buffer {
    events: VecDeque<LogEvent>,
    selected: Option<usize>,
}

struct Inner {
    capacity: usize,
    buffer: Mutex<Buffer>,
    files_to_process: AtomicU64,
    processed_files: AtomicU64,
    selected_files: AtomicU64,
    total_events: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    listeners: RwLock<Vec<(ListenerId, Option<Property>, Listener)>>,
    next_listener: AtomicU64,
    changes: broadcast::Sender<PropertyChange>,
}

/// Cloneable handle; every clone sees the same state
#[derive(Clone)]
pub struct JobResults {
    inner: Arc<Inner>,
}

impl Default for JobResults {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl JobResults {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                capacity,
                buffer: Mutex::new(Buffer {
                    events: VecDeque::with_capacity(capacity.min(4096)),
                    selected: None,
                }),
                files_to_process: AtomicU64::new(0),
                processed_files: AtomicU64::new(0),
                selected_files: AtomicU64::new(0),
                total_events: AtomicU64::new(0),
                lifecycle: Mutex::new(Lifecycle::default()),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                changes,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    // --- events ---

    pub fn add(&self, event: LogEvent) {
        self.add_all(vec![event]);
    }

    /// Append a batch atomically with a single notification
    pub fn add_all(&self, events: Vec<LogEvent>) {
        if events.is_empty() {
            return;
        }
        let added = events.len();
        self.inner.total_events.fetch_add(added as u64, Ordering::SeqCst);
        let len = {
            let mut buf = self.inner.buffer.lock();
            let mut evicted = 0;
            for event in events {
                if buf.events.len() == self.inner.capacity {
                    buf.events.pop_front();
                    evicted += 1;
                }
                buf.events.push_back(event);
            }
            if evicted > 0 {
                buf.selected = buf.selected.and_then(|i| i.checked_sub(evicted));
            }
            buf.events.len()
        };
        self.notify(PropertyChange::Events { added, len });
    }

    /// Count events that were produced but never offered to the buffer
    pub fn add_discarded(&self, n: u64) {
        self.inner.total_events.fetch_add(n, Ordering::SeqCst);
    }

    /// Events produced since the job started, including evicted ones
    pub fn total_events(&self) -> u64 {
        self.inner.total_events.load(Ordering::SeqCst)
    }

    /// Buffered events, oldest first
    pub fn events(&self) -> Vec<LogEvent> {
        self.inner.buffer.lock().events.iter().cloned().collect()
    }

    /// The newest `limit` events, oldest first
    pub fn recent(&self, limit: usize) -> Vec<LogEvent> {
        let buf = self.inner.buffer.lock();
        let skip = buf.events.len().saturating_sub(limit);
        buf.events.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.buffer.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn event_at(&self, index: usize) -> Option<LogEvent> {
        self.inner.buffer.lock().events.get(index).cloned()
    }

    /// Mark the event at `index` as selected. Returns false when out of range.
    pub fn select(&self, index: Option<usize>) -> bool {
        let mut buf = self.inner.buffer.lock();
        match index {
            Some(i) if i >= buf.events.len() => false,
            _ => {
                buf.selected = index;
                true
            }
        }
    }

    pub fn selected_event(&self) -> Option<LogEvent> {
        let buf = self.inner.buffer.lock();
        buf.selected.and_then(|i| buf.events.get(i).cloned())
    }

    /// Drop all events and reset the counters
    pub fn clear(&self) {
        let had = {
            let mut buf = self.inner.buffer.lock();
            let had = buf.events.len();
            buf.events.clear();
            buf.selected = None;
            had
        };
        self.inner.total_events.store(0, Ordering::SeqCst);
        if had > 0 {
            self.notify(PropertyChange::Events { added: 0, len: 0 });
        }

        for (counter, property) in [
            (&self.inner.files_to_process, Property::FilesToProcess),
            (&self.inner.processed_files, Property::ProcessedFiles),
            (&self.inner.selected_files, Property::SelectedFiles),
        ] {
            let old = counter.swap(0, Ordering::SeqCst);
            if old != 0 {
                self.notify(counter_change(property, old, 0));
            }
        }
    }

    // --- counters ---

    pub fn files_to_process(&self) -> u64 {
        self.inner.files_to_process.load(Ordering::SeqCst)
    }

    pub fn processed_files(&self) -> u64 {
        self.inner.processed_files.load(Ordering::SeqCst)
    }

    pub fn selected_files(&self) -> u64 {
        self.inner.selected_files.load(Ordering::SeqCst)
    }

    pub fn add_files_to_process(&self, n: u64) {
        self.bump(&self.inner.files_to_process, Property::FilesToProcess, n);
    }

    pub fn inc_processed_files(&self) {
        self.bump(&self.inner.processed_files, Property::ProcessedFiles, 1);
    }

    pub fn inc_selected_files(&self) {
        self.bump(&self.inner.selected_files, Property::SelectedFiles, 1);
    }

    fn bump(&self, counter: &AtomicU64, property: Property, n: u64) {
        if n == 0 {
            return;
        }
        let old = counter.fetch_add(n, Ordering::SeqCst);
        self.notify(counter_change(property, old, old + n));
    }

    // --- lifecycle ---

    pub fn state(&self) -> JobState {
        self.inner.lifecycle.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == JobState::Running
    }

    pub fn is_stopping(&self) -> bool {
        self.state() == JobState::Stopping
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lifecycle.lock().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lifecycle.lock().end_time
    }

    /// Message of the failure that ended the last run
    pub fn error(&self) -> Option<String> {
        self.inner.lifecycle.lock().error.clone()
    }

    pub fn is_success(&self) -> bool {
        let lc = self.inner.lifecycle.lock();
        lc.end_time.is_some() && lc.error.is_none()
    }

    /// STOPPED -> RUNNING. Clears the buffer and counters and records the start time.
    pub fn before_job(&self) -> Result<(), CollectError> {
        {
            let mut lc = self.inner.lifecycle.lock();
            if lc.state != JobState::Stopped {
                return Err(CollectError::AlreadyRunning);
            }
            lc.state = JobState::Running;
            lc.start_time = Some(Utc::now());
            lc.end_time = None;
            lc.error = None;
        }

        self.clear();
        self.notify(PropertyChange::JobState {
            old: JobState::Stopped,
            new: JobState::Running,
        });
        Ok(())
    }

    /// RUNNING -> STOPPING. Returns false when no job is running.
    pub fn request_stop(&self) -> bool {
        {
            let mut lc = self.inner.lifecycle.lock();
            if lc.state != JobState::Running {
                debug!("Stop requested while {:?}, ignoring", lc.state);
                return false;
            }
            lc.state = JobState::Stopping;
        }

        info!("Stop requested");
        self.notify(PropertyChange::JobState {
            old: JobState::Running,
            new: JobState::Stopping,
        });
        true
    }

    /// -> STOPPED. Records the end time and the failure, if any.
    pub fn after_job(&self, error: Option<String>) {
        let (old, start, end) = {
            let mut lc = self.inner.lifecycle.lock();
            let old = lc.state;
            let end = Utc::now();
            lc.state = JobState::Stopped;
            lc.end_time = Some(end);
            lc.error = error.clone();
            (old, lc.start_time, end)
        };

        if let Some(start) = start {
            let elapsed = (end - start).to_std().unwrap_or_default();
            let elapsed = std::time::Duration::from_millis(elapsed.as_millis() as u64);
            info!("Work time: {}", humantime::format_duration(elapsed));
        }
        info!(
            "Statistics: {} files to process, {} processed, {} selected, {} events found, {} buffered",
            self.files_to_process(),
            self.processed_files(),
            self.selected_files(),
            self.total_events(),
            self.len()
        );
        if let Some(error) = &error {
            warn!("Job failed: {}", error);
        }

        if old != JobState::Stopped {
            self.notify(PropertyChange::JobState {
                old,
                new: JobState::Stopped,
            });
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let (state, start_time, end_time, error) = {
            let lc = self.inner.lifecycle.lock();
            (lc.state, lc.start_time, lc.end_time, lc.error.clone())
        };
        JobSnapshot {
            job_state: state,
            files_to_process: self.files_to_process(),
            processed_files: self.processed_files(),
            selected_files: self.selected_files(),
            events: self.len(),
            total_events: self.total_events(),
            capacity: self.inner.capacity,
            success: end_time.is_some() && error.is_none(),
            start_time,
            end_time,
            error,
        }
    }

    // --- observation ---

    pub fn subscribe(&self) -> broadcast::Receiver<PropertyChange> {
        self.inner.changes.subscribe()
    }

    /// Register a synchronous listener for one property, or all when `None`.
    /// Listeners run on the notifying thread and must not block.
    pub fn add_listener(&self, property: Option<Property>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::SeqCst));
        self.inner.listeners.write().push((id, property, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _, _)| *lid != id);
        listeners.len() != before
    }

    fn notify(&self, change: PropertyChange) {
        let property = change.property();
        // Called without holding any other lock so listeners may call back in
        let targets: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .iter()
            .filter(|(_, p, _)| p.map_or(true, |p| p == property))
            .map(|(_, _, l)| l.clone())
            .collect();

        for listener in targets {
            listener(&change);
        }
        let _ = self.inner.changes.send(change);
    }
}

fn counter_change(property: Property, old: u64, new: u64) -> PropertyChange {
    match property {
        Property::FilesToProcess => PropertyChange::FilesToProcess { old, new },
        Property::ProcessedFiles => PropertyChange::ProcessedFiles { old, new },
        _ => PropertyChange::SelectedFiles { old, new },
    }
}
