use super::Location;
use crate::storage::LocationLookup;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Resolve a comma-separated id list in input order.
///
/// Unknown ids are logged and dropped. Repeated ids keep their first position.
pub fn resolve_locations(ids: &str, lookup: &dyn LocationLookup) -> Vec<Location> {
    let mut seen = HashSet::new();
    let mut resolved = Vec::new();

    for id in ids.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        if !seen.insert(id) {
            debug!("Location '{}' listed twice, keeping the first", id);
            continue;
        }
        match lookup.get_by_code(id) {
            Some(location) => resolved.push(location),
            None => warn!("Location with id '{}' not found", id),
        }
    }

    resolved
}

/// Single-threaded supplier of the job's locations.
///
/// The list is resolved on the first `read()` and handed out one item per call
/// until exhausted. `close()` forgets everything, so a source is not reusable
/// across runs.
pub struct LocationSource {
    ids: String,
    lookup: Arc<dyn LocationLookup>,
    pending: Mutex<Option<VecDeque<Location>>>,
}

impl LocationSource {
    pub fn new(ids: impl Into<String>, lookup: Arc<dyn LocationLookup>) -> Self {
        Self {
            ids: ids.into(),
            lookup,
            pending: Mutex::new(None),
        }
    }

    pub fn read(&self) -> Option<Location> {
        let next = {
            let mut pending = self.pending.lock();
            pending
                .get_or_insert_with(|| resolve_locations(&self.ids, self.lookup.as_ref()).into())
                .pop_front()
        };

        if let Some(location) = &next {
            info!("read() {}", location);
        }
        next
    }

    pub fn close(&self) {
        *self.pending.lock() = None;
    }
}

impl Iterator for &LocationSource {
    type Item = Location;

    fn next(&mut self) -> Option<Location> {
        self.read()
    }
}
