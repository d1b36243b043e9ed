// Import and export tables.
//
// Export ids received in peer pushes are positive and allocated in push
// order; ids we mint for returned capabilities and promises are negative.
// Import ids we allocate when initiating calls on the peer are positive.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace};

use crate::hooks::StubHook;

/// Lifecycle of an export entry's value.
#[derive(Clone)]
pub enum ExportState {
    /// A recorded operation awaiting execution (by microtask or pull).
    Pending { method: String, args: Value },
    /// Computed result (possibly an error tuple) awaiting its pull.
    Resolved(Value),
    /// Drained: value emitted and cleared, entry kept until released.
    Empty,
}

/// One entry in the export table.
pub struct ExportEntry {
    /// References the peer believes it holds. Entry dies at zero.
    pub remote_refcount: i64,
    pub state: ExportState,
    /// Dispatch hook for calls through this export; `None` means the
    /// session's root target.
    pub hook: Option<Arc<dyn StubHook>>,
    /// Peer capability ids referenced by this entry's arguments or
    /// captures; released back to the peer after the entry completes.
    pub imported_client_ids: HashMap<i64, i64>,
}

impl ExportEntry {
    fn new(state: ExportState) -> Self {
        ExportEntry {
            remote_refcount: 1,
            state,
            hook: None,
            imported_client_ids: HashMap::new(),
        }
    }
}

/// Owns export entries and both id counters.
pub struct Exporter {
    table: HashMap<i64, ExportEntry>,
    next_positive: i64,
    next_negative: i64,
}

impl Default for Exporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Exporter {
    pub fn new() -> Self {
        Exporter {
            table: HashMap::new(),
            next_positive: 1,
            next_negative: -1,
        }
    }

    /// Next positive id, aligned to peer push order.
    pub fn allocate_for_push(&mut self) -> i64 {
        let id = self.next_positive;
        self.next_positive += 1;
        id
    }

    /// Next negative id for exporter-originated capabilities and promises.
    pub fn allocate_negative(&mut self) -> i64 {
        let id = self.next_negative;
        self.next_negative -= 1;
        id
    }

    /// Create (or get) the entry for `id` without touching its state.
    pub fn ensure(&mut self, id: i64) -> &mut ExportEntry {
        self.table
            .entry(id)
            .or_insert_with(|| ExportEntry::new(ExportState::Empty))
    }

    /// Record a pending operation, replacing any prior entry for `id`.
    pub fn set_operation(
        &mut self,
        id: i64,
        method: String,
        args: Value,
        hook: Option<Arc<dyn StubHook>>,
    ) {
        let mut entry = ExportEntry::new(ExportState::Pending { method, args });
        entry.hook = hook;
        self.table.insert(id, entry);
    }

    /// Store a computed result, clearing any pending operation.
    pub fn cache_result(&mut self, id: i64, result: Value) {
        let entry = self.ensure(id);
        entry.state = ExportState::Resolved(result);
    }

    pub fn result(&self, id: i64) -> Option<Value> {
        match self.table.get(&id).map(|e| &e.state) {
            Some(ExportState::Resolved(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn operation(&self, id: i64) -> Option<(String, Value, Option<Arc<dyn StubHook>>)> {
        let entry = self.table.get(&id)?;
        match &entry.state {
            ExportState::Pending { method, args } => {
                Some((method.clone(), args.clone(), entry.hook.clone()))
            }
            _ => None,
        }
    }

    pub fn has_operation(&self, id: i64) -> bool {
        matches!(
            self.table.get(&id).map(|e| &e.state),
            Some(ExportState::Pending { .. })
        )
    }

    pub fn hook(&self, id: i64) -> Option<Arc<dyn StubHook>> {
        self.table.get(&id).and_then(|e| e.hook.clone())
    }

    /// Drop the resolved value, keeping the entry until its refs are
    /// released. A later pull of the same id yields `ExportNotFound`.
    pub fn clear_result(&mut self, id: i64) {
        if let Some(entry) = self.table.get_mut(&id) {
            entry.state = ExportState::Empty;
        }
    }

    pub fn record_imported_id(&mut self, id: i64, peer_id: i64) {
        let entry = self.ensure(id);
        *entry.imported_client_ids.entry(peer_id).or_insert(0) += 1;
    }

    pub fn take_imported_ids(&mut self, id: i64) -> Vec<(i64, i64)> {
        match self.table.get_mut(&id) {
            Some(entry) => entry.imported_client_ids.drain().collect(),
            None => Vec::new(),
        }
    }

    /// Handle a peer `release`. Returns true when the entry was removed.
    pub fn release(&mut self, id: i64, count: i64) -> bool {
        let Some(entry) = self.table.get_mut(&id) else {
            debug!(id, "release for unknown export id ignored");
            return false;
        };
        if count > 0 {
            entry.remote_refcount -= count;
        }
        if entry.remote_refcount <= 0 {
            trace!(id, "export entry removed");
            self.table.remove(&id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.table.contains_key(&id)
    }

    pub fn remote_refcount(&self, id: i64) -> Option<i64> {
        self.table.get(&id).map(|e| e.remote_refcount)
    }

    pub fn add_remote_ref(&mut self, id: i64) {
        if let Some(entry) = self.table.get_mut(&id) {
            entry.remote_refcount += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn reset(&mut self) {
        self.table.clear();
        self.next_positive = 1;
        self.next_negative = -1;
    }
}

/// One entry in the import table.
pub struct ImportEntry {
    pub local_refcount: i64,
    pub remote_refcount: i64,
    pub resolution: Option<Value>,
}

impl Default for ImportEntry {
    fn default() -> Self {
        ImportEntry {
            local_refcount: 1,
            remote_refcount: 1,
            resolution: None,
        }
    }
}

/// Owns imports we allocated when initiating calls on the peer.
pub struct Importer {
    table: HashMap<i64, ImportEntry>,
    next_positive: i64,
}

impl Default for Importer {
    fn default() -> Self {
        Self::new()
    }
}

impl Importer {
    pub fn new() -> Self {
        Importer {
            table: HashMap::new(),
            next_positive: 1,
        }
    }

    /// Allocate a positive import id and its entry.
    pub fn allocate(&mut self) -> i64 {
        let id = self.next_positive;
        self.next_positive += 1;
        self.table.insert(id, ImportEntry::default());
        id
    }

    /// Record a resolve/reject for `id` and return the number of remote
    /// refs to release. The entry (created on the fly for peer-minted ids)
    /// is erased after recording.
    pub fn record_resolution(&mut self, id: i64, resolution: Value) -> i64 {
        let mut entry = self.table.remove(&id).unwrap_or_default();
        entry.resolution = Some(resolution);
        entry.remote_refcount.max(1)
    }

    /// Defensive handling of a peer release that targets one of our import
    /// ids: decrement local refs and erase at zero.
    pub fn release_local(&mut self, id: i64, count: i64) {
        if count <= 0 {
            return;
        }
        let Some(entry) = self.table.get_mut(&id) else {
            debug!(id, "release for unknown import id ignored");
            return;
        };
        if entry.local_refcount > 0 {
            entry.local_refcount -= count;
            if entry.local_refcount <= 0 {
                self.table.remove(&id);
            }
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.table.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn reset(&mut self) {
        self.table.clear();
        self.next_positive = 1;
    }
}
