//! Replicated document: a yrs-backed CRDT container for the four document
//! collections, with origin-tagged transactions and synchronous observers.
//!
//! Every entry is stored as a canonical JSON string keyed by id, so merge
//! granularity is one whole entry per key: concurrent writes to the same key
//! resolve by last-writer-wins on the entire entry (metadata is split one key
//! per field, which makes its resolution per-field). This is deliberate and
//! documented rather than hidden.
//!
//! All mutation goes through [`ReplicatedDoc::transact`] or
//! [`ReplicatedDoc::merge_remote_update`]; both dispatch exactly one
//! notification per touched collection, tagged with the transaction's
//! [`Origin`]. The store adapter and the undo manager both depend on that
//! tagging, which is why the underlying yrs maps are never exposed.

use std::collections::BTreeMap;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut, Update};

/// Source of a batch of mutations.
///
/// A closed enumeration instead of free-form strings, so origin filtering is
/// checkable at compile time. `UndoRedo` is reserved for transactions issued
/// by the undo manager; it is never part of a tracked-origin set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    Local,
    Remote,
    UndoRedo,
}

impl Origin {
    /// Stable tag attached to the underlying yrs transaction.
    pub fn tag(self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Remote => "remote",
            Origin::UndoRedo => "undo-redo",
        }
    }
}

/// The four replicated collections of a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Collection {
    Elements,
    Relationships,
    Metadata,
    Annotations,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Elements,
        Collection::Relationships,
        Collection::Metadata,
        Collection::Annotations,
    ];

    /// Name of the backing yrs map. Must match on every replica.
    pub fn name(self) -> &'static str {
        match self {
            Collection::Elements => "elements",
            Collection::Relationships => "relationships",
            Collection::Metadata => "metadata",
            Collection::Annotations => "annotations",
        }
    }
}

/// One key's transition within a transaction.
///
/// `before`/`after` are canonical JSON; `None` means the key was absent.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryChange {
    pub collection: Collection,
    pub key: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// Notification delivered to a per-collection observer: the slice of a
/// transaction's changes that touched that collection.
#[derive(Clone, Debug)]
pub struct CollectionUpdate {
    pub collection: Collection,
    pub origin: Origin,
    pub entries: Vec<EntryChange>,
}

/// Whole-transaction notification, used by the undo manager.
#[derive(Clone, Debug)]
pub struct TxnSummary {
    pub origin: Origin,
    pub changes: Vec<EntryChange>,
}

/// Handle returned by `observe`/`observe_transactions`, used to unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObserverId(u64);

/// Malformed input at a decode boundary. Non-fatal: the document is left
/// exactly as it was.
#[derive(Debug, Clone)]
pub enum DecodeError {
    /// A sync-protocol frame that could not be parsed.
    Message(String),
    /// A CRDT delta that could not be decoded.
    Update(String),
    /// A peer state vector that could not be decoded.
    StateVector(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(e) => write!(f, "Malformed sync message: {e}"),
            Self::Update(e) => write!(f, "Malformed document update: {e}"),
            Self::StateVector(e) => write!(f, "Malformed state vector: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {}

struct CollectionObserver {
    id: u64,
    collection: Collection,
    callback: Box<dyn FnMut(&CollectionUpdate)>,
}

struct TxnObserver {
    id: u64,
    callback: Box<dyn FnMut(&TxnSummary)>,
}

/// CRDT document holding the element, relationship, metadata and annotation
/// collections of one editing session.
///
/// Single-threaded by design: replicas exchange opaque deltas, they never
/// share memory.
pub struct ReplicatedDoc {
    doc: Doc,
    elements: MapRef,
    relationships: MapRef,
    metadata: MapRef,
    annotations: MapRef,
    collection_observers: Vec<CollectionObserver>,
    txn_observers: Vec<TxnObserver>,
    next_observer: u64,
}

impl ReplicatedDoc {
    /// Create an empty document. All four collections start empty and live
    /// until the document is dropped.
    pub fn new() -> Self {
        let doc = Doc::new();
        let elements = doc.get_or_insert_map(Collection::Elements.name());
        let relationships = doc.get_or_insert_map(Collection::Relationships.name());
        let metadata = doc.get_or_insert_map(Collection::Metadata.name());
        let annotations = doc.get_or_insert_map(Collection::Annotations.name());
        Self {
            doc,
            elements,
            relationships,
            metadata,
            annotations,
            collection_observers: Vec::new(),
            txn_observers: Vec::new(),
            next_observer: 0,
        }
    }

    fn map(&self, collection: Collection) -> &MapRef {
        match collection {
            Collection::Elements => &self.elements,
            Collection::Relationships => &self.relationships,
            Collection::Metadata => &self.metadata,
            Collection::Annotations => &self.annotations,
        }
    }

    /// Run `f` against a mutable transaction tagged with `origin`.
    ///
    /// Every mutation performed through the [`DocTxn`] is committed
    /// atomically; observers see the whole batch as a single notification per
    /// touched collection, after commit. Returns the closure's result and the
    /// delta encoding exactly this transaction, ready to broadcast.
    pub fn transact<R>(&mut self, origin: Origin, f: impl FnOnce(&mut DocTxn) -> R) -> (R, Vec<u8>) {
        let mut doc_txn = DocTxn {
            elements: self.elements.clone(),
            relationships: self.relationships.clone(),
            metadata: self.metadata.clone(),
            annotations: self.annotations.clone(),
            txn: self.doc.transact_mut_with(origin.tag()),
            changes: Vec::new(),
        };
        let result = f(&mut doc_txn);
        let delta = doc_txn.txn.encode_update_v1();
        let changes = std::mem::take(&mut doc_txn.changes);
        // Release the transaction's loan of the doc before dispatching.
        drop(doc_txn);
        self.dispatch(origin, changes);
        (result, delta)
    }

    /// Register an observer for one collection. The callback runs once per
    /// transaction that touched the collection and receives the transaction's
    /// origin; ordering between observers is unspecified.
    pub fn observe(
        &mut self,
        collection: Collection,
        callback: impl FnMut(&CollectionUpdate) + 'static,
    ) -> ObserverId {
        let id = self.next_observer;
        self.next_observer += 1;
        self.collection_observers.push(CollectionObserver {
            id,
            collection,
            callback: Box::new(callback),
        });
        ObserverId(id)
    }

    /// Register a whole-transaction observer (one callback per transaction,
    /// all collections). This is the hook the undo manager captures from.
    pub fn observe_transactions(&mut self, callback: impl FnMut(&TxnSummary) + 'static) -> ObserverId {
        let id = self.next_observer;
        self.next_observer += 1;
        self.txn_observers.push(TxnObserver {
            id,
            callback: Box::new(callback),
        });
        ObserverId(id)
    }

    /// Unregister an observer. Returns false if the id was unknown.
    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.collection_observers.len() + self.txn_observers.len();
        self.collection_observers.retain(|o| o.id != id.0);
        self.txn_observers.retain(|o| o.id != id.0);
        before != self.collection_observers.len() + self.txn_observers.len()
    }

    /// Merge a delta produced by another replica of the same document.
    ///
    /// Merge is commutative, associative and idempotent: any arrival order
    /// and any duplication converge to the same state. Malformed bytes fail
    /// with [`DecodeError`] before any mutation, leaving the document
    /// untouched. A delta that decodes but cannot be applied also reports
    /// [`DecodeError::Update`]; observers are still notified of whatever part
    /// did apply, so projections never drift from the document.
    pub fn merge_remote_update(&mut self, bytes: &[u8], origin: Origin) -> Result<(), DecodeError> {
        let update = Update::decode_v1(bytes).map_err(|e| DecodeError::Update(e.to_string()))?;
        let before = self.snapshot();
        let applied = {
            let mut txn = self.doc.transact_mut_with(origin.tag());
            txn.apply_update(update)
                .map_err(|e| DecodeError::Update(e.to_string()))
        };
        let after = self.snapshot();
        let changes = diff_snapshots(&before, &after);
        self.dispatch(origin, changes);
        applied
    }

    /// Serialize the full current state as an opaque delta blob. Merging it
    /// into an empty replica reproduces this document's logical content.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// This replica's state vector, for incremental peer sync.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode only the state a peer with the given state vector is missing.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| DecodeError::StateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Canonical JSON currently replicated under `key`, if any.
    pub fn get_json(&self, collection: Collection, key: &str) -> Option<String> {
        let txn = self.doc.transact();
        self.map(collection).get(&txn, key).and_then(out_as_json)
    }

    pub fn contains(&self, collection: Collection, key: &str) -> bool {
        let txn = self.doc.transact();
        self.map(collection).get(&txn, key).is_some()
    }

    /// All `(key, canonical JSON)` pairs of one collection, ordered by key.
    /// Map iteration order underneath is unstable; sorting here keeps the
    /// whole read surface deterministic across replicas.
    pub fn entries(&self, collection: Collection) -> Vec<(String, String)> {
        let txn = self.doc.transact();
        let map = self.map(collection);
        let keys: Vec<String> = map.keys(&txn).map(|k| k.to_string()).collect();
        let ordered: BTreeMap<String, String> = keys
            .into_iter()
            .filter_map(|key| {
                let json = map.get(&txn, &key).and_then(out_as_json)?;
                Some((key, json))
            })
            .collect();
        ordered.into_iter().collect()
    }

    pub fn len(&self, collection: Collection) -> usize {
        let txn = self.doc.transact();
        self.map(collection).len(&txn) as usize
    }

    pub fn is_empty(&self) -> bool {
        Collection::ALL.iter().all(|c| self.len(*c) == 0)
    }

    fn snapshot(&self) -> [BTreeMap<String, String>; 4] {
        let mut out: [BTreeMap<String, String>; 4] = Default::default();
        for (i, collection) in Collection::ALL.iter().enumerate() {
            out[i] = self.entries(*collection).into_iter().collect();
        }
        out
    }

    fn dispatch(&mut self, origin: Origin, changes: Vec<EntryChange>) {
        if changes.is_empty() {
            return;
        }
        let summary = TxnSummary { origin, changes };
        for observer in self.txn_observers.iter_mut() {
            (observer.callback)(&summary);
        }
        for collection in Collection::ALL {
            let entries: Vec<EntryChange> = summary
                .changes
                .iter()
                .filter(|c| c.collection == collection)
                .cloned()
                .collect();
            if entries.is_empty() {
                continue;
            }
            let update = CollectionUpdate {
                collection,
                origin,
                entries,
            };
            for observer in self
                .collection_observers
                .iter_mut()
                .filter(|o| o.collection == collection)
            {
                (observer.callback)(&update);
            }
        }
    }
}

impl Default for ReplicatedDoc {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable view handed to a [`ReplicatedDoc::transact`] closure.
///
/// Records every effective change so observers and the undo manager can see
/// the transaction's before/after values. Writing a value identical to the
/// replicated one is a no-op and records nothing.
pub struct DocTxn<'doc> {
    elements: MapRef,
    relationships: MapRef,
    metadata: MapRef,
    annotations: MapRef,
    txn: TransactionMut<'doc>,
    changes: Vec<EntryChange>,
}

impl DocTxn<'_> {
    fn map(&self, collection: Collection) -> MapRef {
        match collection {
            Collection::Elements => self.elements.clone(),
            Collection::Relationships => self.relationships.clone(),
            Collection::Metadata => self.metadata.clone(),
            Collection::Annotations => self.annotations.clone(),
        }
    }

    /// Insert or overwrite `key` with a canonical JSON value.
    pub fn insert(&mut self, collection: Collection, key: &str, json: impl Into<String>) {
        let json = json.into();
        let map = self.map(collection);
        let before = map.get(&self.txn, key).and_then(out_as_json);
        if before.as_deref() == Some(json.as_str()) {
            return;
        }
        map.insert(&mut self.txn, key, json.clone());
        self.changes.push(EntryChange {
            collection,
            key: key.to_string(),
            before,
            after: Some(json),
        });
    }

    /// Remove `key`. Returns false if the key was already absent.
    pub fn remove(&mut self, collection: Collection, key: &str) -> bool {
        let map = self.map(collection);
        let before = map.remove(&mut self.txn, key).and_then(out_as_json);
        if before.is_none() {
            return false;
        }
        self.changes.push(EntryChange {
            collection,
            key: key.to_string(),
            before,
            after: None,
        });
        true
    }

    /// Read a value as it stands within this transaction.
    pub fn get(&self, collection: Collection, key: &str) -> Option<String> {
        self.map(collection).get(&self.txn, key).and_then(out_as_json)
    }

    /// Number of effective changes recorded so far.
    pub fn change_count(&self) -> usize {
        self.changes.len()
    }
}

fn out_as_json(value: Out) -> Option<String> {
    match value {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn diff_snapshots(
    before: &[BTreeMap<String, String>; 4],
    after: &[BTreeMap<String, String>; 4],
) -> Vec<EntryChange> {
    let mut changes = Vec::new();
    for (i, collection) in Collection::ALL.iter().enumerate() {
        let old = &before[i];
        let new = &after[i];
        for (key, old_value) in old {
            match new.get(key) {
                Some(new_value) if new_value == old_value => {}
                new_value => changes.push(EntryChange {
                    collection: *collection,
                    key: key.clone(),
                    before: Some(old_value.clone()),
                    after: new_value.cloned(),
                }),
            }
        }
        for (key, new_value) in new {
            if !old.contains_key(key) {
                changes.push(EntryChange {
                    collection: *collection,
                    key: key.clone(),
                    before: None,
                    after: Some(new_value.clone()),
                });
            }
        }
    }
    changes
}
