//! Working-state projection and the adapter that keeps it synchronized with
//! the replicated document in both directions.
//!
//! Application code (the rendering collaborator) reads and writes only the
//! [`WorkingState`]; it never touches the CRDT. Every local mutation is
//! mirrored into the document inside a `Local` transaction, and every
//! document notification whose origin is *not* `Local` is mirrored back into
//! the projection. The origin check is what breaks the
//! local edit -> document -> projection -> local edit feedback loop.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use trellis_model::{Annotation, Element, Metadata, Relationship};

use crate::doc::{Collection, CollectionUpdate, ObserverId, Origin, ReplicatedDoc};

/// Plain in-memory mirror of the replicated document, plus transient
/// UI-only state (`selection`) that is never replicated.
#[derive(Debug, Default)]
pub struct WorkingState {
    pub elements: Vec<Element>,
    pub relationships: Vec<Relationship>,
    pub metadata: Metadata,
    pub annotations: HashMap<String, Annotation>,
    pub selection: HashSet<String>,
}

impl WorkingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn relationship(&self, id: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.id == id)
    }

    fn upsert_element(&mut self, element: Element) {
        match self.elements.iter_mut().find(|e| e.id == element.id) {
            Some(slot) => *slot = element,
            None => self.elements.push(element),
        }
    }

    fn upsert_relationship(&mut self, relationship: Relationship) {
        match self.relationships.iter_mut().find(|r| r.id == relationship.id) {
            Some(slot) => *slot = relationship,
            None => self.relationships.push(relationship),
        }
    }
}

/// Bridge between the [`WorkingState`] and a [`ReplicatedDoc`].
///
/// The document handle is injected rather than global; several adapters in
/// one process address several documents. Mutation methods return the
/// replication delta to hand to the transport, or `None` when the write was
/// skipped as redundant.
pub struct StoreAdapter {
    doc: Rc<RefCell<ReplicatedDoc>>,
    state: Rc<RefCell<WorkingState>>,
    observers: Vec<ObserverId>,
}

impl StoreAdapter {
    /// Attach to a document, hydrating the projection from whatever the
    /// document already contains.
    pub fn new(doc: Rc<RefCell<ReplicatedDoc>>) -> Self {
        let state = Rc::new(RefCell::new(WorkingState::new()));
        let mut observers = Vec::new();
        {
            let mut doc_ref = doc.borrow_mut();
            for collection in Collection::ALL {
                let sink = state.clone();
                observers.push(doc_ref.observe(collection, move |update| {
                    if update.origin == Origin::Local {
                        // Our own mirror write echoing back; rebuilding here
                        // would loop.
                        return;
                    }
                    apply_collection_update(&mut sink.borrow_mut(), update);
                }));
            }
        }
        let adapter = Self {
            doc,
            state,
            observers,
        };
        adapter.refresh();
        adapter
    }

    /// Shared handle to the projection for the rendering collaborator.
    pub fn state(&self) -> Rc<RefCell<WorkingState>> {
        self.state.clone()
    }

    /// Handle to the underlying document, for wiring up sync and undo.
    pub fn doc(&self) -> Rc<RefCell<ReplicatedDoc>> {
        self.doc.clone()
    }

    /// Rebuild the whole projection from the document, keeping selection
    /// entries whose ids still exist.
    pub fn refresh(&self) {
        let doc = self.doc.borrow();
        let mut state = self.state.borrow_mut();

        state.elements = doc
            .entries(Collection::Elements)
            .iter()
            .filter_map(|(_, json)| parse_logged(Element::from_json(json), Collection::Elements))
            .collect();
        state.relationships = doc
            .entries(Collection::Relationships)
            .iter()
            .filter_map(|(_, json)| {
                parse_logged(Relationship::from_json(json), Collection::Relationships)
            })
            .collect();
        state.annotations = doc
            .entries(Collection::Annotations)
            .iter()
            .filter_map(|(key, json)| {
                parse_logged(Annotation::from_json(json), Collection::Annotations)
                    .map(|a| (key.clone(), a))
            })
            .collect();

        let mut metadata = Metadata::default();
        for (key, json) in doc.entries(Collection::Metadata) {
            set_metadata_field(&mut metadata, &key, Some(&json));
        }
        state.metadata = metadata;

        let live: HashSet<String> = state
            .elements
            .iter()
            .map(|e| e.id.clone())
            .chain(state.relationships.iter().map(|r| r.id.clone()))
            .collect();
        state.selection.retain(|id| live.contains(id));
    }

    /// Add or replace an element.
    pub fn add_element(&mut self, element: Element) -> Option<Vec<u8>> {
        self.write_element(element)
    }

    /// Same write path as [`StoreAdapter::add_element`]; kept separate so the
    /// caller's intent reads clearly.
    pub fn update_element(&mut self, element: Element) -> Option<Vec<u8>> {
        self.write_element(element)
    }

    fn write_element(&mut self, element: Element) -> Option<Vec<u8>> {
        let json = element.to_json();
        if self.replicated(Collection::Elements, &element.id).as_deref() == Some(json.as_str()) {
            log::debug!("skipping redundant element write: {}", element.id);
            self.state.borrow_mut().upsert_element(element);
            return None;
        }
        let id = element.id.clone();
        self.state.borrow_mut().upsert_element(element);
        let (_, delta) = self.doc.borrow_mut().transact(Origin::Local, |txn| {
            txn.insert(Collection::Elements, &id, json);
        });
        Some(delta)
    }

    /// Remove an element and, in the same transaction, every relationship
    /// incident to it. No relationship with a dangling endpoint pointing at
    /// the removed id survives this call.
    pub fn remove_element(&mut self, id: &str) -> Option<Vec<u8>> {
        let incident: Vec<String> = {
            let doc = self.doc.borrow();
            doc.entries(Collection::Relationships)
                .iter()
                .filter_map(|(rid, json)| Relationship::from_json(json).ok().map(|r| (rid.clone(), r)))
                .filter(|(_, r)| r.is_incident_to(id))
                .map(|(rid, _)| rid)
                .collect()
        };
        if !self.doc.borrow().contains(Collection::Elements, id) && incident.is_empty() {
            return None;
        }

        {
            let mut state = self.state.borrow_mut();
            state.elements.retain(|e| e.id != id);
            state.relationships.retain(|r| !incident.contains(&r.id));
            state.selection.remove(id);
            for rid in &incident {
                state.selection.remove(rid);
            }
        }

        let (_, delta) = self.doc.borrow_mut().transact(Origin::Local, |txn| {
            txn.remove(Collection::Elements, id);
            for rid in &incident {
                txn.remove(Collection::Relationships, rid);
            }
        });
        Some(delta)
    }

    pub fn add_relationship(&mut self, relationship: Relationship) -> Option<Vec<u8>> {
        self.write_relationship(relationship)
    }

    pub fn update_relationship(&mut self, relationship: Relationship) -> Option<Vec<u8>> {
        self.write_relationship(relationship)
    }

    fn write_relationship(&mut self, relationship: Relationship) -> Option<Vec<u8>> {
        let json = relationship.to_json();
        if self
            .replicated(Collection::Relationships, &relationship.id)
            .as_deref()
            == Some(json.as_str())
        {
            log::debug!("skipping redundant relationship write: {}", relationship.id);
            self.state.borrow_mut().upsert_relationship(relationship);
            return None;
        }
        let id = relationship.id.clone();
        self.state.borrow_mut().upsert_relationship(relationship);
        let (_, delta) = self.doc.borrow_mut().transact(Origin::Local, |txn| {
            txn.insert(Collection::Relationships, &id, json);
        });
        Some(delta)
    }

    pub fn remove_relationship(&mut self, id: &str) -> Option<Vec<u8>> {
        if !self.doc.borrow().contains(Collection::Relationships, id) {
            return None;
        }
        {
            let mut state = self.state.borrow_mut();
            state.relationships.retain(|r| r.id != id);
            state.selection.remove(id);
        }
        let (_, delta) = self.doc.borrow_mut().transact(Origin::Local, |txn| {
            txn.remove(Collection::Relationships, id);
        });
        Some(delta)
    }

    /// Write the metadata record, one replicated key per field. Only fields
    /// that actually differ are transacted, so concurrent edits to different
    /// fields merge instead of clobbering each other.
    pub fn update_metadata(&mut self, metadata: Metadata) -> Option<Vec<u8>> {
        let changed: Vec<(String, String)> = metadata_fields(&metadata)
            .into_iter()
            .filter(|(key, json)| {
                self.replicated(Collection::Metadata, key).as_deref() != Some(json.as_str())
            })
            .collect();
        self.state.borrow_mut().metadata = metadata;
        if changed.is_empty() {
            log::debug!("skipping redundant metadata write");
            return None;
        }
        let (_, delta) = self.doc.borrow_mut().transact(Origin::Local, |txn| {
            for (key, json) in &changed {
                txn.insert(Collection::Metadata, key, json.clone());
            }
        });
        Some(delta)
    }

    /// Attach or replace the annotation for `target_id`. Unknown targets are
    /// accepted; the entry just stays inert until something references it.
    pub fn upsert_annotation(&mut self, target_id: &str, annotation: Annotation) -> Option<Vec<u8>> {
        {
            let doc = self.doc.borrow();
            if !doc.contains(Collection::Elements, target_id)
                && !doc.contains(Collection::Relationships, target_id)
            {
                log::debug!("annotation targets unknown id {target_id}; kept as inert");
            }
        }
        let json = annotation.to_json();
        if self.replicated(Collection::Annotations, target_id).as_deref() == Some(json.as_str()) {
            log::debug!("skipping redundant annotation write: {target_id}");
            self.state
                .borrow_mut()
                .annotations
                .insert(target_id.to_string(), annotation);
            return None;
        }
        self.state
            .borrow_mut()
            .annotations
            .insert(target_id.to_string(), annotation);
        let (_, delta) = self.doc.borrow_mut().transact(Origin::Local, |txn| {
            txn.insert(Collection::Annotations, target_id, json);
        });
        Some(delta)
    }

    pub fn remove_annotation(&mut self, target_id: &str) -> Option<Vec<u8>> {
        if !self.doc.borrow().contains(Collection::Annotations, target_id) {
            return None;
        }
        self.state.borrow_mut().annotations.remove(target_id);
        let (_, delta) = self.doc.borrow_mut().transact(Origin::Local, |txn| {
            txn.remove(Collection::Annotations, target_id);
        });
        Some(delta)
    }

    /// Seed the document from an already-migrated snapshot (the schema
    /// migration collaborator's entry point). One `Local` transaction writes
    /// everything; entries identical to what is already replicated are
    /// skipped, so re-seeding the same snapshot is a no-op.
    pub fn seed(
        &mut self,
        elements: Vec<Element>,
        relationships: Vec<Relationship>,
        annotations: HashMap<String, Annotation>,
        metadata: Metadata,
    ) -> Option<Vec<u8>> {
        let fields = metadata_fields(&metadata);
        let (changed, delta) = self.doc.borrow_mut().transact(Origin::Local, |txn| {
            for element in &elements {
                txn.insert(Collection::Elements, &element.id, element.to_json());
            }
            for relationship in &relationships {
                txn.insert(Collection::Relationships, &relationship.id, relationship.to_json());
            }
            for (key, annotation) in &annotations {
                txn.insert(Collection::Annotations, key, annotation.to_json());
            }
            for (key, json) in &fields {
                txn.insert(Collection::Metadata, key, json.clone());
            }
            txn.change_count()
        });

        // The document may already hold entries the snapshot knows nothing
        // about (a remote delta merged ahead of the migration), so the
        // projection is rebuilt from the document, not from the snapshot.
        self.refresh();

        if changed == 0 {
            log::debug!("seed matched replicated state; no transaction emitted");
            return None;
        }
        log::info!("seeded document: {changed} replicated entries written");
        Some(delta)
    }

    /// Replace the selection. Purely local; never transacted or replicated.
    pub fn set_selection(&mut self, ids: impl IntoIterator<Item = String>) {
        self.state.borrow_mut().selection = ids.into_iter().collect();
    }

    pub fn select(&mut self, id: &str) {
        self.state.borrow_mut().selection.insert(id.to_string());
    }

    pub fn deselect(&mut self, id: &str) {
        self.state.borrow_mut().selection.remove(id);
    }

    pub fn clear_selection(&mut self) {
        self.state.borrow_mut().selection.clear();
    }

    fn replicated(&self, collection: Collection, key: &str) -> Option<String> {
        self.doc.borrow().get_json(collection, key)
    }
}

impl Drop for StoreAdapter {
    fn drop(&mut self) {
        if let Ok(mut doc) = self.doc.try_borrow_mut() {
            for id in self.observers.drain(..) {
                doc.unobserve(id);
            }
        }
    }
}

/// Mirror one non-local notification into the projection, preserving
/// transient fields and pruning selection entries whose ids vanished.
fn apply_collection_update(state: &mut WorkingState, update: &CollectionUpdate) {
    for entry in &update.entries {
        match (update.collection, &entry.after) {
            (Collection::Elements, Some(json)) => {
                if let Some(element) = parse_logged(Element::from_json(json), update.collection) {
                    state.upsert_element(element);
                }
            }
            (Collection::Elements, None) => {
                state.elements.retain(|e| e.id != entry.key);
                state.selection.remove(&entry.key);
            }
            (Collection::Relationships, Some(json)) => {
                if let Some(relationship) =
                    parse_logged(Relationship::from_json(json), update.collection)
                {
                    state.upsert_relationship(relationship);
                }
            }
            (Collection::Relationships, None) => {
                state.relationships.retain(|r| r.id != entry.key);
                state.selection.remove(&entry.key);
            }
            (Collection::Metadata, after) => {
                set_metadata_field(&mut state.metadata, &entry.key, after.as_deref());
            }
            (Collection::Annotations, Some(json)) => {
                if let Some(annotation) = parse_logged(Annotation::from_json(json), update.collection)
                {
                    state.annotations.insert(entry.key.clone(), annotation);
                }
            }
            (Collection::Annotations, None) => {
                state.annotations.remove(&entry.key);
            }
        }
    }
}

fn parse_logged<T>(parsed: Result<T, serde_json::Error>, collection: Collection) -> Option<T> {
    match parsed {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("dropping unparseable {} entry: {e}", collection.name());
            None
        }
    }
}

/// Metadata as `(field, canonical JSON)` pairs, one replicated key per field.
fn metadata_fields(metadata: &Metadata) -> Vec<(String, String)> {
    match serde_json::to_value(metadata) {
        Ok(serde_json::Value::Object(map)) => map
            .into_iter()
            .map(|(key, value)| (key, value.to_string()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Patch a single metadata field from its replicated JSON value. `None`
/// resets the field to its default. Unknown fields are ignored so newer
/// peers can add fields without breaking older ones.
fn set_metadata_field(metadata: &mut Metadata, key: &str, json: Option<&str>) {
    let mut object = match serde_json::to_value(&*metadata) {
        Ok(serde_json::Value::Object(object)) => object,
        _ => return,
    };
    let default_object = match serde_json::to_value(Metadata::default()) {
        Ok(serde_json::Value::Object(object)) => object,
        _ => return,
    };
    let value = json
        .and_then(|j| serde_json::from_str::<serde_json::Value>(j).ok())
        .or_else(|| default_object.get(key).cloned());
    let Some(value) = value else { return };
    object.insert(key.to_string(), value);
    if let Ok(next) = serde_json::from_value(serde_json::Value::Object(object)) {
        *metadata = next;
    }
}
