//! Data model for Trellis structured documents.
//!
//! A document is a graph of [`Element`]s connected by [`Relationship`]s,
//! plus a flat [`Metadata`] record and per-element [`Annotation`]s. These
//! types carry no replication logic; `trellis-collab` mirrors them into a
//! CRDT document as canonical JSON.
//!
//! Canonical JSON: `serde_json` with its default sorted object keys, so two
//! structurally equal values always serialize to the same string. The
//! replication layer relies on this for its redundant-write checks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Axis-aligned placement of an element on the canvas.
///
/// Opaque to the replication engine; only the rendering collaborator
/// interprets it.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Bounds {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Bounds {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }
}

/// A node of the document graph.
///
/// `id` is immutable once created. `parent_id` expresses containment and may
/// dangle transiently during concurrent edits; nothing at this layer enforces
/// referential integrity.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Element {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub bounds: Bounds,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Kind-specific payload, opaque to the engine.
    #[serde(default)]
    pub data: Value,
}

impl Element {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            bounds: Bounds::default(),
            parent_id: None,
            data: Value::Null,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// An edge between two elements.
///
/// `source`/`target` may dangle; collaborators prune dangling relationships,
/// the engine only cascades deletes for local element removal.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Relationship {
    pub id: String,
    pub kind: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub data: Value,
}

impl Relationship {
    pub fn new(kind: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            source: source.into(),
            target: target.into(),
            data: Value::Null,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Whether this relationship touches the given element id.
    pub fn is_incident_to(&self, element_id: &str) -> bool {
        self.source == element_id || self.target == element_id
    }
}

/// Flat scalar record describing the document itself.
///
/// Replicated field-by-field; each field resolves concurrent writes by
/// last-writer-wins.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Metadata {
    pub title: String,
    pub kind: String,
}

impl Metadata {
    pub fn new(title: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            kind: kind.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Review feedback attached to a single element or relationship.
///
/// Keyed externally by the id of the thing it annotates. Entries are
/// independent; an annotation whose target has been deleted is inert, not
/// an error.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Annotation {
    pub score: f64,
    #[serde(default)]
    pub feedback: Option<String>,
}

impl Annotation {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            feedback: None,
        }
    }

    pub fn with_feedback(score: f64, feedback: impl Into<String>) -> Self {
        Self {
            score,
            feedback: Some(feedback.into()),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_element_ids_unique() {
        let a = Element::new("class");
        let b = Element::new("class");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_element_json_roundtrip() {
        let mut el = Element::new("class");
        el.bounds = Bounds::new(10.0, 20.0, 200.0, 100.0);
        el.data = json!({ "name": "Foo", "attributes": ["x", "y"] });

        let parsed = Element::from_json(&el.to_json()).unwrap();
        assert_eq!(parsed, el);
    }

    #[test]
    fn test_canonical_json_is_stable() {
        let mut a = Element::new("class");
        a.data = json!({ "b": 1, "a": 2 });
        let b = a.clone();

        // Structural equality implies byte-identical canonical JSON.
        assert_eq!(a.to_json(), b.to_json());
    }

    #[test]
    fn test_element_tolerates_missing_optional_fields() {
        let el = Element::from_json(r#"{"id":"e1","kind":"class"}"#).unwrap();
        assert_eq!(el.id, "e1");
        assert_eq!(el.bounds, Bounds::default());
        assert!(el.parent_id.is_none());
        assert!(el.data.is_null());
    }

    #[test]
    fn test_relationship_incidence() {
        let rel = Relationship::new("association", "a", "b");
        assert!(rel.is_incident_to("a"));
        assert!(rel.is_incident_to("b"));
        assert!(!rel.is_incident_to("c"));
    }

    #[test]
    fn test_relationship_json_roundtrip() {
        let rel = Relationship::new("inheritance", "child", "parent");
        let parsed = Relationship::from_json(&rel.to_json()).unwrap();
        assert_eq!(parsed, rel);
    }

    #[test]
    fn test_metadata_defaults() {
        let meta = Metadata::default();
        assert!(meta.title.is_empty());
        assert!(meta.kind.is_empty());
    }

    #[test]
    fn test_annotation_json_roundtrip() {
        let ann = Annotation::with_feedback(0.5, "needs a second association");
        let parsed = Annotation::from_json(&ann.to_json()).unwrap();
        assert_eq!(parsed, ann);

        let bare = Annotation::from_json(r#"{"score":1.0}"#).unwrap();
        assert_eq!(bare.score, 1.0);
        assert!(bare.feedback.is_none());
    }
}
