//! Undo/redo over logical edit groups.
//!
//! The CRDT substrate has no notion of undo, so the manager records each
//! tracked transaction's before/after values and applies the inverse as a
//! fresh transaction. Transactions arriving within the capture window of the
//! previous one coalesce into a single undo step; the window closes when it
//! elapses or when undo/redo runs.
//!
//! Inverse transactions are tagged [`Origin::UndoRedo`], which is never in
//! the tracked-origin set. If it were, undoing would itself push an undo
//! step and silently eat the redo stack. Constructing a manager with
//! `UndoRedo` tracked is a programming error: it trips a `debug_assert!` in
//! development and is corrected by stripping the origin in release builds.
//!
//! A concurrent remote edit can race an undo of the same entry; the merge
//! then resolves last-writer-wins like any other concurrent write. The
//! inverse is just a normal transaction, on purpose.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::doc::{EntryChange, ObserverId, Origin, ReplicatedDoc};

/// Default capture window for grouping rapid edits into one step.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);

/// One undoable step: the coalesced changes of one or more transactions.
#[derive(Clone, Debug)]
struct UndoStep {
    changes: Vec<EntryChange>,
}

impl UndoStep {
    /// Fold a later transaction into this step. Per key: keep the earliest
    /// `before`, take the latest `after`.
    fn absorb(&mut self, changes: &[EntryChange]) {
        for change in changes {
            match self
                .changes
                .iter_mut()
                .find(|c| c.collection == change.collection && c.key == change.key)
            {
                Some(existing) => existing.after = change.after.clone(),
                None => self.changes.push(change.clone()),
            }
        }
    }
}

struct UndoStacks {
    undo: Vec<UndoStep>,
    redo: Vec<UndoStep>,
    tracked: HashSet<Origin>,
    capture_timeout: Duration,
    /// `Some` while a grouping window is open (the `Grouping` state);
    /// `None` is `Idle`.
    last_capture: Option<Instant>,
}

impl UndoStacks {
    fn capture(&mut self, origin: Origin, changes: &[EntryChange]) {
        if !self.tracked.contains(&origin) {
            return;
        }
        // A new qualifying edit invalidates everything that was undone.
        self.redo.clear();

        let now = Instant::now();
        let grouping = self
            .last_capture
            .is_some_and(|stamp| now.duration_since(stamp) < self.capture_timeout)
            && !self.undo.is_empty();
        if grouping {
            if let Some(top) = self.undo.last_mut() {
                top.absorb(changes);
            }
        } else {
            self.undo.push(UndoStep {
                changes: changes.to_vec(),
            });
        }
        self.last_capture = Some(now);
    }
}

/// Linear undo/redo manager bound to one [`ReplicatedDoc`].
///
/// Only transactions whose origin is in the tracked set become undo steps;
/// by default both `Local` and `Remote` qualify, while transient UI state
/// never passes through `transact` at all and is therefore never undoable.
pub struct UndoManager {
    doc: Rc<RefCell<ReplicatedDoc>>,
    stacks: Rc<RefCell<UndoStacks>>,
    observer: ObserverId,
}

impl UndoManager {
    pub fn new(doc: Rc<RefCell<ReplicatedDoc>>) -> Self {
        Self::with_options(
            doc,
            HashSet::from([Origin::Local, Origin::Remote]),
            DEFAULT_CAPTURE_TIMEOUT,
        )
    }

    pub fn with_options(
        doc: Rc<RefCell<ReplicatedDoc>>,
        mut tracked: HashSet<Origin>,
        capture_timeout: Duration,
    ) -> Self {
        debug_assert!(
            !tracked.contains(&Origin::UndoRedo),
            "UndoRedo must not be a tracked origin"
        );
        tracked.remove(&Origin::UndoRedo);

        let stacks = Rc::new(RefCell::new(UndoStacks {
            undo: Vec::new(),
            redo: Vec::new(),
            tracked,
            capture_timeout,
            last_capture: None,
        }));
        let sink = stacks.clone();
        let observer = doc.borrow_mut().observe_transactions(move |summary| {
            sink.borrow_mut().capture(summary.origin, &summary.changes);
        });
        Self {
            doc,
            stacks,
            observer,
        }
    }

    /// Revert the most recent undo step. Returns the delta of the inverse
    /// transaction for broadcast, or `None` if the undo stack is empty.
    pub fn undo(&mut self) -> Option<Vec<u8>> {
        let step = {
            let mut stacks = self.stacks.borrow_mut();
            stacks.last_capture = None; // undo force-closes the window
            stacks.undo.pop()?
        };
        let delta = self.apply(&step, Direction::Backward);
        self.stacks.borrow_mut().redo.push(step);
        Some(delta)
    }

    /// Re-apply the most recently undone step. Returns the transaction's
    /// delta, or `None` if the redo stack is empty.
    pub fn redo(&mut self) -> Option<Vec<u8>> {
        let step = {
            let mut stacks = self.stacks.borrow_mut();
            stacks.last_capture = None;
            stacks.redo.pop()?
        };
        let delta = self.apply(&step, Direction::Forward);
        self.stacks.borrow_mut().undo.push(step);
        Some(delta)
    }

    fn apply(&mut self, step: &UndoStep, direction: Direction) -> Vec<u8> {
        let mut doc = self.doc.borrow_mut();
        let (_, delta) = doc.transact(Origin::UndoRedo, |txn| {
            for change in step.changes.iter().rev() {
                let target = match direction {
                    Direction::Backward => &change.before,
                    Direction::Forward => &change.after,
                };
                match target {
                    Some(json) => txn.insert(change.collection, &change.key, json.clone()),
                    None => {
                        txn.remove(change.collection, &change.key);
                    }
                }
            }
        });
        delta
    }

    /// Close the current grouping window so the next qualifying transaction
    /// starts a fresh undo step.
    pub fn stop_capturing(&mut self) {
        self.stacks.borrow_mut().last_capture = None;
    }

    /// Drop both stacks without touching the document.
    pub fn clear(&mut self) {
        let mut stacks = self.stacks.borrow_mut();
        stacks.undo.clear();
        stacks.redo.clear();
        stacks.last_capture = None;
    }

    pub fn can_undo(&self) -> bool {
        !self.stacks.borrow().undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.stacks.borrow().redo.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.stacks.borrow().undo.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.stacks.borrow().redo.len()
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Backward,
    Forward,
}

impl Drop for UndoManager {
    fn drop(&mut self) {
        if let Ok(mut doc) = self.doc.try_borrow_mut() {
            doc.unobserve(self.observer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::Collection;
    use trellis_model::Element;

    fn shared_doc() -> Rc<RefCell<ReplicatedDoc>> {
        Rc::new(RefCell::new(ReplicatedDoc::new()))
    }

    /// Manager whose capture window never groups: every transaction becomes
    /// its own step.
    fn ungrouped_manager(doc: &Rc<RefCell<ReplicatedDoc>>) -> UndoManager {
        UndoManager::with_options(
            doc.clone(),
            HashSet::from([Origin::Local, Origin::Remote]),
            Duration::ZERO,
        )
    }

    fn insert_element(doc: &Rc<RefCell<ReplicatedDoc>>, el: &Element) -> Vec<u8> {
        let json = el.to_json();
        let id = el.id.clone();
        let (_, delta) = doc.borrow_mut().transact(Origin::Local, move |txn| {
            txn.insert(Collection::Elements, &id, json);
        });
        delta
    }

    #[test]
    fn test_undo_redo_three_separated_edits() {
        let doc = shared_doc();
        let mut undo = ungrouped_manager(&doc);

        let a = Element::new("class");
        let b = Element::new("class");
        insert_element(&doc, &a); // E1
        insert_element(&doc, &b); // E2
        let mut a2 = a.clone();
        a2.kind = "interface".into();
        insert_element(&doc, &a2); // E3

        assert_eq!(undo.undo_depth(), 3);

        // Three undos return to the pre-E1 state.
        assert!(undo.undo().is_some());
        assert_eq!(
            doc.borrow().get_json(Collection::Elements, &a.id),
            Some(a.to_json())
        );
        assert!(undo.undo().is_some());
        assert!(!doc.borrow().contains(Collection::Elements, &b.id));
        assert!(undo.undo().is_some());
        assert!(doc.borrow().is_empty());
        assert!(!undo.can_undo());

        // Three redos restore E1..E3.
        assert!(undo.redo().is_some());
        assert!(undo.redo().is_some());
        assert!(undo.redo().is_some());
        assert!(!undo.can_redo());
        assert_eq!(
            doc.borrow().get_json(Collection::Elements, &a.id),
            Some(a2.to_json())
        );
        assert!(doc.borrow().contains(Collection::Elements, &b.id));
    }

    #[test]
    fn test_empty_stacks_are_noops() {
        let doc = shared_doc();
        let mut undo = ungrouped_manager(&doc);
        assert!(undo.undo().is_none());
        assert!(undo.redo().is_none());
        assert!(!undo.can_undo());
        assert!(!undo.can_redo());
    }

    #[test]
    fn test_new_edit_clears_redo() {
        let doc = shared_doc();
        let mut undo = ungrouped_manager(&doc);

        insert_element(&doc, &Element::new("class"));
        insert_element(&doc, &Element::new("class"));
        undo.undo().unwrap();
        assert!(undo.can_redo());

        insert_element(&doc, &Element::new("class"));
        assert!(!undo.can_redo());
    }

    #[test]
    fn test_capture_window_groups_rapid_edits() {
        let doc = shared_doc();
        let mut undo = UndoManager::with_options(
            doc.clone(),
            HashSet::from([Origin::Local]),
            Duration::from_secs(30),
        );

        let a = Element::new("class");
        let b = Element::new("class");
        insert_element(&doc, &a);
        insert_element(&doc, &b);

        // Both edits landed within the window: one step.
        assert_eq!(undo.undo_depth(), 1);
        undo.undo().unwrap();
        assert!(doc.borrow().is_empty());
    }

    #[test]
    fn test_capture_window_elapses_between_edits() {
        let doc = shared_doc();
        let undo = UndoManager::with_options(
            doc.clone(),
            HashSet::from([Origin::Local]),
            Duration::from_millis(20),
        );

        insert_element(&doc, &Element::new("class"));
        std::thread::sleep(Duration::from_millis(40));
        insert_element(&doc, &Element::new("class"));

        assert_eq!(undo.undo_depth(), 2);
    }

    #[test]
    fn test_stop_capturing_forces_new_step() {
        let doc = shared_doc();
        let mut undo = UndoManager::with_options(
            doc.clone(),
            HashSet::from([Origin::Local]),
            Duration::from_secs(30),
        );

        insert_element(&doc, &Element::new("class"));
        undo.stop_capturing();
        insert_element(&doc, &Element::new("class"));
        assert_eq!(undo.undo_depth(), 2);
    }

    #[test]
    fn test_grouped_update_restores_earliest_before() {
        let doc = shared_doc();
        let mut undo = UndoManager::with_options(
            doc.clone(),
            HashSet::from([Origin::Local]),
            Duration::from_secs(30),
        );

        let mut el = Element::new("class");
        insert_element(&doc, &el);
        el.kind = "interface".into();
        insert_element(&doc, &el);
        el.kind = "enumeration".into();
        insert_element(&doc, &el);

        // All three coalesced; undoing removes the element entirely.
        assert_eq!(undo.undo_depth(), 1);
        undo.undo().unwrap();
        assert!(!doc.borrow().contains(Collection::Elements, &el.id));
    }

    #[test]
    fn test_untracked_origin_is_not_undoable() {
        let doc = shared_doc();
        let undo = UndoManager::with_options(
            doc.clone(),
            HashSet::from([Origin::Local]),
            Duration::ZERO,
        );

        doc.borrow_mut().transact(Origin::Remote, |txn| {
            txn.insert(Collection::Elements, "a", r#"{"id":"a"}"#);
        });
        assert!(!undo.can_undo());
    }

    #[test]
    fn test_remote_edits_are_undoable_by_default() {
        let mut source = ReplicatedDoc::new();
        let (_, delta) = source.transact(Origin::Local, |txn| {
            txn.insert(Collection::Elements, "a", r#"{"id":"a"}"#);
        });

        let doc = shared_doc();
        let mut undo = UndoManager::new(doc.clone());
        doc.borrow_mut()
            .merge_remote_update(&delta, Origin::Remote)
            .unwrap();

        assert!(undo.can_undo());
        undo.undo().unwrap();
        assert!(!doc.borrow().contains(Collection::Elements, "a"));
    }

    #[test]
    fn test_undo_transactions_do_not_recapture() {
        let doc = shared_doc();
        let mut undo = ungrouped_manager(&doc);

        insert_element(&doc, &Element::new("class"));
        assert_eq!(undo.undo_depth(), 1);

        undo.undo().unwrap();
        // The inverse transaction must not have pushed a new step, and the
        // redo stack must have survived it.
        assert_eq!(undo.undo_depth(), 0);
        assert_eq!(undo.redo_depth(), 1);
    }

    #[test]
    fn test_undo_delta_replicates_to_peers() {
        let doc = shared_doc();
        let mut undo = ungrouped_manager(&doc);

        let el = Element::new("class");
        let add_delta = insert_element(&doc, &el);

        let mut peer = ReplicatedDoc::new();
        peer.merge_remote_update(&add_delta, Origin::Remote).unwrap();
        assert!(peer.contains(Collection::Elements, &el.id));

        let undo_delta = undo.undo().unwrap();
        peer.merge_remote_update(&undo_delta, Origin::Remote).unwrap();
        assert!(!peer.contains(Collection::Elements, &el.id));
    }

    #[test]
    fn test_undo_removal_restores_entry() {
        let doc = shared_doc();
        let mut undo = ungrouped_manager(&doc);

        let el = Element::new("class");
        insert_element(&doc, &el);
        doc.borrow_mut().transact(Origin::Local, |txn| {
            txn.remove(Collection::Elements, &el.id);
        });

        undo.undo().unwrap();
        assert_eq!(
            doc.borrow().get_json(Collection::Elements, &el.id),
            Some(el.to_json())
        );
    }

    #[test]
    fn test_clear_drops_both_stacks() {
        let doc = shared_doc();
        let mut undo = ungrouped_manager(&doc);
        insert_element(&doc, &Element::new("class"));
        undo.undo().unwrap();
        insert_element(&doc, &Element::new("class"));

        undo.clear();
        assert!(!undo.can_undo());
        assert!(!undo.can_redo());
    }
}
