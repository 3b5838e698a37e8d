//! # trellis-collab — Replication and undo engine for Trellis documents
//!
//! Offline-first collaborative editing over a graph-of-elements document.
//! Each session runs this whole stack single-threaded and exchanges opaque
//! CRDT deltas with its peers; convergence needs no central arbiter and no
//! delivery-order guarantees from the transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ mutate  ┌──────────────┐ transact  ┌───────────────┐
//! │ UI / host    │ ──────► │ StoreAdapter │ ────────► │ ReplicatedDoc │
//! │ application  │ ◄────── │ + Working-   │ ◄──────── │ (yrs CRDT)    │
//! └──────────────┘  read   │   State      │  observe  └──────┬────────┘
//!                          └──────────────┘  (≠local)        │ deltas
//!                          ┌──────────────┐                  │
//!                          │ UndoManager  │ ◄────────────────┤
//!                          └──────────────┘   observe        │
//!                          ┌──────────────┐                  │
//!                          │ SyncMessage  │ ◄────────────────┘
//!                          │ (protocol)   │ ◄──► external transport
//!                          └──────────────┘
//! ```
//!
//! Local edits flow projection → document inside a `Local` transaction;
//! inbound deltas flow document → projection under a `Remote` origin. The
//! origin tag is what keeps the two directions from feeding back into each
//! other.
//!
//! ## Modules
//!
//! - [`doc`] — CRDT document with origin-tagged transactions and observers
//! - [`store`] — working-state projection + synchronization adapter
//! - [`undo`] — capture-window grouping undo/redo over logical edit steps
//! - [`protocol`] — framed sync messages for an arbitrary byte channel

pub mod doc;
pub mod protocol;
pub mod store;
pub mod undo;

// Re-exports for convenience
pub use doc::{
    Collection, CollectionUpdate, DecodeError, DocTxn, EntryChange, ObserverId, Origin,
    ReplicatedDoc, TxnSummary,
};
pub use protocol::{
    handle_message, handle_message_lossy, sync_request, update_message, SyncMessage,
};
pub use store::{StoreAdapter, WorkingState};
pub use undo::{UndoManager, DEFAULT_CAPTURE_TIMEOUT};
