//! Heap snapshot analysis engine.
//!
//! Loads heap snapshots in the streamed JSON wire format and answers the
//! questions a memory investigation asks of them: what retains an object,
//! how much memory it keeps alive, which classes grew between two
//! snapshots and where the objects were allocated.
//!
//! # Modules
//!
//! - [`loader`] - Chunked parser for the wire format
//! - [`graph`] - Flat node/edge storage with cursors and retainer index
//! - [`policy`] - Node classification and containment rules
//! - [`distances`], [`dominators`] - Reachability, dominator tree, retained sizes
//! - [`aggregates`], [`diff`], [`search`], [`allocation`] - Analyses
//! - [`snapshot`] - [`HeapSnapshot`], which ties the above together
//! - [`provider`] - Paginated, sortable result sets
//! - [`dispatcher`] - Request/response protocol for hosting the engine
//!
//! # Example
//!
//! ```no_run
//! use heapsnap::{GenericPolicy, HeapSnapshot, Loader};
//! use std::fs::File;
//!
//! let raw = Loader::load(File::open("Heap.heapsnapshot").unwrap()).unwrap();
//! let snapshot = HeapSnapshot::new(raw, Box::new(GenericPolicy)).unwrap();
//! println!("{} bytes reachable", snapshot.total_retained_size());
//! ```

pub mod aggregates;
pub mod allocation;
pub mod diff;
pub mod dispatcher;
pub mod distances;
pub mod dominators;
pub mod graph;
pub mod loader;
pub mod meta;
pub mod policy;
pub mod provider;
pub mod search;
pub mod snapshot;

#[cfg(test)]
mod testing;

pub use aggregates::NodeFilter;
pub use loader::{LoadError, Loader, Progress};
pub use policy::{GenericPolicy, JsHeapPolicy, PolicyConfig, SnapshotPolicy};
pub use provider::{ComparatorConfig, ItemProvider};
pub use search::SearchConfig;
pub use snapshot::{HeapSnapshot, SnapshotError};
