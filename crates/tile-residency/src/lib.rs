//! Per-resource tile residency bookkeeping: heap allocation, the delayed
//! eviction ring, the flat per-mip mapping state, the `UpdateList` pool
//! record type, and the feedback-to-load/evict translator built on top of
//! them.
//!
//! This crate owns no threads and no GPU handles; it is driven entirely by
//! whatever caller wires it to a feedback source, an `UpdateListPool`, and
//! a completion notifier (`tile-uploader`, `tile-update-manager`).

pub mod eviction_ring;
pub mod heap;
pub mod mapping_state;
pub mod residency_engine;
pub mod update_list;

pub use eviction_ring::EvictionDelayRing;
pub use heap::HeapAllocator;
pub use mapping_state::{TileGridDims, TileMappingState};
pub use residency_engine::{FeedbackBuffer, ResidencyEngine, UpdateListPool};
pub use update_list::{LoadEntry, UpdateList, UpdateListState};
