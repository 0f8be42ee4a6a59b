//! Drives `UpdateList`s submitted by a `ResidencyEngine` through a
//! `MappingBackend` and a `TileStreamer`, and reports completed work back
//! onto each resource's `TileMappingState` (§4.5, C6).

pub mod backend;
pub mod pool;
pub mod uploader;

#[cfg(any(test, feature = "test-utils"))]
pub mod fakes;

#[cfg(test)]
mod threaded_tests;

pub use backend::{MappingBackend, TileStreamer};
pub use pool::UpdateListSlots;
pub use uploader::DataUploader;
