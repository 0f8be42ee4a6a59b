//! Top-level aggregator (C7): owns one `ResidencyEngine` per registered
//! streaming resource, the shared residency buffer those engines publish
//! into, and the worker thread that repeatedly drives
//! `process_feedback`/`queue_tiles` across all of them (§2, §4.7).

mod manager;
mod residency_buffer;
mod resource;

pub use manager::{BeginFrameOutput, EngineFatalError, TileUpdateManager};
pub use residency_buffer::{FrameCommand, ResidencyBuffer, ResidencyBufferDescriptor, ResourceRegion};
pub use resource::StreamingResourceHandle;
