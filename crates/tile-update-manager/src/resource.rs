use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use residency_protocol::ResourceId;
use tile_residency::{ResidencyEngine, TileGridDims, TileMappingState};

/// Stable, `Send + Sync` handle the caller keeps after
/// `TileUpdateManager::create_streaming_resource`. Back-edges into the
/// engine are this handle, not an owning pointer (§9 cross-thread
/// references).
#[derive(Clone)]
pub struct StreamingResourceHandle {
    pub(crate) id: ResourceId,
    pub(crate) dims: TileGridDims,
    pub(crate) mip_count: u8,
    pub(crate) needs_transition: Arc<AtomicBool>,
}

impl StreamingResourceHandle {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn dims(&self) -> TileGridDims {
        self.dims
    }

    pub fn mip_count(&self) -> u8 {
        self.mip_count
    }

    /// One-shot flag consumed by the renderer the first time this resource
    /// becomes sampleable (§4.6): once the packed-mip bootstrap copy lands,
    /// the caller must perform whatever GPU resource-state transition its
    /// API requires, exactly once, before drawing with this resource.
    pub fn take_needs_transition(&self) -> bool {
        self.needs_transition.swap(false, Ordering::AcqRel)
    }
}

/// Everything the `TileUpdateManager` keeps per registered resource: the
/// `ResidencyEngine` driving it (behind a `Mutex` since both the worker
/// thread and `end_frame` touch it), the shared mapping state registered
/// with the uploader, and this resource's slice of the residency buffer.
pub(crate) struct ManagedResource {
    pub(crate) engine: Mutex<ResidencyEngine>,
    pub(crate) state: Arc<TileMappingState>,
    pub(crate) residency_changed: Arc<AtomicBool>,
    pub(crate) region_offset: usize,
    pub(crate) region_count: usize,
    pub(crate) needs_transition: Arc<AtomicBool>,
    pub(crate) packed_transition_armed: AtomicBool,
}
