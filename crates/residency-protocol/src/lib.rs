//! Wire and coordination types shared between the tile residency control
//! plane and the GPU-facing worker threads.
//!
//! This crate is the bottom of the dependency graph: everything else may
//! depend on it, it depends on nothing workspace-local.

use std::fmt;

/// Fixed GPU heap page size. Every resident tile occupies exactly one page.
pub const PAGE_SIZE_BYTES: u64 = 64 * 1024;

/// Sentinel for "no heap page assigned".
pub const INVALID_HEAP_INDEX: u32 = u32::MAX;

/// A tile coordinate: `(x, y)` tile indices within subresource (mip) `s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub s: u8,
}

impl TileCoord {
    pub const fn new(x: u32, y: u32, s: u8) -> Self {
        Self { x, y, s }
    }

    /// The coordinate of the tile one mip coarser that covers this one.
    pub fn parent(self) -> Self {
        Self {
            x: self.x >> 1,
            y: self.y >> 1,
            s: self.s + 1,
        }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "({}, {}, s{})", self.x, self.y, self.s)
    }
}

/// Stable, non-owning identifier for a `StreamingResource` registered with
/// the `TileUpdateManager`. Resources never hand out owning pointers across
/// threads; every back-edge is one of these handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u32);

/// Residency state of one tile record. See the joint invariant table:
/// `heap_index` is valid iff residency is `Resident` or `Loading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Residency {
    NotResident = 0,
    Resident = 1,
    Loading = 2,
    Evicting = 3,
}

impl Residency {
    pub const fn from_tag(tag: u8) -> Self {
        match tag {
            0 => Residency::NotResident,
            1 => Residency::Resident,
            2 => Residency::Loading,
            3 => Residency::Evicting,
            _ => panic!("invalid residency tag"),
        }
    }

    pub const fn tag(self) -> u8 {
        self as u8
    }

    pub const fn heap_index_valid(self) -> bool {
        matches!(self, Residency::Resident | Residency::Loading)
    }
}

/// Fence value stamped on a feedback buffer by the renderer, identifying
/// the render-thread frame at which the GPU resolved that feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RenderFence(pub u64);

/// Fence value returned by `MappingBackend::map`/`unmap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MappingFence(pub u64);

/// Fence/ticket identifying an in-flight tile (or packed-mip) copy issued
/// through the `TileStreamer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CopyTicket(pub u64);

/// A completed-frame fence: the frame the renderer has finished executing,
/// used by `process_feedback` to pick the newest feedback buffer that is
/// safe to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameFenceCompleted(pub u64);

/// Tunable parameters for one `TileUpdateManager` instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of swap-chain buffers the renderer cycles through.
    pub swap_buffers: u32,
    /// Eviction delay ring depth. Always `swap_buffers + 1`.
    pub eviction_delay_depth: u32,
    /// Ceiling on concurrently in-flight UpdateLists.
    pub max_copy_batches: u32,
    /// Ceiling on tile copies queued into a single UpdateList.
    pub max_tile_copies_per_batch: u32,
    /// Ceiling on tiles with an outstanding load across all UpdateLists.
    pub max_tiles_in_flight: u32,
    /// Ceiling on mapping updates issued in one backend API call.
    pub max_tile_mapping_updates_per_api_call: u32,
    /// Heap capacity, in 64 KiB pages.
    pub heap_capacity_pages: u32,
    /// Enable the coarsest-mip-only fast path for `min_resident_mip`
    /// instead of the conservative full per-mip walk. Default `false`.
    pub optimistic_min_resident_mip: bool,
}

impl EngineConfig {
    /// Builds a config from `swap_buffers`, deriving `eviction_delay_depth`
    /// as `swap_buffers + 1`.
    pub fn new(swap_buffers: u32) -> Self {
        Self {
            swap_buffers,
            eviction_delay_depth: swap_buffers + 1,
            ..Self::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            swap_buffers: 2,
            eviction_delay_depth: 3,
            max_copy_batches: 128,
            max_tile_copies_per_batch: 32,
            max_tiles_in_flight: 512,
            max_tile_mapping_updates_per_api_call: 4096,
            heap_capacity_pages: 4096,
            optimistic_min_resident_mip: false,
        }
    }
}

/// Fatal condition reported by a `MappingBackend`/`TileStreamer` that the
/// engine cannot absorb as deferred queue state: device loss or a fence
/// wait that the backend itself gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    DeviceLost,
    FenceWaitFailed { message: String },
}

impl fmt::Display for BackendError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::DeviceLost => write!(formatter, "GPU device lost"),
            BackendError::FenceWaitFailed { message } => {
                write!(formatter, "fence wait failed: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}
