use residency_protocol::{BackendError, CopyTicket, MappingFence, ResourceId};
use tile_residency::LoadEntry;
use residency_protocol::TileCoord;

/// GPU-facing tile mapping operations (§6 External Interfaces). Implemented
/// once per graphics backend; the engine never touches the device directly.
pub trait MappingBackend: Send + Sync {
    /// Issues a batch of heap (un)mappings. `loads` carries the heap page
    /// each newly-resident tile was assigned; `evicts` carries tiles being
    /// unmapped. Returns a fence the caller polls with [`Self::poll_fence`].
    fn map_tiles(&self, loads: &[LoadEntry], evicts: &[TileCoord]) -> Result<MappingFence, BackendError>;

    /// True once the GPU has executed the mapping batch identified by `fence`.
    fn poll_fence(&self, fence: MappingFence) -> Result<bool, BackendError>;
}

/// Streams tile pixel data into already-mapped heap pages (§6).
pub trait TileStreamer: Send + Sync {
    /// Issues copies for the given loads, returning a ticket to poll.
    fn stream_copies(&self, loads: &[LoadEntry]) -> Result<CopyTicket, BackendError>;

    /// Issues the one-shot packed-mip bootstrap payload for `resource`
    /// (§4.6): every packed mip in a single small upload, ahead of any
    /// standard-mip streaming.
    fn stream_packed_bootstrap(&self, resource: ResourceId) -> Result<CopyTicket, BackendError>;

    /// True once the copy identified by `ticket` has landed.
    fn poll_ticket(&self, ticket: CopyTicket) -> Result<bool, BackendError>;
}
