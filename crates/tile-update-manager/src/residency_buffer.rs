use residency_protocol::ResourceId;

/// Per-region mip-residency bytes for every registered resource, laid out
/// contiguously at the offset assigned when each resource was registered
/// (§6 Residency-map wire format): byte-per-region, row-major, resources
/// concatenated.
#[derive(Debug, Default)]
pub struct ResidencyBuffer {
    bytes: Vec<u8>,
}

impl ResidencyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grows the buffer to fit a freshly registered resource and returns the
    /// byte offset assigned to it, filled with `mip_count` (only packed
    /// mips resident) per §4.7's "re-initialization of that region on
    /// registration".
    pub fn reserve_region(&mut self, region_count: usize, mip_count: u8) -> usize {
        let offset = self.bytes.len();
        self.bytes.resize(offset + region_count, mip_count);
        offset
    }

    pub fn publish(&mut self, offset: usize, min_mip_map: &[u8]) {
        self.bytes[offset..offset + min_mip_map.len()].copy_from_slice(min_mip_map);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Snapshot of the shared residency buffer handed to the renderer by
/// `begin_frame`, together with the offset/length of each resource's region
/// within it so the renderer can bind the right slice per draw.
#[derive(Debug, Clone)]
pub struct ResidencyBufferDescriptor {
    pub bytes: Vec<u8>,
    pub regions: Vec<ResourceRegion>,
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceRegion {
    pub resource: ResourceId,
    pub offset: usize,
    pub len: usize,
}

/// Clear/resolve command lists the renderer must execute around a frame's
/// draw calls (§6 `begin_frame`). GPU API specifics are out of scope
/// (§1): these are opaque markers the renderer's own command-list builder
/// interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCommand {
    /// Clears a freshly registered resource's feedback-resolve target
    /// before the first frame it participates in.
    ClearFeedbackTarget { resource: ResourceId },
    /// Resolves the GPU-written min-mip feedback buffer into the
    /// CPU-readable form `queue_feedback` consumes.
    ResolveFeedback { resource: ResourceId },
}
