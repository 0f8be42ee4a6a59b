//! In-process fakes of [`MappingBackend`] and [`TileStreamer`], gated
//! behind `test-utils`. Every fence/ticket is "reached" the instant it is
//! issued: there is no real device, so there is nothing to wait for.

use std::sync::atomic::{AtomicU64, Ordering};

use residency_protocol::{BackendError, CopyTicket, MappingFence, ResourceId, TileCoord};

use crate::backend::{MappingBackend, TileStreamer};
use tile_residency::LoadEntry;

#[derive(Debug, Default)]
pub struct ImmediateBackend {
    next_fence: AtomicU64,
}

impl MappingBackend for ImmediateBackend {
    fn map_tiles(&self, _loads: &[LoadEntry], _evicts: &[TileCoord]) -> Result<MappingFence, BackendError> {
        Ok(MappingFence(self.next_fence.fetch_add(1, Ordering::Relaxed)))
    }

    fn poll_fence(&self, _fence: MappingFence) -> Result<bool, BackendError> {
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct ImmediateStreamer {
    next_ticket: AtomicU64,
}

impl TileStreamer for ImmediateStreamer {
    fn stream_copies(&self, _loads: &[LoadEntry]) -> Result<CopyTicket, BackendError> {
        Ok(CopyTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed)))
    }

    fn stream_packed_bootstrap(&self, _resource: ResourceId) -> Result<CopyTicket, BackendError> {
        Ok(CopyTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed)))
    }

    fn poll_ticket(&self, _ticket: CopyTicket) -> Result<bool, BackendError> {
        Ok(true)
    }
}
