use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use residency_protocol::{CopyTicket, MappingFence, ResourceId, TileCoord};

/// `UpdateList` lifecycle states. `Free -> Allocated -> Submitted ->
/// {Uploading | PackedMapping} -> CopyPending -> Free`. Each state's
/// single outgoing edge is driven by exactly one of the four threads
/// (§5): the pool allocator claims `Free -> Allocated`, `ResidencyEngine`
/// drives `Allocated -> Submitted`, the submit thread drives
/// `Submitted -> {Uploading, PackedMapping, CopyPending}`, and the
/// fence-monitor thread drives every other transition, ending at `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpdateListState {
    Free = 0,
    Allocated = 1,
    Submitted = 2,
    Uploading = 3,
    PackedMapping = 4,
    CopyPending = 5,
}

impl UpdateListState {
    fn from_tag(tag: u8) -> Self {
        match tag {
            0 => UpdateListState::Free,
            1 => UpdateListState::Allocated,
            2 => UpdateListState::Submitted,
            3 => UpdateListState::Uploading,
            4 => UpdateListState::PackedMapping,
            5 => UpdateListState::CopyPending,
            _ => panic!("invalid update list state tag {tag}"),
        }
    }

    fn tag(self) -> u8 {
        self as u8
    }
}

/// One tile queued to be loaded, paired with the heap page freshly
/// allocated for it on entering `Loading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadEntry {
    pub coord: TileCoord,
    pub heap_index: u32,
}

#[derive(Debug, Default)]
struct UpdateListContents {
    resource: Option<ResourceId>,
    loads: Vec<LoadEntry>,
    evicts: Vec<TileCoord>,
    mapping_fence: Option<MappingFence>,
    copy_ticket: Option<CopyTicket>,
    is_packed_mapping: bool,
}

impl UpdateListContents {
    fn clear(&mut self) {
        self.resource = None;
        self.loads.clear();
        self.evicts.clear();
        self.mapping_fence = None;
        self.copy_ticket = None;
        self.is_packed_mapping = false;
    }
}

/// Batched unit of mapping + copy work moving through the pipeline.
///
/// The `state` tag is a plain atomic so the pool can scan slots for `Free`
/// ones without taking the lock; every field access that matters for
/// correctness goes through `contents`, locked for the duration of each
/// transition so a slot's payload is always read/written as a unit by
/// whichever thread currently owns that edge of the state graph.
#[derive(Debug)]
pub struct UpdateList {
    state: AtomicU8,
    contents: Mutex<UpdateListContents>,
}

impl Default for UpdateList {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateList {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(UpdateListState::Free.tag()),
            contents: Mutex::new(UpdateListContents::default()),
        }
    }

    pub fn state(&self) -> UpdateListState {
        UpdateListState::from_tag(self.state.load(Ordering::Acquire))
    }

    /// Attempts to claim this slot for `resource`. Succeeds only if the
    /// slot was `Free`; used by the pool's CAS-acquire probe.
    pub fn try_allocate(&self, resource: ResourceId) -> bool {
        let claimed = self
            .state
            .compare_exchange(
                UpdateListState::Free.tag(),
                UpdateListState::Allocated.tag(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if claimed {
            let mut contents = self.contents.lock().expect("update list mutex poisoned");
            contents.resource = Some(resource);
        }
        claimed
    }

    pub fn resource(&self) -> Option<ResourceId> {
        self.contents.lock().expect("update list mutex poisoned").resource
    }

    pub fn is_empty(&self) -> bool {
        let contents = self.contents.lock().expect("update list mutex poisoned");
        contents.loads.is_empty() && contents.evicts.is_empty()
    }

    pub fn push_load(&self, entry: LoadEntry) {
        self.contents
            .lock()
            .expect("update list mutex poisoned")
            .loads
            .push(entry);
    }

    pub fn push_evict(&self, coord: TileCoord) {
        self.contents
            .lock()
            .expect("update list mutex poisoned")
            .evicts
            .push(coord);
    }

    pub fn loads(&self) -> Vec<LoadEntry> {
        self.contents.lock().expect("update list mutex poisoned").loads.clone()
    }

    pub fn evicts(&self) -> Vec<TileCoord> {
        self.contents.lock().expect("update list mutex poisoned").evicts.clone()
    }

    /// `Allocated -> Submitted`: the `ResidencyEngine` hands the filled
    /// list to the uploader for the submit thread to process.
    pub fn submit(&self) {
        self.assert_state(UpdateListState::Allocated, "submit");
        self.state.store(UpdateListState::Submitted.tag(), Ordering::Release);
    }

    /// `Submitted -> Uploading`, recording the mapping fence the backend
    /// returned. Taken when the list carries loads.
    pub fn begin_uploading(&self, mapping_fence: MappingFence) {
        self.assert_state(UpdateListState::Submitted, "begin_uploading");
        self.contents.lock().expect("update list mutex poisoned").mapping_fence = Some(mapping_fence);
        self.state.store(UpdateListState::Uploading.tag(), Ordering::Release);
    }

    /// `Submitted -> PackedMapping`: packed-mip bootstrap path (§4.6).
    pub fn begin_packed_mapping(&self, mapping_fence: MappingFence) {
        self.assert_state(UpdateListState::Submitted, "begin_packed_mapping");
        let mut contents = self.contents.lock().expect("update list mutex poisoned");
        contents.mapping_fence = Some(mapping_fence);
        contents.is_packed_mapping = true;
        drop(contents);
        self.state.store(UpdateListState::PackedMapping.tag(), Ordering::Release);
    }

    /// `Submitted -> CopyPending` directly: taken when the list carries
    /// only evictions (no streamer copy needed).
    pub fn begin_copy_pending_evict_only(&self, mapping_fence: MappingFence) {
        self.assert_state(UpdateListState::Submitted, "begin_copy_pending_evict_only");
        self.contents.lock().expect("update list mutex poisoned").mapping_fence = Some(mapping_fence);
        self.state.store(UpdateListState::CopyPending.tag(), Ordering::Release);
    }

    /// `PackedMapping -> Uploading`, once the mapping fence is reached and
    /// the streamer has been asked to stream the packed payload.
    pub fn packed_mapping_to_uploading(&self, copy_ticket: CopyTicket) {
        self.assert_state(UpdateListState::PackedMapping, "packed_mapping_to_uploading");
        self.contents.lock().expect("update list mutex poisoned").copy_ticket = Some(copy_ticket);
        self.state.store(UpdateListState::Uploading.tag(), Ordering::Release);
    }

    /// `Uploading -> CopyPending`, once the streamer commits the copy.
    pub fn begin_copy_pending(&self, copy_ticket: CopyTicket) {
        self.assert_state(UpdateListState::Uploading, "begin_copy_pending");
        self.contents.lock().expect("update list mutex poisoned").copy_ticket = Some(copy_ticket);
        self.state.store(UpdateListState::CopyPending.tag(), Ordering::Release);
    }

    pub fn mapping_fence(&self) -> Option<MappingFence> {
        self.contents.lock().expect("update list mutex poisoned").mapping_fence
    }

    pub fn copy_ticket(&self) -> Option<CopyTicket> {
        self.contents.lock().expect("update list mutex poisoned").copy_ticket
    }

    pub fn is_packed_mapping(&self) -> bool {
        self.contents.lock().expect("update list mutex poisoned").is_packed_mapping
    }

    /// `CopyPending -> Free`: both fences satisfied, notifications
    /// delivered, slot returned to the pool.
    pub fn release_to_pool(&self) {
        self.assert_state(UpdateListState::CopyPending, "release_to_pool");
        self.contents.lock().expect("update list mutex poisoned").clear();
        self.state.store(UpdateListState::Free.tag(), Ordering::Release);
    }

    /// Abandons a list that turned out empty after queueing (§4.4.3 step
    /// 3): goes straight back to `Free` without ever being submitted.
    pub fn abandon_unsubmitted(&self) {
        self.assert_state(UpdateListState::Allocated, "abandon_unsubmitted");
        self.contents.lock().expect("update list mutex poisoned").clear();
        self.state.store(UpdateListState::Free.tag(), Ordering::Release);
    }

    fn assert_state(&self, expected: UpdateListState, transition: &'static str) {
        let actual = self.state();
        debug_assert!(
            actual == expected,
            "update list transition {transition} requires state {expected:?}, found {actual:?}"
        );
    }
}
