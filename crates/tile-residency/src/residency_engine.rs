use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use residency_protocol::{EngineConfig, FrameFenceCompleted, RenderFence, Residency, ResourceId, TileCoord};

use crate::eviction_ring::EvictionDelayRing;
use crate::heap::HeapAllocator;
use crate::mapping_state::TileMappingState;
use crate::update_list::{LoadEntry, UpdateList};

/// One feedback buffer resolved by the renderer: a row-major grid over the
/// finest-mip tile grid, one `desired mip` byte per region, tagged with the
/// render fence it was resolved at.
#[derive(Debug, Clone)]
pub struct FeedbackBuffer {
    pub render_fence: RenderFence,
    pub regions: Vec<u8>,
}

/// Handed to a `ResidencyEngine` by whatever owns the `UpdateList` pool
/// (the uploader). Kept on this side of the boundary so `tile-residency`
/// never depends on `tile-uploader`: the uploader depends downward on this
/// crate and implements the trait, not the other way around.
pub trait UpdateListPool: Send + Sync {
    /// Claims a free `UpdateList` slot for `resource`, or `None` if the
    /// pool is fully subscribed (`max_copy_batches`).
    fn allocate(&self, resource: ResourceId) -> Option<Arc<UpdateList>>;

    /// Nudges the submit thread so a freshly `Submitted` list is not left
    /// waiting for its next scheduled wakeup.
    fn wake_submit_thread(&self);
}

/// Translates GPU feedback into tile load/evict decisions for one streaming
/// resource (§4.4). Every method here runs on a single logical thread (the
/// `TileUpdateManager` worker); `queue_feedback` and `request_evict_all` are
/// the two entry points other threads are allowed to call concurrently,
/// which is why they go through the `Mutex`/`AtomicBool` fields instead of
/// the plain fields the rest of the engine uses.
pub struct ResidencyEngine {
    resource: ResourceId,
    config: EngineConfig,
    state: Arc<TileMappingState>,
    heap: Arc<HeapAllocator>,
    eviction_ring: EvictionDelayRing,
    tile_references: Vec<u8>,
    pending_loads: Vec<TileCoord>,
    min_mip_map: Vec<u8>,
    previous_min_mip: Vec<u8>,
    queued_feedback: Mutex<Vec<FeedbackBuffer>>,
    residency_changed: Arc<AtomicBool>,
    evict_all_requested: AtomicBool,
}

impl ResidencyEngine {
    pub fn new(
        resource: ResourceId,
        config: EngineConfig,
        state: Arc<TileMappingState>,
        heap: Arc<HeapAllocator>,
    ) -> Self {
        let mip_count = state.mip_count();
        let region_count = (state.dims().width_tiles as usize) * (state.dims().height_tiles as usize);
        Self {
            resource,
            eviction_ring: EvictionDelayRing::new(config.eviction_delay_depth),
            config,
            state,
            heap,
            tile_references: vec![mip_count; region_count],
            pending_loads: Vec::new(),
            min_mip_map: vec![mip_count; region_count],
            // Seeded at the finest mip rather than `mip_count`: the latter
            // would make `start = floor.max(previous)` saturate to
            // `mip_count` forever the first time every reference drops and
            // never recover once references return.
            previous_min_mip: vec![0; region_count],
            queued_feedback: Mutex::new(Vec::new()),
            residency_changed: Arc::new(AtomicBool::new(false)),
            evict_all_requested: AtomicBool::new(false),
        }
    }

    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// Shared mapping-state handle, for registering this resource with the
    /// uploader's completion notifications.
    pub fn state(&self) -> Arc<TileMappingState> {
        self.state.clone()
    }

    /// Rotates this resource's `EvictionDelayRing` (§4.2). Called once per
    /// frame by the `TileUpdateManager` aggregator, independent of whether
    /// `process_feedback`/`queue_tiles` ran this tick.
    pub fn next_frame(&mut self) {
        self.eviction_ring.next_frame();
    }

    /// Shared flag the completion worker also sets on terminal transitions
    /// (§4.5.3), so `update_min_mip_map` picks up residency changes that
    /// happened off this thread.
    pub fn residency_changed_flag(&self) -> Arc<AtomicBool> {
        self.residency_changed.clone()
    }

    pub fn min_mip_map(&self) -> &[u8] {
        &self.min_mip_map
    }

    /// Records a resolved feedback buffer (§6, `queue_feedback`). Called
    /// from the render thread; at most `swap_buffers` buffers are retained,
    /// oldest first dropped, since only a handful can ever still be useful
    /// by the time `process_feedback` gets to them.
    pub fn queue_feedback(&self, buffer: FeedbackBuffer) {
        let mut queued = self.queued_feedback.lock().expect("feedback queue mutex poisoned");
        queued.push(buffer);
        let cap = self.config.swap_buffers.max(1) as usize;
        if queued.len() > cap {
            queued.remove(0);
        }
    }

    /// Requests that every resident tile be queued for eviction and every
    /// pending load discarded, e.g. because the owning object was culled.
    pub fn request_evict_all(&self) {
        self.evict_all_requested.store(true, Ordering::Release);
    }

    /// §4.4.1. Consumes at most one queued feedback buffer and folds it
    /// into `tile_references`, issuing `SetMinMip` calls for every region
    /// whose desired mip changed.
    pub fn process_feedback(&mut self, frame_fence_completed: FrameFenceCompleted) {
        if self.evict_all_requested.swap(false, Ordering::AcqRel) {
            self.evict_all();
            return;
        }

        let Some(buffer) = self.take_consumable_feedback(frame_fence_completed) else {
            return;
        };

        let dims = self.state.dims();
        let width = dims.width_tiles as usize;
        let mut changed = false;
        for y in 0..dims.height_tiles as usize {
            for x in 0..width {
                let idx = y * width + x;
                let desired = buffer.regions[idx].min(self.state.mip_count());
                let current = self.tile_references[idx];
                if desired != current {
                    self.set_min_mip(x as u32, y as u32, current, desired);
                    self.tile_references[idx] = desired;
                    changed = true;
                }
            }
        }

        // AbandonPending: a region whose refcount fell back to 0 before its
        // load was ever queued no longer needs loading.
        let state = &self.state;
        self.pending_loads.retain(|coord| state.refcount(*coord) > 0);

        // Rescue: a region re-referenced before its delayed eviction fired.
        self.eviction_ring.rescue(&self.state);

        if changed {
            self.residency_changed.store(true, Ordering::Release);
        }
    }

    fn take_consumable_feedback(&self, completed: FrameFenceCompleted) -> Option<FeedbackBuffer> {
        let mut queued = self.queued_feedback.lock().expect("feedback queue mutex poisoned");
        let chosen_index = queued
            .iter()
            .enumerate()
            .filter(|(_, buffer)| buffer.render_fence.0 <= completed.0)
            .max_by_key(|(_, buffer)| buffer.render_fence.0)
            .map(|(index, _)| index)?;
        let chosen = queued.remove(chosen_index);
        queued.retain(|buffer| buffer.render_fence.0 > completed.0);
        Some(chosen)
    }

    fn evict_all(&mut self) {
        let dims = self.state.dims();
        for s in 0..self.state.mip_count() {
            let (width, height) = {
                let w = dims.width_tiles.div_ceil(1 << s as u32).max(1);
                let h = dims.height_tiles.div_ceil(1 << s as u32).max(1);
                (w, h)
            };
            for y in 0..height {
                for x in 0..width {
                    let coord = TileCoord::new(x, y, s);
                    let had_references = self.state.refcount(coord) > 0;
                    if had_references {
                        self.zero_refcount(coord);
                        match self.state.residency(coord) {
                            Residency::Resident | Residency::Loading => self.eviction_ring.append(coord),
                            Residency::NotResident | Residency::Evicting => {}
                        }
                    }
                }
            }
        }
        self.tile_references.fill(self.state.mip_count());
        self.pending_loads.clear();
        self.queued_feedback.lock().expect("feedback queue mutex poisoned").clear();
        self.residency_changed.store(true, Ordering::Release);
    }

    fn zero_refcount(&self, coord: TileCoord) {
        while self.state.refcount(coord) > 0 {
            self.state.decrement_refcount(coord);
        }
    }

    /// §4.4.2. `desired < current` walks coarse-to-fine adding references;
    /// `desired > current` walks fine-to-coarse releasing them. The
    /// ordering matters: a tile is only ever referenced once its coarser
    /// ancestor already is, and only released once every finer descendant
    /// no longer needs it.
    fn set_min_mip(&mut self, x: u32, y: u32, current: u8, desired: u8) {
        if desired < current {
            for s in (desired..current).rev() {
                let coord = TileCoord::new(x >> s, y >> s, s);
                if self.state.increment_refcount(coord) == 0 {
                    self.request_load(coord);
                }
            }
        } else {
            for s in current..desired {
                let coord = TileCoord::new(x >> s, y >> s, s);
                if self.state.decrement_refcount(coord) == 1 {
                    self.release_tile(coord);
                }
            }
        }
    }

    /// §4.4.2 `add_ref`: called on every 0->1 refcount transition,
    /// unconditionally, regardless of the tile's current residency.
    /// `drain_loads` is what actually filters by residency (NotResident
    /// starts loading, Evicting is delayed, Resident/Loading are already
    /// satisfied and dropped) — gating the enqueue here on residency would
    /// strand a tile re-referenced while `Evicting`: it was already
    /// dropped from the eviction ring by the time `set_evicting` ran, so
    /// `rescue` can no longer save it, and nothing would ever re-queue its
    /// load once the unmap completes and flips it `NotResident`.
    fn request_load(&mut self, coord: TileCoord) {
        self.pending_loads.push(coord);
    }

    fn release_tile(&mut self, coord: TileCoord) {
        match self.state.residency(coord) {
            Residency::Resident | Residency::Loading => self.eviction_ring.append(coord),
            Residency::NotResident | Residency::Evicting => {}
        }
    }

    /// §4.4.3. Drains evictions and loads into `UpdateList`s obtained from
    /// `pool`, submitting each non-empty list and abandoning the last one
    /// if it turned out empty.
    pub fn queue_tiles(&mut self, pool: &dyn UpdateListPool) {
        loop {
            let evictions_pending = !self.eviction_ring.ready_to_evict().is_empty();
            let loads_pending = !self.pending_loads.is_empty() && self.heap.num_free() > 0;
            if !evictions_pending && !loads_pending {
                break;
            }

            let Some(list) = pool.allocate(self.resource) else {
                break;
            };

            self.drain_evictions(&list);
            self.drain_loads(&list);

            if list.is_empty() {
                list.abandon_unsubmitted();
                break;
            }
            list.submit();
            pool.wake_submit_thread();
        }
    }

    /// §4.4.4: `Resident` tiles are actually unmapped and freed; `Loading`
    /// ones are delayed another rotation; anything else is dropped silently
    /// (already gone, or someone else is already handling it).
    fn drain_evictions(&mut self, list: &UpdateList) {
        let bucket = self.eviction_ring.ready_to_evict();
        let mut delayed = Vec::new();
        for coord in bucket.drain(..) {
            match self.state.residency(coord) {
                Residency::Resident => {
                    self.state.set_evicting(coord);
                    let index = self.state.heap_index(coord);
                    self.heap.free(index);
                    self.state.set_heap_index(coord, HeapAllocator::INVALID);
                    list.push_evict(coord);
                }
                Residency::Loading => delayed.push(coord),
                Residency::NotResident | Residency::Evicting => {}
            }
        }
        bucket.extend(delayed);
    }

    /// §4.4.5: bounded by `min(pending_loads.len(), max_tile_copies_per_batch,
    /// heap.num_free())`. `NotResident` tiles actually start loading;
    /// `Evicting` ones are delayed (kept pending); anything else is already
    /// satisfied and dropped silently.
    fn drain_loads(&mut self, list: &UpdateList) {
        let budget = self
            .pending_loads
            .len()
            .min(self.config.max_tile_copies_per_batch as usize)
            .min(self.heap.num_free() as usize);

        let mut started = 0usize;
        let mut remaining = Vec::with_capacity(self.pending_loads.len());
        for coord in self.pending_loads.drain(..) {
            if started >= budget {
                remaining.push(coord);
                continue;
            }
            match self.state.residency(coord) {
                Residency::NotResident => {
                    self.state.set_loading(coord);
                    let index = self.heap.allocate();
                    debug_assert_ne!(index, HeapAllocator::INVALID, "budget overran heap.num_free()");
                    self.state.set_heap_index(coord, index);
                    list.push_load(LoadEntry {
                        coord,
                        heap_index: index,
                    });
                    started += 1;
                }
                Residency::Evicting => remaining.push(coord),
                Residency::Resident | Residency::Loading => {}
            }
        }
        self.pending_loads = remaining;
    }

    /// §4.4.6. Only recomputes when something changed since the last call.
    /// Returns `true` if `min_mip_map` was republished.
    pub fn update_min_mip_map(&mut self) -> bool {
        if !self.residency_changed.swap(false, Ordering::AcqRel) {
            return false;
        }

        if !self.state.any_refcount() {
            self.min_mip_map.fill(self.state.mip_count());
            self.previous_min_mip.fill(0);
            return true;
        }

        let floor = self.state.min_resident_mip(self.config.optimistic_min_resident_mip);
        let dims = self.state.dims();
        let width = dims.width_tiles as usize;
        let mip_count = self.state.mip_count();

        for y in 0..dims.height_tiles {
            for x in 0..dims.width_tiles {
                let idx = (y as usize) * width + x as usize;
                let start = floor.max(self.previous_min_mip[idx]);
                self.min_mip_map[idx] = if start >= mip_count {
                    mip_count
                } else {
                    self.walk_resident_chain(x, y, start)
                };
            }
        }
        self.previous_min_mip.copy_from_slice(&self.min_mip_map);
        true
    }

    fn walk_resident_chain(&self, x: u32, y: u32, start: u8) -> u8 {
        let mut s = start;
        let mut deepest = self.state.mip_count();
        loop {
            let coord = TileCoord::new(x >> s, y >> s, s);
            if !self.state.is_resident(coord) {
                break;
            }
            deepest = s;
            if s == 0 {
                break;
            }
            s -= 1;
        }
        deepest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping_state::TileGridDims;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    struct FakePool {
        lists: Vec<Arc<UpdateList>>,
        wakes: AtomicUsize,
    }

    impl FakePool {
        fn new(capacity: usize) -> Self {
            Self {
                lists: (0..capacity).map(|_| Arc::new(UpdateList::new())).collect(),
                wakes: AtomicUsize::new(0),
            }
        }
    }

    impl UpdateListPool for FakePool {
        fn allocate(&self, resource: ResourceId) -> Option<Arc<UpdateList>> {
            self.lists.iter().find(|list| list.try_allocate(resource)).cloned()
        }

        fn wake_submit_thread(&self) {
            self.wakes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn engine(width: u32, height: u32, mip_count: u8, heap_capacity: u32) -> ResidencyEngine {
        let state = Arc::new(TileMappingState::new(TileGridDims::new(width, height), mip_count));
        let heap = Arc::new(HeapAllocator::new(heap_capacity));
        ResidencyEngine::new(ResourceId(1), EngineConfig::new(2), state, heap)
    }

    fn feedback_all(width: u32, height: u32, mip: u8, fence: u64) -> FeedbackBuffer {
        FeedbackBuffer {
            render_fence: RenderFence(fence),
            regions: vec![mip; (width * height) as usize],
        }
    }

    #[test]
    fn cold_load_queues_tiles_coarse_to_fine() {
        // S1: a 2x2 finest grid, 2 mips, everything requests mip 0.
        let mut engine = engine(2, 2, 2, 16);
        engine.queue_feedback(feedback_all(2, 2, 0, 1));
        engine.process_feedback(FrameFenceCompleted(1));

        // Coarsest mip (1x1 at mip1) must have been referenced by every
        // region, and loads queued for it plus every mip0 tile.
        assert_eq!(engine.state.refcount(TileCoord::new(0, 0, 1)), 4);
        assert_eq!(engine.pending_loads.len(), 5);

        let pool = FakePool::new(4);
        engine.queue_tiles(&pool);

        // At least one UpdateList was submitted and the heap advanced.
        assert!(engine.heap.num_free() < 16);
        assert!(pool.wakes.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn process_feedback_picks_largest_fence_not_exceeding_completed() {
        let mut engine = engine(1, 1, 1, 4);
        engine.queue_feedback(feedback_all(1, 1, 0, 5));
        engine.queue_feedback(feedback_all(1, 1, 0, 10));
        engine.queue_feedback(feedback_all(1, 1, 0, 20));

        engine.process_feedback(FrameFenceCompleted(12));

        // fence 10 was chosen and consumed; fence 20 remains queued.
        assert_eq!(engine.queued_feedback.lock().unwrap().len(), 1);
        assert_eq!(engine.queued_feedback.lock().unwrap()[0].render_fence, RenderFence(20));
    }

    #[test]
    fn process_feedback_is_a_no_op_when_nothing_is_consumable() {
        let mut engine = engine(1, 1, 1, 4);
        engine.queue_feedback(feedback_all(1, 1, 0, 50));
        engine.process_feedback(FrameFenceCompleted(10));
        assert!(engine.pending_loads.is_empty());
        assert_eq!(engine.queued_feedback.lock().unwrap().len(), 1);
    }

    #[test]
    fn dropping_references_releases_to_eviction_ring_not_immediately() {
        let mut engine = engine(1, 1, 1, 4);
        engine.queue_feedback(feedback_all(1, 1, 0, 1));
        engine.process_feedback(FrameFenceCompleted(1));
        let pool = FakePool::new(2);
        engine.queue_tiles(&pool);

        // simulate completion: the tile is now Resident.
        let coord = TileCoord::new(0, 0, 0);
        engine.state.set_resident(coord);

        engine.queue_feedback(feedback_all(1, 1, 1, 2));
        engine.process_feedback(FrameFenceCompleted(2));

        assert_eq!(engine.state.refcount(coord), 0);
        assert_eq!(engine.state.residency(coord), Residency::Resident, "not evicted until the delay ring rotates");
        assert_eq!(engine.eviction_ring.ready_to_evict().len(), 0, "still delayed");
    }

    #[test]
    fn rescue_keeps_a_re_referenced_tile_out_of_eviction() {
        let mut engine = engine(1, 1, 1, 4);
        let coord = TileCoord::new(0, 0, 0);
        engine.state.set_resident(coord);
        engine.eviction_ring.append(coord);

        engine.queue_feedback(feedback_all(1, 1, 0, 1));
        engine.process_feedback(FrameFenceCompleted(1));

        assert_eq!(engine.state.refcount(coord), 1);
        engine.eviction_ring.next_frame();
        assert!(
            engine.eviction_ring.ready_to_evict().is_empty(),
            "rescue must have dropped the re-referenced coord before it reached the eligible bucket"
        );
    }

    #[test]
    fn re_reference_while_evicting_is_delayed_then_loaded() {
        // A tile mid-unmap (Evicting, refcount 0) is re-referenced before
        // the unmap completes. It's already gone from the eviction ring by
        // the time Evicting was set, so rescue can't help it; request_load
        // must queue it into pending_loads regardless, and queue_tiles must
        // keep delaying it (not drop it) until the unmap actually finishes.
        let mut engine = engine(1, 1, 1, 4);
        let coord = TileCoord::new(0, 0, 0);
        engine.state.set_evicting(coord);

        engine.queue_feedback(feedback_all(1, 1, 0, 1));
        engine.process_feedback(FrameFenceCompleted(1));
        assert_eq!(engine.state.refcount(coord), 1);
        assert!(engine.pending_loads.contains(&coord), "re-referenced Evicting tile must be queued for reload");

        let pool = FakePool::new(2);
        engine.queue_tiles(&pool);
        assert_eq!(engine.state.residency(coord), Residency::Evicting, "still in flight, delayed rather than dropped");
        assert!(engine.pending_loads.contains(&coord), "delayed load must stay pending, not be lost");

        // The unmap completes: the completion worker flips it NotResident.
        engine.state.set_not_resident(coord);
        engine.queue_tiles(&pool);
        assert_eq!(engine.state.residency(coord), Residency::Loading, "now free to actually start loading");
    }

    #[test]
    fn evict_all_clears_references_and_queues_resident_tiles() {
        // S6: everything resident with positive refcount, then culled.
        let mut engine = engine(2, 1, 1, 8);
        let a = TileCoord::new(0, 0, 0);
        let b = TileCoord::new(1, 0, 0);
        engine.state.set_resident(a);
        engine.state.set_resident(b);
        engine.state.increment_refcount(a);
        engine.state.increment_refcount(b);
        engine.pending_loads.push(TileCoord::new(0, 0, 0));

        engine.request_evict_all();
        engine.process_feedback(FrameFenceCompleted(1));

        assert_eq!(engine.state.refcount(a), 0);
        assert_eq!(engine.state.refcount(b), 0);
        assert!(engine.pending_loads.is_empty());
        assert_eq!(engine.eviction_ring.ready_to_evict().len(), 0, "still delayed");
        engine.eviction_ring.next_frame();
        engine.eviction_ring.next_frame();
        assert_eq!(engine.eviction_ring.ready_to_evict().len(), 2, "eligible after depth - 1 rotations");
    }

    #[test]
    fn update_min_mip_map_is_no_op_without_residency_change() {
        let mut engine = engine(1, 1, 1, 4);
        assert!(!engine.update_min_mip_map());
    }

    #[test]
    fn update_min_mip_map_reports_mip_count_when_nothing_referenced() {
        let mut engine = engine(1, 1, 2, 4);
        engine.residency_changed.store(true, Ordering::Relaxed);
        assert!(engine.update_min_mip_map());
        assert_eq!(engine.min_mip_map(), &[2]);
    }

    #[test]
    fn update_min_mip_map_walks_the_resident_chain() {
        let mut engine = engine(1, 1, 2, 4);
        let coarse = TileCoord::new(0, 0, 1);
        let fine = TileCoord::new(0, 0, 0);
        engine.state.increment_refcount(coarse);
        engine.state.set_resident(coarse);
        engine.state.set_resident(fine);
        engine.residency_changed.store(true, Ordering::Relaxed);

        assert!(engine.update_min_mip_map());
        assert_eq!(engine.min_mip_map(), &[0]);
    }

    #[test]
    fn min_mip_map_refines_as_coarser_mips_arrive_before_finer_ones() {
        // S2: the streamer delivers coarse-to-fine, same order queue_tiles
        // submitted them in. min_mip_map should only ever report a mip
        // once every tile of that level and everything coarser is
        // resident, never skipping ahead to a finer level still loading.
        let mut engine = engine(1, 1, 4, 4);
        let coarsest = TileCoord::new(0, 0, 3);
        let mid = TileCoord::new(0, 0, 2);
        let fine = TileCoord::new(0, 0, 1);
        let finest = TileCoord::new(0, 0, 0);

        engine.queue_feedback(feedback_all(1, 1, 0, 1));
        engine.process_feedback(FrameFenceCompleted(1));
        engine.residency_changed.store(true, Ordering::Relaxed);
        assert!(engine.update_min_mip_map());
        assert_eq!(engine.min_mip_map(), &[4], "nothing resident yet");

        engine.state.set_resident(coarsest);
        engine.residency_changed.store(true, Ordering::Relaxed);
        assert!(engine.update_min_mip_map());
        assert_eq!(engine.min_mip_map(), &[3]);

        engine.state.set_resident(mid);
        engine.residency_changed.store(true, Ordering::Relaxed);
        assert!(engine.update_min_mip_map());
        assert_eq!(engine.min_mip_map(), &[2]);

        engine.state.set_resident(fine);
        engine.residency_changed.store(true, Ordering::Relaxed);
        assert!(engine.update_min_mip_map());
        assert_eq!(engine.min_mip_map(), &[1]);

        engine.state.set_resident(finest);
        engine.residency_changed.store(true, Ordering::Relaxed);
        assert!(engine.update_min_mip_map());
        assert_eq!(engine.min_mip_map(), &[0]);
    }

    #[test]
    fn heap_pressure_drains_remaining_loads_across_cycles() {
        // S5: heap capacity 2, four tiles want to load. First cycle maps
        // only as many as the heap can back; the rest stay in
        // pending_loads until a later cycle frees pages and retries them.
        let mut engine = engine(2, 2, 1, 2);
        engine.queue_feedback(feedback_all(2, 2, 0, 1));
        engine.process_feedback(FrameFenceCompleted(1));
        assert_eq!(engine.pending_loads.len(), 4);

        let pool = FakePool::new(4);
        engine.queue_tiles(&pool);
        assert_eq!(engine.heap.num_free(), 0, "both pages handed out");
        assert_eq!(engine.pending_loads.len(), 2, "the rest wait for heap space");

        // Completion frees a page back to the allocator (as the uploader
        // would once the evicted tile's copy fence retires).
        engine.heap.free(0);
        engine.queue_tiles(&pool);
        assert_eq!(engine.heap.num_free(), 0);
        assert_eq!(engine.pending_loads.len(), 1, "one more drained once a page was free");

        engine.heap.free(1);
        engine.queue_tiles(&pool);
        assert_eq!(engine.pending_loads.len(), 0, "last one drains once the final page frees");
    }
}
