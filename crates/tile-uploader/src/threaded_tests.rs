//! End-to-end tests of `DataUploader`'s worker threads against the
//! `fakes` backend/streamer, driving a real `ResidencyEngine` rather than
//! poking `UpdateList` state transitions directly.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use pretty_assertions::assert_eq;
    use residency_protocol::{BackendError, CopyTicket, EngineConfig, FrameFenceCompleted, RenderFence, ResourceId};
    use tile_residency::{HeapAllocator, LoadEntry, ResidencyEngine, TileGridDims, TileMappingState, UpdateListState};

    use crate::backend::TileStreamer;
    use crate::fakes::{ImmediateBackend, ImmediateStreamer};
    use crate::uploader::DataUploader;

    /// Records every `stream_copies`/`stream_packed_bootstrap` call instead
    /// of just completing instantly, so tests can assert which one the
    /// uploader actually reached for.
    #[derive(Default)]
    struct RecordingStreamer {
        next_ticket: AtomicU64,
        copy_batch_sizes: Mutex<Vec<usize>>,
        bootstrap_calls: AtomicUsize,
    }

    impl TileStreamer for RecordingStreamer {
        fn stream_copies(&self, loads: &[LoadEntry]) -> Result<CopyTicket, BackendError> {
            self.copy_batch_sizes.lock().expect("mutex poisoned").push(loads.len());
            Ok(CopyTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed)))
        }

        fn stream_packed_bootstrap(&self, _resource: ResourceId) -> Result<CopyTicket, BackendError> {
            self.bootstrap_calls.fetch_add(1, Ordering::Relaxed);
            Ok(CopyTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed)))
        }

        fn poll_ticket(&self, _ticket: CopyTicket) -> Result<bool, BackendError> {
            Ok(true)
        }
    }

    fn spin_until(mut predicate: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !predicate() {
            assert!(Instant::now() < deadline, "condition did not become true in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn pool_is_fully_free(uploader: &DataUploader) -> bool {
        uploader.pool().slots().iter().all(|slot| slot.state() == UpdateListState::Free)
    }

    #[test]
    fn cold_load_reaches_resident_and_marks_the_resource_packed_ready() {
        let config = EngineConfig::new(2);
        let uploader =
            DataUploader::start(config, Arc::new(ImmediateBackend::default()), Arc::new(ImmediateStreamer::default()));

        let heap = Arc::new(HeapAllocator::new(config.heap_capacity_pages));
        let state = Arc::new(TileMappingState::new(TileGridDims::new(1, 1), 1));
        let mut engine = ResidencyEngine::new(ResourceId(1), config, state.clone(), heap);
        uploader.register_resource(ResourceId(1), state.clone(), engine.residency_changed_flag());

        engine.queue_feedback(tile_residency::FeedbackBuffer { render_fence: RenderFence(1), regions: vec![0] });
        engine.process_feedback(FrameFenceCompleted(1));
        engine.queue_tiles(uploader.pool().as_ref());

        spin_until(|| pool_is_fully_free(&uploader));
        spin_until(|| uploader.is_packed_ready(ResourceId(1)));

        assert_eq!(state.residency(residency_protocol::TileCoord::new(0, 0, 0)), residency_protocol::Residency::Resident);
        assert!(uploader.fatal_error().is_none());
    }

    #[test]
    fn packed_bootstrap_labeled_list_still_copies_its_real_tile_data() {
        // The list the uploader marks as a resource's packed-mip bootstrap
        // is, in practice, its first load-bearing batch of real
        // standard-mip tiles. That tile data must go through the same
        // `stream_copies` path any other load batch does, not
        // `stream_packed_bootstrap` (which copies no tile data at all).
        let config = EngineConfig::new(2);
        let streamer = Arc::new(RecordingStreamer::default());
        let uploader = DataUploader::start(config, Arc::new(ImmediateBackend::default()), streamer.clone());

        let heap = Arc::new(HeapAllocator::new(config.heap_capacity_pages));
        let state = Arc::new(TileMappingState::new(TileGridDims::new(1, 1), 1));
        let mut engine = ResidencyEngine::new(ResourceId(1), config, state.clone(), heap);
        uploader.register_resource(ResourceId(1), state.clone(), engine.residency_changed_flag());

        engine.queue_feedback(tile_residency::FeedbackBuffer { render_fence: RenderFence(1), regions: vec![0] });
        engine.process_feedback(FrameFenceCompleted(1));
        engine.queue_tiles(uploader.pool().as_ref());

        spin_until(|| pool_is_fully_free(&uploader));
        spin_until(|| uploader.is_packed_ready(ResourceId(1)));

        assert_eq!(
            streamer.copy_batch_sizes.lock().expect("mutex poisoned").as_slice(),
            &[1],
            "the bootstrap-labeled list's one real tile load must be copied via stream_copies"
        );
        assert_eq!(
            streamer.bootstrap_calls.load(Ordering::Relaxed),
            0,
            "stream_packed_bootstrap must not stand in for copying real tile data"
        );
        assert_eq!(state.residency(residency_protocol::TileCoord::new(0, 0, 0)), residency_protocol::Residency::Resident);
    }

    #[test]
    fn unregistered_resource_completion_does_not_panic_the_worker_threads() {
        let config = EngineConfig::new(2);
        let uploader =
            DataUploader::start(config, Arc::new(ImmediateBackend::default()), Arc::new(ImmediateStreamer::default()));

        let heap = Arc::new(HeapAllocator::new(config.heap_capacity_pages));
        let state = Arc::new(TileMappingState::new(TileGridDims::new(1, 1), 1));
        let mut engine = ResidencyEngine::new(ResourceId(7), config, state.clone(), heap);
        // Deliberately never registered with `uploader`.

        engine.queue_feedback(tile_residency::FeedbackBuffer { render_fence: RenderFence(1), regions: vec![0] });
        engine.process_feedback(FrameFenceCompleted(1));
        engine.queue_tiles(uploader.pool().as_ref());

        spin_until(|| pool_is_fully_free(&uploader));
        assert!(uploader.fatal_error().is_none());
    }
}
