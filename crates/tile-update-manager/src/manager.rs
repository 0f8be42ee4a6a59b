use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use residency_protocol::{BackendError, EngineConfig, FrameFenceCompleted, ResourceId};
use tile_residency::{FeedbackBuffer, HeapAllocator, ResidencyEngine, TileGridDims, TileMappingState};
use tile_uploader::{DataUploader, MappingBackend, TileStreamer};
use tracing::debug;

use crate::residency_buffer::{FrameCommand, ResidencyBuffer, ResidencyBufferDescriptor, ResourceRegion};
use crate::resource::{ManagedResource, StreamingResourceHandle};

/// Worker thread wakeup cadence when nothing signals it sooner (§4.7.x
/// EXPANSION).
const DEFAULT_WORKER_TICK: Duration = Duration::from_millis(2);

/// Output of `begin_frame`: the residency buffer snapshot the renderer
/// binds for shader sampling, and the clear/resolve command lists it must
/// execute before and after the frame's draw calls (§6).
#[derive(Debug, Clone)]
pub struct BeginFrameOutput {
    pub residency_buffer: ResidencyBufferDescriptor,
    pub pre_draw_commands: Vec<FrameCommand>,
    pub post_draw_commands: Vec<FrameCommand>,
}

/// A `MappingBackend`/`TileStreamer` reported a condition the engine cannot
/// absorb as deferred queue state (§7): device loss, or a fence wait the
/// backend itself gave up on. Surfaced from `finish()` once the pipeline
/// has drained as far as it can.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFatalError(pub BackendError);

impl fmt::Display for EngineFatalError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "tile update manager stopped on a fatal backend error: {}", self.0)
    }
}

impl std::error::Error for EngineFatalError {}

/// C7. Aggregates every registered `StreamingResource`'s `ResidencyEngine`,
/// owns the shared residency buffer, and hosts the worker thread that
/// repeatedly drives `process_feedback`/`queue_tiles` across all of them
/// (§4.7).
pub struct TileUpdateManager {
    #[allow(dead_code)]
    config: EngineConfig,
    #[allow(dead_code)]
    heap: Arc<HeapAllocator>,
    uploader: Arc<DataUploader>,
    resources: Arc<Mutex<HashMap<ResourceId, Arc<ManagedResource>>>>,
    residency_buffer: Arc<Mutex<ResidencyBuffer>>,
    next_resource_id: AtomicU32,
    frame_fence_completed: Arc<AtomicU64>,
    stop_requested: Arc<AtomicBool>,
    worker_wake: SyncSender<()>,
    worker_thread: Option<std::thread::JoinHandle<()>>,
}

impl TileUpdateManager {
    pub fn new(config: EngineConfig, backend: Arc<dyn MappingBackend>, streamer: Arc<dyn TileStreamer>) -> Self {
        Self::with_worker_tick(config, backend, streamer, DEFAULT_WORKER_TICK)
    }

    /// Same as [`Self::new`] but with an explicit worker wakeup cadence,
    /// for tests that want the pipeline to settle faster than the 2ms
    /// production default.
    pub fn with_worker_tick(
        config: EngineConfig,
        backend: Arc<dyn MappingBackend>,
        streamer: Arc<dyn TileStreamer>,
        tick: Duration,
    ) -> Self {
        let heap = Arc::new(HeapAllocator::new(config.heap_capacity_pages));
        let uploader = Arc::new(DataUploader::start(config, backend, streamer));
        let resources: Arc<Mutex<HashMap<ResourceId, Arc<ManagedResource>>>> = Arc::new(Mutex::new(HashMap::new()));
        let residency_buffer = Arc::new(Mutex::new(ResidencyBuffer::new()));
        let frame_fence_completed = Arc::new(AtomicU64::new(0));
        let stop_requested = Arc::new(AtomicBool::new(false));
        let (worker_wake, wake_rx) = mpsc::sync_channel(1);

        let worker_thread = {
            let resources = resources.clone();
            let uploader = uploader.clone();
            let frame_fence_completed = frame_fence_completed.clone();
            let stop_requested = stop_requested.clone();
            std::thread::Builder::new()
                .name("tile-update-manager-worker".to_owned())
                .spawn(move || worker_loop(resources, uploader, frame_fence_completed, stop_requested, wake_rx, tick))
                .expect("spawn tile update manager worker thread")
        };

        Self {
            config,
            heap,
            uploader,
            resources,
            residency_buffer,
            next_resource_id: AtomicU32::new(1),
            frame_fence_completed,
            stop_requested,
            worker_wake,
            worker_thread: Some(worker_thread),
        }
    }

    /// Registers a new streaming resource, reserving its slice of the
    /// residency buffer and seeding it at `mip_count` ("only packed mips
    /// resident") per §4.7.
    pub fn create_streaming_resource(&self, dims: TileGridDims, mip_count: u8) -> StreamingResourceHandle {
        let id = ResourceId(self.next_resource_id.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(TileMappingState::new(dims, mip_count));
        let engine = ResidencyEngine::new(id, self.config, state.clone(), self.heap.clone());
        let residency_changed = engine.residency_changed_flag();

        let region_count = (dims.width_tiles as usize) * (dims.height_tiles as usize);
        let region_offset = self.residency_buffer.lock().expect("residency buffer mutex poisoned").reserve_region(
            region_count,
            mip_count,
        );
        let needs_transition = Arc::new(AtomicBool::new(false));

        self.uploader.register_resource(id, state.clone(), residency_changed.clone());

        let managed = Arc::new(ManagedResource {
            engine: Mutex::new(engine),
            state,
            residency_changed,
            region_offset,
            region_count,
            needs_transition: needs_transition.clone(),
            packed_transition_armed: AtomicBool::new(false),
        });
        self.resources.lock().expect("resource registry mutex poisoned").insert(id, managed);
        self.wake_worker();

        debug!(resource = id.0, region_count, mip_count, "registered streaming resource");

        StreamingResourceHandle { id, dims, mip_count, needs_transition }
    }

    /// Drops a resource from the aggregator, returning its heap allocations
    /// and unregistering it from the uploader. Must only be called outside
    /// a frame boundary, after `finish()` has drained the pipeline (§3
    /// Lifecycle summary).
    pub fn destroy_streaming_resource(&self, resource: ResourceId) {
        let Some(managed) = self.resources.lock().expect("resource registry mutex poisoned").remove(&resource)
        else {
            return;
        };
        managed.state.free_heap_allocations(&self.heap);
        self.uploader.unregister_resource(resource);
    }

    /// Records a resolved feedback buffer for `resource` (§6
    /// `queue_feedback`), called from the render thread.
    pub fn queue_feedback(&self, resource: ResourceId, buffer: FeedbackBuffer) {
        let resources = self.resources.lock().expect("resource registry mutex poisoned");
        if let Some(managed) = resources.get(&resource) {
            managed.engine.lock().expect("residency engine mutex poisoned").queue_feedback(buffer);
        }
        drop(resources);
        self.wake_worker();
    }

    /// Requests every resident tile of `resource` be queued for eviction,
    /// e.g. because the owning object was culled (§4.4.1 step 1).
    pub fn request_evict_all(&self, resource: ResourceId) {
        let resources = self.resources.lock().expect("resource registry mutex poisoned");
        if let Some(managed) = resources.get(&resource) {
            managed.engine.lock().expect("residency engine mutex poisoned").request_evict_all();
        }
        drop(resources);
        self.wake_worker();
    }

    /// Forces `update_min_mip_map` to re-run for `resource` on the next
    /// `end_frame`, even without a fresh residency transition. Exposed for
    /// callers who mutate residency state outside the normal feedback path.
    pub fn set_residency_changed(&self, resource: ResourceId) {
        let resources = self.resources.lock().expect("resource registry mutex poisoned");
        if let Some(managed) = resources.get(&resource) {
            managed.residency_changed.store(true, Ordering::Release);
        }
    }

    /// True once `resource`'s packed-mip bootstrap has completed and it is
    /// safe to sample (§4.6).
    pub fn is_ready_to_sample(&self, resource: ResourceId) -> bool {
        self.uploader.is_packed_ready(resource)
    }

    /// Publishes a snapshot of the residency buffer and the clear/resolve
    /// command lists the renderer must execute around this frame's draws
    /// (§6).
    pub fn begin_frame(&self) -> BeginFrameOutput {
        let resources = self.resources.lock().expect("resource registry mutex poisoned");
        let buffer = self.residency_buffer.lock().expect("residency buffer mutex poisoned");

        let mut regions = Vec::with_capacity(resources.len());
        let mut pre_draw = Vec::with_capacity(resources.len());
        let mut post_draw = Vec::with_capacity(resources.len());
        for (&id, managed) in resources.iter() {
            regions.push(ResourceRegion { resource: id, offset: managed.region_offset, len: managed.region_count });
            pre_draw.push(FrameCommand::ClearFeedbackTarget { resource: id });
            post_draw.push(FrameCommand::ResolveFeedback { resource: id });
        }

        BeginFrameOutput {
            residency_buffer: ResidencyBufferDescriptor { bytes: buffer.bytes().to_vec(), regions },
            pre_draw_commands: pre_draw,
            post_draw_commands: post_draw,
        }
    }

    /// Advances every resource's `EvictionDelayRing` and re-publishes its
    /// min-mip map where residency changed (§4.4.6, §4.7). Also arms the
    /// one-shot packed-bootstrap transition flag the first time a resource
    /// becomes ready to sample.
    pub fn end_frame(&self, frame_fence: FrameFenceCompleted) {
        self.frame_fence_completed.store(frame_fence.0, Ordering::Release);

        let resources = self.resources.lock().expect("resource registry mutex poisoned");
        let mut buffer = self.residency_buffer.lock().expect("residency buffer mutex poisoned");
        for (&id, managed) in resources.iter() {
            {
                let mut engine = managed.engine.lock().expect("residency engine mutex poisoned");
                engine.next_frame();
                if engine.update_min_mip_map() {
                    buffer.publish(managed.region_offset, engine.min_mip_map());
                }
            }
            if self.uploader.is_packed_ready(id) && !managed.packed_transition_armed.swap(true, Ordering::AcqRel) {
                managed.needs_transition.store(true, Ordering::Release);
            }
        }
        drop(buffer);
        drop(resources);
        self.wake_worker();
    }

    /// Blocks until every `UpdateList` has returned to the pool, i.e. all
    /// in-flight work has drained (§5 Suspension/blocking). Returns the
    /// fatal backend error, if one stopped the uploader's worker threads.
    pub fn finish(&self) -> Result<(), EngineFatalError> {
        loop {
            if let Some(error) = self.uploader.fatal_error() {
                return Err(EngineFatalError(error));
            }
            let all_free = self
                .uploader
                .pool()
                .slots()
                .iter()
                .all(|slot| slot.state() == tile_residency::UpdateListState::Free);
            if all_free {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn wake_worker(&self) {
        let _ = self.worker_wake.try_send(());
    }
}

impl Drop for TileUpdateManager {
    fn drop(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
        self.wake_worker();
        if let Some(handle) = self.worker_thread.take() {
            handle.join().expect("join tile update manager worker thread");
        }
    }
}

fn worker_loop(
    resources: Arc<Mutex<HashMap<ResourceId, Arc<ManagedResource>>>>,
    uploader: Arc<DataUploader>,
    frame_fence_completed: Arc<AtomicU64>,
    stop_requested: Arc<AtomicBool>,
    wake: Receiver<()>,
    tick: Duration,
) {
    while !stop_requested.load(Ordering::Acquire) {
        let fence = FrameFenceCompleted(frame_fence_completed.load(Ordering::Acquire));
        let snapshot: Vec<Arc<ManagedResource>> =
            resources.lock().expect("resource registry mutex poisoned").values().cloned().collect();

        for managed in &snapshot {
            let mut engine = managed.engine.lock().expect("residency engine mutex poisoned");
            engine.process_feedback(fence);
            engine.queue_tiles(uploader.pool().as_ref());
        }

        if uploader.fatal_error().is_some() {
            stop_requested.store(true, Ordering::Release);
            return;
        }

        let _ = wake.recv_timeout(tick);
    }
}
