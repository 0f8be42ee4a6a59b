use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use residency_protocol::{BackendError, EngineConfig, ResourceId};
use tile_residency::{TileMappingState, UpdateList, UpdateListState};
use tracing::{debug, error, warn};

use crate::backend::{MappingBackend, TileStreamer};
use crate::pool::UpdateListSlots;

const IDLE_SLEEP_DURATION: Duration = Duration::from_millis(1);

#[derive(Clone)]
struct ResourceHandles {
    state: Arc<TileMappingState>,
    residency_changed: Arc<AtomicBool>,
}

/// C6. Owns the `UpdateList` pool and the two worker threads that drive it
/// through the submit backend and streamer (§4.5). `ResidencyEngine`s never
/// touch the GPU; they ask this for slots via [`tile_residency::UpdateListPool`]
/// and this delivers terminal residency notifications back onto the
/// `TileMappingState` once the device confirms the work.
pub struct DataUploader {
    pool: Arc<UpdateListSlots>,
    resources: Arc<Mutex<HashMap<ResourceId, ResourceHandles>>>,
    packed_ready: Arc<Mutex<HashSet<ResourceId>>>,
    stop_requested: Arc<AtomicBool>,
    fatal_error: Arc<OnceLock<BackendError>>,
    submit_wake: SyncSender<()>,
    submit_thread: Option<std::thread::JoinHandle<()>>,
    completion_thread: Option<std::thread::JoinHandle<()>>,
}

impl DataUploader {
    pub fn start(
        config: EngineConfig,
        backend: Arc<dyn MappingBackend>,
        streamer: Arc<dyn TileStreamer>,
    ) -> Self {
        let (submit_wake, submit_wake_rx) = mpsc::sync_channel(1);
        let pool = Arc::new(UpdateListSlots::new(config.max_copy_batches as usize, submit_wake.clone()));
        let resources = Arc::new(Mutex::new(HashMap::new()));
        let packed_ready = Arc::new(Mutex::new(HashSet::<ResourceId>::new()));
        let stop_requested = Arc::new(AtomicBool::new(false));
        let fatal_error = Arc::new(OnceLock::new());
        let bootstrapped = Arc::new(Mutex::new(std::collections::HashSet::<ResourceId>::new()));

        let submit_thread = {
            let pool = pool.clone();
            let stop_requested = stop_requested.clone();
            let fatal_error = fatal_error.clone();
            let backend = backend.clone();
            let bootstrapped = bootstrapped.clone();
            let max_chunk = config.max_tile_mapping_updates_per_api_call;
            std::thread::Builder::new()
                .name("tile-uploader-submit".to_owned())
                .spawn(move || {
                    submit_loop(pool, stop_requested, fatal_error, backend, bootstrapped, submit_wake_rx, max_chunk)
                })
                .expect("spawn tile uploader submit thread")
        };

        let completion_thread = {
            let pool = pool.clone();
            let resources = resources.clone();
            let packed_ready = packed_ready.clone();
            let stop_requested = stop_requested.clone();
            let fatal_error = fatal_error.clone();
            std::thread::Builder::new()
                .name("tile-uploader-completion".to_owned())
                .spawn(move || {
                    completion_loop(pool, resources, packed_ready, stop_requested, fatal_error, backend, streamer)
                })
                .expect("spawn tile uploader completion thread")
        };

        Self {
            pool,
            resources,
            packed_ready,
            stop_requested,
            fatal_error,
            submit_wake,
            submit_thread: Some(submit_thread),
            completion_thread: Some(completion_thread),
        }
    }

    pub fn register_resource(
        &self,
        resource: ResourceId,
        state: Arc<TileMappingState>,
        residency_changed: Arc<AtomicBool>,
    ) {
        self.resources
            .lock()
            .expect("resource registry mutex poisoned")
            .insert(resource, ResourceHandles { state, residency_changed });
    }

    pub fn unregister_resource(&self, resource: ResourceId) {
        self.resources.lock().expect("resource registry mutex poisoned").remove(&resource);
    }

    pub fn pool(&self) -> Arc<UpdateListSlots> {
        self.pool.clone()
    }

    /// The backend/streamer error that stopped both worker threads, if any.
    pub fn fatal_error(&self) -> Option<BackendError> {
        self.fatal_error.get().cloned()
    }

    /// True once `resource`'s packed-mip bootstrap UpdateList (§4.6) has
    /// reached `Free`: its mapping and copy fences are both satisfied, so
    /// the resource's always-resident footprint is in the heap and it may
    /// be considered for drawing.
    pub fn is_packed_ready(&self, resource: ResourceId) -> bool {
        self.packed_ready.lock().expect("packed-ready set mutex poisoned").contains(&resource)
    }

    fn wake_submit_thread(&self) {
        let _ = self.submit_wake.try_send(());
    }
}

impl Drop for DataUploader {
    fn drop(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
        self.wake_submit_thread();
        if let Some(handle) = self.submit_thread.take() {
            handle.join().expect("join tile uploader submit thread");
        }
        if let Some(handle) = self.completion_thread.take() {
            handle.join().expect("join tile uploader completion thread");
        }
    }
}

fn submit_loop(
    pool: Arc<UpdateListSlots>,
    stop_requested: Arc<AtomicBool>,
    fatal_error: Arc<OnceLock<BackendError>>,
    backend: Arc<dyn MappingBackend>,
    bootstrapped: Arc<Mutex<std::collections::HashSet<ResourceId>>>,
    wake: Receiver<()>,
    max_chunk: u32,
) {
    while !stop_requested.load(Ordering::Acquire) {
        let mut did_work = false;
        for list in pool.slots() {
            if list.state() != UpdateListState::Submitted {
                continue;
            }
            did_work = true;
            let Some(resource) = list.resource() else {
                continue;
            };
            let loads = list.loads();
            let evicts = list.evicts();

            let is_bootstrap = !loads.is_empty() && {
                let mut seen = bootstrapped.lock().expect("bootstrapped set mutex poisoned");
                seen.insert(resource)
            };

            let fence = match map_in_chunks(backend.as_ref(), &loads, &evicts, max_chunk.max(1)) {
                Ok(fence) => fence,
                Err(error) => {
                    error!(?error, "mapping backend reported a fatal error");
                    let _ = fatal_error.set(error);
                    stop_requested.store(true, Ordering::Release);
                    return;
                }
            };

            if is_bootstrap {
                debug!(resource = resource.0, "submitting packed-mip bootstrap mapping");
                list.begin_packed_mapping(fence);
            } else if loads.is_empty() {
                list.begin_copy_pending_evict_only(fence);
            } else {
                list.begin_uploading(fence);
            }
        }

        if !did_work {
            let _ = wake.recv_timeout(IDLE_SLEEP_DURATION);
        }
    }
}

fn map_in_chunks(
    backend: &dyn MappingBackend,
    loads: &[tile_residency::LoadEntry],
    evicts: &[residency_protocol::TileCoord],
    max_chunk: u32,
) -> Result<residency_protocol::MappingFence, BackendError> {
    let max_chunk = max_chunk as usize;
    let total = loads.len() + evicts.len();
    if total <= max_chunk {
        return backend.map_tiles(loads, evicts);
    }

    warn!(total, max_chunk, "splitting mapping batch across multiple backend calls");
    let mut fence = None;
    for load_chunk in loads.chunks(max_chunk.max(1)) {
        fence = Some(backend.map_tiles(load_chunk, &[])?);
    }
    for evict_chunk in evicts.chunks(max_chunk.max(1)) {
        fence = Some(backend.map_tiles(&[], evict_chunk)?);
    }
    Ok(fence.expect("chunked batch must issue at least one backend call"))
}

fn completion_loop(
    pool: Arc<UpdateListSlots>,
    resources: Arc<Mutex<HashMap<ResourceId, ResourceHandles>>>,
    packed_ready: Arc<Mutex<HashSet<ResourceId>>>,
    stop_requested: Arc<AtomicBool>,
    fatal_error: Arc<OnceLock<BackendError>>,
    backend: Arc<dyn MappingBackend>,
    streamer: Arc<dyn TileStreamer>,
) {
    while !stop_requested.load(Ordering::Acquire) {
        let mut did_work = false;
        for list in pool.slots() {
            match list.state() {
                UpdateListState::PackedMapping => {
                    did_work |= advance_packed_mapping(list, &backend, &streamer, &fatal_error, &stop_requested);
                }
                UpdateListState::Uploading => {
                    did_work |= advance_uploading(list, &backend, &streamer, &fatal_error, &stop_requested);
                }
                UpdateListState::CopyPending => {
                    did_work |= advance_copy_pending(
                        list,
                        &resources,
                        &packed_ready,
                        &backend,
                        &streamer,
                        &fatal_error,
                        &stop_requested,
                    );
                }
                _ => {}
            }
        }
        if !did_work {
            std::thread::sleep(IDLE_SLEEP_DURATION);
        }
    }
}

fn report_fatal(error: BackendError, fatal_error: &OnceLock<BackendError>, stop_requested: &AtomicBool) {
    error!(?error, "tile streamer reported a fatal error");
    let _ = fatal_error.set(error);
    stop_requested.store(true, Ordering::Release);
}

fn advance_packed_mapping(
    list: &Arc<UpdateList>,
    backend: &Arc<dyn MappingBackend>,
    streamer: &Arc<dyn TileStreamer>,
    fatal_error: &OnceLock<BackendError>,
    stop_requested: &AtomicBool,
) -> bool {
    let Some(resource) = list.resource() else { return false };
    let Some(fence) = list.mapping_fence() else { return false };
    match backend.poll_fence(fence) {
        Ok(true) => {}
        Ok(false) => return false,
        Err(error) => {
            report_fatal(error, fatal_error, stop_requested);
            return false;
        }
    }
    // The list labeled as this resource's packed-mip bootstrap is, in
    // practice, its first load-bearing batch of real standard-mip tiles
    // (`submit_loop` only marks a list bootstrap when it carries loads).
    // Those tiles still need their actual pixel data copied like any other
    // load — `stream_packed_bootstrap` only signals "resource ready to
    // sample" and copies no tile data, so it must never stand in for
    // `stream_copies` when the list has loads to carry.
    let loads = list.loads();
    let result = if loads.is_empty() {
        streamer.stream_packed_bootstrap(resource)
    } else {
        streamer.stream_copies(&loads)
    };
    match result {
        Ok(ticket) => {
            list.packed_mapping_to_uploading(ticket);
            true
        }
        Err(error) => {
            report_fatal(error, fatal_error, stop_requested);
            false
        }
    }
}

fn advance_uploading(
    list: &Arc<UpdateList>,
    backend: &Arc<dyn MappingBackend>,
    streamer: &Arc<dyn TileStreamer>,
    fatal_error: &OnceLock<BackendError>,
    stop_requested: &AtomicBool,
) -> bool {
    if let Some(ticket) = list.copy_ticket() {
        // Packed path: the copy was already issued on the PackedMapping ->
        // Uploading transition; just fold into CopyPending.
        list.begin_copy_pending(ticket);
        return true;
    }
    let Some(fence) = list.mapping_fence() else { return false };
    match backend.poll_fence(fence) {
        Ok(true) => {}
        Ok(false) => return false,
        Err(error) => {
            report_fatal(error, fatal_error, stop_requested);
            return false;
        }
    }
    let loads = list.loads();
    match streamer.stream_copies(&loads) {
        Ok(ticket) => {
            list.begin_copy_pending(ticket);
            true
        }
        Err(error) => {
            report_fatal(error, fatal_error, stop_requested);
            false
        }
    }
}

fn advance_copy_pending(
    list: &Arc<UpdateList>,
    resources: &Mutex<HashMap<ResourceId, ResourceHandles>>,
    packed_ready: &Mutex<HashSet<ResourceId>>,
    backend: &Arc<dyn MappingBackend>,
    streamer: &Arc<dyn TileStreamer>,
    fatal_error: &OnceLock<BackendError>,
    stop_requested: &AtomicBool,
) -> bool {
    let Some(ticket) = list.copy_ticket() else {
        // Evict-only list (§4.5.1): no streamer copy was ever issued, so
        // the fence recorded on submit *is* the thing to wait on.
        let Some(fence) = list.mapping_fence() else { return false };
        return match backend.poll_fence(fence) {
            Ok(true) => {
                deliver_notifications(list, resources, packed_ready);
                list.release_to_pool();
                true
            }
            Ok(false) => false,
            Err(error) => {
                report_fatal(error, fatal_error, stop_requested);
                false
            }
        };
    };
    match streamer.poll_ticket(ticket) {
        Ok(true) => {
            deliver_notifications(list, resources, packed_ready);
            list.release_to_pool();
            true
        }
        Ok(false) => false,
        Err(error) => {
            report_fatal(error, fatal_error, stop_requested);
            false
        }
    }
}

fn deliver_notifications(
    list: &Arc<UpdateList>,
    resources: &Mutex<HashMap<ResourceId, ResourceHandles>>,
    packed_ready: &Mutex<HashSet<ResourceId>>,
) {
    let Some(resource) = list.resource() else { return };
    if list.is_packed_mapping() {
        packed_ready.lock().expect("packed-ready set mutex poisoned").insert(resource);
        debug!(resource = resource.0, "packed-mip bootstrap complete, resource ready to sample");
    }
    let resources = resources.lock().expect("resource registry mutex poisoned");
    let Some(handles) = resources.get(&resource) else {
        warn!(resource = resource.0, "completion for unregistered resource, dropping notifications");
        return;
    };
    for entry in list.loads() {
        handles.state.set_resident(entry.coord);
    }
    for coord in list.evicts() {
        handles.state.set_not_resident(coord);
    }
    handles.residency_changed.store(true, Ordering::Release);
}
