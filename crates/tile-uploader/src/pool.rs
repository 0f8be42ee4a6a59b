use std::sync::Arc;
use std::sync::mpsc::SyncSender;

use residency_protocol::ResourceId;
use tile_residency::{UpdateList, UpdateListPool};

/// Fixed-capacity pool of `UpdateList` slots (`max_copy_batches`), shared by
/// every resource registered with one `DataUploader`. Allocation is a
/// rotating-index CAS probe rather than a stack like `HeapAllocator`'s,
/// since slots aren't fungible the way heap pages are: a slot that was just
/// freed shouldn't be handed straight back out before the submit thread has
/// had a chance to see other slots idle too.
pub struct UpdateListSlots {
    slots: Vec<Arc<UpdateList>>,
    next_probe: std::sync::atomic::AtomicUsize,
    wake: SyncSender<()>,
}

impl UpdateListSlots {
    pub fn new(capacity: usize, wake: SyncSender<()>) -> Self {
        assert!(capacity > 0, "update list pool needs at least one slot");
        Self {
            slots: (0..capacity).map(|_| Arc::new(UpdateList::new())).collect(),
            next_probe: std::sync::atomic::AtomicUsize::new(0),
            wake,
        }
    }

    pub fn slots(&self) -> &[Arc<UpdateList>] {
        &self.slots
    }
}

impl UpdateListPool for UpdateListSlots {
    fn allocate(&self, resource: ResourceId) -> Option<Arc<UpdateList>> {
        let len = self.slots.len();
        let start = self.next_probe.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % len;
        for offset in 0..len {
            let index = (start + offset) % len;
            if self.slots[index].try_allocate(resource) {
                return Some(self.slots[index].clone());
            }
        }
        None
    }

    fn wake_submit_thread(&self) {
        let _ = self.wake.try_send(());
    }
}
