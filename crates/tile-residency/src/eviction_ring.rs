use std::collections::VecDeque;

use residency_protocol::TileCoord;

use crate::mapping_state::TileMappingState;

/// Per-frame deferred-eviction buffer of depth `F = swap_buffers + 1`.
///
/// Bucket index `0` (front) holds this frame's new candidates; the back
/// bucket holds candidates eligible for heap unmapping. A coordinate
/// appended during frame `k` becomes eligible no earlier than frame
/// `k + F - 1`: it takes `F - 1` calls to `next_frame` to walk from the
/// front bucket to the back one.
#[derive(Debug)]
pub struct EvictionDelayRing {
    buckets: VecDeque<Vec<TileCoord>>,
    depth: usize,
}

impl EvictionDelayRing {
    pub fn new(depth: u32) -> Self {
        assert!(depth >= 1, "eviction delay depth must be at least 1");
        let depth = depth as usize;
        let mut buckets = VecDeque::with_capacity(depth);
        for _ in 0..depth {
            buckets.push_back(Vec::new());
        }
        Self { buckets, depth }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Pushes `coord` onto the newest bucket.
    pub fn append(&mut self, coord: TileCoord) {
        self.buckets
            .front_mut()
            .expect("eviction ring always has at least one bucket")
            .push(coord);
    }

    /// The oldest bucket; callers mutate in place (remove what they
    /// consumed, retain what is delayed another frame).
    pub fn ready_to_evict(&mut self) -> &mut Vec<TileCoord> {
        self.buckets
            .back_mut()
            .expect("eviction ring always has at least one bucket")
    }

    /// Rotates the ring: whatever is left in the oldest bucket (entries the
    /// caller chose to retain via `ready_to_evict`) is merged into the bucket
    /// that becomes the new oldest, and a fresh empty bucket is pushed to
    /// the front.
    pub fn next_frame(&mut self) {
        let leftover = self
            .buckets
            .pop_back()
            .expect("eviction ring always has at least one bucket");
        self.buckets.push_front(Vec::new());
        if self.depth > 1 {
            self.buckets
                .back_mut()
                .expect("eviction ring always has at least one bucket")
                .extend(leftover);
        } else {
            // depth == 1: the bucket we just cleared *is* the oldest bucket,
            // so anything left over simply goes straight back in.
            self.buckets
                .front_mut()
                .expect("eviction ring always has at least one bucket")
                .extend(leftover);
        }
    }

    /// Removes from every bucket any coordinate whose refcount is now > 0:
    /// a rescued tile was going to be evicted but is wanted again.
    pub fn rescue(&mut self, state: &TileMappingState) {
        for bucket in &mut self.buckets {
            bucket.retain(|coord| state.refcount(*coord) == 0);
        }
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    #[cfg(test)]
    pub(crate) fn bucket_lens(&self) -> Vec<usize> {
        self.buckets.iter().map(Vec::len).collect()
    }

    /// Every coordinate currently sitting in any bucket, regardless of
    /// position. Used by invariant checks that need to know whether a coord
    /// is anywhere in the delay ring, not just the eligible bucket.
    #[cfg(test)]
    pub(crate) fn all_coords(&self) -> Vec<TileCoord> {
        self.buckets.iter().flatten().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping_state::{TileGridDims, TileMappingState};

    fn coord(x: u32) -> TileCoord {
        TileCoord::new(x, 0, 0)
    }

    #[test]
    fn delay_of_f_minus_one_next_frame_calls() {
        // S4: swap_buffers = 2 (F = 3). Queue an eviction at frame 10; call
        // next_frame at 11 and 12. Eligible bucket is non-empty only
        // starting at frame 12.
        let mut ring = EvictionDelayRing::new(3);
        ring.append(coord(1));
        assert!(ring.ready_to_evict().is_empty());

        ring.next_frame();
        assert!(ring.ready_to_evict().is_empty());

        ring.next_frame();
        assert_eq!(ring.ready_to_evict().len(), 1);
        assert_eq!(ring.ready_to_evict()[0], coord(1));
    }

    #[test]
    fn leftover_in_oldest_bucket_survives_rotation() {
        let mut ring = EvictionDelayRing::new(2);
        ring.append(coord(1));
        ring.next_frame();
        assert_eq!(ring.ready_to_evict().len(), 1);
        // caller retains the entry (e.g. it was Loading, delayed again)
        ring.next_frame();
        assert_eq!(
            ring.ready_to_evict().len(),
            1,
            "entry left in the oldest bucket must not be lost across rotation"
        );
    }

    #[test]
    fn depth_one_is_eligible_immediately_next_frame() {
        let mut ring = EvictionDelayRing::new(1);
        ring.append(coord(1));
        ring.next_frame();
        assert_eq!(ring.ready_to_evict().len(), 1);
    }

    #[test]
    fn rescue_drops_coords_with_nonzero_refcount() {
        let mut ring = EvictionDelayRing::new(3);
        let state = TileMappingState::new(TileGridDims::new(4, 4), 4);
        ring.append(TileCoord::new(0, 0, 0));
        ring.append(TileCoord::new(1, 0, 0));
        state.increment_refcount(TileCoord::new(1, 0, 0));

        ring.rescue(&state);

        assert_eq!(ring.bucket_lens()[0], 1);
    }

    #[test]
    fn clear_drops_every_bucket() {
        let mut ring = EvictionDelayRing::new(3);
        ring.append(coord(1));
        ring.next_frame();
        ring.append(coord(2));
        ring.clear();
        assert!(ring.bucket_lens().iter().all(|len| *len == 0));
    }
}
