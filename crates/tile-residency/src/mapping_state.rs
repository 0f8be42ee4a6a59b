use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use residency_protocol::{Residency, TileCoord, INVALID_HEAP_INDEX};

use crate::heap::HeapAllocator;

/// Tile grid dimensions at the finest (mip 0) level. Coarser mips derive
/// their own extents by halving (rounding up) this per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGridDims {
    pub width_tiles: u32,
    pub height_tiles: u32,
}

impl TileGridDims {
    pub const fn new(width_tiles: u32, height_tiles: u32) -> Self {
        Self {
            width_tiles,
            height_tiles,
        }
    }

    fn mip_extent(self, s: u8) -> (u32, u32) {
        let shift = s as u32;
        let width = self.width_tiles.div_ceil(1 << shift).max(1);
        let height = self.height_tiles.div_ceil(1 << shift).max(1);
        (width, height)
    }
}

/// Per-resource 2-D grids of `{refcount, heap_index, residency}`, one grid
/// per standard (unpacked) mip `0..mip_count`, stored as three flat
/// buffers with per-mip offsets rather than nested vectors, for
/// cache-friendly access without double indirection.
///
/// `residency` is written by the completion worker (terminal states) and
/// the feedback thread (transient states); those writers never race
/// because the transient write gates the terminal one. `refcount` and
/// `heap_index` are written only by the feedback thread. All three are
/// plain atomics with relaxed ordering: single-writer-at-a-time, multiple
/// readers observing a consistent snapshot per cell.
#[derive(Debug)]
pub struct TileMappingState {
    dims: TileGridDims,
    mip_count: u8,
    mip_offsets: Vec<usize>,
    mip_widths: Vec<u32>,
    refcount: Vec<AtomicU32>,
    heap_index: Vec<AtomicU32>,
    residency: Vec<AtomicU8>,
}

impl TileMappingState {
    pub fn new(dims: TileGridDims, mip_count: u8) -> Self {
        assert!(mip_count >= 1, "a streaming resource needs at least one standard mip");
        let mut mip_offsets = Vec::with_capacity(mip_count as usize);
        let mut mip_widths = Vec::with_capacity(mip_count as usize);
        let mut total = 0usize;
        for s in 0..mip_count {
            let (width, height) = dims.mip_extent(s);
            mip_offsets.push(total);
            mip_widths.push(width);
            total += (width as usize) * (height as usize);
        }
        Self {
            dims,
            mip_count,
            mip_offsets,
            mip_widths,
            refcount: (0..total).map(|_| AtomicU32::new(0)).collect(),
            heap_index: (0..total).map(|_| AtomicU32::new(INVALID_HEAP_INDEX)).collect(),
            residency: (0..total).map(|_| AtomicU8::new(Residency::NotResident.tag())).collect(),
        }
    }

    pub fn dims(&self) -> TileGridDims {
        self.dims
    }

    pub fn mip_count(&self) -> u8 {
        self.mip_count
    }

    pub fn mip_width(&self, s: u8) -> u32 {
        self.mip_widths[s as usize]
    }

    pub fn mip_height(&self, s: u8) -> u32 {
        let (_, height) = self.dims.mip_extent(s);
        height
    }

    fn index(&self, coord: TileCoord) -> usize {
        debug_assert!(coord.s < self.mip_count, "subresource out of range");
        let width = self.mip_widths[coord.s as usize];
        debug_assert!(coord.x < width, "tile x out of range for mip {}", coord.s);
        self.mip_offsets[coord.s as usize] + (coord.y as usize) * (width as usize) + coord.x as usize
    }

    pub fn residency(&self, coord: TileCoord) -> Residency {
        Residency::from_tag(self.residency[self.index(coord)].load(Ordering::Relaxed))
    }

    fn set_residency(&self, coord: TileCoord, residency: Residency) {
        self.residency[self.index(coord)].store(residency.tag(), Ordering::Relaxed);
    }

    pub fn set_resident(&self, coord: TileCoord) {
        self.set_residency(coord, Residency::Resident);
    }

    pub fn set_not_resident(&self, coord: TileCoord) {
        self.set_residency(coord, Residency::NotResident);
    }

    pub fn set_loading(&self, coord: TileCoord) {
        self.set_residency(coord, Residency::Loading);
    }

    pub fn set_evicting(&self, coord: TileCoord) {
        self.set_residency(coord, Residency::Evicting);
    }

    pub fn refcount(&self, coord: TileCoord) -> u32 {
        self.refcount[self.index(coord)].load(Ordering::Relaxed)
    }

    /// Increments the refcount and returns the value it held before the
    /// increment (so callers can detect the 0 -> 1 transition).
    pub fn increment_refcount(&self, coord: TileCoord) -> u32 {
        self.refcount[self.index(coord)].fetch_add(1, Ordering::Relaxed)
    }

    /// Decrements the refcount and returns the value it held before the
    /// decrement (so callers can detect the 1 -> 0 transition).
    pub fn decrement_refcount(&self, coord: TileCoord) -> u32 {
        let index = self.index(coord);
        let previous = self.refcount[index].fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "refcount underflow at {coord}");
        previous
    }

    pub fn heap_index(&self, coord: TileCoord) -> u32 {
        self.heap_index[self.index(coord)].load(Ordering::Relaxed)
    }

    pub fn set_heap_index(&self, coord: TileCoord, value: u32) {
        self.heap_index[self.index(coord)].store(value, Ordering::Relaxed);
    }

    /// Fast short-circuit for `update_min_mip_map`: true if any tile
    /// anywhere in the resource has a nonzero refcount. Only the coarsest
    /// mip is scanned, since a finer tile can only be referenced once its
    /// coarser ancestor already is (§4.4.2's coarse-before-fine ordering).
    pub fn any_refcount(&self) -> bool {
        let coarsest = self.mip_count - 1;
        let start = self.mip_offsets[coarsest as usize];
        let end = self
            .mip_offsets
            .get(coarsest as usize + 1)
            .copied()
            .unwrap_or(self.refcount.len());
        self.refcount[start..end]
            .iter()
            .any(|count| count.load(Ordering::Relaxed) > 0)
    }

    /// The finest `s` such that every tile of mip `s` is `Resident`, else
    /// `mip_count` (meaning: only packed mips resident). Scans from the
    /// coarsest mip toward the finest, accumulating the finest level still
    /// seen fully resident so far and stopping at the first level that
    /// isn't: residency can only get *less* complete moving finer, so a gap
    /// at some mip means nothing finer can be trusted either. When
    /// `optimistic` is set, only the coarsest mip is inspected instead of
    /// walking every level: a possibly-wrong heuristic kept available but
    /// off by default.
    pub fn min_resident_mip(&self, optimistic: bool) -> u8 {
        if optimistic {
            let coarsest = self.mip_count - 1;
            return if self.mip_fully_resident(coarsest) {
                coarsest
            } else {
                self.mip_count
            };
        }
        let mut result = self.mip_count;
        for s in (0..self.mip_count).rev() {
            if self.mip_fully_resident(s) {
                result = s;
            } else {
                break;
            }
        }
        result
    }

    fn mip_fully_resident(&self, s: u8) -> bool {
        let start = self.mip_offsets[s as usize];
        let end = self
            .mip_offsets
            .get(s as usize + 1)
            .copied()
            .unwrap_or(self.residency.len());
        self.residency[start..end]
            .iter()
            .all(|tag| Residency::from_tag(tag.load(Ordering::Relaxed)) == Residency::Resident)
    }

    /// Returns true if the tile at `coord` is `Resident`. Used by the
    /// min-mip-map walk (§4.4.6) to find the deepest contiguous resident
    /// chain at one region.
    pub fn is_resident(&self, coord: TileCoord) -> bool {
        self.residency(coord) == Residency::Resident
    }

    /// Bulk-returns every valid heap index held by this resource to
    /// `heap`, for use on resource destruction.
    pub fn free_heap_allocations(&self, heap: &HeapAllocator) {
        for slot in &self.heap_index {
            let index = slot.swap(INVALID_HEAP_INDEX, Ordering::Relaxed);
            heap.free(index);
        }
    }
}
