/// The behaviour shared by every segment set: segment ownership, the sweep,
/// block splitting and growth. Each concrete set supplies its free-space
/// index through the hook methods of `SegmentSet`.
use std::ptr::NonNull;

use blockalloc::{round_to_page, Block};
use log::{debug, trace};

use crate::allocator::{AllocHeader, Mark, Pool};
use crate::deadobject::{find_overlap, DeadObjectRef};
use crate::segment::{MemorySegment, SegmentArena, SegmentId};
use crate::source::SegmentSource;

/// A block of storage handed out by a set. `size` may exceed what was asked
/// for when the leftover would have been too small to keep.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub ptr: NonNull<u8>,
    pub size: usize,
}

impl Allocation {
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

/// State common to all segment sets
pub struct SegmentSetCore {
    pool: Pool,
    anchor: SegmentId,
    count: usize,
    live_object_bytes: usize,
    dead_object_bytes: usize,
}

impl SegmentSetCore {
    pub fn new(pool: Pool, arena: &mut SegmentArena) -> SegmentSetCore {
        SegmentSetCore {
            pool,
            anchor: arena.new_anchor(),
            count: 0,
            live_object_bytes: 0,
            dead_object_bytes: 0,
        }
    }

    pub fn pool(&self) -> Pool {
        self.pool
    }

    pub fn name(&self) -> &'static str {
        self.pool.name()
    }

    pub fn anchor(&self) -> SegmentId {
        self.anchor
    }

    /// Number of segments owned
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn live_object_bytes(&self) -> usize {
        self.live_object_bytes
    }

    pub fn dead_object_bytes(&self) -> usize {
        self.dead_object_bytes
    }

    /// Free space as a percentage of live plus dead bytes
    pub fn free_percent(&self) -> usize {
        let total = self.live_object_bytes + self.dead_object_bytes;
        if total == 0 {
            0
        } else {
            self.dead_object_bytes * 100 / total
        }
    }

    pub fn total_bytes(&self, arena: &SegmentArena) -> usize {
        arena.chain(self.anchor).map(|(_, s)| s.size()).sum()
    }

    pub(crate) fn reset_counters(&mut self) {
        self.live_object_bytes = 0;
        self.dead_object_bytes = 0;
    }

    pub(crate) fn add_live(&mut self, bytes: usize) {
        self.live_object_bytes += bytes;
    }

    pub(crate) fn add_dead(&mut self, bytes: usize) {
        self.dead_object_bytes += bytes;
    }

    pub(crate) fn remove_dead(&mut self, bytes: usize) {
        self.dead_object_bytes = self.dead_object_bytes.saturating_sub(bytes);
    }

    fn link(&mut self, arena: &mut SegmentArena, id: SegmentId) {
        arena.link_after(self.anchor, id);
        self.count += 1;
    }

    fn unlink(&mut self, arena: &mut SegmentArena, id: SegmentId) {
        arena.unlink(id);
        self.count -= 1;
    }
}

/// What one segment contributed to a sweep
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepTally {
    pub live_bytes: usize,
    pub dead_bytes: usize,
    pub live_objects: usize,
    pub dead_runs: usize,
}

/// Sweep one segment: every maximal run of objects not live in `mark` is
/// rewritten as a single dead object and passed to `on_dead`.
pub(crate) fn sweep_segment<H, F>(segment: &mut MemorySegment, mark: Mark, mut on_dead: F) -> SweepTally
where
    H: AllocHeader,
    F: FnMut(DeadObjectRef<H>),
{
    let mut tally = SweepTally::default();
    let mut run: Option<(NonNull<H>, usize)> = None;

    let mut close_run = |run: &mut Option<(NonNull<H>, usize)>, tally: &mut SweepTally| {
        if let Some((start, length)) = run.take() {
            tally.dead_bytes += length;
            tally.dead_runs += 1;
            // The walk has already stepped past the run, so the headers
            // inside it can be overwritten.
            on_dead(unsafe { DeadObjectRef::write(start.cast(), length) });
        }
    };

    for header in segment.objects::<H>() {
        let (size, live) = {
            let header = unsafe { header.as_ref() };
            (header.size(), header.is_live(mark))
        };

        if live {
            close_run(&mut run, &mut tally);
            tally.live_bytes += size;
            tally.live_objects += 1;
        } else {
            run = match run {
                Some((start, length)) => Some((start, length + size)),
                None => Some((header, size)),
            };
        }
    }
    close_run(&mut run, &mut tally);

    segment.set_live_objects(tally.live_objects);
    tally
}

/// Carve `size` bytes off the front of a free block. If what is left would be
/// smaller than `min_remainder` the whole block goes to the requester;
/// otherwise the rest comes back as a new dead object for re-indexing.
pub(crate) fn split_dead_object<H: AllocHeader>(
    object: DeadObjectRef<H>,
    size: usize,
    min_remainder: usize,
) -> (Allocation, Option<DeadObjectRef<H>>) {
    let total = object.size();
    debug_assert!(total >= size);

    let remainder = total - size;
    if remainder < min_remainder {
        let allocation = Allocation {
            ptr: object.start(),
            size: total,
        };
        return (allocation, None);
    }

    let start = object.start();
    let rest = unsafe {
        // Keep the segment walkable until the caller writes its own header
        DeadObjectRef::<H>::write(start, size);
        DeadObjectRef::write(NonNull::new_unchecked(start.as_ptr().add(size)), remainder)
    };

    (Allocation { ptr: start, size }, Some(rest))
}

/// Bytes a set must add so that free space reaches `threshold` percent of
/// live plus dead bytes
pub fn growth_needed(live: usize, dead: usize, threshold: usize) -> usize {
    let total = live + dead;
    if total == 0 || dead.saturating_mul(100) >= total.saturating_mul(threshold) {
        return 0;
    }

    // (dead + x) / (total + x) >= threshold / 100
    let deficit = total.saturating_mul(threshold) - dead.saturating_mul(100);
    let slack = 100 - threshold;
    (deficit + slack - 1) / slack
}

/// The policy hooks and shared operations of a segment set.
///
/// A set owns a chain of segments in a shared `SegmentArena` and indexes the
/// dead objects in them. Free space found by a sweep is handed to
/// `add_dead_object`; allocation is `find_object`; a sibling under pressure
/// asks for `donate_object` or `donate_segment`.
pub trait SegmentSet<H: AllocHeader> {
    fn core(&self) -> &SegmentSetCore;

    fn core_mut(&mut self) -> &mut SegmentSetCore;

    /// Index a free block
    fn add_dead_object(&mut self, object: DeadObjectRef<H>);

    /// Find free storage of exactly `size` bytes (already rounded by
    /// `allocation_size`), splitting a larger block if necessary
    fn find_object(&mut self, size: usize) -> Option<Allocation>;

    /// Every dead object currently indexed
    fn dead_objects(&self) -> Vec<DeadObjectRef<H>>;

    /// Round a request to this set's allocation granularity
    fn allocation_size(&self, size: usize) -> usize;

    /// Default and minimum size of the segments this set grows by
    fn segment_sizes(&self) -> (usize, usize);

    /// Free-space percentage this set keeps after a sweep, if it grows at all
    fn free_threshold(&self) -> Option<usize> {
        None
    }

    /// Give up free storage of at least `size` bytes to a sibling set. The
    /// storage stays in this set's segment and comes back on the next sweep.
    fn donate_object(&mut self, _size: usize) -> Option<Allocation> {
        None
    }

    /// Give up a completely empty segment of at least `size` bytes. The
    /// segment is unlinked and must be adopted by the caller.
    fn donate_segment(&mut self, _arena: &mut SegmentArena, _size: usize) -> Option<SegmentId> {
        None
    }

    /// Reset counters and forget the free-space index before a sweep
    fn prepare_for_sweep(&mut self) {
        self.core_mut().reset_counters();
    }

    /// Called once all segments have been swept
    fn complete_sweep_operation(&mut self) {}

    /// Allocate `size` bytes (already rounded). Most sets only look in their
    /// free-space index.
    fn allocate(&mut self, _arena: &mut SegmentArena, _source: &mut dyn SegmentSource, size: usize) -> Option<Allocation> {
        self.find_object(size)
    }

    /// Take ownership of fresh memory, indexing all of it as free
    fn add_segment(&mut self, arena: &mut SegmentArena, block: Block) -> SegmentId {
        let mut segment = MemorySegment::new(block);
        let dead = segment.create_dead_object::<H>();
        let size = segment.size();

        let id = arena.insert(segment);
        self.core_mut().link(arena, id);
        self.core_mut().add_dead(size);
        self.add_dead_object(dead);

        debug!("{} set: added segment of {} bytes", self.core().name(), size);
        id
    }

    /// Take ownership of a segment that still holds objects. Its free space
    /// is picked up by the next sweep.
    fn adopt_segment(&mut self, arena: &mut SegmentArena, id: SegmentId) {
        self.core_mut().link(arena, id);
    }

    /// Take ownership of a segment donated empty by a sibling
    fn adopt_empty_segment(&mut self, arena: &mut SegmentArena, id: SegmentId) {
        let dead = arena.get_mut(id).create_dead_object::<H>();
        self.core_mut().link(arena, id);
        self.core_mut().add_dead(dead.size());
        self.add_dead_object(dead);
    }

    /// Unlink a segment so it can move to another set
    fn detach_segment(&mut self, arena: &mut SegmentArena, id: SegmentId) {
        self.core_mut().unlink(arena, id);
    }

    /// Unlink a segment and hand its memory back to the system
    fn release_segment(&mut self, arena: &mut SegmentArena, id: SegmentId) {
        self.core_mut().count -= 1;
        let segment = arena.remove(id);
        debug!(
            "{} set: released segment of {} bytes",
            self.core().name(),
            segment.size()
        );
    }

    /// Rebuild the free-space index from every segment, coalescing runs of
    /// objects that are not live in `mark`
    fn sweep(&mut self, arena: &mut SegmentArena, mark: Mark) {
        self.prepare_for_sweep();

        for id in arena.chain_ids(self.core().anchor()) {
            let segment = arena.get_mut(id);
            let tally = sweep_segment::<H, _>(segment, mark, |dead| self.add_dead_object(dead));

            let core = self.core_mut();
            core.add_live(tally.live_bytes);
            core.add_dead(tally.dead_bytes);
        }

        self.complete_sweep_operation();

        trace!(
            "{} set swept: {} segments, {} live bytes, {} dead bytes",
            self.core().name(),
            self.core().count(),
            self.core().live_object_bytes(),
            self.core().dead_object_bytes()
        );

        debug_assert!(
            self.check_dead_overlap().is_none(),
            "{} set has overlapping dead objects",
            self.core().name()
        );
    }

    /// Add segments until `bytes` more are free, returning how much was added
    fn expand(&mut self, arena: &mut SegmentArena, source: &mut dyn SegmentSource, bytes: usize) -> usize {
        let (segment_size, minimum) = self.segment_sizes();
        let mut added = 0;

        while added < bytes {
            match source.new_segment(segment_size, minimum) {
                Some(block) => {
                    added += block.size();
                    self.add_segment(arena, block);
                }
                None => break,
            }
        }

        added
    }

    /// Post-sweep growth check: grow until free space is back at the
    /// threshold. Returns the bytes added.
    fn adjust_memory_size(&mut self, arena: &mut SegmentArena, source: &mut dyn SegmentSource) -> usize {
        let threshold = match self.free_threshold() {
            Some(threshold) => threshold,
            None => return 0,
        };

        let core = self.core();
        let needed = growth_needed(core.live_object_bytes(), core.dead_object_bytes(), threshold);
        if needed == 0 {
            return 0;
        }

        debug!(
            "{} set is {}% free, below {}%: growing by {} bytes",
            core.name(),
            core.free_percent(),
            threshold,
            needed
        );
        self.expand(arena, source, needed)
    }

    /// Add one segment just big enough for `size`, or the minimum segment if
    /// that is bigger
    fn force_add_segment(&mut self, arena: &mut SegmentArena, source: &mut dyn SegmentSource, size: usize) -> bool {
        let exact = match round_to_page(size) {
            Some(exact) => exact,
            None => return false,
        };
        let (_, minimum) = self.segment_sizes();

        match source.new_segment(exact.max(minimum), exact) {
            Some(block) => {
                self.add_segment(arena, block);
                true
            }
            None => false,
        }
    }

    /// Debug validator: the first pair of indexed dead objects that overlap
    fn check_dead_overlap(&self) -> Option<(usize, usize)> {
        find_overlap(self.dead_objects())
    }
}
