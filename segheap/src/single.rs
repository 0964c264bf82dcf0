use blockalloc::round_to_page;
use log::debug;

use crate::allocator::{AllocHeader, Mark, Pool};
use crate::config::HeapConfig;
use crate::constants::PAGE_SIZE;
use crate::deadobject::DeadObjectRef;
use crate::segment::{MemorySegment, SegmentArena, SegmentId};
use crate::segmentset::{sweep_segment, Allocation, SegmentSet, SegmentSetCore};
use crate::source::SegmentSource;

/// One huge object per segment.
///
/// There is no free-space index. A segment whose object dies goes back to
/// the system; a segment whose object was shrunk, leaving a dead tail, is
/// detached by the sweep and collected in `transfers` for the normal set to
/// adopt.
pub struct SingleObjectSegmentSet<H: AllocHeader> {
    core: SegmentSetCore,
    allocations_since_last_gc: usize,
    throttle: usize,
    transfers: Vec<SegmentId>,
    _header: std::marker::PhantomData<*const H>,
}

impl<H: AllocHeader> SingleObjectSegmentSet<H> {
    pub fn new(arena: &mut SegmentArena, config: &HeapConfig) -> SingleObjectSegmentSet<H> {
        SingleObjectSegmentSet {
            core: SegmentSetCore::new(Pool::SingleObject, arena),
            allocations_since_last_gc: 0,
            throttle: config.single_object_throttle,
            transfers: Vec::new(),
            _header: std::marker::PhantomData,
        }
    }

    pub fn allocations_since_last_gc(&self) -> usize {
        self.allocations_since_last_gc
    }

    /// Segments the last sweep detached for the normal set
    pub fn take_transfers(&mut self) -> Vec<SegmentId> {
        std::mem::take(&mut self.transfers)
    }

    /// Take a segment donated by a sibling and hand all of it out as one
    /// object
    pub fn allocate_in_donated(&mut self, arena: &mut SegmentArena, id: SegmentId) -> Allocation {
        let dead = arena.get_mut(id).create_dead_object::<H>();
        self.adopt_segment(arena, id);
        self.allocations_since_last_gc += 1;
        self.core.add_live(dead.size());

        Allocation {
            ptr: dead.start(),
            size: dead.size(),
        }
    }
}

impl<H: AllocHeader> SegmentSet<H> for SingleObjectSegmentSet<H> {
    fn core(&self) -> &SegmentSetCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SegmentSetCore {
        &mut self.core
    }

    fn add_dead_object(&mut self, _object: DeadObjectRef<H>) {}

    fn find_object(&mut self, _size: usize) -> Option<Allocation> {
        None
    }

    fn dead_objects(&self) -> Vec<DeadObjectRef<H>> {
        Vec::new()
    }

    fn allocation_size(&self, size: usize) -> usize {
        round_to_page(size).unwrap_or(size)
    }

    fn segment_sizes(&self) -> (usize, usize) {
        (PAGE_SIZE, PAGE_SIZE)
    }

    /// A fresh segment of exactly `size` bytes, unless enough of them have
    /// been handed out since the last collection that one should run first
    fn allocate(&mut self, arena: &mut SegmentArena, source: &mut dyn SegmentSource, size: usize) -> Option<Allocation> {
        if self.allocations_since_last_gc >= self.throttle {
            debug!(
                "single-object set: {} allocations since last collection, throttling",
                self.allocations_since_last_gc
            );
            return None;
        }

        let block = source.new_segment(size, size)?;
        let mut segment = MemorySegment::new(block);
        // Covered by a dead header until the caller writes its own
        let dead = segment.create_dead_object::<H>();

        let id = arena.insert(segment);
        self.adopt_segment(arena, id);
        self.allocations_since_last_gc += 1;
        self.core.add_live(dead.size());

        debug!("single-object set: new segment of {} bytes", dead.size());
        Some(Allocation {
            ptr: dead.start(),
            size: dead.size(),
        })
    }

    fn sweep(&mut self, arena: &mut SegmentArena, mark: Mark) {
        self.prepare_for_sweep();
        self.allocations_since_last_gc = 0;

        for id in arena.chain_ids(self.core.anchor()) {
            let tally = sweep_segment::<H, _>(arena.get_mut(id), mark, |_| {});

            if tally.live_objects == 0 {
                self.release_segment(arena, id);
            } else if tally.dead_bytes > 0 {
                debug!(
                    "single-object set: transferring segment with {} dead bytes",
                    tally.dead_bytes
                );
                self.detach_segment(arena, id);
                self.transfers.push(id);
            } else {
                self.core.add_live(tally.live_bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{header_at, write_object, BudgetSource, TestHeader};

    fn set(throttle: usize) -> (SegmentArena, SingleObjectSegmentSet<TestHeader>) {
        let mut arena = SegmentArena::new();
        let config = HeapConfig::default().with_single_object_throttle(throttle);
        let set = SingleObjectSegmentSet::new(&mut arena, &config);
        (arena, set)
    }

    #[test]
    fn test_dedicated_segment_per_object() {
        let (mut arena, mut set) = set(8);
        let mut source = BudgetSource::unlimited();

        let size = set.allocation_size(PAGE_SIZE * 3 + 1);
        assert_eq!(size, PAGE_SIZE * 4);

        let first = set.allocate(&mut arena, &mut source, size).unwrap();
        let second = set.allocate(&mut arena, &mut source, size).unwrap();
        assert_eq!(first.size, size);
        assert_ne!(first.addr(), second.addr());
        assert_eq!(set.core().count(), 2);
        assert_eq!(set.allocations_since_last_gc(), 2);
    }

    #[test]
    fn test_throttle_forces_collection() {
        let (mut arena, mut set) = set(2);
        let mut source = BudgetSource::unlimited();

        assert!(set.allocate(&mut arena, &mut source, PAGE_SIZE).is_some());
        assert!(set.allocate(&mut arena, &mut source, PAGE_SIZE).is_some());
        assert!(set.allocate(&mut arena, &mut source, PAGE_SIZE).is_none());
        assert_eq!(source.requests().len(), 2);

        set.sweep(&mut arena, Mark::INITIAL);
        assert!(set.allocate(&mut arena, &mut source, PAGE_SIZE).is_some());
    }

    #[test]
    fn test_sweep_releases_dead_and_transfers_shrunk() {
        let (mut arena, mut set) = set(8);
        let mut source = BudgetSource::unlimited();
        let live = Mark::INITIAL.next();

        let kept = set.allocate(&mut arena, &mut source, PAGE_SIZE * 4).unwrap();
        write_object(kept.ptr, kept.size, live);

        let dead = set.allocate(&mut arena, &mut source, PAGE_SIZE * 4).unwrap();
        write_object(dead.ptr, dead.size, Mark::INITIAL);

        let shrunk = set.allocate(&mut arena, &mut source, PAGE_SIZE * 4).unwrap();
        write_object(shrunk.ptr, PAGE_SIZE, live);
        let tail = unsafe { std::ptr::NonNull::new_unchecked(shrunk.ptr.as_ptr().add(PAGE_SIZE)) };
        write_object(tail, PAGE_SIZE * 3, Mark::INITIAL);

        set.sweep(&mut arena, live);

        assert_eq!(set.core().count(), 1);
        assert_eq!(set.core().live_object_bytes(), PAGE_SIZE * 4);
        assert_eq!(set.allocations_since_last_gc(), 0);

        let transfers = set.take_transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(arena.get(transfers[0]).start(), shrunk.addr());
        assert!(set.take_transfers().is_empty());

        // the tail is now a dead object, the head is untouched
        assert!(header_at(shrunk.addr()).is_live(live));
        assert_eq!(arena.get(transfers[0]).objects::<TestHeader>().count(), 2);
    }

    #[test]
    fn test_failed_segment_request() {
        let (mut arena, mut set) = set(8);
        let mut source = BudgetSource::limited(0);
        assert!(set.allocate(&mut arena, &mut source, PAGE_SIZE).is_none());
        assert_eq!(set.core().count(), 0);
    }
}
