use blockalloc::Block;
use log::debug;

use crate::allocator::{AllocHeader, Mark, Pool};
use crate::config::HeapConfig;
use crate::constants::{self, OBJECT_GRAIN};
use crate::deadobject::{min_object_size, DeadObjectPool, DeadObjectRef};
use crate::segment::{MemorySegment, SegmentArena, SegmentId};
use crate::segmentset::{split_dead_object, Allocation, SegmentSet, SegmentSetCore};

/// The bootstrap pool. Objects built while the initial image is constructed
/// land here and are never collected.
///
/// The free chain is unsorted and newest-first, and every split puts the
/// remainder back at the front, so allocation runs through the newest
/// segment like a bump pointer.
pub struct OldSpaceSegmentSet<H: AllocHeader> {
    core: SegmentSetCore,
    dead: DeadObjectPool<H>,
    min_object: usize,
    segment_size: usize,
    minimum_segment_size: usize,
}

impl<H: AllocHeader> OldSpaceSegmentSet<H> {
    pub fn new(arena: &mut SegmentArena, config: &HeapConfig) -> OldSpaceSegmentSet<H> {
        OldSpaceSegmentSet {
            core: SegmentSetCore::new(Pool::OldSpace, arena),
            dead: DeadObjectPool::new(),
            min_object: min_object_size::<H>(),
            segment_size: config.segment_size,
            minimum_segment_size: config.minimum_segment_size,
        }
    }

    /// Take ownership of a segment read back from an image and mark every
    /// object in it live in `mark`. Returns the number of objects.
    pub fn restore_segment(&mut self, arena: &mut SegmentArena, block: Block, mark: Mark) -> (SegmentId, usize) {
        let mut segment = MemorySegment::new(block);
        let size = segment.size();
        let objects = segment.mark_all_objects::<H>(mark);

        let id = arena.insert(segment);
        self.adopt_segment(arena, id);
        self.core.add_live(size);

        debug!("old-space set: restored segment of {} bytes, {} objects", size, objects);
        (id, objects)
    }
}

impl<H: AllocHeader> SegmentSet<H> for OldSpaceSegmentSet<H> {
    fn core(&self) -> &SegmentSetCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SegmentSetCore {
        &mut self.core
    }

    fn add_dead_object(&mut self, object: DeadObjectRef<H>) {
        self.dead.push(object);
    }

    fn find_object(&mut self, size: usize) -> Option<Allocation> {
        let object = self.dead.take_first_fit(size)?;
        let (allocation, rest) = split_dead_object(object, size, self.min_object);

        self.core.remove_dead(allocation.size);
        self.core.add_live(allocation.size);
        if let Some(rest) = rest {
            self.dead.push(rest);
        }

        Some(allocation)
    }

    fn dead_objects(&self) -> Vec<DeadObjectRef<H>> {
        self.dead.iter().collect()
    }

    fn allocation_size(&self, size: usize) -> usize {
        constants::round_up(size, OBJECT_GRAIN).max(self.min_object)
    }

    fn segment_sizes(&self) -> (usize, usize) {
        (self.segment_size, self.minimum_segment_size)
    }

    fn prepare_for_sweep(&mut self) {
        self.core.reset_counters();
        self.dead.clear();
    }

    /// Image segments are saved whole, so they start out zeroed rather than
    /// holding whatever the system handed back
    fn add_segment(&mut self, arena: &mut SegmentArena, block: Block) -> SegmentId {
        let mut segment = MemorySegment::new(block);
        segment.block_mut().zero();
        let dead = segment.create_dead_object::<H>();
        let size = segment.size();

        let id = arena.insert(segment);
        self.adopt_segment(arena, id);
        self.core.add_dead(size);
        self.dead.push(dead);

        debug!("old-space set: added segment of {} bytes", size);
        id
    }
}
