use log::debug;

use crate::allocator::{AllocHeader, Pool};
use crate::config::HeapConfig;
use crate::constants::{self, LARGE_ALLOCATION_UNIT};
use crate::deadobject::{min_object_size, DeadObjectPool, DeadObjectRef};
use crate::segment::{SegmentArena, SegmentId};
use crate::segmentset::{split_dead_object, Allocation, SegmentSet, SegmentSetCore};
use crate::source::SegmentSource;

/// Objects between `LARGE_BLOCK_THRESHOLD` and `SINGLE_BLOCK_THRESHOLD`.
///
/// Sizes are rounded to `LARGE_ALLOCATION_UNIT` and free space is one chain
/// sorted by size, searched smallest-sufficient first. Free runs shorter than
/// one unit are counted but not indexed; they merge back into something
/// usable when a neighbour dies.
pub struct LargeSegmentSet<H: AllocHeader> {
    core: SegmentSetCore,
    dead: DeadObjectPool<H>,
    segment_size: usize,
    minimum_segment_size: usize,
    free_threshold: usize,
}

impl<H: AllocHeader> LargeSegmentSet<H> {
    pub fn new(arena: &mut SegmentArena, config: &HeapConfig) -> LargeSegmentSet<H> {
        LargeSegmentSet {
            core: SegmentSetCore::new(Pool::Large, arena),
            dead: DeadObjectPool::new(),
            segment_size: config.large_segment_size,
            minimum_segment_size: config.minimum_segment_size,
            free_threshold: config.large_free_threshold,
        }
    }

    pub fn indexed_dead_objects(&self) -> usize {
        self.dead.len()
    }

    fn split(&mut self, object: DeadObjectRef<H>, size: usize) -> Allocation {
        let (allocation, rest) = split_dead_object(object, size, LARGE_ALLOCATION_UNIT);
        if let Some(rest) = rest {
            self.add_dead_object(rest);
        }
        allocation
    }
}

impl<H: AllocHeader> SegmentSet<H> for LargeSegmentSet<H> {
    fn core(&self) -> &SegmentSetCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SegmentSetCore {
        &mut self.core
    }

    fn add_dead_object(&mut self, object: DeadObjectRef<H>) {
        if object.size() >= LARGE_ALLOCATION_UNIT {
            self.dead.insert_sorted(object);
        }
    }

    fn find_object(&mut self, size: usize) -> Option<Allocation> {
        let object = self.dead.take_first_fit(size)?;
        Some(self.split(object, size))
    }

    fn donate_object(&mut self, size: usize) -> Option<Allocation> {
        let size = constants::round_up(size, constants::OBJECT_GRAIN).max(min_object_size::<H>());
        let object = self.dead.take_first_fit(size)?;
        debug!("large set: donating {} of {} free bytes", size, object.size());

        let (allocation, rest) = split_dead_object(object, size, min_object_size::<H>());
        if let Some(rest) = rest {
            self.add_dead_object(rest);
        }
        Some(allocation)
    }

    fn donate_segment(&mut self, arena: &mut SegmentArena, size: usize) -> Option<SegmentId> {
        let candidates: Vec<(SegmentId, usize, usize)> = arena
            .chain(self.core.anchor())
            .filter(|(_, segment)| segment.size() >= size && segment.live_objects() == 0)
            .filter(|(_, segment)| {
                segment
                    .objects::<H>()
                    .next()
                    .map_or(false, |header| unsafe { header.as_ref() }.size() == segment.size())
            })
            .map(|(id, segment)| (id, segment.start(), segment.size()))
            .collect();

        for (id, start, segment_size) in candidates {
            if self.dead.remove(start).is_some() {
                self.core.remove_dead(segment_size);
                self.detach_segment(arena, id);
                debug!("large set: donating empty segment of {} bytes", segment_size);
                return Some(id);
            }
        }

        None
    }

    fn dead_objects(&self) -> Vec<DeadObjectRef<H>> {
        self.dead.iter().collect()
    }

    fn allocation_size(&self, size: usize) -> usize {
        constants::round_up(size, LARGE_ALLOCATION_UNIT)
    }

    fn segment_sizes(&self) -> (usize, usize) {
        (self.segment_size, self.minimum_segment_size)
    }

    fn free_threshold(&self) -> Option<usize> {
        Some(self.free_threshold)
    }

    fn prepare_for_sweep(&mut self) {
        self.core.reset_counters();
        self.dead.clear();
    }

    /// A large object may not fit in a default-sized segment
    fn expand(&mut self, arena: &mut SegmentArena, source: &mut dyn SegmentSource, bytes: usize) -> usize {
        let mut added = 0;

        while added < bytes {
            let wanted = blockalloc::round_to_page(bytes - added).unwrap_or(self.segment_size);
            let requested = wanted.max(self.segment_size);
            let minimum = wanted.min(self.minimum_segment_size).max(constants::PAGE_SIZE);

            match source.new_segment(requested, minimum) {
                Some(block) => {
                    added += block.size();
                    self.add_segment(arena, block);
                }
                None => break,
            }
        }

        added
    }

    /// A full large segment if the system has one, else just enough pages
    /// for the failing request
    fn force_add_segment(&mut self, arena: &mut SegmentArena, source: &mut dyn SegmentSource, size: usize) -> bool {
        let exact = match blockalloc::round_to_page(size) {
            Some(exact) => exact,
            None => return false,
        };

        match source.new_segment(exact.max(self.segment_size), exact) {
            Some(block) => {
                self.add_segment(arena, block);
                true
            }
            None => false,
        }
    }
}
