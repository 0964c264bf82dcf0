use std::fmt;

use crate::allocator::{AllocHeader, AllocTypeId, Mark, Pool};
use crate::segment::{ObjectStats, SegmentArena};
use crate::segmentset::SegmentSet;

/// A snapshot of one segment set
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SetStats {
    pub pool: Pool,
    pub segments: usize,
    pub total_bytes: usize,
    pub live_bytes: usize,
    pub dead_bytes: usize,
    pub indexed_dead_objects: usize,
    pub largest_free_block: usize,
}

impl SetStats {
    pub fn gather<H, S>(set: &S, arena: &SegmentArena) -> SetStats
    where
        H: AllocHeader,
        S: SegmentSet<H> + ?Sized,
    {
        let core = set.core();
        let dead = set.dead_objects();

        SetStats {
            pool: core.pool(),
            segments: core.count(),
            total_bytes: core.total_bytes(arena),
            live_bytes: core.live_object_bytes(),
            dead_bytes: core.dead_object_bytes(),
            indexed_dead_objects: dead.len(),
            largest_free_block: dead.iter().map(|object| object.size()).max().unwrap_or(0),
        }
    }

    /// Add the objects of every segment in `set` to a census
    pub fn census<H, S>(set: &S, arena: &SegmentArena, mark: Mark, objects: &mut ObjectStats<H::TypeId>)
    where
        H: AllocHeader,
        S: SegmentSet<H> + ?Sized,
    {
        for (_, segment) in arena.chain(set.core().anchor()) {
            segment.gather_object_stats::<H>(mark, objects);
        }
    }
}

/// Heap-wide statistics as returned by `Heap::gather_stats`
pub struct HeapStats<T: AllocTypeId> {
    pub mark: Mark,
    pub collections: usize,
    pub sets: Vec<SetStats>,
    pub objects: ObjectStats<T>,
}

impl<T: AllocTypeId> HeapStats<T> {
    pub fn set(&self, pool: Pool) -> Option<&SetStats> {
        self.sets.iter().find(|set| set.pool == pool)
    }

    pub fn total_bytes(&self) -> usize {
        self.sets.iter().map(|set| set.total_bytes).sum()
    }

    pub fn segments(&self) -> usize {
        self.sets.iter().map(|set| set.segments).sum()
    }
}

impl<T: AllocTypeId> fmt::Display for HeapStats<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "epoch {}, {} collections, {} bytes in {} segments",
            self.mark.as_u32(),
            self.collections,
            self.total_bytes(),
            self.segments()
        )?;

        for set in self.sets.iter() {
            writeln!(
                f,
                "  {:<14} {:>4} segments {:>12} total {:>12} live {:>12} dead {:>8} free blocks, largest {}",
                set.pool.name(),
                set.segments,
                set.total_bytes,
                set.live_bytes,
                set.dead_bytes,
                set.indexed_dead_objects,
                set.largest_free_block
            )?;
        }

        for (type_id, tally) in self.objects.iter() {
            writeln!(
                f,
                "  {:<14?} {:>8} objects ({} bytes), {} live ({} bytes)",
                type_id, tally.objects, tally.bytes, tally.live_objects, tally.live_bytes
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::large::LargeSegmentSet;
    use crate::test_support::{write_object, TestHeader, TestTypeId};
    use blockalloc::{Block, PAGE_SIZE};

    #[test]
    fn test_set_stats() {
        let mut arena = SegmentArena::new();
        let mut set = LargeSegmentSet::<TestHeader>::new(&mut arena, &HeapConfig::default());
        set.add_segment(&mut arena, Block::new(PAGE_SIZE * 4).unwrap());
        set.add_segment(&mut arena, Block::new(PAGE_SIZE * 2).unwrap());

        let allocation = set.find_object(PAGE_SIZE).unwrap();
        write_object(allocation.ptr, allocation.size, Mark::INITIAL);

        let stats = SetStats::gather(&set, &arena);
        assert_eq!(stats.pool, Pool::Large);
        assert_eq!(stats.segments, 2);
        assert_eq!(stats.total_bytes, PAGE_SIZE * 6);
        assert_eq!(stats.indexed_dead_objects, 2);
        assert_eq!(stats.largest_free_block, PAGE_SIZE * 4);

        let mut objects = ObjectStats::new();
        SetStats::census(&set, &arena, Mark::INITIAL, &mut objects);
        let arrays = objects.get(TestTypeId::Array);
        assert_eq!(arrays.live_objects, 1);
        assert_eq!(arrays.bytes, PAGE_SIZE);

        let dead = objects.get(TestTypeId::Dead);
        assert_eq!(dead.objects, 2);
        assert_eq!(dead.live_objects, 0);
    }
}
