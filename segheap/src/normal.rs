use blockalloc::Block;
use log::{debug, warn};

use crate::allocator::{AllocHeader, Pool};
use crate::config::HeapConfig;
use crate::constants::{self, DEAD_POOLS, OBJECT_GRAIN, OBJECT_GRAIN_BITS};
use crate::deadobject::{min_object_size, DeadObjectPool, DeadObjectRef};
use crate::segment::{SegmentArena, SegmentId};
use crate::segmentset::{split_dead_object, Allocation, SegmentSet, SegmentSetCore};

fn dead_pool_index(size: usize) -> usize {
    size >> OBJECT_GRAIN_BITS
}

/// The general small and medium object pool.
///
/// Free blocks smaller than `LARGE_BLOCK_THRESHOLD` are kept in per-size
/// subpools, one for each multiple of `OBJECT_GRAIN`; anything bigger goes
/// on a size-sorted overflow chain. `last_used_subpool[i]` is the nearest
/// non-empty subpool at or above `i`, or `DEAD_POOLS` if there is none, so
/// a miss on the exact size is one lookup rather than a scan.
pub struct NormalSegmentSet<H: AllocHeader> {
    core: SegmentSetCore,
    subpools: Vec<DeadObjectPool<H>>,
    last_used_subpool: Vec<usize>,
    large_dead: DeadObjectPool<H>,
    recover_segment: Option<Block>,
    min_object: usize,
    segment_size: usize,
    minimum_segment_size: usize,
    free_threshold: usize,
}

impl<H: AllocHeader> NormalSegmentSet<H> {
    /// A set with no segments yet, holding `recover_segment` back for
    /// reporting memory exhaustion
    pub fn new(arena: &mut SegmentArena, config: &HeapConfig, recover_segment: Option<Block>) -> NormalSegmentSet<H> {
        NormalSegmentSet {
            core: SegmentSetCore::new(Pool::Normal, arena),
            subpools: (0..DEAD_POOLS).map(|_| DeadObjectPool::new()).collect(),
            last_used_subpool: vec![DEAD_POOLS; DEAD_POOLS],
            large_dead: DeadObjectPool::new(),
            recover_segment,
            min_object: min_object_size::<H>(),
            segment_size: config.segment_size,
            minimum_segment_size: config.minimum_segment_size,
            free_threshold: config.normal_free_threshold,
        }
    }

    pub fn has_recover_segment(&self) -> bool {
        self.recover_segment.is_some()
    }

    /// Put the held-back segment into service. Returns false if it has
    /// already been used.
    pub fn release_recover_segment(&mut self, arena: &mut SegmentArena) -> bool {
        match self.recover_segment.take() {
            Some(block) => {
                warn!("releasing the {} byte recover segment", block.size());
                self.add_segment(arena, block);
                true
            }
            None => false,
        }
    }

    /// The subpool a request of `size` bytes would be served from, if any
    pub fn subpool_for(&self, size: usize) -> Option<usize> {
        let index = dead_pool_index(size);
        if index < DEAD_POOLS && self.last_used_subpool[index] < DEAD_POOLS {
            Some(self.last_used_subpool[index])
        } else {
            None
        }
    }

    pub fn subpool_len(&self, index: usize) -> usize {
        self.subpools[index].len()
    }

    pub fn large_dead_len(&self) -> usize {
        self.large_dead.len()
    }

    /// A subpool just ran dry: every look-aside entry that pointed at it moves
    /// on to the next non-empty subpool above it. Those entries are the
    /// contiguous run ending at `index`.
    fn retire_subpool(&mut self, index: usize) {
        let next = if index + 1 < DEAD_POOLS {
            self.last_used_subpool[index + 1]
        } else {
            DEAD_POOLS
        };

        for entry in self.last_used_subpool[..=index].iter_mut().rev() {
            if *entry != index {
                break;
            }
            *entry = next;
        }
    }

    /// Index the remainder of a split
    fn requeue(&mut self, rest: Option<DeadObjectRef<H>>) {
        if let Some(rest) = rest {
            self.add_dead_object(rest);
        }
    }

    fn split(&mut self, object: DeadObjectRef<H>, size: usize) -> Allocation {
        let (allocation, rest) = split_dead_object(object, size, self.min_object);
        self.requeue(rest);
        allocation
    }
}

impl<H: AllocHeader> SegmentSet<H> for NormalSegmentSet<H> {
    fn core(&self) -> &SegmentSetCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SegmentSetCore {
        &mut self.core
    }

    fn add_dead_object(&mut self, object: DeadObjectRef<H>) {
        let index = dead_pool_index(object.size());

        if index >= DEAD_POOLS {
            self.large_dead.insert_sorted(object);
            return;
        }

        self.subpools[index].push(object);

        // The table is non-decreasing, so stop at the first entry that
        // already points at or below this subpool
        for entry in self.last_used_subpool[..=index].iter_mut().rev() {
            if *entry <= index {
                break;
            }
            *entry = index;
        }
    }

    fn find_object(&mut self, size: usize) -> Option<Allocation> {
        let index = dead_pool_index(size);

        if index < DEAD_POOLS {
            let pool = self.last_used_subpool[index];

            if pool < DEAD_POOLS {
                let object = self.subpools[pool].pop()?;
                if self.subpools[pool].is_empty() {
                    self.retire_subpool(pool);
                }

                if pool == index {
                    return Some(Allocation {
                        ptr: object.start(),
                        size: object.size(),
                    });
                }
                return Some(self.split(object, size));
            }
        }

        let object = self.large_dead.take_first_fit(size)?;
        Some(self.split(object, size))
    }

    fn donate_object(&mut self, size: usize) -> Option<Allocation> {
        let object = self.large_dead.take_first_fit(size)?;
        debug!("normal set: donating {} of {} free bytes", size, object.size());
        Some(self.split(object, size))
    }

    fn donate_segment(&mut self, arena: &mut SegmentArena, size: usize) -> Option<SegmentId> {
        // A segment is empty when its first object spans it and is indexed
        // here as free. Segments are at least a page, so that object can only
        // be on the overflow chain.
        let candidates: Vec<(SegmentId, usize, usize)> = arena
            .chain(self.core.anchor())
            .filter(|(_, segment)| segment.size() >= size)
            .filter(|(_, segment)| {
                segment
                    .objects::<H>()
                    .next()
                    .map_or(false, |header| unsafe { header.as_ref() }.size() == segment.size())
            })
            .map(|(id, segment)| (id, segment.start(), segment.size()))
            .collect();

        for (id, start, segment_size) in candidates {
            if self.large_dead.remove(start).is_some() {
                self.core.remove_dead(segment_size);
                self.detach_segment(arena, id);
                debug!("normal set: donating empty segment of {} bytes", segment_size);
                return Some(id);
            }
        }

        None
    }

    fn dead_objects(&self) -> Vec<DeadObjectRef<H>> {
        self.subpools
            .iter()
            .flat_map(|pool| pool.iter())
            .chain(self.large_dead.iter())
            .collect()
    }

    fn allocation_size(&self, size: usize) -> usize {
        constants::round_up(size, OBJECT_GRAIN).max(self.min_object)
    }

    fn segment_sizes(&self) -> (usize, usize) {
        (self.segment_size, self.minimum_segment_size)
    }

    fn free_threshold(&self) -> Option<usize> {
        Some(self.free_threshold)
    }

    fn prepare_for_sweep(&mut self) {
        self.core.reset_counters();
        for pool in self.subpools.iter_mut() {
            pool.clear();
        }
        self.large_dead.clear();
        for entry in self.last_used_subpool.iter_mut() {
            *entry = DEAD_POOLS;
        }
    }

    fn complete_sweep_operation(&mut self) {
        let mut next = DEAD_POOLS;
        for index in (0..DEAD_POOLS).rev() {
            if !self.subpools[index].is_empty() {
                next = index;
            }
            self.last_used_subpool[index] = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Mark;
    use crate::test_support::{header_at, write_object, TestHeader};
    use blockalloc::PAGE_SIZE;
    use std::collections::HashSet;

    fn set_with_segment(pages: usize) -> (SegmentArena, NormalSegmentSet<TestHeader>) {
        let mut arena = SegmentArena::new();
        let mut set = NormalSegmentSet::new(&mut arena, &HeapConfig::default(), None);
        set.add_segment(&mut arena, Block::new(PAGE_SIZE * pages).unwrap());
        (arena, set)
    }

    /// Allocate and write live-in-`mark` objects of the given sizes
    fn allocate(set: &mut NormalSegmentSet<TestHeader>, sizes: &[usize], mark: Mark) -> Vec<Allocation> {
        sizes
            .iter()
            .map(|&size| {
                let size = set.allocation_size(size);
                let allocation = set.find_object(size).unwrap();
                write_object(allocation.ptr, allocation.size, mark);
                allocation
            })
            .collect()
    }

    fn assert_table_consistent(set: &NormalSegmentSet<TestHeader>) {
        for index in 0..DEAD_POOLS {
            let expect = (index..DEAD_POOLS)
                .find(|&i| !set.subpools[i].is_empty())
                .unwrap_or(DEAD_POOLS);
            assert_eq!(set.last_used_subpool[index], expect, "entry {}", index);
        }
    }

    #[test]
    fn test_fresh_segment_is_one_large_dead_object() {
        let (_arena, set) = set_with_segment(4);
        assert_eq!(set.large_dead_len(), 1);
        assert_eq!(set.subpool_for(64), None);
        assert_eq!(set.core().dead_object_bytes(), PAGE_SIZE * 4);
    }

    #[test]
    fn test_small_request_carves_from_overflow() {
        let (_arena, mut set) = set_with_segment(4);
        let allocation = set.find_object(64).unwrap();
        assert_eq!(allocation.size, 64);
        assert_eq!(set.large_dead_len(), 1);
        assert_eq!(set.large_dead.largest(), Some(PAGE_SIZE * 4 - 64));
    }

    #[test]
    fn test_exact_size_class_reuse() {
        let (mut arena, mut set) = set_with_segment(4);
        let old = Mark::INITIAL;
        let new = old.next();

        // alternate live and garbage so each garbage object is its own run
        let sizes = [48, 96, 48, 96, 48, 96];
        let allocations = allocate(&mut set, &sizes, old);
        for (index, allocation) in allocations.iter().enumerate() {
            if index % 2 == 0 {
                header_at(allocation.addr()).mark(new);
            }
        }
        // keep the tail from merging with the last garbage object
        let tail = allocate(&mut set, &[32], old)[0];
        header_at(tail.addr()).mark(new);

        set.sweep(&mut arena, new);
        assert_table_consistent(&set);

        let freed: HashSet<usize> = allocations
            .iter()
            .skip(1)
            .step_by(2)
            .map(|a| a.addr())
            .collect();
        assert_eq!(set.subpool_len(96 / OBJECT_GRAIN), 3);

        let reused = set.find_object(96).unwrap();
        assert_eq!(reused.size, 96);
        assert!(freed.contains(&reused.addr()));
    }

    #[test]
    fn test_miss_uses_next_larger_subpool_exactly() {
        let (mut arena, mut set) = set_with_segment(4);
        let old = Mark::INITIAL;
        let new = old.next();

        let allocations = allocate(&mut set, &[64, 256, 64], old);
        header_at(allocations[0].addr()).mark(new);
        header_at(allocations[2].addr()).mark(new);
        let tail = allocate(&mut set, &[32], old)[0];
        header_at(tail.addr()).mark(new);

        set.sweep(&mut arena, new);
        assert_eq!(set.subpool_for(128), Some(256 / OBJECT_GRAIN));

        // 128 has no exact class, so it is carved from the 256 block and the
        // other half is indexed in its own class
        let allocation = set.find_object(128).unwrap();
        assert_eq!(allocation.addr(), allocations[1].addr());
        assert_eq!(allocation.size, 128);
        assert_eq!(set.subpool_len(128 / OBJECT_GRAIN), 1);
        assert_eq!(set.subpool_len(256 / OBJECT_GRAIN), 0);
        assert_table_consistent(&set);
    }

    #[test]
    fn test_retire_subpool_updates_lookaside() {
        let (mut arena, mut set) = set_with_segment(4);
        let old = Mark::INITIAL;
        let new = old.next();

        let allocations = allocate(&mut set, &[32, 64, 32, 160, 32], old);
        for index in [0, 2, 4] {
            header_at(allocations[index].addr()).mark(new);
        }
        let tail = allocate(&mut set, &[32], old)[0];
        header_at(tail.addr()).mark(new);

        set.sweep(&mut arena, new);
        assert_table_consistent(&set);

        set.find_object(64).unwrap();
        assert_table_consistent(&set);
        assert_eq!(set.subpool_for(48), Some(160 / OBJECT_GRAIN));
    }

    #[test]
    fn test_sweep_conserves_bytes() {
        let (mut arena, mut set) = set_with_segment(8);
        let old = Mark::INITIAL;
        let new = old.next();

        let sizes: Vec<usize> = (1..60).map(|i| (i * 37) % 700 + 16).collect();
        let allocations = allocate(&mut set, &sizes, old);
        for allocation in allocations.iter().step_by(3) {
            header_at(allocation.addr()).mark(new);
        }

        set.sweep(&mut arena, new);

        let core = set.core();
        assert_eq!(
            core.live_object_bytes() + core.dead_object_bytes(),
            core.total_bytes(&arena)
        );
        assert_eq!(set.check_dead_overlap(), None);
        assert_table_consistent(&set);
    }

    #[test]
    fn test_min_split_never_leaves_slivers() {
        let (mut arena, mut set) = set_with_segment(1);
        let old = Mark::INITIAL;
        let new = old.next();
        let min = min_object_size::<TestHeader>();

        // one garbage block just a grain bigger than the request
        let allocations = allocate(&mut set, &[208, 192 + OBJECT_GRAIN], old);
        header_at(allocations[0].addr()).mark(new);
        let rest: usize = set.dead_objects().iter().map(|object| object.size()).sum();
        let tail = allocate(&mut set, &[rest], old)[0];
        header_at(tail.addr()).mark(new);
        set.sweep(&mut arena, new);

        let allocation = set.find_object(192).unwrap();
        assert!(OBJECT_GRAIN < min);
        assert_eq!(allocation.size, 192 + OBJECT_GRAIN);
        for object in set.dead_objects() {
            assert!(object.size() >= min);
        }
    }

    #[test]
    fn test_donate_empty_segment() {
        let (mut arena, mut set) = set_with_segment(4);
        let second = set.add_segment(&mut arena, Block::new(PAGE_SIZE * 8).unwrap());
        assert_eq!(set.core().count(), 2);

        // carve from the smaller segment so only the bigger one is empty
        set.find_object(64).unwrap();

        let donated = set.donate_segment(&mut arena, PAGE_SIZE * 6).unwrap();
        assert_eq!(donated, second);
        assert_eq!(set.core().count(), 1);
        assert_eq!(arena.chain(set.core().anchor()).count(), 1);
        assert!(set.donate_segment(&mut arena, PAGE_SIZE * 6).is_none());
    }

    #[test]
    fn test_recover_segment() {
        let mut arena = SegmentArena::new();
        let recover = Block::new(PAGE_SIZE * 2).unwrap();
        let mut set = NormalSegmentSet::<TestHeader>::new(&mut arena, &HeapConfig::default(), Some(recover));

        assert!(set.has_recover_segment());
        assert!(set.find_object(64).is_none());

        assert!(set.release_recover_segment(&mut arena));
        assert!(!set.release_recover_segment(&mut arena));
        assert!(set.find_object(64).is_some());
    }
}
