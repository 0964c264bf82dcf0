use std::io;
use std::mem::size_of;
use std::ptr::{self, NonNull};

use log::{debug, error, info, warn};

use crate::allocator::{header_size, AllocError, AllocHeader, AllocObject, Mark, Pool};
use crate::config::HeapConfig;
use crate::constants::{self, OBJECT_GRAIN};
use crate::deadobject::{min_object_size, DeadObjectRef};
use crate::image::ImageError;
use crate::large::LargeSegmentSet;
use crate::normal::NormalSegmentSet;
use crate::oldspace::OldSpaceSegmentSet;
use crate::rawptr::RawPtr;
use crate::segment::{MemorySegment, ObjectStats, SegmentArena};
use crate::segmentset::{Allocation, SegmentSet};
use crate::single::SingleObjectSegmentSet;
use crate::source::SegmentSource;
use crate::stats::{HeapStats, SetStats};

/// The external mark phase. Called with the new epoch at the start of every
/// collection, it must mark every reachable object with it.
pub trait Marker {
    fn mark(&mut self, mark: Mark);
}

impl<F: FnMut(Mark)> Marker for F {
    fn mark(&mut self, mark: Mark) {
        self(mark)
    }
}

/// One step of the allocation failure ladder
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Rung {
    /// Run a full collection and retry
    Collect,
    /// Grow the failing set back to its free-space threshold and retry
    Grow,
    /// Add one segment sized for the request and retry
    ForceAdd,
    /// Take storage from a sibling set
    Scavenge,
    /// Release the emergency segment and report out of memory
    Emergency,
}

const NORMAL_LADDER: &[Rung] = &[
    Rung::Collect,
    Rung::Grow,
    Rung::ForceAdd,
    Rung::Scavenge,
    Rung::Emergency,
];

// A dedicated-segment retry after the collection stands in for growth
const SINGLE_OBJECT_LADDER: &[Rung] = &[Rung::Collect, Rung::Scavenge, Rung::Emergency];

const OLD_SPACE_LADDER: &[Rung] = &[Rung::ForceAdd];

fn ladder(pool: Pool) -> &'static [Rung] {
    match pool {
        Pool::Normal | Pool::Large => NORMAL_LADDER,
        Pool::SingleObject => SINGLE_OBJECT_LADDER,
        Pool::OldSpace => OLD_SPACE_LADDER,
    }
}

/// The heap coordinator: owns the four segment sets and every segment in
/// them, routes allocations, runs collections and walks the failure ladder.
pub struct Heap<H: AllocHeader> {
    config: HeapConfig,
    arena: SegmentArena,
    normal: NormalSegmentSet<H>,
    large: LargeSegmentSet<H>,
    single: SingleObjectSegmentSet<H>,
    old_space: OldSpaceSegmentSet<H>,
    source: Box<dyn SegmentSource + Send>,
    marker: Box<dyn Marker + Send>,
    mark: Mark,
    bootstrapping: bool,
    collections: usize,
    escalation: Vec<Rung>,
}

// Segment memory and the free chains threaded through it are only reachable
// through the heap, so the heap can move between threads as a whole.
unsafe impl<H: AllocHeader> Send for Heap<H> {}

impl<H: AllocHeader> Heap<H> {
    /// Create a heap, reserving the emergency segment and the initial normal
    /// heap from `source`
    pub fn new<S, M>(config: HeapConfig, source: S, marker: M) -> Result<Heap<H>, AllocError>
    where
        S: SegmentSource + Send + 'static,
        M: Marker + Send + 'static,
    {
        config.validate()?;

        let mut source: Box<dyn SegmentSource + Send> = Box::new(source);
        let mut arena = SegmentArena::new();

        let recover = source
            .new_segment(config.recover_segment_size, config.recover_segment_size)
            .ok_or(AllocError::OOM)?;

        let mut normal = NormalSegmentSet::new(&mut arena, &config, Some(recover));
        if config.initial_normal_size > 0 {
            let added = normal.expand(&mut arena, &mut *source, config.initial_normal_size);
            if added == 0 {
                return Err(AllocError::OOM);
            }
        }

        let large = LargeSegmentSet::new(&mut arena, &config);
        let single = SingleObjectSegmentSet::new(&mut arena, &config);
        let old_space = OldSpaceSegmentSet::new(&mut arena, &config);

        debug!(
            "heap created: {} byte normal heap, {} byte recover segment",
            normal.core().total_bytes(&arena),
            config.recover_segment_size
        );

        Ok(Heap {
            config,
            arena,
            normal,
            large,
            single,
            old_space,
            source,
            marker: Box::new(marker),
            mark: Mark::INITIAL,
            bootstrapping: false,
            collections: 0,
            escalation: Vec::new(),
        })
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The current collection epoch. New objects are allocated live in it.
    pub fn mark(&self) -> Mark {
        self.mark
    }

    pub fn collections(&self) -> usize {
        self.collections
    }

    /// Replace the mark phase
    pub fn set_marker<M: Marker + Send + 'static>(&mut self, marker: M) {
        self.marker = Box::new(marker);
    }

    /// Route every allocation to the old space until `end_bootstrap`
    pub fn begin_bootstrap(&mut self) {
        debug!("bootstrap started");
        self.bootstrapping = true;
    }

    pub fn end_bootstrap(&mut self) {
        debug!(
            "bootstrap finished: {} bytes in old space",
            self.old_space.core().live_object_bytes()
        );
        self.bootstrapping = false;
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrapping
    }

    /// The rungs of the most recent allocation failure, in the order tried
    pub fn last_escalation(&self) -> &[Rung] {
        &self.escalation
    }

    pub fn has_recover_segment(&self) -> bool {
        self.normal.has_recover_segment()
    }

    /// Write an object into the heap and return a pointer to it
    pub fn alloc<T>(&mut self, object: T) -> Result<RawPtr<T>, AllocError>
    where
        T: AllocObject<H::TypeId>,
    {
        let header_size = header_size::<H>();
        let allocation = self.allocate(header_size + size_of::<T>())?;

        unsafe {
            let space = allocation.ptr.as_ptr();
            ptr::write(space as *mut H, H::new::<T>(allocation.size, self.mark));

            let object_space = space.add(header_size) as *mut T;
            ptr::write(object_space, object);
            Ok(RawPtr::new(object_space))
        }
    }

    /// Allocate a zeroed byte array of at least `capacity` bytes
    pub fn alloc_array(&mut self, capacity: usize) -> Result<RawPtr<u8>, AllocError> {
        let header_size = header_size::<H>();
        let size = header_size
            .checked_add(capacity)
            .ok_or(AllocError::BadRequest)?;
        let allocation = self.allocate(size)?;

        unsafe {
            let space = allocation.ptr.as_ptr();
            ptr::write(space as *mut H, H::new_array(allocation.size, self.mark));

            let array_space = space.add(header_size);
            ptr::write_bytes(array_space, 0, allocation.size - header_size);
            Ok(RawPtr::new(array_space))
        }
    }

    /// Return the object header for a given object pointer
    pub fn get_header(object: NonNull<()>) -> NonNull<H> {
        unsafe { NonNull::new_unchecked(object.cast::<u8>().as_ptr().sub(header_size::<H>())).cast() }
    }

    /// Return the object from its header address
    pub fn get_object(header: NonNull<H>) -> NonNull<()> {
        unsafe { NonNull::new_unchecked(header.cast::<u8>().as_ptr().add(header_size::<H>())).cast() }
    }

    /// Truncate an object in place to `new_size` bytes of payload. If the
    /// freed tail can hold a dead object it is written as one and reclaimed by
    /// the next sweep; otherwise the object keeps its size. An object never
    /// shrinks below the minimum object size, so it can always be rewritten
    /// as a dead object once it dies. Returns the object's resulting total
    /// size.
    ///
    /// # Safety
    ///
    /// `object` must point at an object allocated by this heap that is still
    /// live, and nothing may hold a reference into the part being cut off.
    pub unsafe fn shrink_object(&mut self, object: NonNull<()>, new_size: usize) -> Result<usize, AllocError> {
        let mut header = Heap::<H>::get_header(object);
        debug_assert!(
            self.owns(header.as_ptr() as usize),
            "shrink_object called with a pointer outside the heap"
        );
        let header = header.as_mut();

        let old_size = header.size();
        let wanted = header_size::<H>()
            .checked_add(new_size)
            .map(|size| constants::round_up(size, OBJECT_GRAIN).max(min_object_size::<H>()))
            .ok_or(AllocError::BadRequest)?;

        if wanted > old_size {
            return Err(AllocError::BadRequest);
        }

        let tail = old_size - wanted;
        if tail < min_object_size::<H>() {
            return Ok(old_size);
        }

        header.set_size(wanted);
        let tail_start = NonNull::new_unchecked((header as *mut H as *mut u8).add(wanted));
        DeadObjectRef::<H>::write(tail_start, tail);

        debug!("shrunk object from {} to {} bytes", old_size, wanted);
        Ok(wanted)
    }

    /// Run the mark phase in a new epoch, then sweep every collected set
    pub fn collect(&mut self) {
        self.mark = self.mark.next();
        let mark = self.mark;
        self.marker.mark(mark);

        self.sweep();
        self.collections += 1;

        info!(
            "collection {} complete: normal {}% free, large {}% free, {} single-object segments",
            self.collections,
            self.normal.core().free_percent(),
            self.large.core().free_percent(),
            self.single.core().count()
        );
    }

    /// Single-object segments go first so that what they hand over is swept
    /// with the rest of the normal set. Old space is never swept.
    fn sweep(&mut self) {
        let mark = self.mark;

        self.single.sweep(&mut self.arena, mark);
        for id in self.single.take_transfers() {
            debug!(
                "transferring {} byte segment from single-object to normal set",
                self.arena.get(id).size()
            );
            self.normal.adopt_segment(&mut self.arena, id);
        }

        self.normal.sweep(&mut self.arena, mark);
        self.large.sweep(&mut self.arena, mark);
    }

    /// Grow the normal and large sets back to their free-space thresholds.
    /// Returns the bytes added.
    pub fn adjust_memory_size(&mut self) -> usize {
        let normal = self.normal.adjust_memory_size(&mut self.arena, &mut *self.source);
        let large = self.large.adjust_memory_size(&mut self.arena, &mut *self.source);
        normal + large
    }

    fn pool_for(&self, size: usize) -> Result<Pool, AllocError> {
        let pool = Pool::for_size(size)?;
        if self.bootstrapping {
            Ok(Pool::OldSpace)
        } else {
            Ok(pool)
        }
    }

    fn set(&self, pool: Pool) -> &dyn SegmentSet<H> {
        match pool {
            Pool::Normal => &self.normal,
            Pool::Large => &self.large,
            Pool::SingleObject => &self.single,
            Pool::OldSpace => &self.old_space,
        }
    }

    /// A set along with the arena and source it needs to change
    fn parts(&mut self, pool: Pool) -> (&mut dyn SegmentSet<H>, &mut SegmentArena, &mut dyn SegmentSource) {
        let set: &mut dyn SegmentSet<H> = match pool {
            Pool::Normal => &mut self.normal,
            Pool::Large => &mut self.large,
            Pool::SingleObject => &mut self.single,
            Pool::OldSpace => &mut self.old_space,
        };
        (set, &mut self.arena, &mut *self.source)
    }

    /// Find storage for an object of `size` bytes, header included. The
    /// storage is covered by a dead header that the caller overwrites.
    fn allocate(&mut self, size: usize) -> Result<Allocation, AllocError> {
        let pool = self.pool_for(size)?;
        let size = self.set(pool).allocation_size(size);

        match self.try_allocate(pool, size) {
            Some(allocation) => Ok(allocation),
            None => self.handle_allocation_failure(pool, size),
        }
    }

    fn try_allocate(&mut self, pool: Pool, size: usize) -> Option<Allocation> {
        let (set, arena, source) = self.parts(pool);
        set.allocate(arena, source, size)
    }

    /// Climb the ladder for `pool` one rung at a time, stopping at the first
    /// that produces storage
    fn handle_allocation_failure(&mut self, pool: Pool, size: usize) -> Result<Allocation, AllocError> {
        self.escalation.clear();

        for &rung in ladder(pool) {
            self.escalation.push(rung);

            let allocation = match rung {
                Rung::Collect => {
                    self.collect();
                    self.try_allocate(pool, size)
                }
                Rung::Grow => {
                    let (set, arena, source) = self.parts(pool);
                    set.adjust_memory_size(arena, source);
                    self.try_allocate(pool, size)
                }
                Rung::ForceAdd => {
                    let (set, arena, source) = self.parts(pool);
                    if set.force_add_segment(arena, source, size) {
                        self.try_allocate(pool, size)
                    } else {
                        None
                    }
                }
                Rung::Scavenge => self.scavenge(pool, size),
                Rung::Emergency => {
                    if self.normal.release_recover_segment(&mut self.arena) {
                        warn!("{} set: emergency segment released", pool.name());
                    }
                    None
                }
            };

            if let Some(allocation) = allocation {
                debug!(
                    "{} set: {} bytes found after {:?}",
                    pool.name(),
                    size,
                    self.escalation
                );
                return Ok(allocation);
            }

            warn!("{} set: {:?} failed to find {} bytes", pool.name(), rung, size);
        }

        error!("{} set: out of memory allocating {} bytes", pool.name(), size);
        Err(AllocError::OOM)
    }

    /// Take storage from a sibling: a whole empty segment if one is big
    /// enough, else a block out of its free space
    fn scavenge(&mut self, pool: Pool, size: usize) -> Option<Allocation> {
        let arena = &mut self.arena;

        match pool {
            Pool::Normal => {
                if let Some(id) = self.large.donate_segment(arena, size) {
                    debug!("normal set: scavenged a segment from the large set");
                    self.normal.adopt_empty_segment(arena, id);
                    return self.normal.find_object(size);
                }
                self.large.donate_object(size)
            }
            Pool::Large => {
                if let Some(id) = self.normal.donate_segment(arena, size) {
                    debug!("large set: scavenged a segment from the normal set");
                    self.large.adopt_empty_segment(arena, id);
                    return self.large.find_object(size);
                }
                self.normal.donate_object(size)
            }
            Pool::SingleObject => {
                let id = match self.large.donate_segment(arena, size) {
                    Some(id) => id,
                    None => self.normal.donate_segment(arena, size)?,
                };
                debug!("single-object set: scavenged a segment");
                Some(self.single.allocate_in_donated(arena, id))
            }
            Pool::OldSpace => None,
        }
    }

    fn sets(&self) -> [&dyn SegmentSet<H>; 4] {
        [&self.normal, &self.large, &self.single, &self.old_space]
    }

    /// Segment counts, byte totals and a census of every object by type
    pub fn gather_stats(&self) -> HeapStats<H::TypeId> {
        let mut objects = ObjectStats::new();
        let mut sets = Vec::new();

        for set in self.sets() {
            sets.push(SetStats::gather::<H, _>(set, &self.arena));
            SetStats::census::<H, _>(set, &self.arena, self.mark, &mut objects);
        }

        HeapStats {
            mark: self.mark,
            collections: self.collections,
            sets,
            objects,
        }
    }

    /// Write one line per segment
    pub fn dump_segments<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        for set in self.sets() {
            let core = set.core();
            writeln!(
                out,
                "{} set: {} segments, {} live bytes, {} dead bytes",
                core.name(),
                core.count(),
                core.live_object_bytes(),
                core.dead_object_bytes()
            )?;

            for (_, segment) in self.arena.chain(core.anchor()) {
                writeln!(
                    out,
                    "  {:#x}-{:#x} {:>10} bytes {:>8} live objects",
                    segment.start(),
                    segment.end(),
                    segment.size(),
                    segment.live_objects()
                )?;
            }
        }

        Ok(())
    }

    /// Debug validator: the first set with overlapping indexed dead objects
    pub fn check_dead_overlap(&self) -> Option<(Pool, (usize, usize))> {
        self.sets()
            .iter()
            .find_map(|set| set.check_dead_overlap().map(|pair| (set.core().pool(), pair)))
    }

    /// Does any set own the segment holding `addr`
    fn owns(&self, addr: usize) -> bool {
        self.sets()
            .iter()
            .any(|set| self.arena.find_containing(set.core().anchor(), addr).is_some())
    }

    pub(crate) fn old_space_segments(&self) -> impl Iterator<Item = &MemorySegment> {
        self.arena
            .chain(self.old_space.core().anchor())
            .map(|(_, segment)| segment)
    }

    /// Load one image segment of `size` bytes into a fresh old-space segment
    /// with `fill`, then mark everything in it live. Returns the number of
    /// objects.
    pub(crate) fn restore_old_space_segment<F>(&mut self, size: usize, fill: F) -> Result<usize, ImageError>
    where
        F: FnOnce(&mut [u8]) -> io::Result<()>,
    {
        let mut block = match self.source.new_segment(size, size) {
            Some(block) if block.size() == size => block,
            _ => return Err(ImageError::Alloc(AllocError::OOM)),
        };
        block.zero();
        fill(unsafe { block.as_mut_slice() })?;

        let segment = MemorySegment::new(block);
        if !segment.object_chain_is_valid::<H>() {
            return Err(ImageError::Corrupt(format!(
                "segment of {} bytes does not hold a valid object chain",
                size
            )));
        }

        let mark = self.mark;
        let (_, objects) = self
            .old_space
            .restore_segment(&mut self.arena, segment.into_block(), mark);
        Ok(objects)
    }
}
