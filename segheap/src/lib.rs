mod allocator;
mod config;
mod constants;
mod deadobject;
mod heap;
mod image;
mod large;
mod memory;
mod normal;
mod oldspace;
mod rawptr;
mod segment;
mod segmentset;
mod single;
mod source;
mod stats;

#[cfg(test)]
mod test_support;

pub use allocator::{
    alloc_size_of, header_size, AllocError, AllocHeader, AllocObject, AllocTypeId, Mark, Pool,
};

pub use config::HeapConfig;

pub use constants::{
    round_up, DEAD_POOLS, LARGE_ALLOCATION_UNIT, LARGE_BLOCK_THRESHOLD, OBJECT_GRAIN,
    PAGE_SIZE, SINGLE_BLOCK_THRESHOLD,
};

pub use deadobject::{min_object_size, DeadObjectPool, DeadObjectRef};

pub use heap::{Heap, Marker, Rung};

pub use image::ImageError;

pub use large::LargeSegmentSet;

pub use memory::{HeapGuard, Memory, Mutator};

pub use normal::NormalSegmentSet;

pub use oldspace::OldSpaceSegmentSet;

pub use rawptr::RawPtr;

pub use segment::{MemorySegment, ObjectIter, ObjectStats, SegmentArena, SegmentId, TypeTally};

pub use segmentset::{growth_needed, Allocation, SegmentSet, SegmentSetCore, SweepTally};

pub use single::SingleObjectSegmentSet;

pub use source::{OsSegmentSource, SegmentSource};

pub use stats::{HeapStats, SetStats};
