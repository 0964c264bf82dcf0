pub use blockalloc::PAGE_SIZE;

/// Every object starts on, and is sized in multiples of, this many bytes
pub const OBJECT_GRAIN_BITS: usize = 4;
pub const OBJECT_GRAIN: usize = 1 << OBJECT_GRAIN_BITS;

/// Objects of this size and above are allocated from the large segment set
pub const LARGE_BLOCK_THRESHOLD: usize = 4096;

/// Number of exact size-class free chains kept by the normal segment set
pub const DEAD_POOLS: usize = LARGE_BLOCK_THRESHOLD / OBJECT_GRAIN;

/// Large objects are rounded up to a multiple of this
pub const LARGE_ALLOCATION_UNIT: usize = 512;

/// Objects of this size and above get a segment of their own
pub const SINGLE_BLOCK_THRESHOLD: usize = 1 << 20;

/// Default normal segment size
pub const SEGMENT_SIZE: usize = 256 * 1024;

/// Smallest segment worth asking the system for
pub const MINIMUM_SEGMENT_SIZE: usize = SEGMENT_SIZE / 2;

/// Default large segment size
pub const LARGE_SEGMENT_SIZE: usize = 4 * 1024 * 1024;

/// Size of the segment held back for reporting memory exhaustion
pub const RECOVER_SEGMENT_SIZE: usize = 64 * 1024;

/// Normal heap size at startup
pub const INITIAL_NORMAL_HEAP_SIZE: usize = 2 * SEGMENT_SIZE;

/// Grow a set when post-sweep free space falls below this percentage
pub const NORMAL_FREE_THRESHOLD: usize = 30;
pub const LARGE_FREE_THRESHOLD: usize = 40;

/// Dedicated-segment allocations allowed between collections
pub const SINGLE_OBJECT_ALLOCATION_THROTTLE: usize = 32;

pub const MAX_ALLOC_SIZE: usize = isize::MAX as usize / 2;

/// Round `size` up to a multiple of `unit`, which must be a power of two
pub const fn round_up(size: usize, unit: usize) -> usize {
    (size + unit - 1) & !(unit - 1)
}
