use blockalloc::PAGE_SIZE;

use crate::allocator::AllocError;
use crate::constants;

/// Tunables for a `Heap`. `Default` gives the production settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Size of each normal segment added on growth
    pub segment_size: usize,
    /// Smallest segment accepted when the default size can't be had
    pub minimum_segment_size: usize,
    /// Size of each large segment added on growth
    pub large_segment_size: usize,
    /// Segment held back to report memory exhaustion
    pub recover_segment_size: usize,
    /// Normal heap allocated up front
    pub initial_normal_size: usize,
    /// Percentage of free space below which the normal set grows
    pub normal_free_threshold: usize,
    /// Percentage of free space below which the large set grows
    pub large_free_threshold: usize,
    /// Dedicated-segment allocations allowed between collections
    pub single_object_throttle: usize,
}

impl Default for HeapConfig {
    fn default() -> HeapConfig {
        HeapConfig {
            segment_size: constants::SEGMENT_SIZE,
            minimum_segment_size: constants::MINIMUM_SEGMENT_SIZE,
            large_segment_size: constants::LARGE_SEGMENT_SIZE,
            recover_segment_size: constants::RECOVER_SEGMENT_SIZE,
            initial_normal_size: constants::INITIAL_NORMAL_HEAP_SIZE,
            normal_free_threshold: constants::NORMAL_FREE_THRESHOLD,
            large_free_threshold: constants::LARGE_FREE_THRESHOLD,
            single_object_throttle: constants::SINGLE_OBJECT_ALLOCATION_THROTTLE,
        }
    }
}

impl HeapConfig {
    pub fn with_segment_size(mut self, size: usize) -> HeapConfig {
        self.segment_size = size;
        self
    }

    pub fn with_minimum_segment_size(mut self, size: usize) -> HeapConfig {
        self.minimum_segment_size = size;
        self
    }

    pub fn with_large_segment_size(mut self, size: usize) -> HeapConfig {
        self.large_segment_size = size;
        self
    }

    pub fn with_recover_segment_size(mut self, size: usize) -> HeapConfig {
        self.recover_segment_size = size;
        self
    }

    pub fn with_initial_normal_size(mut self, size: usize) -> HeapConfig {
        self.initial_normal_size = size;
        self
    }

    pub fn with_free_thresholds(mut self, normal: usize, large: usize) -> HeapConfig {
        self.normal_free_threshold = normal;
        self.large_free_threshold = large;
        self
    }

    pub fn with_single_object_throttle(mut self, allocations: usize) -> HeapConfig {
        self.single_object_throttle = allocations;
        self
    }

    /// Check that every size is a page multiple and the thresholds are
    /// percentages a set can actually grow towards
    pub fn validate(&self) -> Result<(), AllocError> {
        let sizes = [
            self.segment_size,
            self.minimum_segment_size,
            self.large_segment_size,
            self.recover_segment_size,
        ];
        if sizes.iter().any(|&size| size == 0 || size % PAGE_SIZE != 0) {
            return Err(AllocError::BadRequest);
        }

        if self.initial_normal_size % PAGE_SIZE != 0 {
            return Err(AllocError::BadRequest);
        }

        if self.minimum_segment_size > self.segment_size {
            return Err(AllocError::BadRequest);
        }

        let thresholds = [self.normal_free_threshold, self.large_free_threshold];
        if thresholds.iter().any(|&t| t == 0 || t >= 100) {
            return Err(AllocError::BadRequest);
        }

        Ok(())
    }
}
