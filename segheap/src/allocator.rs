use std::fmt::Debug;
use std::hash::Hash;
use std::mem::size_of;

use blockalloc::BlockError;
use thiserror::Error;

use crate::constants;

/// An allocation error type
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Some attribute of the allocation, most likely the size requested,
    /// could not be fulfilled
    #[error("an invalid memory size allocation was requested")]
    BadRequest,
    /// Every recovery step failed. The emergency segment, if it was still
    /// held back, has been released so that this error can be reported.
    #[error("out of memory")]
    OOM,
}

impl From<BlockError> for AllocError {
    fn from(error: BlockError) -> AllocError {
        match error {
            BlockError::BadRequest => AllocError::BadRequest,
            BlockError::OOM => AllocError::OOM,
        }
    }
}

/// A collection epoch. An object is live iff its header carries the epoch of
/// the most recent mark phase. Zero is never a valid epoch so headers of
/// dead objects can use it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Mark(u32);

impl Mark {
    pub const INITIAL: Mark = Mark(1);

    /// The epoch after this one, skipping zero on wraparound
    pub fn next(self) -> Mark {
        match self.0.wrapping_add(1) {
            0 => Mark(1),
            n => Mark(n),
        }
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// The segment set an allocation is routed to
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Pool {
    Normal,
    Large,
    SingleObject,
    OldSpace,
}

impl Pool {
    /// Route an allocation by its total size in bytes, header included.
    /// Bootstrap routing to `OldSpace` is decided by the heap, not here.
    pub fn for_size(object_size: usize) -> Result<Pool, AllocError> {
        match object_size {
            0 => Err(AllocError::BadRequest),
            s if s < constants::LARGE_BLOCK_THRESHOLD => Ok(Pool::Normal),
            s if s < constants::SINGLE_BLOCK_THRESHOLD => Ok(Pool::Large),
            s if s <= constants::MAX_ALLOC_SIZE => Ok(Pool::SingleObject),
            _ => Err(AllocError::BadRequest),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Pool::Normal => "normal",
            Pool::Large => "large",
            Pool::SingleObject => "single-object",
            Pool::OldSpace => "old-space",
        }
    }
}

/// A managed-type type-identifier type should implement this!
pub trait AllocTypeId: Copy + Debug + Eq + Hash {}

/// All managed object types must implement this trait in order to be allocatable
pub trait AllocObject<T: AllocTypeId> {
    const TYPE_ID: T;
}

/// An object header struct must provide an implementation of this trait.
/// This is the whole of what the heap knows about the object model: every
/// object in a segment starts with a header, and the header's size is the
/// distance to the next object.
pub trait AllocHeader: Sized {
    /// Associated type that identifies the allocated object type
    type TypeId: AllocTypeId;

    /// Create a new header for an object `size` bytes long, header included
    fn new<O: AllocObject<Self::TypeId>>(size: usize, mark: Mark) -> Self;

    /// Create a new header for a byte array `size` bytes long, header included
    fn new_array(size: usize, mark: Mark) -> Self;

    /// Create a header describing free space. It must never be live.
    fn new_dead(size: usize) -> Self;

    /// Set the mark to the given epoch
    fn mark(&mut self, mark: Mark);

    /// Was this object marked in the given epoch
    fn is_live(&self, mark: Mark) -> bool;

    /// Total size of the object in bytes, header included
    fn size(&self) -> usize;

    /// Change the recorded size of the object
    fn set_size(&mut self, size: usize);

    /// Get the type of the object
    fn type_id(&self) -> Self::TypeId;
}

/// Return the allocated size of an object as it's size value rounded up to a
/// double-word boundary
pub fn alloc_size_of(object_size: usize) -> usize {
    let align = size_of::<usize>() * 2;
    (object_size + (align - 1)) & !(align - 1)
}

/// Offset from a header to the object that follows it
pub fn header_size<H: AllocHeader>() -> usize {
    alloc_size_of(size_of::<H>())
}
