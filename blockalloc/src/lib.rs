/// An extent allocator for blocks of memory that must be:
///  - a non-zero multiple of the page size in length
///  - aligned to the page size
///
/// On unix this goes through `posix_memalign`, elsewhere through the
/// stabilized std Alloc API.
/// https://doc.rust-lang.org/std/alloc/index.html
///
/// Usage:
/// ```
/// use blockalloc::{Block, PAGE_SIZE};
///
/// let size = PAGE_SIZE * 4;  // must be a multiple of PAGE_SIZE
/// let block = Block::new(size).unwrap();
/// assert_eq!(block.size(), size);
/// ```
///
/// Normal scoping rules will call Block::drop() when `block` goes out of scope
/// causing the block to be handed back to the system allocator.
use std::ptr::NonNull;

use thiserror::Error;

pub type BlockPtr = NonNull<u8>;
pub type BlockSize = usize;

/// Every block is aligned to, and sized in multiples of, this many bytes
pub const PAGE_SIZE: BlockSize = 4096;

/// Set of possible block allocation failures
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum BlockError {
    /// Usually means requested block size was zero or not a page multiple
    #[error("block size must be a non-zero multiple of the page size")]
    BadRequest,
    /// Insufficient memory, couldn't allocate a block
    #[error("out of memory allocating a block")]
    OOM,
}

/// Round a byte count up to the next page boundary, or None on overflow
pub fn round_to_page(size: BlockSize) -> Option<BlockSize> {
    size.checked_add(PAGE_SIZE - 1).map(|s| s & !(PAGE_SIZE - 1))
}

/// A page-aligned extent of memory
pub struct Block {
    ptr: BlockPtr,
    size: BlockSize,
}

impl Block {
    /// Instantiate a new block of the given size. Size must be a multiple of
    /// `PAGE_SIZE`.
    pub fn new(size: BlockSize) -> Result<Block, BlockError> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(BlockError::BadRequest);
        }

        Ok(Block {
            ptr: internal::alloc_block(size)?,
            size,
        })
    }

    /// Consume and return the pointer only. The memory is leaked unless it is
    /// reassembled with `from_raw_parts`.
    pub fn into_mut_ptr(self) -> BlockPtr {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }

    /// Return the size in bytes of the block
    pub fn size(&self) -> BlockSize {
        self.size
    }

    /// Unsafely reassemble from pointer and size
    pub unsafe fn from_raw_parts(ptr: BlockPtr, size: BlockSize) -> Block {
        Block { ptr, size }
    }

    /// Return a bare pointer to the base of the block
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Return a mutable bare pointer to the base of the block
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// View the block contents as bytes. Unsafe because the caller must know
    /// the whole block has been initialized.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.size)
    }

    /// Mutable byte view of the block. Unsafe for the same reason as
    /// `as_slice`: a fresh block is uninitialized until `zero` or some other
    /// write has covered all of it.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size)
    }

    /// Fill the whole block with zero bytes
    pub fn zero(&mut self) {
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.size) }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        internal::dealloc_block(self.ptr, self.size);
    }
}

// A Block uniquely owns its extent.
unsafe impl Send for Block {}

/// The set of possible allocation sources
#[derive(Debug, PartialEq)]
pub enum BlockSource {
    RustAlloc,
    PosixMemalign,
}

pub fn block_source() -> BlockSource {
    internal::BLOCK_SOURCE
}

#[cfg(unix)]
mod internal {
    use super::{BlockError, BlockPtr, BlockSize, BlockSource, PAGE_SIZE};
    use std::ptr::{self, NonNull};

    pub const BLOCK_SOURCE: BlockSource = BlockSource::PosixMemalign;

    pub fn alloc_block(size: BlockSize) -> Result<BlockPtr, BlockError> {
        let mut ptr: *mut libc::c_void = ptr::null_mut();

        let result = unsafe { libc::posix_memalign(&mut ptr, PAGE_SIZE, size) };

        if result != 0 {
            return Err(BlockError::OOM);
        }

        NonNull::new(ptr as *mut u8).ok_or(BlockError::OOM)
    }

    pub fn dealloc_block(ptr: BlockPtr, _size: BlockSize) {
        unsafe { libc::free(ptr.as_ptr() as *mut libc::c_void) }
    }
}

#[cfg(not(unix))]
mod internal {
    use super::{BlockError, BlockPtr, BlockSize, BlockSource, PAGE_SIZE};
    use std::alloc::{alloc, dealloc, Layout};
    use std::ptr::NonNull;

    pub const BLOCK_SOURCE: BlockSource = BlockSource::RustAlloc;

    pub fn alloc_block(size: BlockSize) -> Result<BlockPtr, BlockError> {
        unsafe {
            let layout = Layout::from_size_align_unchecked(size, PAGE_SIZE);

            NonNull::new(alloc(layout)).ok_or(BlockError::OOM)
        }
    }

    pub fn dealloc_block(ptr: BlockPtr, size: BlockSize) {
        unsafe {
            let layout = Layout::from_size_align_unchecked(size, PAGE_SIZE);

            dealloc(ptr.as_ptr(), layout);
        }
    }
}

#[cfg(test)]
mod tests {

    use crate::{block_source, round_to_page, Block, BlockError, BlockSize, BlockSource, PAGE_SIZE};

    fn alloc_dealloc(size: BlockSize) -> Result<(), BlockError> {
        let block = Block::new(size)?;

        // the block address bitwise AND the page alignment bits should
        // be zero
        let mask = PAGE_SIZE - 1;
        assert!(block.ptr.as_ptr() as usize & mask == 0);

        drop(block);
        Ok(())
    }

    #[test]
    fn test_bad_size() {
        assert!(alloc_dealloc(999) == Err(BlockError::BadRequest));
        assert!(alloc_dealloc(0) == Err(BlockError::BadRequest));
    }

    #[test]
    fn test_4k() {
        assert!(alloc_dealloc(4096).is_ok())
    }

    #[test]
    fn test_non_power_of_two() {
        assert!(alloc_dealloc(PAGE_SIZE * 3).is_ok())
    }

    #[test]
    fn test_16m() {
        assert!(alloc_dealloc(16 * 1024 * 1024).is_ok())
    }

    #[test]
    fn test_round_to_page() {
        assert_eq!(round_to_page(1), Some(PAGE_SIZE));
        assert_eq!(round_to_page(PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(round_to_page(PAGE_SIZE + 1), Some(PAGE_SIZE * 2));
        assert_eq!(round_to_page(usize::MAX), None);
    }

    #[test]
    fn test_writable_and_raw_round_trip() {
        let mut block = Block::new(PAGE_SIZE).unwrap();
        block.zero();
        unsafe { block.as_mut_slice()[PAGE_SIZE - 1] = 0xAB };

        let ptr = block.into_mut_ptr();
        let block = unsafe { Block::from_raw_parts(ptr, PAGE_SIZE) };

        let bytes = unsafe { block.as_slice() };
        assert_eq!(bytes[PAGE_SIZE - 1], 0xAB);
        assert!(bytes[..PAGE_SIZE - 1].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_source() {
        if cfg!(unix) {
            assert_eq!(block_source(), BlockSource::PosixMemalign);
        } else {
            assert_eq!(block_source(), BlockSource::RustAlloc);
        }
    }
}
