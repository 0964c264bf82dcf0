use std::fmt;
use std::ptr::NonNull;

use crate::allocator::{header_size, AllocHeader};

/// A pointer to an object of type `T` in the heap, just past its header.
/// Nothing keeps the object alive: it is only valid until the next
/// collection that doesn't mark it.
pub struct RawPtr<T: Sized> {
    ptr: NonNull<T>,
}

impl<T: Sized> RawPtr<T> {
    /// Create a new RawPtr from a bare pointer, which must not be null
    pub fn new(ptr: *const T) -> RawPtr<T> {
        RawPtr {
            ptr: unsafe { NonNull::new_unchecked(ptr as *mut T) },
        }
    }

    /// Get the pointer value as a word-sized integer
    pub fn as_word(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn as_untyped(&self) -> NonNull<()> {
        self.ptr.cast()
    }

    /// The header in front of the object
    pub fn header<H: AllocHeader>(&self) -> NonNull<H> {
        unsafe { NonNull::new_unchecked((self.ptr.as_ptr() as *mut u8).sub(header_size::<H>())).cast() }
    }

    /// Get a `&` reference to the object. Unsafe because the object may
    /// already have been swept.
    pub unsafe fn as_ref(&self) -> &T {
        self.ptr.as_ref()
    }

    /// Get a `&mut` reference to the object. Unsafe because the object may
    /// already have been swept, and nothing stops two `RawPtr`s to the same
    /// object handing out aliasing references.
    pub unsafe fn as_mut_ref(&mut self) -> &mut T {
        self.ptr.as_mut()
    }
}

impl<T> Clone for RawPtr<T> {
    fn clone(&self) -> RawPtr<T> {
        RawPtr { ptr: self.ptr }
    }
}

impl<T> Copy for RawPtr<T> {}

impl<T: Sized> PartialEq for RawPtr<T> {
    fn eq(&self, other: &RawPtr<T>) -> bool {
        self.ptr == other.ptr
    }
}

impl<T: Sized> fmt::Debug for RawPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RawPtr({:#x})", self.as_word())
    }
}
