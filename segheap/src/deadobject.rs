/// Free space bookkeeping written into the free space itself.
///
/// A dead object is an ordinary object header, built with
/// `AllocHeader::new_dead`, followed by a chain link. Segment walks see it as
/// just another object that is never live, so a run of dead objects and
/// garbage is coalesced by the next sweep without any side table.
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};

use crate::allocator::AllocHeader;
use crate::constants;

#[repr(C)]
struct DeadObject<H> {
    header: H,
    next: Option<NonNull<DeadObject<H>>>,
}

/// The smallest block that can hold a dead object header. No free chain
/// holds anything smaller, and no object is allocated smaller than this.
pub fn min_object_size<H: AllocHeader>() -> usize {
    constants::round_up(size_of::<DeadObject<H>>(), constants::OBJECT_GRAIN)
}

/// A handle to a dead object living in segment memory.
///
/// Handles can only be made by `write`, which is where the unsafety lives:
/// once written, a dead object stays valid for as long as the owning set
/// keeps it indexed.
pub struct DeadObjectRef<H: AllocHeader> {
    ptr: NonNull<DeadObject<H>>,
}

impl<H: AllocHeader> Clone for DeadObjectRef<H> {
    fn clone(&self) -> DeadObjectRef<H> {
        DeadObjectRef { ptr: self.ptr }
    }
}

impl<H: AllocHeader> Copy for DeadObjectRef<H> {}

impl<H: AllocHeader> PartialEq for DeadObjectRef<H> {
    fn eq(&self, other: &DeadObjectRef<H>) -> bool {
        self.ptr == other.ptr
    }
}

impl<H: AllocHeader> std::fmt::Debug for DeadObjectRef<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "DeadObject({:#x}, {})", self.addr(), self.size())
    }
}

impl<H: AllocHeader> DeadObjectRef<H> {
    /// Write a dead object describing `size` bytes at `start`.
    ///
    /// # Safety
    /// `start..start + size` must be memory inside a segment that no live
    /// object occupies, and `start` must be object-grain aligned.
    pub unsafe fn write(start: NonNull<u8>, size: usize) -> DeadObjectRef<H> {
        debug_assert!(size >= min_object_size::<H>());
        debug_assert!(start.as_ptr() as usize % align_of::<DeadObject<H>>() == 0);

        let ptr = start.cast::<DeadObject<H>>();
        ptr::write(
            ptr.as_ptr(),
            DeadObject {
                header: H::new_dead(size),
                next: None,
            },
        );

        DeadObjectRef { ptr }
    }

    pub fn size(&self) -> usize {
        unsafe { self.ptr.as_ref().header.size() }
    }

    pub fn start(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// One past the last byte described
    pub fn end(&self) -> usize {
        self.addr() + self.size()
    }

    fn next(&self) -> Option<DeadObjectRef<H>> {
        unsafe { self.ptr.as_ref().next }.map(|ptr| DeadObjectRef { ptr })
    }

    fn set_next(&self, next: Option<DeadObjectRef<H>>) {
        unsafe { (*self.ptr.as_ptr()).next = next.map(|n| n.ptr) }
    }
}

/// A singly linked chain of dead objects. Whether the chain is kept sorted by
/// size depends on which insertion method the owning set uses; sorted chains
/// must only ever be added to with `insert_sorted`.
pub struct DeadObjectPool<H: AllocHeader> {
    head: Option<DeadObjectRef<H>>,
    count: usize,
}

impl<H: AllocHeader> DeadObjectPool<H> {
    pub fn new() -> DeadObjectPool<H> {
        DeadObjectPool {
            head: None,
            count: 0,
        }
    }

    /// Forget every entry. The memory itself is left as it is; the next
    /// sweep rediscovers it.
    pub fn clear(&mut self) {
        self.head = None;
        self.count = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Add to the front of the chain
    pub fn push(&mut self, object: DeadObjectRef<H>) {
        object.set_next(self.head);
        self.head = Some(object);
        self.count += 1;
    }

    /// Take the front of the chain
    pub fn pop(&mut self) -> Option<DeadObjectRef<H>> {
        let head = self.head?;
        self.head = head.next();
        self.count -= 1;
        Some(head)
    }

    /// Insert keeping the chain in ascending size order
    pub fn insert_sorted(&mut self, object: DeadObjectRef<H>) {
        let size = object.size();

        let mut prev: Option<DeadObjectRef<H>> = None;
        let mut cursor = self.head;

        while let Some(current) = cursor {
            if current.size() >= size {
                break;
            }
            prev = Some(current);
            cursor = current.next();
        }

        object.set_next(cursor);
        match prev {
            Some(prev) => prev.set_next(Some(object)),
            None => self.head = Some(object),
        }
        self.count += 1;
    }

    /// Remove and return the first entry of at least `size` bytes. On a
    /// sorted chain this is the smallest sufficient block.
    pub fn take_first_fit(&mut self, size: usize) -> Option<DeadObjectRef<H>> {
        self.take_where(|object| object.size() >= size)
    }

    /// Remove the entry starting at `addr`, if indexed here
    pub fn remove(&mut self, addr: usize) -> Option<DeadObjectRef<H>> {
        self.take_where(|object| object.addr() == addr)
    }

    fn take_where<F>(&mut self, matches: F) -> Option<DeadObjectRef<H>>
    where
        F: Fn(&DeadObjectRef<H>) -> bool,
    {
        let mut prev: Option<DeadObjectRef<H>> = None;
        let mut cursor = self.head;

        while let Some(current) = cursor {
            if matches(&current) {
                let next = current.next();
                match prev {
                    Some(prev) => prev.set_next(next),
                    None => self.head = next,
                }
                current.set_next(None);
                self.count -= 1;
                return Some(current);
            }
            prev = Some(current);
            cursor = current.next();
        }

        None
    }

    pub fn iter(&self) -> DeadObjectIter<'_, H> {
        DeadObjectIter {
            cursor: self.head,
            _pool: PhantomData,
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.iter().map(|object| object.size()).sum()
    }

    pub fn largest(&self) -> Option<usize> {
        self.iter().map(|object| object.size()).max()
    }
}

impl<H: AllocHeader> Default for DeadObjectPool<H> {
    fn default() -> DeadObjectPool<H> {
        DeadObjectPool::new()
    }
}

pub struct DeadObjectIter<'pool, H: AllocHeader> {
    cursor: Option<DeadObjectRef<H>>,
    _pool: PhantomData<&'pool DeadObjectPool<H>>,
}

impl<'pool, H: AllocHeader> Iterator for DeadObjectIter<'pool, H> {
    type Item = DeadObjectRef<H>;

    fn next(&mut self) -> Option<DeadObjectRef<H>> {
        let current = self.cursor?;
        self.cursor = current.next();
        Some(current)
    }
}

/// Check that no two dead objects across the given chains overlap. Returns
/// the first offending pair.
pub fn find_overlap<H, I>(objects: I) -> Option<(usize, usize)>
where
    H: AllocHeader,
    I: IntoIterator<Item = DeadObjectRef<H>>,
{
    let mut ranges: Vec<(usize, usize)> = objects
        .into_iter()
        .map(|object| (object.addr(), object.end()))
        .collect();
    ranges.sort_unstable();

    ranges
        .windows(2)
        .find(|pair| pair[0].1 > pair[1].0)
        .map(|pair| (pair[0].0, pair[1].0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestHeader, TestMemory};

    fn dead_objects(mem: &mut TestMemory, sizes: &[usize]) -> Vec<DeadObjectRef<TestHeader>> {
        let mut offset = 0;
        sizes
            .iter()
            .map(|&size| {
                let object = unsafe { DeadObjectRef::write(mem.at(offset), size) };
                offset += size;
                object
            })
            .collect()
    }

    #[test]
    fn test_min_object_size_holds_header() {
        let min = min_object_size::<TestHeader>();
        assert!(min >= size_of::<TestHeader>() + size_of::<usize>());
        assert!(min % constants::OBJECT_GRAIN == 0);
    }

    #[test]
    fn test_push_pop_is_lifo() {
        let mut mem = TestMemory::new();
        let objects = dead_objects(&mut mem, &[32, 64, 48]);

        let mut pool = DeadObjectPool::new();
        for object in &objects {
            pool.push(*object);
        }

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.pop(), Some(objects[2]));
        assert_eq!(pool.pop(), Some(objects[1]));
        assert_eq!(pool.pop(), Some(objects[0]));
        assert_eq!(pool.pop(), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_sorted_insert_and_best_fit() {
        let mut mem = TestMemory::new();
        let objects = dead_objects(&mut mem, &[256, 64, 1024, 128]);

        let mut pool = DeadObjectPool::new();
        for object in &objects {
            pool.insert_sorted(*object);
        }

        let sizes: Vec<usize> = pool.iter().map(|o| o.size()).collect();
        assert_eq!(sizes, vec![64, 128, 256, 1024]);

        // smallest sufficient block wins
        let fit = pool.take_first_fit(100).unwrap();
        assert_eq!(fit, objects[3]);
        assert_eq!(pool.len(), 3);

        assert_eq!(pool.take_first_fit(2048), None);
        assert_eq!(pool.largest(), Some(1024));
        assert_eq!(pool.total_bytes(), 64 + 256 + 1024);
    }

    #[test]
    fn test_remove_by_address() {
        let mut mem = TestMemory::new();
        let objects = dead_objects(&mut mem, &[32, 32, 32]);

        let mut pool = DeadObjectPool::new();
        for object in &objects {
            pool.push(*object);
        }

        assert_eq!(pool.remove(objects[1].addr()), Some(objects[1]));
        assert_eq!(pool.remove(objects[1].addr()), None);

        let left: Vec<_> = pool.iter().collect();
        assert_eq!(left, vec![objects[2], objects[0]]);
    }

    #[test]
    fn test_find_overlap() {
        let mut mem = TestMemory::new();
        let objects = dead_objects(&mut mem, &[64, 64]);
        assert_eq!(find_overlap(objects.iter().copied()), None);

        // a second header inside the first object's range
        let inner = unsafe { DeadObjectRef::<TestHeader>::write(mem.at(32), 32) };
        assert_eq!(
            find_overlap(vec![objects[0], inner]),
            Some((objects[0].addr(), inner.addr()))
        );
    }
}
