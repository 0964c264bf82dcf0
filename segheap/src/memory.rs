/// Process-wide access to a heap.
///
/// Every allocation, collection and segment move happens with the heap lock
/// held. The lock is not reentrant: a mark phase or mutator that tries to
/// take it again from the same thread is a bug, and panics rather than
/// deadlocking.
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use parking_lot::{Mutex, MutexGuard};

use crate::allocator::{AllocError, AllocHeader};
use crate::heap::Heap;

fn current_thread_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|token| *token)
}

/// Owns a heap and hands out exclusive access to it
pub struct Memory<H: AllocHeader> {
    heap: Mutex<Heap<H>>,
    owner: AtomicU64,
}

impl<H: AllocHeader> Memory<H> {
    pub fn new(heap: Heap<H>) -> Memory<H> {
        Memory {
            heap: Mutex::new(heap),
            owner: AtomicU64::new(0),
        }
    }

    /// Take the heap lock, blocking until it is free
    pub fn lock(&self) -> HeapGuard<'_, H> {
        let token = current_thread_token();
        if self.owner.load(Ordering::Acquire) == token {
            panic!(
                "heap lock re-entered by thread {:?}",
                thread::current().name().unwrap_or("<unnamed>")
            );
        }

        let guard = self.heap.lock();
        self.owner.store(token, Ordering::Release);
        HeapGuard {
            guard,
            owner: &self.owner,
        }
    }

    /// Run a mutator with the heap locked
    pub fn mutate<M: Mutator<H>>(&self, m: &M, input: M::Input) -> Result<M::Output, AllocError> {
        let mut guard = self.lock();
        m.run(&mut *guard, input)
    }

    /// Run a closure with the heap locked
    pub fn with_heap<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut Heap<H>) -> T,
    {
        let mut guard = self.lock();
        f(&mut *guard)
    }

    pub fn into_inner(self) -> Heap<H> {
        self.heap.into_inner()
    }
}

/// Exclusive access to the heap, released on drop
pub struct HeapGuard<'memory, H: AllocHeader> {
    guard: MutexGuard<'memory, Heap<H>>,
    owner: &'memory AtomicU64,
}

impl<'memory, H: AllocHeader> Deref for HeapGuard<'memory, H> {
    type Target = Heap<H>;

    fn deref(&self) -> &Heap<H> {
        &self.guard
    }
}

impl<'memory, H: AllocHeader> DerefMut for HeapGuard<'memory, H> {
    fn deref_mut(&mut self) -> &mut Heap<H> {
        &mut self.guard
    }
}

impl<'memory, H: AllocHeader> Drop for HeapGuard<'memory, H> {
    fn drop(&mut self) {
        self.owner.store(0, Ordering::Release);
    }
}

/// Defines the interface a heap-mutating type must use to be allowed access to the heap
pub trait Mutator<H: AllocHeader>: Sized {
    type Input;
    type Output;

    fn run(&self, heap: &mut Heap<H>, input: Self::Input) -> Result<Self::Output, AllocError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::test_support::{BudgetSource, RootMarker, TestHeader};
    use blockalloc::PAGE_SIZE;
    use std::sync::Arc;

    fn memory() -> Memory<TestHeader> {
        let config = HeapConfig::default()
            .with_segment_size(PAGE_SIZE * 4)
            .with_minimum_segment_size(PAGE_SIZE * 4)
            .with_initial_normal_size(PAGE_SIZE * 4);
        Memory::new(Heap::new(config, BudgetSource::unlimited(), RootMarker::new()).unwrap())
    }

    struct Sum;

    impl Mutator<TestHeader> for Sum {
        type Input = Vec<usize>;
        type Output = usize;

        fn run(&self, heap: &mut Heap<TestHeader>, input: Vec<usize>) -> Result<usize, AllocError> {
            let mut total = 0;
            for value in input {
                let ptr = heap.alloc(value)?;
                total += unsafe { *ptr.as_ref() };
            }
            Ok(total)
        }
    }

    #[test]
    fn test_mutate() {
        let memory = memory();
        assert_eq!(memory.mutate(&Sum, vec![1, 2, 3]), Ok(6));
        assert_eq!(memory.with_heap(|heap| heap.collections()), 0);
    }

    #[test]
    fn test_lock_is_released() {
        let memory = memory();
        drop(memory.lock());
        memory.with_heap(|heap| heap.collect());
        assert_eq!(memory.into_inner().collections(), 1);
    }

    #[test]
    #[should_panic(expected = "re-entered")]
    fn test_reentry_panics() {
        let memory = memory();
        let _guard = memory.lock();
        let _again = memory.lock();
    }

    #[test]
    fn test_shared_between_threads() {
        let memory = Arc::new(memory());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let memory = Arc::clone(&memory);
                std::thread::spawn(move || memory.mutate(&Sum, vec![1; 10]))
            })
            .collect();

        for worker in workers {
            assert_eq!(worker.join().unwrap(), Ok(10));
        }
    }
}
