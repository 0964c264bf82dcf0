/// Object model, mark phase and segment source stand-ins shared by the unit
/// tests.
use std::ptr::{self, NonNull};
use std::sync::Arc;

use blockalloc::{Block, PAGE_SIZE};
use parking_lot::Mutex;

use crate::allocator::{AllocHeader, AllocObject, AllocTypeId, Mark};
use crate::heap::Marker;
use crate::source::SegmentSource;

#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TestTypeId {
    Dead,
    Array,
    Word,
    Pair,
}

impl AllocTypeId for TestTypeId {}

#[repr(C)]
pub struct TestHeader {
    size: usize,
    mark: u32,
    type_id: TestTypeId,
}

impl AllocHeader for TestHeader {
    type TypeId = TestTypeId;

    fn new<O: AllocObject<Self::TypeId>>(size: usize, mark: Mark) -> TestHeader {
        TestHeader {
            size,
            mark: mark.as_u32(),
            type_id: O::TYPE_ID,
        }
    }

    fn new_array(size: usize, mark: Mark) -> TestHeader {
        TestHeader {
            size,
            mark: mark.as_u32(),
            type_id: TestTypeId::Array,
        }
    }

    fn new_dead(size: usize) -> TestHeader {
        TestHeader {
            size,
            mark: 0,
            type_id: TestTypeId::Dead,
        }
    }

    fn mark(&mut self, mark: Mark) {
        self.mark = mark.as_u32();
    }

    fn is_live(&self, mark: Mark) -> bool {
        self.mark == mark.as_u32()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    fn type_id(&self) -> TestTypeId {
        self.type_id
    }
}

impl AllocObject<TestTypeId> for usize {
    const TYPE_ID: TestTypeId = TestTypeId::Word;
}

impl AllocObject<TestTypeId> for (usize, usize) {
    const TYPE_ID: TestTypeId = TestTypeId::Pair;
}

/// Write a live object header of `size` bytes at `at`
pub fn write_object(at: NonNull<u8>, size: usize, mark: Mark) -> NonNull<TestHeader> {
    let header = at.cast::<TestHeader>();
    unsafe { ptr::write(header.as_ptr(), TestHeader::new_array(size, mark)) };
    header
}

pub fn header_at(addr: usize) -> &'static mut TestHeader {
    unsafe { &mut *(addr as *mut TestHeader) }
}

/// Scratch memory for tests that don't need a whole segment set
pub struct TestMemory {
    block: Block,
}

impl TestMemory {
    pub fn new() -> TestMemory {
        TestMemory {
            block: Block::new(PAGE_SIZE * 16).unwrap(),
        }
    }

    pub fn at(&mut self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.block.size());
        NonNull::new(unsafe { self.block.as_mut_ptr().add(offset) }).unwrap()
    }
}

/// A mark phase that marks a shared list of object header addresses
#[derive(Clone, Default)]
pub struct RootMarker {
    pub roots: Arc<Mutex<Vec<usize>>>,
    pub calls: Arc<Mutex<usize>>,
}

impl RootMarker {
    pub fn new() -> RootMarker {
        RootMarker::default()
    }

    pub fn root(&self, header: usize) {
        self.roots.lock().push(header);
    }

    pub fn unroot(&self, header: usize) {
        self.roots.lock().retain(|&root| root != header);
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

impl Marker for RootMarker {
    fn mark(&mut self, mark: Mark) {
        *self.calls.lock() += 1;
        for &root in self.roots.lock().iter() {
            header_at(root).mark(mark);
        }
    }
}

/// A segment source that grants a limited number of segments and records
/// every request as `(requested, minimum, granted)`
#[derive(Clone)]
pub struct BudgetSource {
    pub budget: Arc<Mutex<Option<usize>>>,
    pub requests: Arc<Mutex<Vec<(usize, usize, bool)>>>,
}

impl BudgetSource {
    /// Grant every request
    pub fn unlimited() -> BudgetSource {
        BudgetSource {
            budget: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Grant only the next `count` requests
    pub fn limited(count: usize) -> BudgetSource {
        let source = BudgetSource::unlimited();
        source.set_budget(Some(count));
        source
    }

    pub fn set_budget(&self, budget: Option<usize>) {
        *self.budget.lock() = budget;
    }

    pub fn granted(&self) -> usize {
        self.requests.lock().iter().filter(|r| r.2).count()
    }

    pub fn requests(&self) -> Vec<(usize, usize, bool)> {
        self.requests.lock().clone()
    }
}

impl SegmentSource for BudgetSource {
    fn new_segment(&mut self, requested: usize, minimum: usize) -> Option<Block> {
        let mut budget = self.budget.lock();

        let allowed = match *budget {
            Some(0) => false,
            Some(ref mut left) => {
                *left -= 1;
                true
            }
            None => true,
        };

        let block = if allowed {
            Block::new(requested).or_else(|_| Block::new(minimum)).ok()
        } else {
            None
        };

        self.requests
            .lock()
            .push((requested, minimum, block.is_some()));
        block
    }
}
