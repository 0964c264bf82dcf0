/// Memory segments and the arena that chains them into segment sets.
///
/// Each set owns a circular chain that starts and ends at a zero-sized
/// anchor node. Chains are linked by `SegmentId` handles into one arena
/// shared by all sets, so moving a segment from one set to another is an
/// unlink followed by a link and its handle never changes.
use std::marker::PhantomData;
use std::ptr::NonNull;

use blockalloc::Block;
use fnv::FnvHashMap;

use crate::allocator::{AllocHeader, AllocTypeId, Mark};
use crate::deadobject::DeadObjectRef;

/// A stable handle to a segment (or a set's anchor) in a `SegmentArena`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SegmentId(u32);

/// One contiguous extent of object storage. The objects in it, read from
/// the start by repeatedly stepping over each object's size, end exactly at
/// the end of the segment.
pub struct MemorySegment {
    block: Block,
    live_objects: usize,
}

impl MemorySegment {
    pub fn new(block: Block) -> MemorySegment {
        MemorySegment {
            block,
            live_objects: 0,
        }
    }

    pub fn start(&self) -> usize {
        self.block.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.block.size()
    }

    pub fn end(&self) -> usize {
        self.start() + self.size()
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }

    /// Live objects found by the last sweep or mark-all
    pub fn live_objects(&self) -> usize {
        self.live_objects
    }

    pub(crate) fn set_live_objects(&mut self, count: usize) {
        self.live_objects = count;
    }

    pub(crate) fn start_ptr(&mut self) -> NonNull<u8> {
        // A Block is never null
        unsafe { NonNull::new_unchecked(self.block.as_mut_ptr()) }
    }

    pub(crate) fn block_mut(&mut self) -> &mut Block {
        &mut self.block
    }

    /// Give the memory back
    pub fn into_block(self) -> Block {
        self.block
    }

    /// Cover the whole segment with a single dead object. Whatever was in the
    /// segment is forgotten.
    pub fn create_dead_object<H: AllocHeader>(&mut self) -> DeadObjectRef<H> {
        self.live_objects = 0;
        let size = self.size();
        unsafe { DeadObjectRef::write(self.start_ptr(), size) }
    }

    /// Walk the objects of the segment in address order
    pub fn objects<H: AllocHeader>(&self) -> ObjectIter<'_, H> {
        ObjectIter {
            cursor: self.start(),
            end: self.end(),
            _segment: PhantomData,
        }
    }

    /// Mark every object reachable in the given epoch, regardless of what it
    /// is. Only used on segments restored from an image. Returns the number
    /// of objects marked.
    pub fn mark_all_objects<H: AllocHeader>(&mut self, mark: Mark) -> usize {
        let mut count = 0;

        for mut header in self.objects::<H>() {
            unsafe { header.as_mut().mark(mark) };
            count += 1;
        }

        self.live_objects = count;
        count
    }

    /// Whether the object chain steps cleanly to the end of the segment.
    /// Used on untrusted contents, where `objects` would panic.
    pub fn object_chain_is_valid<H: AllocHeader>(&self) -> bool {
        let mut cursor = self.start();

        while cursor < self.end() {
            if cursor % std::mem::align_of::<H>() != 0 || self.end() - cursor < std::mem::size_of::<H>() {
                return false;
            }
            let size = unsafe { (*(cursor as *const H)).size() };
            if size == 0 || size > self.end() - cursor {
                return false;
            }
            cursor += size;
        }

        true
    }

    /// Add every object in the segment to a census
    pub fn gather_object_stats<H: AllocHeader>(&self, mark: Mark, stats: &mut ObjectStats<H::TypeId>) {
        for header in self.objects::<H>() {
            let header = unsafe { header.as_ref() };
            stats.record(header.type_id(), header.size(), header.is_live(mark));
        }
    }
}

/// Iterator over the object headers in a segment
pub struct ObjectIter<'segment, H: AllocHeader> {
    cursor: usize,
    end: usize,
    _segment: PhantomData<(&'segment MemorySegment, *const H)>,
}

impl<'segment, H: AllocHeader> Iterator for ObjectIter<'segment, H> {
    type Item = NonNull<H>;

    fn next(&mut self) -> Option<NonNull<H>> {
        if self.cursor >= self.end {
            return None;
        }

        let header = self.cursor as *mut H;
        let size = unsafe { (*header).size() };

        if size == 0 || size > self.end - self.cursor {
            panic!(
                "corrupt object chain: object at {:#x} claims {} bytes, segment ends at {:#x}",
                self.cursor, size, self.end
            );
        }

        self.cursor += size;
        NonNull::new(header)
    }
}

/// Per-type object counts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TypeTally {
    pub objects: usize,
    pub bytes: usize,
    pub live_objects: usize,
    pub live_bytes: usize,
}

/// Object census by type
#[derive(Debug)]
pub struct ObjectStats<T: AllocTypeId> {
    types: FnvHashMap<T, TypeTally>,
}

impl<T: AllocTypeId> ObjectStats<T> {
    pub fn new() -> ObjectStats<T> {
        ObjectStats {
            types: FnvHashMap::default(),
        }
    }

    pub fn record(&mut self, type_id: T, size: usize, live: bool) {
        let tally = self.types.entry(type_id).or_default();
        tally.objects += 1;
        tally.bytes += size;
        if live {
            tally.live_objects += 1;
            tally.live_bytes += size;
        }
    }

    pub fn get(&self, type_id: T) -> TypeTally {
        self.types.get(&type_id).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&T, &TypeTally)> {
        self.types.iter()
    }

    pub fn total(&self) -> TypeTally {
        self.types.values().fold(TypeTally::default(), |acc, t| TypeTally {
            objects: acc.objects + t.objects,
            bytes: acc.bytes + t.bytes,
            live_objects: acc.live_objects + t.live_objects,
            live_bytes: acc.live_bytes + t.live_bytes,
        })
    }
}

impl<T: AllocTypeId> Default for ObjectStats<T> {
    fn default() -> ObjectStats<T> {
        ObjectStats::new()
    }
}

enum Slot {
    Anchor,
    Segment(MemorySegment),
    Vacant,
}

struct Node {
    prev: SegmentId,
    next: SegmentId,
    slot: Slot,
}

/// Owns every segment of a heap along with the anchors of the chains they
/// are linked into
pub struct SegmentArena {
    nodes: Vec<Node>,
    vacant: Vec<SegmentId>,
}

impl SegmentArena {
    pub fn new() -> SegmentArena {
        SegmentArena {
            nodes: Vec::new(),
            vacant: Vec::new(),
        }
    }

    fn alloc_node(&mut self, slot: Slot) -> SegmentId {
        match self.vacant.pop() {
            Some(id) => {
                let node = &mut self.nodes[id.0 as usize];
                node.prev = id;
                node.next = id;
                node.slot = slot;
                id
            }
            None => {
                let id = SegmentId(self.nodes.len() as u32);
                self.nodes.push(Node {
                    prev: id,
                    next: id,
                    slot,
                });
                id
            }
        }
    }

    fn node(&self, id: SegmentId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: SegmentId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    /// Create an empty chain
    pub fn new_anchor(&mut self) -> SegmentId {
        self.alloc_node(Slot::Anchor)
    }

    /// Take ownership of a segment. It is not linked into any chain yet.
    pub fn insert(&mut self, segment: MemorySegment) -> SegmentId {
        self.alloc_node(Slot::Segment(segment))
    }

    /// Link an unlinked segment in directly after `at`
    pub fn link_after(&mut self, at: SegmentId, id: SegmentId) {
        debug_assert!(self.node(id).next == id, "segment is already linked");

        let next = self.node(at).next;
        {
            let node = self.node_mut(id);
            node.prev = at;
            node.next = next;
        }
        self.node_mut(at).next = id;
        self.node_mut(next).prev = id;
    }

    /// Take a segment out of whatever chain it is in
    pub fn unlink(&mut self, id: SegmentId) {
        let (prev, next) = {
            let node = self.node(id);
            (node.prev, node.next)
        };
        self.node_mut(prev).next = next;
        self.node_mut(next).prev = prev;

        let node = self.node_mut(id);
        node.prev = id;
        node.next = id;
    }

    /// Unlink a segment and release its slot, returning the segment
    pub fn remove(&mut self, id: SegmentId) -> MemorySegment {
        self.unlink(id);

        let slot = std::mem::replace(&mut self.node_mut(id).slot, Slot::Vacant);
        match slot {
            Slot::Segment(segment) => {
                self.vacant.push(id);
                segment
            }
            _ => panic!("{:?} is not a segment", id),
        }
    }

    pub fn get(&self, id: SegmentId) -> &MemorySegment {
        match self.node(id).slot {
            Slot::Segment(ref segment) => segment,
            _ => panic!("{:?} is not a segment", id),
        }
    }

    pub fn get_mut(&mut self, id: SegmentId) -> &mut MemorySegment {
        match self.node_mut(id).slot {
            Slot::Segment(ref mut segment) => segment,
            _ => panic!("{:?} is not a segment", id),
        }
    }

    pub fn next(&self, id: SegmentId) -> SegmentId {
        self.node(id).next
    }

    pub fn prev(&self, id: SegmentId) -> SegmentId {
        self.node(id).prev
    }

    /// Iterate the segments of the chain starting at `anchor`
    pub fn chain(&self, anchor: SegmentId) -> Chain<'_> {
        Chain {
            arena: self,
            anchor,
            cursor: self.next(anchor),
        }
    }

    /// Snapshot of a chain's handles, for walks that relink as they go
    pub fn chain_ids(&self, anchor: SegmentId) -> Vec<SegmentId> {
        self.chain(anchor).map(|(id, _)| id).collect()
    }

    /// The segment in the chain that holds `addr`
    pub fn find_containing(&self, anchor: SegmentId, addr: usize) -> Option<SegmentId> {
        self.chain(anchor)
            .find(|(_, segment)| segment.contains(addr))
            .map(|(id, _)| id)
    }
}

impl Default for SegmentArena {
    fn default() -> SegmentArena {
        SegmentArena::new()
    }
}

pub struct Chain<'arena> {
    arena: &'arena SegmentArena,
    anchor: SegmentId,
    cursor: SegmentId,
}

impl<'arena> Iterator for Chain<'arena> {
    type Item = (SegmentId, &'arena MemorySegment);

    fn next(&mut self) -> Option<(SegmentId, &'arena MemorySegment)> {
        if self.cursor == self.anchor {
            return None;
        }
        let id = self.cursor;
        self.cursor = self.arena.next(id);
        Some((id, self.arena.get(id)))
    }
}
