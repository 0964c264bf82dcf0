use blockalloc::{round_to_page, Block};
use log::debug;

/// Where segment memory comes from. The heap asks for `requested` bytes and
/// will settle for `minimum`; both are page multiples. `None` means the
/// system has nothing to give, which is not an error at this level: the
/// caller moves on to its next recovery step.
pub trait SegmentSource {
    fn new_segment(&mut self, requested: usize, minimum: usize) -> Option<Block>;
}

/// Segments straight from the system allocator
#[derive(Default)]
pub struct OsSegmentSource {
    segments_allocated: usize,
    bytes_allocated: usize,
}

impl OsSegmentSource {
    pub fn new() -> OsSegmentSource {
        OsSegmentSource::default()
    }

    pub fn segments_allocated(&self) -> usize {
        self.segments_allocated
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }
}

impl SegmentSource for OsSegmentSource {
    fn new_segment(&mut self, requested: usize, minimum: usize) -> Option<Block> {
        let requested = round_to_page(requested)?;
        let minimum = round_to_page(minimum)?.min(requested);

        let block = match Block::new(requested) {
            Ok(block) => block,
            Err(error) if minimum < requested => {
                debug!(
                    "segment of {} bytes failed ({}), retrying with {}",
                    requested, error, minimum
                );
                Block::new(minimum).ok()?
            }
            Err(_) => return None,
        };

        self.segments_allocated += 1;
        self.bytes_allocated += block.size();
        Some(block)
    }
}
