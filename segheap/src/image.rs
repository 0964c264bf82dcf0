/// Saving the old space as a heap image and reading it back.
///
/// An image is the tag `SEGHEAP1`, a segment count, then for each old-space
/// segment its length and raw bytes. Integers are little-endian `u64`.
/// Restored objects are marked live in the current epoch; relocating any
/// pointers between them is the object model's business.
use std::io::{self, Read, Write};

use blockalloc::PAGE_SIZE;
use log::info;
use thiserror::Error;

use crate::allocator::{AllocError, AllocHeader};
use crate::heap::Heap;

const IMAGE_TAG: &[u8; 8] = b"SEGHEAP1";

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("no memory for image segment: {0}")]
    Alloc(#[from] AllocError),
    #[error("corrupt image: {0}")]
    Corrupt(String),
}

fn read_u64<R: Read>(input: &mut R) -> Result<u64, ImageError> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

impl<H: AllocHeader> Heap<H> {
    /// Write every old-space segment. Returns the number of segments written.
    pub fn save_image<W: Write>(&self, out: &mut W) -> Result<usize, ImageError> {
        let segments: Vec<_> = self.old_space_segments().collect();

        out.write_all(IMAGE_TAG)?;
        out.write_all(&(segments.len() as u64).to_le_bytes())?;

        let mut bytes = 0;
        for segment in segments.iter() {
            out.write_all(&(segment.size() as u64).to_le_bytes())?;
            // The segment is a single initialized extent owned by the heap
            let contents = unsafe { std::slice::from_raw_parts(segment.start() as *const u8, segment.size()) };
            out.write_all(contents)?;
            bytes += segment.size();
        }
        out.flush()?;

        info!("saved image: {} segments, {} bytes", segments.len(), bytes);
        Ok(segments.len())
    }

    /// Read an image written by `save_image` into new old-space segments.
    /// Returns the number of objects restored.
    pub fn restore_image<R: Read>(&mut self, input: &mut R) -> Result<usize, ImageError> {
        let mut tag = [0u8; 8];
        input.read_exact(&mut tag)?;
        if &tag != IMAGE_TAG {
            return Err(ImageError::Corrupt("bad image tag".to_string()));
        }

        let count = read_u64(input)?;
        let mut objects = 0;

        for index in 0..count {
            let size = read_u64(input)?;
            let size = usize::try_from(size)
                .ok()
                .filter(|&size| size > 0 && size % PAGE_SIZE == 0)
                .ok_or_else(|| ImageError::Corrupt(format!("segment {} has bad length {}", index, size)))?;

            objects += self.restore_old_space_segment(size, |bytes| input.read_exact(bytes))?;
        }

        info!("restored image: {} segments, {} objects", count, objects);
        Ok(objects)
    }
}
