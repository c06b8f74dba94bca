//! Linear memory of the sandboxed module.
//!
//! Values cross the boundary only by being copied into or out of this buffer.
//! Allocation is a bump pointer; callers take a [`LinearMemory::mark`] before a
//! batch of allocations and [`LinearMemory::release`] it afterwards.

use anyhow::{anyhow, bail, Result};

/// Offset into a [`LinearMemory`]. Zero is never a valid allocation.
pub type MemPtr = u32;

pub const NULL_PTR: MemPtr = 0;

/// Offset 0 is reserved so a zero pointer always reads as null.
const RESERVED_BYTES: u32 = 8;

#[derive(Debug, Clone)]
pub struct LinearMemory {
    bytes: Vec<u8>,
    next: u32,
}

impl LinearMemory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(RESERVED_BYTES as usize, u32::MAX as usize);
        Self {
            bytes: vec![0; capacity],
            next: RESERVED_BYTES,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn used(&self) -> usize {
        self.next as usize
    }

    pub fn alloc(&mut self, size: u32, align: u32) -> Result<MemPtr> {
        let align = align.max(1);
        if !align.is_power_of_two() {
            bail!("alignment {align} is not a power of two");
        }
        let start = self
            .next
            .checked_add(align - 1)
            .map(|value| value & !(align - 1))
            .ok_or_else(|| anyhow!("linear memory address overflow"))?;
        let end = start
            .checked_add(size)
            .ok_or_else(|| anyhow!("linear memory address overflow"))?;
        if end as usize > self.bytes.len() {
            bail!(
                "linear memory exhausted: need {size} bytes at {start}, capacity {}",
                self.bytes.len()
            );
        }
        self.bytes[start as usize..end as usize].fill(0);
        self.next = end;
        Ok(start)
    }

    pub fn mark(&self) -> u32 {
        self.next
    }

    /// Frees every allocation made after `mark` was taken.
    pub fn release(&mut self, mark: u32) {
        self.next = mark.clamp(RESERVED_BYTES, self.next);
    }

    pub fn reset(&mut self) {
        self.next = RESERVED_BYTES;
    }

    pub fn read(&self, ptr: MemPtr, len: u32) -> Result<&[u8]> {
        let range = self.range(ptr, len)?;
        Ok(&self.bytes[range])
    }

    pub fn slice_mut(&mut self, ptr: MemPtr, len: u32) -> Result<&mut [u8]> {
        let range = self.range(ptr, len)?;
        Ok(&mut self.bytes[range])
    }

    pub fn write(&mut self, ptr: MemPtr, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| anyhow!("write too large"))?;
        self.slice_mut(ptr, len)?.copy_from_slice(data);
        Ok(())
    }

    /// Copies `text` into memory with a trailing NUL.
    pub fn write_c_string(&mut self, text: &str) -> Result<MemPtr> {
        if text.as_bytes().contains(&0) {
            bail!("string contains an interior NUL byte");
        }
        let len = u32::try_from(text.len() + 1).map_err(|_| anyhow!("string too large"))?;
        let ptr = self.alloc(len, 1)?;
        let target = self.slice_mut(ptr, len)?;
        target[..text.len()].copy_from_slice(text.as_bytes());
        target[text.len()] = 0;
        Ok(ptr)
    }

    /// Copies a NUL-terminated string out of memory.
    pub fn read_c_string(&self, ptr: MemPtr) -> Result<String> {
        if ptr == NULL_PTR {
            bail!("null string pointer");
        }
        let start = ptr as usize;
        let tail = self
            .bytes
            .get(start..)
            .ok_or_else(|| anyhow!("string pointer {ptr} out of bounds"))?;
        let len = tail
            .iter()
            .position(|byte| *byte == 0)
            .ok_or_else(|| anyhow!("string at {ptr} is not NUL-terminated"))?;
        String::from_utf8(tail[..len].to_vec())
            .map_err(|error| anyhow!("string at {ptr} is not valid UTF-8: {error}"))
    }

    fn range(&self, ptr: MemPtr, len: u32) -> Result<std::ops::Range<usize>> {
        let start = ptr as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                anyhow!(
                    "access of {len} bytes at {ptr} exceeds linear memory of {} bytes",
                    self.bytes.len()
                )
            })?;
        Ok(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_aligns_and_never_returns_null() {
        let mut memory = LinearMemory::new(64);
        let first = memory.alloc(3, 1).expect("first");
        assert_ne!(first, NULL_PTR);
        let second = memory.alloc(8, 8).expect("aligned");
        assert_eq!(second % 8, 0);
        assert!(second >= first + 3);
        assert!(memory.alloc(1024, 8).is_err());
    }

    #[test]
    fn test_release_rewinds_to_mark() {
        let mut memory = LinearMemory::new(128);
        let mark = memory.mark();
        memory.write_c_string("scratch").expect("write");
        assert!(memory.used() > mark as usize);
        memory.release(mark);
        assert_eq!(memory.mark(), mark);
    }

    #[test]
    fn test_c_string_round_trip_and_errors() {
        let mut memory = LinearMemory::new(64);
        let ptr = memory.write_c_string("héllo").expect("write");
        assert_eq!(memory.read_c_string(ptr).expect("read"), "héllo");
        assert!(memory.write_c_string("a\0b").is_err());
        assert!(memory.read_c_string(NULL_PTR).is_err());
        assert!(memory.read_c_string(1000).is_err());

        let end = memory.capacity() as u32 - 2;
        memory.write(end, b"ab").expect("fill tail");
        assert!(memory.read_c_string(end).is_err());
    }
}
