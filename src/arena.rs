//! Fixed-size, 8-byte aligned host byte regions.
//!
//! The transpile backend owns one arena per purpose (arguments, each tree
//! root, global temporaries, ndarrays). An arena is sized once and never
//! resized, so pointers handed to generated code stay valid for its life.

use crate::error::{BackendError, Result};

pub struct Arena {
    words: Box<[u64]>,
    len: usize,
}

impl Arena {
    /// Zero-filled arena of `len` bytes.
    pub fn new(len: usize) -> Self {
        let words = vec![0u64; len.div_ceil(8).max(1)].into_boxed_slice();
        Self { words, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr().cast()
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let range = self.check(offset, len)?;
        Ok(&self.as_bytes()[range])
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let range = self.check(offset, data.len())?;
        self.as_bytes_mut()[range].copy_from_slice(data);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    fn check(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(offset..end),
            _ => Err(BackendError::Transfer(format!(
                "range {}..{} outside arena of {} bytes",
                offset,
                offset.saturating_add(len),
                self.len
            ))),
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_and_aligned() {
        let mut arena = Arena::new(13);
        assert_eq!(arena.len(), 13);
        assert!(arena.as_bytes().iter().all(|&b| b == 0));
        assert_eq!(arena.as_mut_ptr() as usize % 8, 0);
    }

    #[test]
    fn test_write_read() {
        let mut arena = Arena::new(16);
        arena.write(4, &7u32.to_le_bytes()).unwrap();
        assert_eq!(arena.read(4, 4).unwrap(), &7u32.to_le_bytes());
        arena.clear();
        assert_eq!(arena.read(4, 4).unwrap(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut arena = Arena::new(8);
        assert!(arena.write(6, &[0; 4]).is_err());
        assert!(arena.read(usize::MAX, 2).is_err());
        assert!(arena.read(8, 0).is_ok());
    }

    #[test]
    fn test_empty_arena_has_stable_pointer() {
        let mut arena = Arena::new(0);
        assert!(arena.is_empty());
        assert!(!arena.as_mut_ptr().is_null());
    }
}
