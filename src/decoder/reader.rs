//! Bounds-checked word readers over raw byte buffers
//!
//! One reader is parameterized to a single word width for one format:
//! 32-bit words for gen-1 data, 64-bit words for gen-2. All reads are
//! little-endian to the host; the ingest step has already byte-swapped
//! gen-2 buffers.

use crate::common::{DecodeError, DecodeResult};

/// Non-owning cursor over a buffer of 32-bit little-endian words
#[derive(Debug, Clone, Copy)]
pub struct Word32Reader<'a> {
    data: &'a [u8],
    total_words: usize,
}

impl<'a> Word32Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            total_words: data.len() / 4,
        }
    }

    /// Total size in words
    pub fn total_words(&self) -> usize {
        self.total_words
    }

    /// Read the word at index `i`, failing on out-of-bounds
    #[inline]
    pub fn read(&self, i: usize) -> DecodeResult<u32> {
        if i >= self.total_words {
            return Err(DecodeError::OutOfBounds);
        }
        let offset = i * 4;
        Ok(u32::from_le_bytes(
            self.data[offset..offset + 4].try_into().unwrap(),
        ))
    }

    /// Read the word at index `i` into `out`; returns false on out-of-bounds
    #[inline]
    pub fn read_safe(&self, i: usize, out: &mut u32) -> bool {
        match self.read(i) {
            Ok(word) => {
                *out = word;
                true
            }
            Err(_) => false,
        }
    }

    /// Words remaining after index `i`
    pub fn remaining(&self, i: usize) -> usize {
        self.total_words.saturating_sub(i)
    }

    /// Advance `i` by `n` words; returns false if that would pass the end
    pub fn advance(&self, i: &mut usize, n: usize) -> bool {
        if *i + n > self.total_words {
            return false;
        }
        *i += n;
        true
    }
}

/// Non-owning cursor over a buffer of 64-bit little-endian words
#[derive(Debug, Clone, Copy)]
pub struct Word64Reader<'a> {
    data: &'a [u8],
    total_words: usize,
}

impl<'a> Word64Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            total_words: data.len() / 8,
        }
    }

    pub fn total_words(&self) -> usize {
        self.total_words
    }

    #[inline]
    pub fn read(&self, i: usize) -> DecodeResult<u64> {
        if i >= self.total_words {
            return Err(DecodeError::OutOfBounds);
        }
        let offset = i * 8;
        Ok(u64::from_le_bytes(
            self.data[offset..offset + 8].try_into().unwrap(),
        ))
    }

    #[inline]
    pub fn read_safe(&self, i: usize, out: &mut u64) -> bool {
        match self.read(i) {
            Ok(word) => {
                *out = word;
                true
            }
            Err(_) => false,
        }
    }

    pub fn remaining(&self, i: usize) -> usize {
        self.total_words.saturating_sub(i)
    }

    pub fn advance(&self, i: &mut usize, n: usize) -> bool {
        if *i + n > self.total_words {
            return false;
        }
        *i += n;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_u32_little_endian() {
        let data = [0x78, 0x56, 0x34, 0x12];
        let reader = Word32Reader::new(&data);
        assert_eq!(reader.read(0).unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_read_u32_second_word() {
        let data = [0x00, 0x00, 0x00, 0x00, 0xEF, 0xBE, 0xAD, 0xDE];
        let reader = Word32Reader::new(&data);
        assert_eq!(reader.read(1).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_read_u32_out_of_bounds() {
        let data = [0u8; 8];
        let reader = Word32Reader::new(&data);
        assert_eq!(reader.read(2), Err(DecodeError::OutOfBounds));
    }

    #[test]
    fn test_read_safe() {
        let data = [0x01, 0x00, 0x00, 0x00];
        let reader = Word32Reader::new(&data);
        let mut out = 0u32;
        assert!(reader.read_safe(0, &mut out));
        assert_eq!(out, 1);
        assert!(!reader.read_safe(1, &mut out));
        assert_eq!(out, 1);
    }

    #[test]
    fn test_remaining() {
        let data = [0u8; 16];
        let reader = Word32Reader::new(&data);
        assert_eq!(reader.remaining(0), 4);
        assert_eq!(reader.remaining(3), 1);
        assert_eq!(reader.remaining(4), 0);
        assert_eq!(reader.remaining(100), 0);
    }

    #[test]
    fn test_advance() {
        let data = [0u8; 16];
        let reader = Word32Reader::new(&data);
        let mut i = 0;
        assert!(reader.advance(&mut i, 3));
        assert_eq!(i, 3);
        assert!(reader.advance(&mut i, 1));
        assert_eq!(i, 4);
        assert!(!reader.advance(&mut i, 1));
        assert_eq!(i, 4);
    }

    #[test]
    fn test_partial_trailing_bytes_ignored() {
        // 6 bytes = 1 complete 32-bit word, trailing 2 bytes unreadable
        let data = [0u8; 6];
        let reader = Word32Reader::new(&data);
        assert_eq!(reader.total_words(), 1);
        assert_eq!(reader.read(1), Err(DecodeError::OutOfBounds));
    }

    #[test]
    fn test_read_u64_little_endian() {
        let data = [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01];
        let reader = Word64Reader::new(&data);
        assert_eq!(reader.read(0).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_read_u64_out_of_bounds() {
        let data = [0u8; 8];
        let reader = Word64Reader::new(&data);
        assert_eq!(reader.read(1), Err(DecodeError::OutOfBounds));
    }

    #[test]
    fn test_u64_advance_and_remaining() {
        let data = [0u8; 32];
        let reader = Word64Reader::new(&data);
        assert_eq!(reader.total_words(), 4);
        let mut i = 1;
        assert!(reader.advance(&mut i, 3));
        assert!(!reader.advance(&mut i, 1));
        assert_eq!(reader.remaining(2), 2);
    }
}
