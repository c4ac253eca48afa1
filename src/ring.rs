//! Fixed-capacity circular byte arena with framing primitives.
//!
//! One producer advances `free_cursor` by packing, one consumer advances
//! `used_cursor` by unpacking or releasing. A single byte is always kept free
//! so that `used == free` unambiguously means empty.
//!
//! Writes never straddle the physical end of the arena: when a message does not
//! fit in the bytes left before the end, the producer skips the tail (it is
//! accounted as used) and writes from offset 0 instead.

use crate::error::{IofwdError, IofwdResult};

/// Byte storage backing a [`RingBuffer`].
pub trait Arena {
    /// Number of addressable bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `src` into the arena at `offset`.
    fn write_at(&mut self, offset: usize, src: &[u8]);

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    fn read_at(&self, offset: usize, dst: &mut [u8]);
}

impl Arena for Vec<u8> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn write_at(&mut self, offset: usize, src: &[u8]) {
        self[offset..offset + src.len()].copy_from_slice(src);
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) {
        dst.copy_from_slice(&self[offset..offset + dst.len()]);
    }
}

impl Arena for Box<[u8]> {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn write_at(&mut self, offset: usize, src: &[u8]) {
        self[offset..offset + src.len()].copy_from_slice(src);
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) {
        dst.copy_from_slice(&self[offset..offset + dst.len()]);
    }
}

/// Size in bytes of an array length prefix.
pub const ARRAY_LEN_SIZE: usize = std::mem::size_of::<i32>();

/// Encoded size of an array of `count` elements of `elem_size` bytes.
#[inline]
pub const fn array_size(count: usize, elem_size: usize) -> usize {
    ARRAY_LEN_SIZE + count * elem_size
}

/// Encoded size of a string (length prefix, bytes, terminating zero).
#[inline]
pub const fn str_size(s: &str) -> usize {
    ARRAY_LEN_SIZE + s.len() + 1
}

/// Circular byte buffer over an [`Arena`].
pub struct RingBuffer<A: Arena = Vec<u8>> {
    arena: A,
    capacity: usize,
    used_cursor: usize,
    free_cursor: usize,
}

impl RingBuffer<Vec<u8>> {
    /// Create a heap-backed ring of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(vec![0u8; capacity])
    }
}

impl<A: Arena> RingBuffer<A> {
    /// Create a ring spanning the whole arena.
    pub fn new(arena: A) -> Self {
        let capacity = arena.len();
        assert!(capacity >= 2, "ring capacity must be at least 2 bytes");
        Self {
            arena,
            capacity,
            used_cursor: 0,
            free_cursor: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest message the ring can ever hold.
    #[inline]
    pub fn max_message(&self) -> usize {
        self.capacity - 1
    }

    #[inline]
    pub fn used_cursor(&self) -> usize {
        self.used_cursor
    }

    #[inline]
    pub fn free_cursor(&self) -> usize {
        self.free_cursor
    }

    #[inline]
    pub fn free_space(&self) -> usize {
        (self.capacity + self.used_cursor - self.free_cursor - 1) % self.capacity
    }

    #[inline]
    pub fn used_space(&self) -> usize {
        (self.capacity + self.free_cursor - self.used_cursor) % self.capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used_cursor == self.free_cursor
    }

    /// Bytes left between the free cursor and the physical end.
    #[inline]
    pub fn tail_room(&self) -> usize {
        self.capacity - self.free_cursor
    }

    pub fn arena(&self) -> &A {
        &self.arena
    }

    /// Reset both cursors to the start. Only valid once fully drained.
    pub fn clear(&mut self) {
        debug_assert!(self.is_empty(), "clearing a ring that still holds data");
        self.used_cursor = 0;
        self.free_cursor = 0;
    }

    /// Drop whatever the consumer has not released and reset the cursors.
    ///
    /// Used when the consumer knows the remaining used bytes are only a
    /// skipped tail with no live data behind it.
    pub fn discard(&mut self) {
        self.used_cursor = self.free_cursor;
        self.clear();
    }

    /// Block until `len` contiguous bytes can be packed.
    ///
    /// `reclaim` is called while space is short. It returns the consumer's new
    /// used cursor, or `None` when the consumer holds nothing (in which case the
    /// remaining used bytes are skipped padding and are dropped).
    pub fn ensure_free_space<E, F>(&mut self, len: usize, mut reclaim: F) -> Result<(), E>
    where
        F: FnMut() -> Result<Option<usize>, E>,
    {
        assert!(
            len <= self.max_message(),
            "message of {} bytes can never fit a ring of {} bytes",
            len,
            self.capacity
        );

        if self.is_empty() {
            self.clear();
        }

        loop {
            while self.free_space() < len {
                match reclaim()? {
                    Some(cursor) => self.release_to(cursor),
                    None => self.discard(),
                }
                if self.is_empty() {
                    self.clear();
                }
            }

            if len <= self.tail_room() {
                return Ok(());
            }
            self.skip_tail();
        }
    }

    /// Claim `len` contiguous bytes without blocking, returning their offset.
    ///
    /// The claimed bytes count as used immediately; the caller fills them
    /// (for example with a one-sided read) before consuming them.
    pub fn try_claim(&mut self, len: usize) -> Option<usize> {
        if len == 0 || len > self.max_message() {
            return None;
        }
        if self.is_empty() {
            self.clear();
        }
        if self.free_space() < len {
            return None;
        }
        if len > self.tail_room() {
            if self.free_space() < self.tail_room() + len {
                return None;
            }
            self.skip_tail();
        }

        let offset = self.free_cursor;
        self.advance_free(len);
        Some(offset)
    }

    /// Mark the bytes up to the physical end as used and wrap to offset 0.
    fn skip_tail(&mut self) {
        let tail = self.tail_room();
        debug_assert!(tail <= self.free_space());
        self.free_cursor = 0;
        tracing::trace!(skipped = tail, "ring wrapped to start");
    }

    fn advance_free(&mut self, len: usize) {
        self.free_cursor += len;
        if self.free_cursor == self.capacity {
            self.free_cursor = 0;
        }
    }

    fn advance_used(&mut self, len: usize) {
        self.used_cursor += len;
        if self.used_cursor == self.capacity {
            self.used_cursor = 0;
        }
    }

    /// Move the used cursor forward to `cursor`, releasing everything before it.
    /// A cursor equal to the capacity is the same position as offset 0.
    pub fn release_to(&mut self, cursor: usize) {
        let cursor = if cursor == self.capacity { 0 } else { cursor };
        let distance = (self.capacity + cursor - self.used_cursor) % self.capacity;
        assert!(
            cursor < self.capacity && distance <= self.used_space(),
            "release cursor {} outside used region [{}, {})",
            cursor,
            self.used_cursor,
            self.free_cursor
        );
        self.used_cursor = cursor;
    }

    // ------------------------------------------------------------------
    // Producer side
    // ------------------------------------------------------------------

    /// Pack raw bytes at the free cursor.
    pub fn pack(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.free_space() && bytes.len() <= self.tail_room(),
            "pack of {} bytes overflows ring (free {}, tail {})",
            bytes.len(),
            self.free_space(),
            self.tail_room()
        );
        self.arena.write_at(self.free_cursor, bytes);
        self.advance_free(bytes.len());
    }

    pub fn pack_i32(&mut self, value: i32) {
        self.pack(&value.to_le_bytes());
    }

    pub fn pack_u64(&mut self, value: u64) {
        self.pack(&value.to_le_bytes());
    }

    /// Sizes travel as 64-bit values regardless of the host word size.
    pub fn pack_usize(&mut self, value: usize) {
        self.pack_u64(value as u64);
    }

    /// Pack `[i32 count][raw element bytes]`.
    pub fn pack_array(&mut self, count: usize, raw: &[u8]) -> IofwdResult<()> {
        self.pack_i32(length_prefix(count)?);
        self.pack(raw);
        Ok(())
    }

    pub fn pack_i32_array(&mut self, values: &[i32]) -> IofwdResult<()> {
        self.pack_i32(length_prefix(values.len())?);
        for v in values {
            self.pack_i32(*v);
        }
        Ok(())
    }

    pub fn pack_usize_array(&mut self, values: &[usize]) -> IofwdResult<()> {
        self.pack_i32(length_prefix(values.len())?);
        for v in values {
            self.pack_usize(*v);
        }
        Ok(())
    }

    /// Pack a string as a byte array including a terminating zero.
    pub fn pack_str(&mut self, s: &str) -> IofwdResult<()> {
        self.pack_i32(length_prefix(s.len() + 1)?);
        self.pack(s.as_bytes());
        self.pack(&[0]);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Consumer side
    // ------------------------------------------------------------------

    /// Copy bytes at `offset` inside the used region without consuming them.
    pub fn peek_at(&self, offset: usize, dst: &mut [u8]) {
        let from_used = (self.capacity + offset - self.used_cursor) % self.capacity;
        assert!(
            from_used + dst.len() <= self.used_space() && offset + dst.len() <= self.capacity,
            "peek of {} bytes at {} outside used region",
            dst.len(),
            offset
        );
        self.arena.read_at(offset, dst);
    }

    /// Unpack `len` bytes at the used cursor.
    pub fn unpack(&mut self, len: usize) -> Vec<u8> {
        assert!(
            len <= self.used_space() && self.used_cursor + len <= self.capacity,
            "unpack of {} bytes underflows ring (used {})",
            len,
            self.used_space()
        );
        let mut out = vec![0u8; len];
        self.arena.read_at(self.used_cursor, &mut out);
        self.advance_used(len);
        out
    }

    /// Unpack `len` bytes starting at `offset`, skipping whatever lies between
    /// the used cursor and `offset` (wrap padding).
    pub fn unpack_at(&mut self, offset: usize, len: usize) -> Vec<u8> {
        self.release_to(offset);
        self.unpack(len)
    }
}

/// Array lengths travel as `i32`.
fn length_prefix(count: usize) -> IofwdResult<i32> {
    i32::try_from(count).map_err(|_| {
        IofwdError::UnexpectedMessage(format!(
            "array of {} elements does not fit an i32 length prefix",
            count
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn no_reclaim() -> Result<Option<usize>, Infallible> {
        panic!("reclaim should not be needed")
    }

    #[test]
    fn test_space_accounting() {
        let mut ring = RingBuffer::with_capacity(16);
        assert!(ring.is_empty());
        assert_eq!(ring.free_space(), 15);
        assert_eq!(ring.used_space(), 0);

        ring.pack(&[1, 2, 3, 4]);
        assert_eq!(ring.used_space(), 4);
        assert_eq!(ring.free_space(), 11);

        assert_eq!(ring.unpack(4), vec![1, 2, 3, 4]);
        assert!(ring.is_empty());
        assert_eq!(ring.free_space(), 15);
    }

    #[test]
    fn test_wraparound_skips_tail() {
        let mut ring = RingBuffer::with_capacity(64);
        ring.pack(&[0xAA; 20]);
        ring.pack(&[0xBB; 34]);
        assert_eq!(ring.tail_room(), 10);

        assert_eq!(ring.unpack(20), vec![0xAA; 20]);

        ring.ensure_free_space(16, no_reclaim).unwrap();
        assert_eq!(ring.free_cursor(), 0);
        // 34 live bytes plus the 10 skipped tail bytes.
        assert_eq!(ring.used_space(), 44);

        ring.pack(&[0xCC; 16]);
        assert_eq!(ring.free_cursor(), 16);

        assert_eq!(ring.unpack(34), vec![0xBB; 34]);
        assert_eq!(ring.unpack_at(0, 16), vec![0xCC; 16]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_ensure_free_space_calls_reclaim() {
        let mut ring = RingBuffer::with_capacity(32);
        ring.pack(&[7u8; 20]);
        let mut calls = 0;

        ring.ensure_free_space(20, || -> Result<Option<usize>, Infallible> {
            calls += 1;
            Ok(Some(20))
        })
        .unwrap();

        assert_eq!(calls, 1);
        // Drained ring resets to the start.
        assert_eq!(ring.free_cursor(), 0);
        assert_eq!(ring.free_space(), 31);
    }

    #[test]
    fn test_ensure_free_space_drops_padding_when_consumer_idle() {
        let mut ring = RingBuffer::with_capacity(32);
        ring.pack(&[1u8; 24]);
        ring.release_to(20);

        // Fits before the skip, not after it: the first reclaim releases the
        // live bytes, the second finds nothing outstanding and drops the
        // skipped tail.
        let mut answers = vec![None, Some(24)];
        ring.ensure_free_space(25, || -> Result<Option<usize>, Infallible> {
            Ok(answers.pop().flatten())
        })
        .unwrap();

        assert!(answers.is_empty());
        assert!(ring.is_empty());
        assert_eq!(ring.free_cursor(), 0);
        ring.pack(&[2u8; 25]);
    }

    #[test]
    fn test_reclaim_error_propagates() {
        let mut ring = RingBuffer::with_capacity(8);
        ring.pack(&[0u8; 6]);
        let result = ring.ensure_free_space(4, || Err("peer gone"));
        assert_eq!(result, Err("peer gone"));
    }

    #[test]
    fn test_try_claim() {
        let mut ring = RingBuffer::with_capacity(32);
        assert_eq!(ring.try_claim(20), Some(0));
        // Only 11 free bytes and 12 of tail room.
        assert_eq!(ring.try_claim(12), None);
        ring.release_to(20);
        // Empty again: claims restart from offset 0.
        assert_eq!(ring.try_claim(24), Some(0));
        ring.release_to(10);
        // Tail room is 8: skip it and place 9 bytes before used cursor 10.
        assert_eq!(ring.try_claim(9), Some(0));
        assert_eq!(ring.free_cursor(), 9);
    }

    #[test]
    fn test_try_claim_wraps() {
        let mut ring = RingBuffer::with_capacity(32);
        assert_eq!(ring.try_claim(24), Some(0));
        ring.release_to(16);
        // tail room 8 < 10, free before used = 15
        assert_eq!(ring.try_claim(10), Some(0));
        assert_eq!(ring.free_cursor(), 10);
        assert_eq!(ring.used_space(), 8 + 8 + 10);
        assert_eq!(ring.try_claim(6), None);
    }

    #[test]
    fn test_scalar_and_array_framing() {
        let mut ring = RingBuffer::with_capacity(128);
        ring.pack_u64(0xDEAD_BEEF_0000_0001);
        ring.pack_str("lat").unwrap();
        ring.pack_i32_array(&[3, -1]).unwrap();
        ring.pack_usize_array(&[5]).unwrap();
        ring.pack_array(2, &[9, 8]).unwrap();

        assert_eq!(ring.unpack(8), 0xDEAD_BEEF_0000_0001u64.to_le_bytes());
        assert_eq!(ring.unpack(str_size("lat")), b"\x04\0\0\0lat\0");
        let mut ints = 2i32.to_le_bytes().to_vec();
        ints.extend_from_slice(&3i32.to_le_bytes());
        ints.extend_from_slice(&(-1i32).to_le_bytes());
        assert_eq!(ring.unpack(array_size(2, 4)), ints);
        let mut sizes = 1i32.to_le_bytes().to_vec();
        sizes.extend_from_slice(&5u64.to_le_bytes());
        assert_eq!(ring.unpack(array_size(1, 8)), sizes);
        assert_eq!(ring.unpack(array_size(2, 1)), vec![2, 0, 0, 0, 9, 8]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_oversized_length_prefix_is_an_error() {
        let mut ring = RingBuffer::with_capacity(16);
        let count = i32::MAX as usize + 1;
        assert!(matches!(
            ring.pack_array(count, &[]),
            Err(IofwdError::UnexpectedMessage(_))
        ));
        // Nothing was packed.
        assert!(ring.is_empty());
        assert_eq!(length_prefix(i32::MAX as usize).unwrap(), i32::MAX);
    }

    #[test]
    fn test_encoded_sizes() {
        assert_eq!(str_size("lat"), 4 + 4);
        assert_eq!(array_size(3, 8), 4 + 24);
    }

    #[test]
    #[should_panic(expected = "overflows ring")]
    fn test_pack_overflow_is_fault() {
        let mut ring = RingBuffer::with_capacity(8);
        ring.pack(&[0u8; 8]);
    }

    #[test]
    #[should_panic(expected = "underflows ring")]
    fn test_unpack_underflow_is_fault() {
        let mut ring = RingBuffer::with_capacity(8);
        ring.pack(&[0u8; 2]);
        ring.unpack(3);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut ring = RingBuffer::with_capacity(16);
        ring.pack(&[1, 2, 3, 4, 5]);
        let mut two = [0u8; 2];
        ring.peek_at(3, &mut two);
        assert_eq!(two, [4, 5]);
        assert_eq!(ring.used_space(), 5);
    }
}
