//! Host-side geometry storage with doubling growth.

use crate::error::{RenderError, Result};
use bytemuck::Pod;

/// A contiguous array of plain-data elements that grows by doubling.
///
/// Appends never grow the storage on their own. Callers reserve room with
/// [`GrowableBuffer::ensure_capacity`] first and use its return value to
/// learn whether the device-side mirror has to be recreated.
#[derive(Debug, Clone)]
pub struct GrowableBuffer<T: Pod> {
    data: Box<[T]>,
    size: usize,
}

impl<T: Pod> GrowableBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![T::zeroed(); capacity].into_boxed_slice(),
            size: 0,
        }
    }

    /// Makes room for `additional` more elements.
    ///
    /// Returns `true` when the storage was reallocated.
    pub fn ensure_capacity(&mut self, additional: usize) -> bool {
        let required = self.size + additional;
        if required <= self.data.len() {
            return false;
        }

        let mut capacity = self.data.len().max(1);
        while capacity < required {
            capacity *= 2;
        }

        let mut data = vec![T::zeroed(); capacity].into_boxed_slice();
        data[..self.size].copy_from_slice(&self.data[..self.size]);
        self.data = data;
        true
    }

    /// Copies `items` after the current contents.
    pub fn append(&mut self, items: &[T]) -> Result<()> {
        let end = self.size + items.len();
        if end > self.data.len() {
            return Err(RenderError::CapacityExceeded {
                requested: items.len(),
                capacity: self.data.len() - self.size,
            });
        }
        self.data[self.size..end].copy_from_slice(items);
        self.size = end;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.size = 0;
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn byte_capacity(&self) -> u64 {
        std::mem::size_of_val(&*self.data) as u64
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data[..self.size]
    }

    /// The used range reinterpreted as bytes, ready for upload.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_capacity_is_idempotent() {
        let mut buf = GrowableBuffer::<u16>::with_capacity(4);
        assert!(buf.ensure_capacity(9));
        let capacity = buf.capacity();
        assert_eq!(capacity, 16);
        assert!(!buf.ensure_capacity(9));
        assert_eq!(buf.capacity(), capacity);
    }

    #[test]
    fn test_growth_preserves_contents() {
        let mut buf = GrowableBuffer::<u32>::with_capacity(2);
        buf.append(&[1, 2]).unwrap();
        assert!(buf.ensure_capacity(3));
        buf.append(&[3, 4, 5]).unwrap();
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4, 5]);
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.as_bytes().len(), 20);
    }

    #[test]
    fn test_zero_capacity_grows_from_one() {
        let mut buf = GrowableBuffer::<u16>::with_capacity(0);
        assert!(buf.ensure_capacity(3));
        assert_eq!(buf.capacity(), 4);
    }

    #[test]
    fn test_append_without_reservation_fails() {
        let mut buf = GrowableBuffer::<u16>::with_capacity(2);
        let err = buf.append(&[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            RenderError::CapacityExceeded {
                requested: 3,
                capacity: 2
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut buf = GrowableBuffer::<u16>::with_capacity(8);
        buf.append(&[1, 2, 3]).unwrap();
        buf.clear();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), 8);
    }
}
