//! The binary column: the long-string structure without NUL semantics.
//! The root is a two-slot `[offsets, blob]` where `offsets[i]` is the
//! cumulative byte end of entry `i`.

use crate::error::Result;
use crate::store::alloc::{Ref, SharedAlloc};
use crate::store::array::{Array, ArrayKind, ParentLink, SharedArray, WidthType};
use crate::store::column::RowSet;

/// A column of byte strings.
pub struct BinaryColumn {
    root: SharedArray,
}

impl BinaryColumn {
    pub fn new(alloc: SharedAlloc) -> Result<BinaryColumn> {
        let offsets = Array::new(alloc.clone(), ArrayKind::Leaf)?;
        let blob = Array::new_with_type(alloc.clone(), ArrayKind::Leaf, WidthType::Ignore)?;
        let root = SharedArray::new(alloc, ArrayKind::HasRefs)?;
        root.add(offsets.ref_().to_slot())?;
        root.add(blob.ref_().to_slot())?;
        Ok(BinaryColumn { root })
    }

    pub fn attach(alloc: SharedAlloc, r: Ref) -> Result<BinaryColumn> {
        Ok(BinaryColumn {
            root: SharedArray::attach(alloc, r)?,
        })
    }

    pub fn root_ref(&self) -> Ref {
        self.root.ref_()
    }

    pub fn set_parent(&self, link: Option<ParentLink>) {
        self.root.set_parent(link);
    }

    pub fn adjust_parent_index(&self, diff: isize) {
        self.root.adjust_parent_index(diff);
    }

    fn parts(&self) -> (SharedArray, SharedArray) {
        let alloc = self.root.alloc_handle();
        let offsets = SharedArray::attach(alloc.clone(), self.root.get_as_ref(0))
            .expect("binary offsets unreadable");
        offsets.set_parent(Some(self.root.parent_link(0)));
        let blob = SharedArray::attach(alloc, self.root.get_as_ref(1))
            .expect("binary blob unreadable");
        blob.set_parent(Some(self.root.parent_link(1)));
        (offsets, blob)
    }

    pub fn len(&self) -> usize {
        let (offsets, _) = self.parts();
        offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, ndx: usize) -> Vec<u8> {
        assert!(ndx < self.len(), "binary column index out of range");
        let (offsets, blob) = self.parts();
        let begin = if ndx == 0 { 0 } else { offsets.get(ndx - 1) as usize };
        let end = offsets.get(ndx) as usize;
        blob.with(|b| b.blob_read(begin, end))
    }

    pub fn set(&mut self, ndx: usize, value: &[u8]) -> Result<()> {
        assert!(ndx < self.len(), "binary column index out of range");
        let (offsets, blob) = self.parts();
        let begin = if ndx == 0 { 0 } else { offsets.get(ndx - 1) as usize };
        let end = offsets.get(ndx) as usize;
        blob.with_mut(|b| b.blob_replace(begin, end, value))?;
        let diff = value.len() as i64 - (end - begin) as i64;
        if diff != 0 {
            offsets.adjust(ndx, diff)?;
        }
        Ok(())
    }

    pub fn insert(&mut self, ndx: usize, value: &[u8]) -> Result<()> {
        assert!(ndx <= self.len(), "binary column index out of range");
        let (offsets, blob) = self.parts();
        let begin = if ndx == 0 { 0 } else { offsets.get(ndx - 1) as usize };
        blob.with_mut(|b| b.blob_replace(begin, begin, value))?;
        offsets.insert(ndx, (begin + value.len()) as i64)?;
        offsets.adjust(ndx + 1, value.len() as i64)?;
        Ok(())
    }

    pub fn add(&mut self, value: &[u8]) -> Result<()> {
        self.insert(self.len(), value)
    }

    pub fn erase(&mut self, ndx: usize) -> Result<()> {
        assert!(ndx < self.len(), "binary column index out of range");
        let (offsets, blob) = self.parts();
        let begin = if ndx == 0 { 0 } else { offsets.get(ndx - 1) as usize };
        let end = offsets.get(ndx) as usize;
        blob.with_mut(|b| b.blob_replace(begin, end, &[]))?;
        offsets.erase(ndx)?;
        offsets.adjust(ndx, -((end - begin) as i64))?;
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        let (offsets, blob) = self.parts();
        let total = blob.with(|b| b.blob_len());
        blob.with_mut(|b| b.blob_replace(0, total, &[]))?;
        offsets.clear()
    }

    pub fn find_first(&self, value: &[u8], start: usize, end: usize) -> Option<usize> {
        let end = if end == usize::MAX { self.len() } else { end };
        (start..end).find(|&i| self.get(i) == value)
    }

    pub fn find_all(&self, out: &mut RowSet, value: &[u8]) {
        for i in 0..self.len() {
            if self.get(i) == value {
                out.push(i);
            }
        }
    }

    pub fn destroy(&mut self) {
        self.root.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::alloc::SlabAlloc;
    use std::rc::Rc;

    fn new_column() -> BinaryColumn {
        BinaryColumn::new(Rc::new(SlabAlloc::new(8))).unwrap()
    }

    #[test]
    fn round_trip_including_empty_payloads() {
        let mut col = new_column();

        col.add(b"hello").unwrap();
        col.add(b"").unwrap();
        col.add(&[0u8, 1, 2, 0]).unwrap();

        assert_eq!(col.len(), 3);
        assert_eq!(col.get(0), b"hello");
        assert_eq!(col.get(1), b"");
        assert_eq!(col.get(2), vec![0, 1, 2, 0]);
    }

    #[test]
    fn set_resizes_in_place() {
        let mut col = new_column();
        col.add(b"aaaa").unwrap();
        col.add(b"bbbb").unwrap();

        col.set(0, b"x").unwrap();

        assert_eq!(col.get(0), b"x");
        assert_eq!(col.get(1), b"bbbb");
    }

    #[test]
    fn insert_and_erase_shift_offsets() {
        let mut col = new_column();
        col.add(b"one").unwrap();
        col.add(b"three").unwrap();
        col.insert(1, b"two").unwrap();

        assert_eq!(col.get(1), b"two");
        assert_eq!(col.get(2), b"three");

        col.erase(0).unwrap();
        assert_eq!(col.get(0), b"two");
        assert_eq!(col.len(), 2);
    }

    #[test]
    fn find_compares_bytes() {
        let mut col = new_column();
        col.add(b"k1").unwrap();
        col.add(b"k2").unwrap();
        col.add(b"k1").unwrap();

        assert_eq!(col.find_first(b"k2", 0, usize::MAX), Some(1));
        let mut rows = RowSet::new();
        col.find_all(&mut rows, b"k1");
        assert_eq!(rows.iter().collect::<Vec<_>>(), vec![0, 2]);
    }
}
