//! The adaptive string column.
//!
//! Short form: a single leaf of NUL-terminated strings padded to a
//! power-of-two byte width (`WidthType::Multiply`). A zero width means
//! every string is empty. The first string of length 64 or more promotes
//! the column to the long form: a two-slot structure `[offsets, blob]`
//! where `offsets[i]` is the cumulative byte end of string `i` and
//! `blob` is the concatenation of all string bytes.

use indexmap::IndexMap;

use crate::error::Result;
use crate::store::alloc::{Ref, SharedAlloc};
use crate::store::array::{Array, ArrayKind, ParentLink, SharedArray, WidthType};
use crate::store::column::{replace_root, IntColumn, RowSet};

/// Longest string the short form can hold (one byte is the terminator).
const MAX_SHORT_LEN: usize = 63;

/// A column of UTF-8 strings with adaptive representation.
pub struct StringColumn {
    root: SharedArray,
    long: bool,
}

impl StringColumn {
    /// Create an empty column in the short form.
    pub fn new(alloc: SharedAlloc) -> Result<StringColumn> {
        Ok(StringColumn {
            root: SharedArray::new_with_type(alloc, ArrayKind::Leaf, WidthType::Multiply)?,
            long: false,
        })
    }

    /// Attach to an existing column root; the header distinguishes the
    /// two forms.
    pub fn attach(alloc: SharedAlloc, r: Ref) -> Result<StringColumn> {
        let root = SharedArray::attach(alloc, r)?;
        let long = root.has_refs();
        Ok(StringColumn { root, long })
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

    pub fn len(&self) -> usize {
        if self.long {
            let (offsets, _) = self.long_parts();
            offsets.len()
        } else {
            self.root.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, ndx: usize) -> String {
        String::from_utf8_lossy(&self.get_bytes(ndx)).into_owned()
    }

    fn get_bytes(&self, ndx: usize) -> Vec<u8> {
        assert!(ndx < self.len(), "string column index out of range");
        if self.long {
            let (offsets, blob) = self.long_parts();
            let begin = if ndx == 0 { 0 } else { offsets.get(ndx - 1) as usize };
            let end = offsets.get(ndx) as usize;
            blob.with(|b| b.blob_read(begin, end))
        } else {
            self.root.with(|a| {
                let w = a.width();
                if w == 0 {
                    return Vec::new();
                }
                a.payload(|p| {
                    let elem = &p[ndx * w..(ndx + 1) * w];
                    let end = elem.iter().position(|&b| b == 0).unwrap_or(w);
                    elem[..end].to_vec()
                })
            })
        }
    }

    pub fn set(&mut self, ndx: usize, value: &str) -> Result<()> {
        assert!(ndx < self.len(), "string column index out of range");
        if !self.long && value.len() > MAX_SHORT_LEN {
            self.upgrade_to_long()?;
        }
        if self.long {
            let (offsets, blob) = self.long_parts();
            let begin = if ndx == 0 { 0 } else { offsets.get(ndx - 1) as usize };
            let end = offsets.get(ndx) as usize;
            blob.with_mut(|b| b.blob_replace(begin, end, value.as_bytes()))?;
            let diff = value.len() as i64 - (end - begin) as i64;
            if diff != 0 {
                offsets.adjust(ndx, diff)?;
            }
            Ok(())
        } else {
            self.short_write(ndx, value, false)
        }
    }

    pub fn insert(&mut self, ndx: usize, value: &str) -> Result<()> {
        assert!(ndx <= self.len(), "string column index out of range");
        if !self.long && value.len() > MAX_SHORT_LEN {
            self.upgrade_to_long()?;
        }
        if self.long {
            let (offsets, blob) = self.long_parts();
            let begin = if ndx == 0 { 0 } else { offsets.get(ndx - 1) as usize };
            blob.with_mut(|b| b.blob_replace(begin, begin, value.as_bytes()))?;
            offsets.insert(ndx, (begin + value.len()) as i64)?;
            offsets.adjust(ndx + 1, value.len() as i64)?;
            Ok(())
        } else {
            self.short_write(ndx, value, true)
        }
    }

    pub fn add(&mut self, value: &str) -> Result<()> {
        self.insert(self.len(), value)
    }

    pub fn erase(&mut self, ndx: usize) -> Result<()> {
        assert!(ndx < self.len(), "string column index out of range");
        if self.long {
            let (offsets, blob) = self.long_parts();
            let begin = if ndx == 0 { 0 } else { offsets.get(ndx - 1) as usize };
            let end = offsets.get(ndx) as usize;
            blob.with_mut(|b| b.blob_replace(begin, end, &[]))?;
            offsets.erase(ndx)?;
            offsets.adjust(ndx, -((end - begin) as i64))?;
            Ok(())
        } else {
            self.root.with_mut(|a| {
                a.copy_on_write()?;
                let w = a.width();
                let len = a.len();
                if w > 0 && ndx + 1 < len {
                    a.payload_mut(|p| p.copy_within((ndx + 1) * w..len * w, ndx * w));
                }
                a.set_len_direct(len - 1);
                Ok(())
            })
        }
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.long {
            let (offsets, blob) = self.long_parts();
            let total = blob.with(|b| b.blob_len());
            blob.with_mut(|b| b.blob_replace(0, total, &[]))?;
            offsets.clear()?;
        } else {
            self.root.clear()?;
        }
        Ok(())
    }

    /// First row equal to `value` within `[start, end)`.
    pub fn find_first(&self, value: &str, start: usize, end: usize) -> Option<usize> {
        let end = if end == usize::MAX { self.len() } else { end };
        (start..end).find(|&i| self.get_bytes(i) == value.as_bytes())
    }

    /// Collect every row equal to `value`.
    pub fn find_all(&self, out: &mut RowSet, value: &str) {
        for i in 0..self.len() {
            if self.get_bytes(i) == value.as_bytes() {
                out.push(i);
            }
        }
    }

    /// Scan for enum compression. When the number of distinct strings is
    /// strictly below half the row count, build the `[keys, values]`
    /// pair and return their refs; the column itself is left untouched
    /// (the containing table performs the slot surgery).
    pub fn auto_enumerate(&self) -> Result<Option<(Ref, Ref)>> {
        let total = self.len();
        if total == 0 {
            return Ok(None);
        }
        // First-seen order is preserved so re-runs are deterministic.
        let mut distinct: IndexMap<Vec<u8>, usize> = IndexMap::new();
        let mut value_ndx = Vec::with_capacity(total);
        for i in 0..total {
            let s = self.get_bytes(i);
            let next = distinct.len();
            let ndx = *distinct.entry(s).or_insert(next);
            value_ndx.push(ndx);
        }
        if distinct.len() * 2 >= total {
            return Ok(None);
        }

        let alloc = self.root.alloc_handle();
        let mut keys = StringColumn::new(alloc.clone())?;
        for key in distinct.keys() {
            keys.add(&String::from_utf8_lossy(key))?;
        }
        let mut values = IntColumn::new(alloc)?;
        for ndx in value_ndx {
            values.add(ndx as i64)?;
        }
        Ok(Some((keys.root_ref(), values.root_ref())))
    }

    pub fn destroy(&mut self) {
        self.root.destroy();
    }

    // ---- short form internals ----

    /// Smallest power-of-two element width for a string of `len` bytes
    /// plus its terminator. Zero when the string is empty (the zero
    /// width means "all strings empty").
    fn width_for(len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let mut w = 1;
        while w < len + 1 {
            w *= 2;
        }
        w
    }

    fn short_write(&mut self, ndx: usize, value: &str, insert: bool) -> Result<()> {
        self.root.with_mut(|a| {
            a.copy_on_write()?;
            let old_w = a.width();
            let len = a.len();
            let needed = StringColumn::width_for(value.len());
            let new_w = needed.max(old_w);

            if new_w > old_w {
                // Expand every element to the new width, in reverse index
                // order so the rewrite is safe in place.
                a.prepare_write(len, new_w)?;
                a.payload_mut(|p| {
                    let mut k = len;
                    while k > 0 {
                        k -= 1;
                        let mut elem = [0u8; 64];
                        elem[..old_w].copy_from_slice(&p[k * old_w..(k + 1) * old_w]);
                        p[k * new_w..(k + 1) * new_w].fill(0);
                        p[k * new_w..k * new_w + old_w].copy_from_slice(&elem[..old_w]);
                    }
                });
            }

            let new_len = if insert { len + 1 } else { len };
            a.prepare_write(new_len, new_w)?;
            if new_w > 0 {
                a.payload_mut(|p| {
                    if insert && ndx < len {
                        p.copy_within(ndx * new_w..len * new_w, (ndx + 1) * new_w);
                    }
                    let slot = &mut p[ndx * new_w..(ndx + 1) * new_w];
                    slot.fill(0);
                    slot[..value.len()].copy_from_slice(value.as_bytes());
                });
            }
            if insert {
                a.set_len_direct(len + 1);
            }
            Ok(())
        })
    }

    fn long_parts(&self) -> (SharedArray, SharedArray) {
        debug_assert!(self.long);
        let alloc = self.root.alloc_handle();
        let offsets = SharedArray::attach(alloc.clone(), self.root.get_as_ref(0))
            .expect("string offsets unreadable");
        offsets.set_parent(Some(self.root.parent_link(0)));
        let blob = SharedArray::attach(alloc, self.root.get_as_ref(1))
            .expect("string blob unreadable");
        blob.set_parent(Some(self.root.parent_link(1)));
        (offsets, blob)
    }

    fn upgrade_to_long(&mut self) -> Result<()> {
        debug_assert!(!self.long);
        let alloc = self.root.alloc_handle();
        let mut offsets = Array::new(alloc.clone(), ArrayKind::Leaf)?;
        let mut blob = Array::new_with_type(alloc.clone(), ArrayKind::Leaf, WidthType::Ignore)?;
        let mut cumulative = 0usize;
        for i in 0..self.root.len() {
            let bytes = self.get_bytes(i);
            cumulative += bytes.len();
            blob.blob_append(&bytes)?;
            offsets.add(cumulative as i64)?;
        }
        let mut top = Array::new(alloc.clone(), ArrayKind::HasRefs)?;
        top.add(offsets.ref_().to_slot())?;
        top.add(blob.ref_().to_slot())?;
        let old_ref = self.root.ref_();
        replace_root(&self.root, top)?;
        let mut shell = Array::attach(alloc, old_ref)?;
        shell.destroy();
        self.long = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::alloc::SlabAlloc;
    use std::rc::Rc;

    fn new_column() -> StringColumn {
        StringColumn::new(Rc::new(SlabAlloc::new(8))).unwrap()
    }

    #[test]
    fn empty_strings_keep_width_zero() {
        let mut col = new_column();
        col.add("").unwrap();
        col.add("").unwrap();

        assert_eq!(col.len(), 2);
        assert_eq!(col.get(0), "");
        assert_eq!(col.get(1), "");
        assert_eq!(col.root.with(|a| a.width()), 0);
    }

    #[test]
    fn short_widths_grow_to_fit() {
        let mut col = new_column();
        col.add("a").unwrap(); // needs 2 bytes
        assert_eq!(col.root.with(|a| a.width()), 2);

        col.add("abcdef").unwrap(); // needs 8 bytes
        assert_eq!(col.root.with(|a| a.width()), 8);

        assert_eq!(col.get(0), "a");
        assert_eq!(col.get(1), "abcdef");
    }

    #[test]
    fn insert_set_erase_round_trip() {
        let mut col = new_column();
        col.add("alpha").unwrap();
        col.add("gamma").unwrap();
        col.insert(1, "beta").unwrap();

        assert_eq!(
            (0..3).map(|i| col.get(i)).collect::<Vec<_>>(),
            vec!["alpha", "beta", "gamma"]
        );

        col.set(0, "ALPHA").unwrap();
        assert_eq!(col.get(0), "ALPHA");

        col.erase(1).unwrap();
        assert_eq!(
            (0..2).map(|i| col.get(i)).collect::<Vec<_>>(),
            vec!["ALPHA", "gamma"]
        );
    }

    #[test]
    fn long_strings_promote_the_column() {
        let mut col = new_column();
        col.add("short").unwrap();

        let long = "x".repeat(100);
        col.add(&long).unwrap();

        assert!(col.long);
        assert_eq!(col.get(0), "short");
        assert_eq!(col.get(1), long);

        // The long form keeps supporting every operation.
        col.insert(1, "middle").unwrap();
        assert_eq!(col.get(1), "middle");
        col.set(1, "resized-middle").unwrap();
        assert_eq!(col.get(1), "resized-middle");
        col.erase(0).unwrap();
        assert_eq!(col.get(0), "resized-middle");
        assert_eq!(col.len(), 2);
    }

    #[test]
    fn find_in_both_forms() {
        let mut col = new_column();
        col.add("one").unwrap();
        col.add("two").unwrap();
        col.add("one").unwrap();

        assert_eq!(col.find_first("two", 0, usize::MAX), Some(1));
        let mut rows = RowSet::new();
        col.find_all(&mut rows, "one");
        assert_eq!(rows.iter().collect::<Vec<_>>(), vec![0, 2]);

        col.add(&"y".repeat(80)).unwrap(); // promote
        assert_eq!(col.find_first("one", 0, usize::MAX), Some(0));
        assert_eq!(col.find_first(&"y".repeat(80), 0, usize::MAX), Some(3));
    }

    #[test]
    fn auto_enumerate_requires_strictly_low_distinct_ratio() {
        // 2 distinct out of 4: ratio is exactly the threshold; must not
        // enumerate.
        let mut col = new_column();
        for s in ["a", "a", "b", "b"] {
            col.add(s).unwrap();
        }
        assert!(col.auto_enumerate().unwrap().is_none());

        // 2 distinct out of 5: strictly below; must enumerate.
        col.add("a").unwrap();
        let (keys_ref, values_ref) = col.auto_enumerate().unwrap().unwrap();

        let keys = StringColumn::attach(col.root.alloc_handle(), keys_ref).unwrap();
        let values = IntColumn::attach(col.root.alloc_handle(), values_ref).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.get(0), "a"); // first-seen order
        assert_eq!(keys.get(1), "b");
        assert_eq!(
            (0..5).map(|i| values.get(i)).collect::<Vec<_>>(),
            vec![0, 0, 1, 1, 0]
        );
    }
}
