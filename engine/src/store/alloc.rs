//! The slab allocator backing every node array in a group.
//!
//! A [`Ref`] is an opaque, 8-byte-aligned offset into the allocator's
//! address space. Refs below the attached-image baseline point into the
//! memory of a previously committed file and are read-only: any mutation
//! of an array stored there must go through copy-on-write first. Refs at
//! or above the baseline identify slabs allocated during the current
//! session; a slab is writable until the transaction that produced it is
//! committed (frozen).
//!
//! The low bit of a ref is reserved: a 64-bit slot in a refs-bearing
//! array whose low bit is set holds an inline integer, not a ref.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::error::{Error, Result};

/// A single allocation may not exceed the 24-bit capacity field of the
/// array header.
pub const MAX_ALLOC_SIZE: usize = 0xFF_FFFF;

/// An opaque locator for one array allocation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref(usize);

impl Ref {
    /// The null ref. Signifies an empty subtree in refs-bearing arrays.
    pub const NULL: Ref = Ref(0);

    /// Construct a ref from a raw byte offset.
    ///
    /// # Panics
    /// Panics if the offset is not 8-byte aligned.
    #[inline]
    pub fn new(offset: usize) -> Self {
        assert_eq!(offset & 7, 0, "refs must be 64-bit aligned");
        Ref(offset)
    }

    /// Whether this is the null ref.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// The raw byte offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.0
    }

    /// Interpret a 64-bit slot value as a ref.
    ///
    /// # Panics
    /// Panics if the value carries the inline-integer tag bit.
    #[inline]
    pub fn from_slot(value: i64) -> Self {
        assert_eq!(value & 1, 0, "slot holds an inline value, not a ref");
        Ref(value as usize)
    }

    /// The slot representation of this ref.
    #[inline]
    pub fn to_slot(&self) -> i64 {
        self.0 as i64
    }

    /// Whether a slot value is a real ref (untagged and non-null).
    #[inline]
    pub fn slot_is_ref(value: i64) -> bool {
        value != 0 && value & 1 == 0
    }
}

#[inline]
fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Shared handle to a group's allocator.
pub type SharedAlloc = Rc<SlabAlloc>;

struct Inner {
    /// Read-only memory attached from a committed file. Refs below
    /// `baseline` resolve into this buffer.
    image: Box<[u8]>,
    baseline: usize,
    /// Slabs allocated and still writable in the current transaction.
    live: HashMap<usize, Box<[u8]>>,
    /// Slabs from committed transactions of this session; read-only.
    frozen: HashMap<usize, Box<[u8]>>,
    /// Read-only refs released by copy-on-write. The space is reclaimed
    /// by a future compaction, never in this session.
    retired: HashSet<usize>,
    next_ref: usize,
}

/// The allocator. One instance per group; all arrays of the group share
/// it through a [`SharedAlloc`] handle.
pub struct SlabAlloc {
    inner: RefCell<Inner>,
}

impl SlabAlloc {
    /// A fresh in-memory allocator with `reserved` bytes kept free at the
    /// start of the address space (ref 0 must stay invalid; file-backed
    /// groups additionally reserve room for the file header).
    pub fn new(reserved: usize) -> SlabAlloc {
        let first = align8(reserved.max(8));
        SlabAlloc {
            inner: RefCell::new(Inner {
                image: Box::default(),
                baseline: 0,
                live: HashMap::new(),
                frozen: HashMap::new(),
                retired: HashSet::new(),
                next_ref: first,
            }),
        }
    }

    /// Attach a committed file image. Every ref inside the image is
    /// read-only; new allocations start past its end.
    pub fn attach_image(image: Vec<u8>) -> SlabAlloc {
        let baseline = image.len();
        SlabAlloc {
            inner: RefCell::new(Inner {
                image: image.into_boxed_slice(),
                baseline,
                live: HashMap::new(),
                frozen: HashMap::new(),
                retired: HashSet::new(),
                next_ref: align8(baseline.max(8)),
            }),
        }
    }

    /// Allocate a zero-initialized slab of at least `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<Ref> {
        if size == 0 || size > MAX_ALLOC_SIZE {
            return Err(Error::AllocationFailure(size));
        }
        let mut inner = self.inner.borrow_mut();
        let r = inner.next_ref;
        let padded = align8(size);
        inner.next_ref += padded;
        inner.live.insert(r, vec![0u8; padded].into_boxed_slice());
        Ok(Ref(r))
    }

    /// Reallocate a writable slab to `new_size` bytes, copying the old
    /// contents, and release the old ref. Read-only refs must be handled
    /// by copy-on-write instead.
    ///
    /// # Panics
    /// Panics if `r` is not a live (writable) slab.
    pub fn realloc(&self, r: Ref, new_size: usize) -> Result<Ref> {
        if new_size == 0 || new_size > MAX_ALLOC_SIZE {
            return Err(Error::AllocationFailure(new_size));
        }
        let mut inner = self.inner.borrow_mut();
        let old = inner
            .live
            .remove(&r.0)
            .expect("realloc of a ref that is not writable");
        let padded = align8(new_size);
        let mut buf = vec![0u8; padded].into_boxed_slice();
        let n = old.len().min(padded);
        buf[..n].copy_from_slice(&old[..n]);
        let new_ref = inner.next_ref;
        inner.next_ref += padded;
        inner.live.insert(new_ref, buf);
        Ok(Ref(new_ref))
    }

    /// Release a ref. Writable slabs are returned immediately; read-only
    /// refs are merely retired (their bytes stay valid for readers of the
    /// committed snapshot).
    pub fn free(&self, r: Ref) {
        if r.is_null() {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        if inner.live.remove(&r.0).is_none() {
            inner.retired.insert(r.0);
        }
    }

    /// Whether a mutation of this ref must copy-on-write.
    pub fn is_read_only(&self, r: Ref) -> bool {
        let inner = self.inner.borrow();
        !inner.live.contains_key(&r.0)
    }

    /// Resolve a ref and run `f` over its bytes. The slice starts at the
    /// array header and extends at least to the end of the allocation.
    ///
    /// # Panics
    /// Panics if the ref does not resolve (stale accessor).
    pub fn with<R>(&self, r: Ref, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.borrow();
        if let Some(buf) = inner.live.get(&r.0) {
            return f(buf);
        }
        if let Some(buf) = inner.frozen.get(&r.0) {
            return f(buf);
        }
        assert!(
            r.0 < inner.baseline,
            "ref {} does not resolve to any allocation",
            r.0
        );
        f(&inner.image[r.0..])
    }

    /// Resolve a writable ref and run `f` over its bytes.
    ///
    /// # Panics
    /// Panics if the ref is read-only; the caller is required to have
    /// performed copy-on-write.
    pub fn with_mut<R>(&self, r: Ref, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.borrow_mut();
        let buf = inner
            .live
            .get_mut(&r.0)
            .expect("write to a read-only ref without copy-on-write");
        f(buf)
    }

    /// Mark every live slab read-only. Called after a successful commit:
    /// the slabs now belong to the durable snapshot.
    pub fn freeze_all(&self) {
        let mut inner = self.inner.borrow_mut();
        let live = std::mem::take(&mut inner.live);
        inner.frozen.extend(live);
    }

    /// Drop every live slab. Called on transaction rollback; accessors
    /// holding refs into the dropped slabs must be detached by the caller.
    pub fn discard_live(&self) {
        self.inner.borrow_mut().live.clear();
    }

    /// Total byte size a serialized file image would occupy.
    pub fn file_size(&self) -> usize {
        let inner = self.inner.borrow();
        let mut size = inner.baseline;
        for (&r, buf) in inner.frozen.iter().chain(inner.live.iter()) {
            size = size.max(r + buf.len());
        }
        size
    }

    /// Serialize the full address space: the attached image, then every
    /// slab at its ref offset. Holes from retired refs keep their old
    /// bytes (compaction is a separate operation).
    pub fn build_image(&self) -> Vec<u8> {
        let size = self.file_size();
        let inner = self.inner.borrow();
        let mut out = vec![0u8; size];
        out[..inner.image.len()].copy_from_slice(&inner.image);
        for (&r, buf) in inner.frozen.iter().chain(inner.live.iter()) {
            out[r..r + buf.len()].copy_from_slice(buf);
        }
        out
    }
}

impl Default for SlabAlloc {
    fn default() -> Self {
        SlabAlloc::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_aligned_nonzero_refs() {
        let alloc = SlabAlloc::new(8);

        let a = alloc.alloc(100).unwrap();
        let b = alloc.alloc(100).unwrap();

        assert!(!a.is_null());
        assert_eq!(a.offset() & 7, 0);
        assert_eq!(b.offset() & 7, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn oversized_alloc_is_a_recoverable_error() {
        let alloc = SlabAlloc::new(8);

        let err = alloc.alloc(MAX_ALLOC_SIZE + 1).unwrap_err();

        assert!(matches!(err, Error::AllocationFailure(_)));
    }

    #[test]
    fn live_slabs_are_writable_until_frozen() {
        let alloc = SlabAlloc::new(8);
        let r = alloc.alloc(16).unwrap();

        assert!(!alloc.is_read_only(r));
        alloc.with_mut(r, |buf| buf[0] = 0xAB);
        assert_eq!(alloc.with(r, |buf| buf[0]), 0xAB);

        alloc.freeze_all();
        assert!(alloc.is_read_only(r));
        // Still readable.
        assert_eq!(alloc.with(r, |buf| buf[0]), 0xAB);
    }

    #[test]
    fn realloc_preserves_contents_and_changes_ref() {
        let alloc = SlabAlloc::new(8);
        let r = alloc.alloc(16).unwrap();
        alloc.with_mut(r, |buf| buf[..4].copy_from_slice(&[1, 2, 3, 4]));

        let r2 = alloc.realloc(r, 64).unwrap();

        assert_ne!(r, r2);
        assert_eq!(alloc.with(r2, |buf| buf[..4].to_vec()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn image_round_trip() {
        let alloc = SlabAlloc::new(8);
        let r = alloc.alloc(16).unwrap();
        alloc.with_mut(r, |buf| buf[..2].copy_from_slice(&[0xCA, 0xFE]));

        let image = alloc.build_image();
        let reattached = SlabAlloc::attach_image(image);

        assert!(reattached.is_read_only(r));
        assert_eq!(reattached.with(r, |buf| buf[..2].to_vec()), vec![0xCA, 0xFE]);
    }

    #[test]
    fn slot_tagging_convention() {
        assert!(Ref::slot_is_ref(16));
        assert!(!Ref::slot_is_ref(17)); // low bit set: inline integer
        assert!(!Ref::slot_is_ref(0)); // null: empty subtree
    }
}
