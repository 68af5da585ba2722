use std::{
	ptr::NonNull,
	sync::{atomic::Ordering, Arc},
};

use crate::page::PageSlot;

/// An RAII token for one reservation against a page's refcount, on top of
/// the baseline reservation that `RangeIndex` holds while a page is indexed
/// (spec I5). Dropping a `PageRef` returns the page to that baseline; it
/// never reclaims the page itself — only [`crate::PageCache::evict`] does
/// that, and only for pages back down to baseline.
pub(crate) struct PageRef {
	slot: Arc<PageSlot>,
}

impl PageRef {
	/// # Safety
	/// The slot's refcount must already have been incremented by the caller
	/// to account for this reservation.
	pub(crate) unsafe fn new(slot: Arc<PageSlot>) -> Self {
		Self { slot }
	}
}

impl Drop for PageRef {
	fn drop(&mut self) {
		self.slot.refcount.fetch_sub(1, Ordering::AcqRel);
	}
}

/// One contiguous byte range aliasing directly into page cache memory,
/// returned by [`crate::PageCache::sg_read`]. Reading through `ptr` is sound
/// for as long as this `SgBuf` (or a clone sharing its [`PageRef`]) is alive:
/// the held reference keeps the owning page's refcount above zero, which
/// keeps the page out of the Free list and its buffer un-recycled (I5).
///
/// Mirrors the source's `{kvirt, length}` scatter-gather entry; `ptr` is raw
/// rather than a borrowed slice because its lifetime is tied to the
/// `PageRef`, not to any stack frame the caller is in.
pub struct SgBuf {
	ptr: NonNull<u8>,
	len: usize,
	_owner: Arc<PageRef>,
}

impl SgBuf {
	pub(crate) fn new(ptr: NonNull<u8>, len: usize, owner: Arc<PageRef>) -> Self {
		Self { ptr, len, _owner: owner }
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// # Safety
	/// See the type-level documentation: sound as long as this `SgBuf` (or a
	/// clone of its owning [`PageRef`]) is alive.
	pub fn as_slice(&self) -> &[u8] {
		unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
	}
}

// Safety: see `IoBuf`; the pointed-to memory is reserved page cache memory
// kept alive by `_owner`.
unsafe impl Send for SgBuf {}
unsafe impl Sync for SgBuf {}

/// The ordered sequence of [`SgBuf`] entries returned by a read, covering
/// the queried range start-to-end with no gaps or overlaps.
#[derive(Default)]
pub struct SgList {
	entries: Vec<SgBuf>,
}

impl SgList {
	pub(crate) fn push(&mut self, buf: SgBuf) {
		self.entries.push(buf);
	}

	pub fn iter(&self) -> impl Iterator<Item = &SgBuf> {
		self.entries.iter()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Total bytes across all entries.
	pub fn total_len(&self) -> usize {
		self.entries.iter().map(SgBuf::len).sum()
	}

	/// Copy every entry's bytes into one contiguous buffer, in order. A
	/// convenience for callers that don't want to deal with scatter-gather
	/// directly.
	pub fn to_vec(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(self.total_len());
		for entry in &self.entries {
			out.extend_from_slice(entry.as_slice());
		}
		out
	}
}
