use std::{
	ptr::NonNull,
	sync::{atomic::Ordering, Arc},
};

use log::{debug, error, trace};
use parking_lot::Mutex;
use static_assertions::assert_impl_all;

use crate::{
	consts::{DEFAULT_BLOCK_SIZE, DEFAULT_PAGE_SIZE},
	device::{BlockDevice, CompletionFn, IoBuf},
	error::PagecacheError,
	index::RangeIndex,
	lru::{ListId, LruLists, SlotId},
	merge::{Merge, MergeHandle},
	page::{Completion, PageSlot, PageState},
	range::Range,
	sg::{PageRef, SgBuf, SgList},
};

/// Construction-time parameters for a [`PageCache`].
#[derive(Debug, Clone, Copy)]
pub struct PageCacheConfig {
	/// Size of one cached page, in bytes. Must be a power of two and at
	/// least `block_size`.
	pub page_size: usize,
	/// Size of one device block, in bytes. Must be a power of two.
	pub block_size: usize,
	/// Size of the backing device, in bytes. Reads and fills are clamped to
	/// this length; bytes beyond it read as zero (spec §5.3, "short reads").
	pub length: u64,
}

impl Default for PageCacheConfig {
	fn default() -> Self {
		Self {
			page_size: DEFAULT_PAGE_SIZE,
			block_size: DEFAULT_BLOCK_SIZE,
			length: 0,
		}
	}
}

/// A block-backed, range-addressable page cache.
///
/// Reads and writes are issued against arbitrary byte ranges; the cache
/// transparently breaks them into page-aligned units, filling on miss and
/// writing through on every write. See `SPEC_FULL.md` for the full design.
#[derive(Clone)]
pub struct PageCache {
	inner: Arc<Inner>,
}

assert_impl_all!(PageCache: Send, Sync);

struct Inner {
	state: Mutex<CacheState>,
	/// Slots that transitioned out of `Reading` while the cache lock could
	/// not be acquired (because the completion fired synchronously, nested
	/// inside the very call that holds it, or lost a race against another
	/// traversal). Whichever call currently holds the cache lock drains this
	/// before releasing it, restoring the "on a list iff not Alloc/Reading"
	/// invariant (I1) before any other thread can observe otherwise.
	pending_attach: Mutex<Vec<SlotId>>,
	device: Arc<dyn BlockDevice>,
	page_size: usize,
	block_order: u32,
	length: u64,
}

#[derive(Default)]
struct CacheState {
	index: RangeIndex,
	lists: LruLists,
	slots: Vec<Arc<PageSlot>>,
	next_phys_frame: u64,
}

fn assert_transition(old: PageState, new: PageState) {
	use PageState::*;
	let legal = matches!(
		(old, new),
		(Free, Alloc)
			| (Alloc, Reading)
			| (Reading, New)
			| (Alloc, New)
			| (New, Active)
			| (Active, Active)
			| (New, Free)
			| (Active, Free)
			| (Dirty, Free)
	);
	if !legal {
		error!("illegal page state transition attempted: {old:?} -> {new:?}");
		panic!("illegal page state transition: {old:?} -> {new:?}");
	}
}

enum PlanItem {
	Existing(SlotId),
	New(Range),
}

/// Walk `aligned` (already page-aligned) against `index`, splitting every
/// uncovered sub-range into page-sized chunks. The result names, in
/// ascending order, every page the caller must touch to cover `aligned`.
fn plan_segments(aligned: Range, index: &RangeIndex, page_size: u64) -> Vec<PlanItem> {
	let mut plan = Vec::new();
	index.lookup_with_gaps(
		aligned,
		|slot, _| plan.push(PlanItem::Existing(slot)),
		|gap| {
			let mut start = gap.start;
			while start < gap.end {
				plan.push(PlanItem::New(Range::new(start, start + page_size)));
				start += page_size;
			}
		},
	);
	plan
}

impl PageCache {
	pub fn new(config: PageCacheConfig, device: impl BlockDevice + 'static) -> Self {
		assert!(config.page_size.is_power_of_two(), "page_size must be a power of two");
		assert!(config.block_size.is_power_of_two(), "block_size must be a power of two");
		assert!(
			config.page_size >= config.block_size,
			"page_size must be at least block_size"
		);

		debug!(
			"page cache initialized: page_size={} block_size={} length={}",
			config.page_size, config.block_size, config.length
		);

		let inner = Arc::new(Inner {
			state: Mutex::new(CacheState::default()),
			pending_attach: Mutex::new(Vec::new()),
			device: Arc::new(device),
			page_size: config.page_size,
			block_order: config.block_size.trailing_zeros(),
			length: config.length,
		});

		Self { inner }
	}

	pub fn page_size(&self) -> usize {
		self.inner.page_size
	}

	pub fn length(&self) -> u64 {
		self.inner.length
	}

	/// Read `query`, returning a scatter-gather list of its contents.
	/// `completion` fires once every page touched by `query` has been
	/// brought up to date (immediately, for pages already `Active`/`New`;
	/// after a fill, for pages that were a miss).
	///
	/// The returned [`SgList`] is valid to read from as soon as this call
	/// returns, even for ranges still being filled: all bytes are already
	/// reserved against the page cache's memory, but bytes belonging to a
	/// page still `Reading` are not yet meaningful until `completion` fires.
	pub fn sg_read(&self, query: Range, completion: CompletionFn) -> SgList {
		assert!(query.span() > 0, "sg_read requires a non-empty range");

		let aligned = self.inner.align_to_pages(query);
		let merge = Merge::new(completion);
		let issuing = merge.handle();
		let mut sg = SgList::default();

		let mut state = self.inner.state.lock();
		let plan = plan_segments(aligned, &state.index, self.inner.page_size as u64);
		for item in plan {
			let slot = match item {
				PlanItem::Existing(slot) => slot,
				PlanItem::New(range) => self.inner.allocate_locked(&mut state, range),
			};
			let slot_arc = Arc::clone(&state.slots[slot]);
			self.inner.read_node(&mut state, &merge, &mut sg, slot_arc, query);
		}
		self.inner.drain_pending_attach(&mut state);
		drop(state);

		issuing.complete(Ok(()));
		sg
	}

	/// Write `src` (whose length must equal `query.span()`) to `query`,
	/// writing through to the backing device. `completion` fires once every
	/// touched page's bytes have both been updated in the cache and (for the
	/// sub-range each page covers) handed to [`BlockDevice::write`], and that
	/// write's own completion has fired.
	pub fn write(&self, query: Range, src: Arc<[u8]>, completion: CompletionFn) {
		assert!(query.span() > 0, "write requires a non-empty range");
		assert_eq!(
			src.len() as u64,
			query.span(),
			"write source length must match the queried range"
		);

		let aligned = self.inner.align_to_pages(query);
		let merge = Merge::new(completion);
		let issuing = merge.handle();

		let mut state = self.inner.state.lock();
		let plan = plan_segments(aligned, &state.index, self.inner.page_size as u64);
		for item in plan {
			match item {
				PlanItem::Existing(slot) => {
					let slot_arc = Arc::clone(&state.slots[slot]);
					self.inner.write_check(slot_arc, query, Arc::clone(&src), merge.handle());
				}
				PlanItem::New(range) => {
					let slot = self.inner.allocate_locked(&mut state, range);
					let slot_arc = Arc::clone(&state.slots[slot]);

					// Whole-page-cover optimization (spec §4.4 "on_write_gap"): if
					// the write covers every writable byte of the new page, there
					// is nothing worth pre-reading — write through immediately
					// instead of filling first.
					let writable_end = range.end.min(self.inner.length);
					let full_cover = query.start <= range.start && query.end >= writable_end;

					if full_cover {
						{
							let mut meta = slot_arc.meta.lock();
							assert_transition(meta.state, PageState::New);
							meta.state = PageState::New;
						}
						state.lists.push_back(ListId::New, slot);
						self.inner.write_through(slot_arc, query, Arc::clone(&src), merge.handle());
					} else {
						{
							let mut meta = slot_arc.meta.lock();
							assert_transition(meta.state, PageState::Reading);
							meta.state = PageState::Reading;
							meta.completions.push_back(Completion::DeferredWrite {
								query,
								src: Arc::clone(&src),
								handle: merge.handle(),
							});
						}
						self.inner.issue_fill(slot_arc, range);
					}
				}
			}
		}
		self.inner.drain_pending_attach(&mut state);
		drop(state);

		issuing.complete(Ok(()));
	}

	/// Reclaim pages that are cached (`New`/`Active`/`Dirty`) but not
	/// currently referenced by any outstanding [`SgBuf`] or deferred
	/// operation, returning them to the Free list for reuse. Returns the
	/// number of pages reclaimed.
	///
	/// Eviction only happens here: the cache never reclaims a page on its
	/// own just because its refcount dropped, so a page a caller read a
	/// moment ago is still there to be read again without a fill, until the
	/// host decides to call this (spec §5.2 / "Release & eviction").
	pub fn evict(&self) -> usize {
		self.inner.with_cache_lock(|state| {
			let mut candidates = Vec::new();
			for list in [ListId::New, ListId::Active, ListId::Dirty] {
				candidates.extend(state.lists.iter(list));
			}

			let mut reclaimed = 0;
			for slot in candidates {
				let slot_arc = Arc::clone(&state.slots[slot]);
				if slot_arc.refcount.load(Ordering::Acquire) != 1 {
					continue;
				}

				let range = {
					let mut meta = slot_arc.meta.lock();
					assert_transition(meta.state, PageState::Free);
					meta.state = PageState::Free;
					meta.buf.fill(0);
					meta.completions.clear();
					meta.range
				};
				state.lists.remove(slot);
				state.index.remove(range);
				slot_arc.refcount.store(0, Ordering::Release);
				state.lists.push_back(ListId::Free, slot);
				reclaimed += 1;
			}
			trace!("evict reclaimed {reclaimed} page(s)");
			reclaimed
		})
	}
}

impl Inner {
	fn with_cache_lock<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> R {
		let mut state = self.state.lock();
		let result = f(&mut state);
		self.drain_pending_attach(&mut state);
		result
	}

	fn drain_pending_attach(&self, state: &mut CacheState) {
		let mut pending = self.pending_attach.lock();
		for slot in pending.drain(..) {
			if state.lists.membership_of(slot).is_none() {
				state.lists.push_back(ListId::New, slot);
			}
		}
	}

	fn align_to_pages(&self, r: Range) -> Range {
		let mask = self.page_size as u64 - 1;
		Range::new(r.start & !mask, (r.end + mask) & !mask)
	}

	/// Claim a page (from the Free list, or by growing the arena) for
	/// `range`, indexing it immediately. The returned slot starts in
	/// `Alloc`, with refcount 1 representing the baseline reservation the
	/// index itself holds for as long as the page stays indexed (I5).
	fn allocate_locked(&self, state: &mut CacheState, range: Range) -> SlotId {
		let slot = if let Some(slot) = state.lists.pop_front(ListId::Free) {
			let slot_arc = Arc::clone(&state.slots[slot]);
			let mut meta = slot_arc.meta.lock();
			assert_transition(meta.state, PageState::Alloc);
			meta.state = PageState::Alloc;
			meta.range = range;
			slot
		} else {
			let slot = state.slots.len();
			let phys_frame = state.next_phys_frame;
			state.next_phys_frame += 1;
			let slot_arc = Arc::new(PageSlot::fresh(self.page_size, phys_frame, slot));
			{
				let mut meta = slot_arc.meta.lock();
				meta.range = range;
			}
			state.slots.push(slot_arc);
			state.lists.register_slot(slot);
			slot
		};

		state.slots[slot].refcount.store(1, Ordering::Release);
		state.index.insert(range, slot);
		trace!("allocated slot {slot} for range {range}");
		slot
	}

	/// Reserve an [`SgBuf`] into `slot_arc` covering its intersection with
	/// `query`, then advance the page toward a servable state: touch it if
	/// already filled, or join (and, the first time, kick off) the fill if
	/// not.
	fn read_node(self: &Arc<Self>, state: &mut CacheState, merge: &Merge, sg: &mut SgList, slot_arc: Arc<PageSlot>, query: Range) {
		slot_arc.refcount.fetch_add(1, Ordering::AcqRel);
		let page_ref = Arc::new(unsafe { PageRef::new(Arc::clone(&slot_arc)) });

		let mut meta = slot_arc.meta.lock();
		let node_range = meta.range;
		let intersection = node_range.intersection(query);
		debug_assert!(!intersection.is_empty(), "visited page does not overlap the query");
		let offset = (intersection.start - node_range.start) as usize;
		let ptr = unsafe { NonNull::new_unchecked(meta.buf.as_mut_ptr().add(offset)) };
		sg.push(SgBuf::new(ptr, intersection.span() as usize, page_ref));

		match meta.state {
			PageState::New => {
				meta.state = PageState::Active;
				drop(meta);
				state.lists.move_to_tail(ListId::Active, slot_arc.slot_id);
			}
			PageState::Active => {
				drop(meta);
				state.lists.move_to_tail(ListId::Active, slot_arc.slot_id);
			}
			PageState::Dirty => drop(meta),
			PageState::Alloc => {
				meta.state = PageState::Reading;
				meta.completions.push_back(Completion::ReadWaiter(merge.handle()));
				drop(meta);
				self.issue_fill(slot_arc, node_range);
			}
			PageState::Reading => {
				meta.completions.push_back(Completion::ReadWaiter(merge.handle()));
			}
			PageState::Free => unreachable!("indexed page must not be Free"),
		}
	}

	/// Issue the block read that brings `slot_arc` (currently `Reading`)
	/// up to date for `node_range`, clamped to the device length.
	fn issue_fill(self: &Arc<Self>, slot_arc: Arc<PageSlot>, node_range: Range) {
		let (ptr, io_len, block_range) = {
			let mut meta = slot_arc.meta.lock();
			let fill_end = node_range.end.min(self.length);
			let tail_start = fill_end.saturating_sub(node_range.start) as usize;
			if fill_end < node_range.end {
				meta.buf[tail_start..].fill(0);
			}
			let ptr = unsafe { NonNull::new_unchecked(meta.buf.as_mut_ptr()) };
			// `node_range.start` and `.end` are always page- (hence
			// block-) aligned; `fill_end` only differs from `node_range.end`
			// when clamped to a non-block-aligned device length, in which
			// case the trailing partial block is deliberately left unread —
			// rounding the request up would have the device overwrite the
			// zero-padding just written above with real past-EOF bytes.
			let block_range = Range::new(node_range.start, fill_end.max(node_range.start)).rshift(self.block_order);
			(ptr, tail_start, block_range)
		};

		if io_len == 0 {
			self.complete_fill(&slot_arc, Ok(()));
			return;
		}

		let dest = unsafe { IoBuf::new(ptr, io_len) };
		let inner = Arc::clone(self);
		let completion_slot = Arc::clone(&slot_arc);
		self.device
			.read(block_range, dest, Box::new(move |status| inner.complete_fill(&completion_slot, status)));
	}

	/// Fill completion: advance `Reading -> New`, then run every completion
	/// the page accumulated while filling (read waiters, deferred writes).
	fn complete_fill(self: &Arc<Self>, slot_arc: &Arc<PageSlot>, status: Result<(), PagecacheError>) {
		let completions = {
			let mut meta = slot_arc.meta.lock();
			if status.is_ok() {
				assert_transition(meta.state, PageState::New);
				meta.state = PageState::New;
			} else if let Err(err) = &status {
				error!("error filling page {}: {err}", meta.range);
			}
			std::mem::take(&mut meta.completions)
		};

		if status.is_ok() {
			match self.state.try_lock() {
				Some(mut state) => state.lists.push_back(ListId::New, slot_arc.slot_id),
				None => self.pending_attach.lock().push(slot_arc.slot_id),
			}
		}

		for completion in completions {
			match completion {
				Completion::ReadWaiter(handle) => handle.complete(status.clone()),
				Completion::DeferredWrite { query, src, handle } => match &status {
					Ok(()) => self.write_through(Arc::clone(slot_arc), query, src, handle),
					Err(err) => handle.complete(Err(err.clone())),
				},
			}
		}
	}

	/// Dispatch a write against an already-indexed page: write through
	/// immediately if it is servable, or queue it to redo once an
	/// in-flight fill resolves.
	fn write_check(self: &Arc<Self>, slot_arc: Arc<PageSlot>, query: Range, src: Arc<[u8]>, handle: MergeHandle) {
		let mut meta = slot_arc.meta.lock();
		match meta.state {
			PageState::Reading => {
				meta.completions.push_back(Completion::DeferredWrite { query, src, handle });
			}
			PageState::New | PageState::Active | PageState::Dirty => {
				drop(meta);
				self.write_through(slot_arc, query, src, handle);
			}
			PageState::Alloc => unreachable!("indexed page must not be Alloc outside allocation"),
			PageState::Free => unreachable!("indexed page must not be Free"),
		}
	}

	/// Copy `src`'s overlap with `slot_arc`'s range into the page buffer,
	/// then write that same region through to the device. `handle` is fed
	/// the device write's own completion status.
	fn write_through(self: &Arc<Self>, slot_arc: Arc<PageSlot>, query: Range, src: Arc<[u8]>, handle: MergeHandle) {
		let (ptr, len, block_range) = {
			let mut meta = slot_arc.meta.lock();
			let node_range = meta.range;
			let intersection = node_range.intersection(query);
			assert!(
				intersection.end <= self.length,
				"write target {intersection} exceeds backing length {}",
				self.length
			);
			let page_offset = (intersection.start - node_range.start) as usize;
			let src_offset = (intersection.start - query.start) as usize;
			let len = intersection.span() as usize;
			meta.buf[page_offset..page_offset + len].copy_from_slice(&src[src_offset..src_offset + len]);
			let ptr = unsafe { NonNull::new_unchecked(meta.buf.as_mut_ptr().add(page_offset)) };
			// Unlike a fill's `node_range`, `intersection` comes from an
			// arbitrary caller-supplied query and need not land on a block
			// boundary, so the trailing partial block must be rounded up
			// to stay covered rather than dropped (plain `rshift` would
			// truncate it, as for `[512, 612)` at a 512-byte block size).
			(ptr, len, intersection.rshift_covering(self.block_order))
		};

		let buf = unsafe { IoBuf::new(ptr, len) };
		self.device.write(block_range, buf, Box::new(move |status| handle.complete(status)));
	}
}

#[cfg(test)]
impl PageCache {
	fn page_state_at(&self, offset: u64) -> Option<PageState> {
		let state = self.inner.state.lock();
		let range = self.inner.align_to_pages(Range::new(offset, offset + 1));
		let slot = state.index.get(range)?;
		Some(state.slots[slot].meta.lock().state)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering},
		Mutex as StdMutex,
	};

	use super::*;
	use crate::device::MockBlockDevice;

	fn config() -> PageCacheConfig {
		PageCacheConfig {
			page_size: 4096,
			block_size: 512,
			length: 16384,
		}
	}

	#[test]
	fn single_aligned_read_miss() {
		let mut device = MockBlockDevice::new();
		device
			.expect_read()
			.times(1)
			.withf(|blocks: &Range, dest: &IoBuf, _| *blocks == Range::new(0, 8) && dest.len() == 4096)
			.returning(|_, _, completion| completion(Ok(())));

		let cache = PageCache::new(config(), device);
		let done = Arc::new(StdAtomicUsize::new(0));
		let done2 = Arc::clone(&done);
		let sg = cache.sg_read(
			Range::new(0, 4096),
			Box::new(move |status| {
				assert!(status.is_ok());
				done2.fetch_add(1, StdOrdering::SeqCst);
			}),
		);

		assert_eq!(done.load(StdOrdering::SeqCst), 1);
		assert_eq!(sg.len(), 1);
		assert_eq!(sg.iter().next().unwrap().len(), 4096);
		assert_eq!(cache.page_state_at(0), Some(PageState::New));
	}

	#[test]
	fn unaligned_cross_page_read_miss() {
		let mut device = MockBlockDevice::new();
		device.expect_read().times(2).returning(|_, _, completion| completion(Ok(())));

		let cache = PageCache::new(config(), device);
		let sg = cache.sg_read(Range::new(3000, 5000), Box::new(|status| assert!(status.is_ok())));

		let lens: Vec<usize> = sg.iter().map(SgBuf::len).collect();
		assert_eq!(lens, vec![1096, 904]);
		assert_eq!(cache.page_state_at(0), Some(PageState::New));
		assert_eq!(cache.page_state_at(4096), Some(PageState::New));
	}

	#[test]
	fn read_past_eof_zero_pads() {
		let mut device = MockBlockDevice::new();
		device.expect_read().returning(|_, mut dest, completion| {
			dest.as_mut_slice().fill(0);
			completion(Ok(()))
		});

		let cache = PageCache::new(config(), device);
		let sg = cache.sg_read(Range::new(16000, 20000), Box::new(|status| assert!(status.is_ok())));

		// [16000, 20000) aligns to pages [12288,16384) and [16384,20480); the
		// sg list is never clipped to `length` (only the fill and its zero
		// padding are), so it covers the full query: 384 + 3616 = 4000.
		assert_eq!(sg.total_len(), 4000);
		assert!(sg.to_vec().iter().all(|&b| b == 0));
	}

	#[test]
	fn whole_page_write_skips_fill() {
		let mut device = MockBlockDevice::new();
		device.expect_read().times(0);
		device
			.expect_write()
			.times(1)
			.withf(|blocks: &Range, buf: &IoBuf, _| *blocks == Range::new(8, 16) && buf.len() == 4096)
			.returning(|_, _, completion| completion(Ok(())));

		let cache = PageCache::new(config(), device);
		let src: Arc<[u8]> = Arc::from(vec![0xAAu8; 4096].into_boxed_slice());
		cache.write(Range::new(4096, 8192), src, Box::new(|status| assert!(status.is_ok())));

		assert_eq!(cache.page_state_at(4096), Some(PageState::New));
	}

	#[test]
	fn partial_page_write_fills_first() {
		let mut device = MockBlockDevice::new();
		let mut seq = mockall::Sequence::new();
		device
			.expect_read()
			.times(1)
			.in_sequence(&mut seq)
			.returning(|_, mut dest, completion| {
				dest.as_mut_slice().fill(0);
				completion(Ok(()))
			});
		device
			.expect_write()
			.times(1)
			.in_sequence(&mut seq)
			.withf(|blocks: &Range, buf: &IoBuf, _| *blocks == Range::new(1, 2) && buf.len() == 100)
			.returning(|_, _, completion| completion(Ok(())));

		let cache = PageCache::new(config(), device);
		let src: Arc<[u8]> = Arc::from(vec![0xBBu8; 100].into_boxed_slice());
		cache.write(Range::new(512, 612), src, Box::new(|status| assert!(status.is_ok())));

		assert_eq!(cache.page_state_at(0), Some(PageState::New));
	}

	#[test]
	fn concurrent_write_on_reading_page_defers() {
		let captured: Arc<StdMutex<Option<CompletionFn>>> = Arc::new(StdMutex::new(None));
		let captured2 = Arc::clone(&captured);

		let mut device = MockBlockDevice::new();
		device.expect_read().times(1).returning(move |_, mut dest, completion| {
			dest.as_mut_slice().fill(0);
			*captured2.lock().unwrap() = Some(completion);
		});
		device.expect_write().times(1).returning(|_, _, completion| completion(Ok(())));

		let cache = PageCache::new(config(), device);

		let read_done = Arc::new(StdAtomicUsize::new(0));
		let read_done2 = Arc::clone(&read_done);
		let _sg = cache.sg_read(
			Range::new(0, 4096),
			Box::new(move |status| {
				assert!(status.is_ok());
				read_done2.fetch_add(1, StdOrdering::SeqCst);
			}),
		);
		assert_eq!(read_done.load(StdOrdering::SeqCst), 0);
		assert_eq!(cache.page_state_at(0), Some(PageState::Reading));

		let write_done = Arc::new(StdAtomicUsize::new(0));
		let write_done2 = Arc::clone(&write_done);
		let src: Arc<[u8]> = Arc::from(vec![0xCCu8; 512].into_boxed_slice());
		cache.write(
			Range::new(512, 1024),
			src,
			Box::new(move |status| {
				assert!(status.is_ok());
				write_done2.fetch_add(1, StdOrdering::SeqCst);
			}),
		);
		assert_eq!(write_done.load(StdOrdering::SeqCst), 0, "write must wait for the fill to resolve");

		let completion = captured.lock().unwrap().take().expect("fill completion was captured");
		completion(Ok(()));

		assert_eq!(read_done.load(StdOrdering::SeqCst), 1);
		assert_eq!(write_done.load(StdOrdering::SeqCst), 1);
		assert_eq!(cache.page_state_at(0), Some(PageState::New));
	}

	#[test]
	fn evict_reclaims_only_unreferenced_pages() {
		let mut device = MockBlockDevice::new();
		device.expect_read().returning(|_, _, completion| completion(Ok(())));
		let cache = PageCache::new(config(), device);

		let sg = cache.sg_read(Range::new(0, 4096), Box::new(|status| assert!(status.is_ok())));
		assert_eq!(cache.evict(), 0, "an outstanding sg entry must keep the page out of eviction");

		drop(sg);
		assert_eq!(cache.evict(), 1);
		assert_eq!(cache.page_state_at(0), None, "reclaimed page must leave the index");
	}

	#[test]
	fn fill_failure_leaves_page_reading_and_propagates_to_waiters() {
		let captured: Arc<StdMutex<Option<CompletionFn>>> = Arc::new(StdMutex::new(None));
		let captured2 = Arc::clone(&captured);

		let mut device = MockBlockDevice::new();
		device.expect_read().times(1).returning(move |_, _, completion| {
			*captured2.lock().unwrap() = Some(completion);
		});

		let cache = PageCache::new(config(), device);

		let read_status: Arc<StdMutex<Option<Result<(), PagecacheError>>>> = Arc::new(StdMutex::new(None));
		let read_status2 = Arc::clone(&read_status);
		let _sg = cache.sg_read(
			Range::new(0, 4096),
			Box::new(move |status| *read_status2.lock().unwrap() = Some(status)),
		);
		assert_eq!(cache.page_state_at(0), Some(PageState::Reading));

		// A write arriving while the fill is still outstanding must be
		// deferred the same as in the success case, and then see the same
		// failure once the fill resolves.
		let write_status: Arc<StdMutex<Option<Result<(), PagecacheError>>>> = Arc::new(StdMutex::new(None));
		let write_status2 = Arc::clone(&write_status);
		let src: Arc<[u8]> = Arc::from(vec![0xDDu8; 512].into_boxed_slice());
		cache.write(
			Range::new(0, 512),
			src,
			Box::new(move |status| *write_status2.lock().unwrap() = Some(status)),
		);

		let completion = captured.lock().unwrap().take().expect("fill completion was captured");
		completion(Err(PagecacheError::block_io(std::io::Error::other("simulated disk failure"))));

		assert!(matches!(read_status.lock().unwrap().take(), Some(Err(PagecacheError::BlockIo(_)))));
		assert!(matches!(write_status.lock().unwrap().take(), Some(Err(PagecacheError::BlockIo(_)))));
		assert_eq!(
			cache.page_state_at(0),
			Some(PageState::Reading),
			"policy: a failed fill leaves the page in Reading rather than rolling it back or retrying"
		);
	}

	/// A zeroed backing store, for round-trip-style tests where mock call
	/// expectations would be more ceremony than signal.
	struct FakeDevice {
		store: StdMutex<Vec<u8>>,
	}

	impl FakeDevice {
		fn zeroed(len: usize) -> Self {
			Self {
				store: StdMutex::new(vec![0u8; len]),
			}
		}
	}

	impl BlockDevice for FakeDevice {
		fn read(&self, blocks: Range, mut dest: IoBuf, completion: CompletionFn) {
			let store = self.store.lock().unwrap();
			let start = blocks.start as usize * 512;
			let end = start + dest.len();
			dest.as_mut_slice().copy_from_slice(&store[start..end]);
			drop(store);
			completion(Ok(()));
		}

		fn write(&self, blocks: Range, buf: IoBuf, completion: CompletionFn) {
			let mut store = self.store.lock().unwrap();
			let start = blocks.start as usize * 512;
			store[start..start + buf.len()].copy_from_slice(buf.as_slice());
			drop(store);
			completion(Ok(()));
		}
	}

	#[test]
	fn round_trip_write_then_read() {
		let device = FakeDevice::zeroed(16384);
		let cache = PageCache::new(config(), device);

		let src: Arc<[u8]> = Arc::from(vec![0x42u8; 2000].into_boxed_slice());
		cache.write(Range::new(100, 2100), Arc::clone(&src), Box::new(|status| assert!(status.is_ok())));

		let sg = cache.sg_read(Range::new(100, 2100), Box::new(|status| assert!(status.is_ok())));
		assert_eq!(sg.to_vec(), src.to_vec());
	}

	#[test]
	fn round_trip_past_eof_tail_is_zero() {
		let device = FakeDevice::zeroed(16384);
		let cache = PageCache::new(config(), device);

		// Write right up to (but never past) `length`, then read further out
		// than `length` and expect the tail beyond it to read back as zero.
		let src: Arc<[u8]> = Arc::from(vec![0x7Fu8; 2384].into_boxed_slice());
		cache.write(Range::new(14000, 16384), Arc::clone(&src), Box::new(|status| assert!(status.is_ok())));

		let sg = cache.sg_read(Range::new(14000, 18000), Box::new(|status| assert!(status.is_ok())));
		let bytes = sg.to_vec();
		assert_eq!(bytes.len(), 4000);
		assert_eq!(&bytes[..2384], &src[..]);
		assert!(bytes[2384..].iter().all(|&b| b == 0), "bytes past `length` must read as zero");
	}

	#[test]
	fn idempotent_read() {
		let device = FakeDevice::zeroed(16384);
		let cache = PageCache::new(config(), device);

		let first = cache.sg_read(Range::new(0, 4096), Box::new(|status| assert!(status.is_ok()))).to_vec();
		let second = cache.sg_read(Range::new(0, 4096), Box::new(|status| assert!(status.is_ok()))).to_vec();
		assert_eq!(first, second);
	}
}
