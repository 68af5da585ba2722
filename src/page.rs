use std::{collections::VecDeque, sync::atomic::AtomicUsize};

use parking_lot::Mutex;

use crate::{consts::INITIAL_COMPLETIONS_CAPACITY, lru::SlotId, merge::MergeHandle, range::Range};

/// A page's place in the state machine (spec §4.2 / SPEC_FULL §5.2).
///
/// `Dirty` is reserved: no code path in this crate currently drives a page
/// into it (see `DESIGN.md`), but it is kept as a distinct state rather than
/// removed, since a write-back engine would need to land here and nothing
/// else in the crate should assume the state space is smaller than this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageState {
	Free,
	Alloc,
	Reading,
	New,
	Active,
	Dirty,
}

/// A pending action to run once a page's in-flight fill resolves: either a
/// read that was merely waiting on the fill, or a write that arrived while
/// the page was `Reading` and must redo the write-check once bytes are in
/// place (spec §4.4 "deferred write closure").
///
/// This is the tagged-operation-object re-expression of the source's
/// function-pointer closures (§9).
pub(crate) enum Completion {
	ReadWaiter(MergeHandle),
	DeferredWrite {
		query: Range,
		src: std::sync::Arc<[u8]>,
		handle: MergeHandle,
	},
}

/// The mutable part of a page slot, guarded by the per-page lock. Holds
/// everything the source's per-page `spin_lock(&pp->lock)` protects: state,
/// the completions queue, and (via `buf`) the short memcpy critical
/// sections on the write path.
pub(crate) struct PageMeta {
	pub state: PageState,
	pub buf: Box<[u8]>,
	pub phys_frame: u64,
	pub completions: VecDeque<Completion>,
	/// The page's indexed byte range, duplicated here from the cache-lock-
	/// guarded `RangeIndex`/`ranges` table so that page-lock-only code paths
	/// (fill completion, deferred-write redo) can read it without taking the
	/// cache lock. Written once at allocation time, under both locks, and
	/// never changes until release.
	pub range: Range,
}

impl PageMeta {
	fn fresh(page_size: usize, phys_frame: u64) -> Self {
		Self {
			state: PageState::Alloc,
			buf: vec![0u8; page_size].into_boxed_slice(),
			phys_frame,
			completions: VecDeque::with_capacity(INITIAL_COMPLETIONS_CAPACITY),
			range: Range::new(0, 0),
		}
	}
}

/// One slot in the page arena. `range` and LRU-list membership live outside
/// this type, in cache-lock-guarded parallel storage (see `cache.rs`),
/// since they are cache-lock invariants (I1, I3) rather than per-page-lock
/// ones. `refcount` is lock-free, matching the source's atomic refcount.
pub(crate) struct PageSlot {
	pub meta: Mutex<PageMeta>,
	pub refcount: AtomicUsize,
	/// This slot's own index into the arena, so code holding only an
	/// `Arc<PageSlot>` (e.g. inside a fill completion) can still name it for
	/// list operations without threading the id through separately.
	pub slot_id: SlotId,
}

impl PageSlot {
	pub(crate) fn fresh(page_size: usize, phys_frame: u64, slot_id: SlotId) -> Self {
		Self {
			meta: Mutex::new(PageMeta::fresh(page_size, phys_frame)),
			refcount: AtomicUsize::new(0),
			slot_id,
		}
	}
}
