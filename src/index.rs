use std::collections::BTreeMap;

use crate::{lru::SlotId, range::Range};

struct IndexEntry {
	end: u64,
	slot: SlotId,
}

/// The non-overlapping interval map from spec §4.1 (C2): byte range → page
/// slot, keyed by the page-aligned start offset. All mutation happens under
/// the cache lock (I3).
#[derive(Default)]
pub(crate) struct RangeIndex {
	entries: BTreeMap<u64, IndexEntry>,
}

impl RangeIndex {
	pub(crate) fn get(&self, range: Range) -> Option<SlotId> {
		self.entries.get(&range.start).map(|e| e.slot)
	}

	pub(crate) fn insert(&mut self, range: Range, slot: SlotId) {
		assert!(
			!self.overlaps(range),
			"attempted to index range {range} which overlaps an existing page"
		);
		self.entries.insert(
			range.start,
			IndexEntry {
				end: range.end,
				slot,
			},
		);
	}

	pub(crate) fn remove(&mut self, range: Range) {
		self.entries.remove(&range.start);
	}

	fn overlaps(&self, range: Range) -> bool {
		self.entries
			.range(..range.end)
			.next_back()
			.is_some_and(|(&start, e)| Range::new(start, e.end).overlaps(range))
	}

	/// Visit every indexed page intersecting `q` (via `on_node`, passing the
	/// page's own full range) and every maximal uncovered sub-range of `q`
	/// (via `on_gap`), both in strictly ascending order of start, such that
	/// the union of visited sub-ranges equals `q` and no gap overlaps a
	/// node.
	///
	/// See SPEC_FULL.md §5.1 for why this always visits at least one node or
	/// gap (and so always returns `true`) for any `q` with positive span —
	/// an empty index still yields exactly one gap spanning all of `q`.
	pub(crate) fn lookup_with_gaps(
		&self,
		q: Range,
		mut on_node: impl FnMut(SlotId, Range),
		mut on_gap: impl FnMut(Range),
	) -> bool {
		debug_assert!(q.span() > 0, "lookup_with_gaps requires a non-empty range");
		if q.span() == 0 {
			return false;
		}

		let mut pos = q.start;
		let mut visited = false;

		for (&start, entry) in self.entries.range(..q.end) {
			if entry.end <= q.start {
				continue;
			}
			if start > pos {
				on_gap(Range::new(pos, start));
				visited = true;
			}
			on_node(entry.slot, Range::new(start, entry.end));
			visited = true;
			pos = entry.end;
			if pos >= q.end {
				break;
			}
		}

		if pos < q.end {
			on_gap(Range::new(pos, q.end));
			visited = true;
		}

		visited
	}
}
