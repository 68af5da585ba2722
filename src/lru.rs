//! The four named LRU lists from spec §3/§5.2, implemented as intrusive
//! doubly-linked lists over page slot ids rather than over owned nodes —
//! the links live in cache-lock-guarded parallel storage, following the
//! source's `list_insert_before`/`list_delete` intrusive list discipline
//! (§9: "use an intrusive doubly-linked list with an explicit `link` field
//! ... the list node is a non-owning relation").

pub(crate) type SlotId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListId {
	Free,
	New,
	Active,
	Dirty,
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
	prev: Option<SlotId>,
	next: Option<SlotId>,
}

#[derive(Debug, Default)]
struct ListHead {
	head: Option<SlotId>,
	tail: Option<SlotId>,
	len: usize,
}

/// Owns the Free/New/Active/Dirty intrusive lists. Every mutating method
/// requires the cache lock to already be held by the caller (there is no
/// locking inside `LruLists` itself — see invariant I1/I6).
#[derive(Debug, Default)]
pub(crate) struct LruLists {
	links: Vec<Link>,
	membership: Vec<Option<ListId>>,
	lists: [ListHead; 4],
}

impl LruLists {
	fn list_mut(&mut self, id: ListId) -> &mut ListHead {
		&mut self.lists[id as usize]
	}

	/// Register a freshly allocated slot id. Must be called once, in order,
	/// for every new slot pushed onto the page arena.
	pub(crate) fn register_slot(&mut self, slot: SlotId) {
		debug_assert_eq!(slot, self.links.len());
		self.links.push(Link::default());
		self.membership.push(None);
	}

	pub(crate) fn membership_of(&self, slot: SlotId) -> Option<ListId> {
		self.membership[slot]
	}

	/// Insert `slot` at the tail of `list`. `slot` must not currently be on
	/// any list.
	pub(crate) fn push_back(&mut self, list: ListId, slot: SlotId) {
		debug_assert!(
			self.membership[slot].is_none(),
			"slot {slot} is already on list {:?}",
			self.membership[slot]
		);
		let prev = self.list_mut(list).tail;
		self.links[slot] = Link { prev, next: None };
		match prev {
			Some(prev) => self.links[prev].next = Some(slot),
			None => self.list_mut(list).head = Some(slot),
		}
		self.list_mut(list).tail = Some(slot);
		self.list_mut(list).len += 1;
		self.membership[slot] = Some(list);
	}

	/// Remove `slot` from whichever list it currently belongs to, if any.
	pub(crate) fn remove(&mut self, slot: SlotId) {
		let Some(list) = self.membership[slot].take() else {
			return;
		};
		let Link { prev, next } = self.links[slot];
		match prev {
			Some(prev) => self.links[prev].next = next,
			None => self.list_mut(list).head = next,
		}
		match next {
			Some(next) => self.links[next].prev = prev,
			None => self.list_mut(list).tail = prev,
		}
		self.links[slot] = Link::default();
		self.list_mut(list).len -= 1;
	}

	/// Move `slot` to the tail of `list`, re-linking if it is already there
	/// (the LRU-refresh behavior for `Active → Active` touches).
	pub(crate) fn move_to_tail(&mut self, list: ListId, slot: SlotId) {
		self.remove(slot);
		self.push_back(list, slot);
	}

	pub(crate) fn pop_front(&mut self, list: ListId) -> Option<SlotId> {
		let head = self.list_mut(list).head?;
		self.remove(head);
		Some(head)
	}

	pub(crate) fn is_empty(&self, list: ListId) -> bool {
		self.lists[list as usize].head.is_none()
	}

	pub(crate) fn len(&self, list: ListId) -> usize {
		self.lists[list as usize].len
	}

	/// Snapshot the slot ids currently on `list`, head to tail.
	pub(crate) fn iter(&self, list: ListId) -> impl Iterator<Item = SlotId> + '_ {
		let mut next = self.lists[list as usize].head;
		std::iter::from_fn(move || {
			let current = next?;
			next = self.links[current].next;
			Some(current)
		})
	}
}
