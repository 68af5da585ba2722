use std::sync::{
	atomic::{AtomicUsize, Ordering},
	Arc,
};

use log::warn;
use parking_lot::Mutex;

use crate::{device::CompletionFn, error::PagecacheError};

struct MergeState {
	pending: AtomicUsize,
	error: Mutex<Option<PagecacheError>>,
	completion: Mutex<Option<CompletionFn>>,
}

/// Fan-in combinator aggregating N concurrent I/O completions into one final
/// status, fired exactly once.
///
/// The issuing call reserves one [`MergeHandle`] before any sub-I/O is
/// issued and completes it with `Ok(())` once the traversal that issues
/// those sub-I/Os has finished; this makes the count off-by-one safe, since
/// `completion` cannot fire until every sub-operation has at least been
/// enqueued.
pub(crate) struct Merge(Arc<MergeState>);

impl Merge {
	pub(crate) fn new(completion: CompletionFn) -> Self {
		Self(Arc::new(MergeState {
			pending: AtomicUsize::new(0),
			error: Mutex::new(None),
			completion: Mutex::new(Some(completion)),
		}))
	}

	/// Reserve a handle counted toward this merge's pending set.
	pub(crate) fn handle(&self) -> MergeHandle {
		self.0.pending.fetch_add(1, Ordering::AcqRel);
		MergeHandle(Arc::clone(&self.0))
	}
}

/// A single outstanding contribution to a [`Merge`]. Exactly one of
/// [`MergeHandle::complete`] must be called for every handle produced by
/// [`Merge::handle`].
pub(crate) struct MergeHandle(Arc<MergeState>);

impl MergeHandle {
	pub(crate) fn complete(self, status: Result<(), PagecacheError>) {
		if let Err(err) = status {
			let mut slot = self.0.error.lock();
			if slot.is_some() {
				warn!("a merge already holds a failure; a further error is dropped: {err}");
			} else {
				*slot = Some(err);
			}
		}

		if self.0.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
			let final_status = match self.0.error.lock().take() {
				Some(err) => Err(err),
				None => Ok(()),
			};
			if let Some(completion) = self.0.completion.lock().take() {
				completion(final_status);
			}
		}
	}
}
