use std::sync::Arc;

use thiserror::Error;

/// Failure surfaced through a read, write, or fill completion.
///
/// Mirrors the source's opaque `status` values with `timm`/`timm_up`
/// annotations, expressed as an idiomatic error enum instead.
#[derive(Debug, Clone, Error)]
pub enum PagecacheError {
	/// A gap handler could not allocate a page slot.
	///
	/// Kept for source fidelity; see `DESIGN.md` for why this never actually
	/// triggers in this crate (the global allocator aborts rather than
	/// returning an error `allocate` could recover from).
	#[error("failed to allocate pagecache_page")]
	PageAllocation,

	/// `lookup_with_gaps` reported that the query range intersects nothing at
	/// all. Kept for source fidelity; unreachable through the public API, see
	/// `DESIGN.md`.
	#[error("no matching pages for range {start}..{end}")]
	NoCoverage { start: u64, end: u64 },

	/// The host-supplied block device failed a read or write.
	#[error("block I/O failed: {0}")]
	BlockIo(Arc<dyn std::error::Error + Send + Sync>),
}

impl PagecacheError {
	pub fn block_io(err: impl std::error::Error + Send + Sync + 'static) -> Self {
		Self::BlockIo(Arc::new(err))
	}
}
