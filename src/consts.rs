use crate::units::KIB;

/// Default page size used by [`crate::PageCacheConfig::default`].
pub(crate) const DEFAULT_PAGE_SIZE: usize = 4 * KIB;

/// Default block size used by [`crate::PageCacheConfig::default`].
pub(crate) const DEFAULT_BLOCK_SIZE: usize = 512;

/// Initial capacity of a freshly allocated page's completion queue, matching
/// the source's `allocate_vector(pc->h, 8)`.
pub(crate) const INITIAL_COMPLETIONS_CAPACITY: usize = 8;
