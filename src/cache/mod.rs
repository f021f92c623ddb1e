//! Request cache: keyed storage of fetched results with staleness tracking,
//! in-flight awareness, and synchronous per-key change notification.
//!
//! The cache itself never fetches. The sync engine is its single writer;
//! everything else observes.

mod entry;
mod store;

pub use entry::{CacheEntry, EntryState, KeyScope};
pub use store::{RequestCache, SubscriptionId};
