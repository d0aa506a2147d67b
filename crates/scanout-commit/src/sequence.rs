use std::sync::atomic::{AtomicU64, Ordering};

use scanout_core::handle::CommitId;

/// Last commit id handed out. Starts at zero with the process and is never reset.
static LAST_COMMIT_ID: AtomicU64 = AtomicU64::new(0);

/// Allocate the next commit id. Ids are strictly increasing and never reused.
pub fn next_commit_id() -> CommitId {
    CommitId(LAST_COMMIT_ID.fetch_add(1, Ordering::Relaxed) + 1)
}

/// The most recently allocated id, `CommitId(0)` before the first commit.
pub fn last_commit_id() -> CommitId {
    CommitId(LAST_COMMIT_ID.load(Ordering::Relaxed))
}
