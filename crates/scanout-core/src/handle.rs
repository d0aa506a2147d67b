use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a client buffer. Allocated once per buffer object and never reused,
/// so equality is identity rather than content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    pub(crate) fn new_unique() -> Self {
        // Start from 1 to avoid confusion with NULL/0 handles
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        BufferId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Display-device framebuffer handle. 0 means "no framebuffer".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FramebufferId(pub u32);

impl FramebufferId {
    pub const NONE: FramebufferId = FramebufferId(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FramebufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fb#{}", self.0)
    }
}

/// Sequence number of a commit. Strictly increasing across the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommitId(pub u64);

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "commit#{}", self.0)
    }
}

/// Correlates a commit with the window/session that submitted it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct WindowSequence(pub u64);

/// Opaque client presentation-feedback resource awaiting a presented/discarded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PresentationFeedback(pub u32);
