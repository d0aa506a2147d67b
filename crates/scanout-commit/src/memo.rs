//! Memoises client buffers and their imported framebuffer + texture so a
//! buffer is imported into the display pipeline once rather than on every
//! commit, avoiding redundant SDMA page-table work for each import.
//!
//! The cache never owns a buffer. Each entry registers a destroy listener on
//! its buffer and is evicted by it, so a memo cannot outlive its buffer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use scanout_core::backend::{BufferImporter, DisplayDevice};
use scanout_core::buffer::{ClientBuffer, ListenerId, Texture, WeakClientBuffer};
use scanout_core::error::ImportError;
use scanout_core::handle::{BufferId, FramebufferId};

/// The display-resident form of a client buffer. Immutable once created.
#[derive(Clone)]
pub struct BufferMemo {
    framebuffer: FramebufferId,
    texture: Arc<dyn Texture>,
}

impl BufferMemo {
    pub fn framebuffer(&self) -> FramebufferId {
        self.framebuffer
    }

    pub fn texture(&self) -> &Arc<dyn Texture> {
        &self.texture
    }

    /// Whether both memos came from the same import.
    pub fn same_import(&self, other: &BufferMemo) -> bool {
        self.framebuffer == other.framebuffer && Arc::ptr_eq(&self.texture, &other.texture)
    }
}

impl fmt::Debug for BufferMemo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferMemo")
            .field("framebuffer", &self.framebuffer)
            .field("texture", &self.texture)
            .finish()
    }
}

struct BufferMemoHolder {
    memo: BufferMemo,
    buffer: WeakClientBuffer,
    listener: ListenerId,
}

/// Per-identity slot. Its lock serialises imports of one buffer without
/// holding up resolves of other buffers.
type Slot = Arc<Mutex<Option<BufferMemoHolder>>>;

struct MemoInner {
    memos: DashMap<BufferId, Slot>,
    importer: Arc<dyn BufferImporter>,
    display: Arc<dyn DisplayDevice>,
    imports: AtomicU64,
}

impl MemoInner {
    /// Called from the buffer's destroy listener.
    fn forget(&self, id: BufferId) {
        let Some((_, slot)) = self.memos.remove(&id) else {
            return;
        };
        let holder = slot.lock().take();
        if let Some(holder) = holder {
            debug!(buffer = %id, fb_id = holder.memo.framebuffer.0, "forgetting buffer memo");
            self.release(holder.memo);
        }
    }

    fn release(&self, memo: BufferMemo) {
        if !memo.framebuffer.is_none() {
            self.display.release_framebuffer(memo.framebuffer);
        }
    }
}

impl Drop for MemoInner {
    fn drop(&mut self) {
        for (id, slot) in std::mem::take(&mut self.memos) {
            let Some(holder) = slot.lock().take() else {
                continue;
            };
            holder.buffer.remove_destroy_listener(holder.listener);
            debug!(buffer = %id, "dropping buffer memo on teardown");
            self.release(holder.memo);
        }
    }
}

/// Cache of buffer memos keyed by buffer identity. Cheap to clone.
#[derive(Clone)]
pub struct BufferMemoiser {
    inner: Arc<MemoInner>,
}

impl BufferMemoiser {
    pub fn new(importer: Arc<dyn BufferImporter>, display: Arc<dyn DisplayDevice>) -> Self {
        Self {
            inner: Arc::new(MemoInner {
                memos: DashMap::new(),
                importer,
                display,
                imports: AtomicU64::new(0),
            }),
        }
    }

    /// Look up the memo for `buffer`, importing it on first use.
    ///
    /// Concurrent resolves of the same buffer import once; the others wait and
    /// receive the same memo. A failed import leaves no entry behind, so a later
    /// resolve is free to try again.
    pub fn resolve(&self, buffer: &ClientBuffer) -> Result<BufferMemo, ImportError> {
        let id = buffer.id();
        loop {
            let slot: Slot = self.inner.memos.entry(id).or_default().clone();
            let mut guard = slot.lock();

            if let Some(holder) = guard.as_ref() {
                return Ok(holder.memo.clone());
            }

            // A failed resolver may have evicted this slot between our clone and lock.
            let current = self
                .inner
                .memos
                .get(&id)
                .is_some_and(|s| Arc::ptr_eq(s.value(), &slot));
            if !current {
                continue;
            }

            return match self.inner.importer.import_buffer(buffer) {
                Ok(imported) => {
                    let memo = BufferMemo {
                        framebuffer: imported.framebuffer,
                        texture: imported.texture,
                    };
                    let weak = Arc::downgrade(&self.inner);
                    let listener = buffer.add_destroy_listener(move |id| {
                        if let Some(inner) = weak.upgrade() {
                            inner.forget(id);
                        }
                    });
                    *guard = Some(BufferMemoHolder {
                        memo: memo.clone(),
                        buffer: buffer.downgrade(),
                        listener,
                    });
                    self.inner.imports.fetch_add(1, Ordering::Relaxed);
                    debug!(buffer = %id, fb_id = memo.framebuffer.0, "buffer imported");
                    Ok(memo)
                }
                Err(e) => {
                    drop(guard);
                    // Never block on a slot while holding the shard lock: if someone
                    // else holds it they either fill it or evict it themselves.
                    self.inner.memos.remove_if(&id, |_, s| {
                        Arc::ptr_eq(s, &slot) && s.try_lock().is_some_and(|h| h.is_none())
                    });
                    warn!(buffer = %id, "buffer import failed: {}", e);
                    Err(e)
                }
            };
        }
    }

    /// Number of buffers with a live memo.
    pub fn len(&self) -> usize {
        self.inner.memos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.memos.is_empty()
    }

    pub fn contains(&self, id: BufferId) -> bool {
        // Clone the slot out first; its lock must not be taken under a shard guard.
        let slot = self.inner.memos.get(&id).map(|s| s.value().clone());
        slot.is_some_and(|slot| slot.lock().is_some())
    }

    /// Total successful imports since creation.
    pub fn import_count(&self) -> u64 {
        self.inner.imports.load(Ordering::Relaxed)
    }
}
