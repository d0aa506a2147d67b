//! Client buffer objects as seen by the commit path.
//!
//! A `ClientBuffer` is the display-protocol server's buffer: cloning it takes a
//! lock, dropping the last lock destroys it. Destruction is observable through
//! listeners so caches keyed on a buffer never need to own it.

use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::handle::BufferId;

/// One plane of a dma-buf backed buffer.
#[derive(Debug)]
pub struct DmabufPlane {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
}

/// Linux dma-buf description of a client buffer.
#[derive(Debug)]
pub struct DmabufAttributes {
    pub width: u32,
    pub height: u32,
    /// DRM fourcc
    pub format: u32,
    pub modifier: u64,
    pub planes: Vec<DmabufPlane>,
}

/// A display-resident texture produced by importing a client buffer.
pub trait Texture: Send + Sync + fmt::Debug {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// DRM fourcc
    fn format(&self) -> u32;
}

/// Token returned by [`ClientBuffer::add_destroy_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type DestroyListener = Box<dyn FnOnce(BufferId) + Send>;

struct BufferInner {
    id: BufferId,
    width: u32,
    height: u32,
    dmabuf: Option<DmabufAttributes>,
    listeners: Mutex<Vec<(ListenerId, DestroyListener)>>,
    next_listener: AtomicU64,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        let listeners = std::mem::take(self.listeners.get_mut());
        trace!(buffer = %self.id, listeners = listeners.len(), "buffer destroyed");
        for (_, listener) in listeners {
            listener(self.id);
        }
    }
}

/// A locked reference to a client buffer.
#[derive(Clone)]
pub struct ClientBuffer {
    inner: Arc<BufferInner>,
}

impl ClientBuffer {
    /// A buffer with no dma-buf backing (e.g. shared memory).
    pub fn new(width: u32, height: u32) -> Self {
        Self::build(width, height, None)
    }

    pub fn with_dmabuf(attributes: DmabufAttributes) -> Self {
        Self::build(attributes.width, attributes.height, Some(attributes))
    }

    fn build(width: u32, height: u32, dmabuf: Option<DmabufAttributes>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id: BufferId::new_unique(),
                width,
                height,
                dmabuf,
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn dmabuf(&self) -> Option<&DmabufAttributes> {
        self.inner.dmabuf.as_ref()
    }

    /// Number of outstanding locks, this one included.
    pub fn lock_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn downgrade(&self) -> WeakClientBuffer {
        WeakClientBuffer {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register a callback run once when the last lock is dropped.
    /// It runs on whichever thread drops that lock.
    pub fn add_destroy_listener<F>(&self, listener: F) -> ListenerId
    where
        F: FnOnce(BufferId) + Send + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((id, Box::new(listener)));
        id
    }

    pub fn remove_destroy_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }
}

impl PartialEq for ClientBuffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ClientBuffer {}

impl fmt::Debug for ClientBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuffer")
            .field("id", &self.inner.id)
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("dmabuf", &self.inner.dmabuf.is_some())
            .finish()
    }
}

/// A non-owning reference to a client buffer.
#[derive(Clone)]
pub struct WeakClientBuffer {
    id: BufferId,
    inner: Weak<BufferInner>,
}

impl WeakClientBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn upgrade(&self) -> Option<ClientBuffer> {
        self.inner.upgrade().map(|inner| ClientBuffer { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// Remove a destroy listener if the buffer is still alive.
    pub fn remove_destroy_listener(&self, id: ListenerId) -> bool {
        match self.upgrade() {
            Some(buffer) => buffer.remove_destroy_listener(id),
            None => false,
        }
    }
}

impl fmt::Debug for WeakClientBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakClientBuffer")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}
