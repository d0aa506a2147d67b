//! Poll loop that watches completion signals and calls back into their owners.
//!
//! Registrations are oneshot: a signal delivers at most one `on_ready` or
//! `on_hang_up`, after which the owner is expected to remove it. Callbacks run
//! on the loop thread with no registry lock held, so an owner may remove its
//! own registration from inside a callback.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use polling::{Event, Events, Poller};
use tracing::{debug, error, trace};

use scanout_core::config::WaiterConfig;

/// An object that owns a completion signal registered with a [`FenceWaiter`].
pub trait Waitable: Send + Sync {
    /// The signal became readable.
    fn on_ready(&self);
    /// The signal's handle was closed or errored before signaling.
    fn on_hang_up(&self);
}

/// Identifies one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitKey(usize);

struct Registration {
    fd: OwnedFd,
    waitable: Weak<dyn Waitable>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<usize, Registration>,
    /// Key whose callback is currently running on the loop thread
    dispatching: Option<usize>,
}

struct Shared {
    poller: Poller,
    registry: Mutex<Registry>,
    idle: Condvar,
    next_key: AtomicUsize,
    stopping: AtomicBool,
    loop_thread: OnceLock<ThreadId>,
}

impl Shared {
    fn on_loop_thread(&self) -> bool {
        self.loop_thread.get() == Some(&thread::current().id())
    }

    fn run(&self) {
        debug!("fence waiter started");
        let mut events = Events::new();
        while !self.stopping.load(Ordering::Acquire) {
            events.clear();
            match self.poller.wait(&mut events, None) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("fence waiter poll failed: {}", e);
                    break;
                }
            }
            for event in events.iter() {
                self.dispatch(event);
            }
        }
        debug!("fence waiter stopped");
    }

    fn dispatch(&self, event: Event) {
        let hang_up_reported = event.is_interrupt() || event.is_err().unwrap_or(false);

        let (waitable, hung_up) = {
            let mut registry = self.registry.lock();
            let Some(registration) = registry.entries.get(&event.key) else {
                trace!(key = event.key, "event for removed registration");
                return;
            };
            let Some(waitable) = registration.waitable.upgrade() else {
                trace!(key = event.key, "event for owner being destroyed");
                return;
            };
            // A signal that completed and was then closed reports both at once.
            let hung_up = hang_up_reported
                && !(event.readable && signaled_before_hang_up(registration.fd.as_fd()));
            registry.dispatching = Some(event.key);
            (waitable, hung_up)
        };

        if hung_up {
            waitable.on_hang_up();
        } else {
            waitable.on_ready();
        }

        self.registry.lock().dispatching = None;
        self.idle.notify_all();
        // May be the last reference; the owner's destructor then runs here.
        drop(waitable);
    }
}

/// Whether a signal reporting hang-up still has its completion queued.
/// Pipe-backed signals keep their byte after the writer closes; fds that do
/// not support `FIONREAD` count as not signaled.
fn signaled_before_hang_up(fd: BorrowedFd<'_>) -> bool {
    let mut pending: libc::c_int = 0;
    // SAFETY: FIONREAD writes a single c_int through the pointer, and the fd is
    // kept open by the registry entry borrowed for this call.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::FIONREAD, &mut pending) };
    rc == 0 && pending > 0
}

/// Registration handle for the fence waiter loop. Cheap to clone.
#[derive(Clone)]
pub struct FenceWaiter {
    shared: Arc<Shared>,
}

impl FenceWaiter {
    /// Watch `fd` for readiness on behalf of `waitable`.
    ///
    /// The waiter owns the fd from here on and closes it on [`remove`](Self::remove).
    /// Holding only a weak reference keeps the registry from extending the
    /// owner's lifetime; once the owner starts dropping no callback reaches it.
    pub fn add(&self, fd: OwnedFd, waitable: Weak<dyn Waitable>) -> io::Result<WaitKey> {
        let key = self.shared.next_key.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.shared.registry.lock();
        // SAFETY: the fd lives in the registry until `remove` deletes it from the
        // poller, and only then is it closed.
        unsafe {
            self.shared
                .poller
                .add(fd.as_raw_fd(), Event::readable(key))?;
        }
        registry.entries.insert(key, Registration { fd, waitable });
        trace!(key, fd = registry.entries[&key].fd.as_raw_fd(), "waitable registered");
        Ok(WaitKey(key))
    }

    /// Stop watching a registration and close its fd.
    ///
    /// Returns false if the key was already removed. When called off the loop
    /// thread this waits for a callback in progress for the same key, so no
    /// callback for it runs after `remove` returns.
    pub fn remove(&self, key: WaitKey) -> bool {
        let mut registry = self.shared.registry.lock();
        let removed = registry.entries.remove(&key.0);
        if let Some(registration) = &removed {
            if let Err(e) = self.shared.poller.delete(registration.fd.as_fd()) {
                debug!(key = key.0, "poller delete failed: {}", e);
            }
        }

        if !self.shared.on_loop_thread() {
            while registry.dispatching == Some(key.0) {
                self.shared.idle.wait(&mut registry);
            }
        }
        drop(registry);

        if removed.is_some() {
            trace!(key = key.0, "waitable removed");
        }
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.shared.registry.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns the poll loop thread. Stops and joins it on drop.
pub struct WaiterThread {
    waiter: FenceWaiter,
    handle: Option<JoinHandle<()>>,
}

impl WaiterThread {
    pub fn spawn(config: &WaiterConfig) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            poller: Poller::new()?,
            registry: Mutex::new(Registry::default()),
            idle: Condvar::new(),
            next_key: AtomicUsize::new(1),
            stopping: AtomicBool::new(false),
            loop_thread: OnceLock::new(),
        });

        let loop_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || loop_shared.run())?;
        let _ = shared.loop_thread.set(handle.thread().id());

        Ok(Self {
            waiter: FenceWaiter { shared },
            handle: Some(handle),
        })
    }

    pub fn waiter(&self) -> FenceWaiter {
        self.waiter.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop the loop. Registrations stay valid and can still be removed.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let shared = &self.waiter.shared;
        shared.stopping.store(true, Ordering::Release);
        if let Err(e) = shared.poller.notify() {
            error!("failed to wake fence waiter: {}", e);
        }
        if shared.on_loop_thread() {
            // Stopped from one of its own callbacks; the loop exits after it returns.
            return;
        }
        if handle.join().is_err() {
            error!("fence waiter thread panicked");
        }
    }
}

impl Drop for WaiterThread {
    fn drop(&mut self) {
        self.stop();
    }
}
