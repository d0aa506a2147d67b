use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use scanout_core::backend::{Backend, PresentTiming};
use scanout_core::buffer::ClientBuffer;
use scanout_core::config::ScanoutConfig;
use scanout_core::error::CommitError;
use scanout_core::handle::CommitId;

use crate::commit::{Commit, CommitContext, CommitEvent, CommitMetadata};
use crate::memo::BufferMemoiser;
use crate::waiter::WaiterThread;

/// Pipeline-wide counters.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub hung_up: AtomicU64,
    pub destroyed: AtomicU64,
    pub import_failures: AtomicU64,
    pub fence_failures: AtomicU64,
}

impl PipelineMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            hung_up: self.hung_up.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            import_failures: self.import_failures.load(Ordering::Relaxed),
            fence_failures: self.fence_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub hung_up: u64,
    pub destroyed: u64,
    pub import_failures: u64,
    pub fence_failures: u64,
}

/// Handle to a live commit owned by a [`CommitPipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitHandle(CommitId);

impl CommitHandle {
    pub fn id(&self) -> CommitId {
        self.0
    }
}

impl From<CommitId> for CommitHandle {
    fn from(id: CommitId) -> Self {
        CommitHandle(id)
    }
}

/// Accepts client buffers for presentation and tracks them until they are destroyed.
pub struct CommitPipeline {
    ctx: Arc<CommitContext>,
    commits: DashMap<CommitId, Arc<Commit>>,
    events: Receiver<CommitEvent>,
    waiter_thread: Mutex<Option<WaiterThread>>,
    shut_down: AtomicBool,
}

impl CommitPipeline {
    /// Start the fence waiter and set up an empty memo cache.
    pub fn new(config: &ScanoutConfig, backend: Backend) -> io::Result<Self> {
        let waiter_thread = WaiterThread::spawn(&config.waiter)?;
        let (tx, rx) = match config.pipeline.event_queue {
            0 => crossbeam_channel::unbounded(),
            n => crossbeam_channel::bounded(n),
        };
        let memos = BufferMemoiser::new(backend.importer.clone(), backend.display.clone());
        let ctx = CommitContext::new(waiter_thread.waiter(), memos, backend)
            .with_events(tx)
            .with_framebuffer_locking(config.pipeline.lock_framebuffers);

        info!(
            thread = %config.waiter.thread_name,
            lock_framebuffers = config.pipeline.lock_framebuffers,
            "commit pipeline started"
        );

        Ok(Self {
            ctx: Arc::new(ctx),
            commits: DashMap::new(),
            events: rx,
            waiter_thread: Mutex::new(Some(waiter_thread)),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn submit_commit(
        &self,
        buffer: &ClientBuffer,
        metadata: CommitMetadata,
    ) -> Result<CommitHandle, CommitError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CommitError::ShutDown);
        }

        let commit = match Commit::new(buffer, metadata, &self.ctx) {
            Ok(commit) => commit,
            Err(e) => {
                let metrics = &self.ctx.metrics;
                match e {
                    CommitError::Import(_) => metrics.import_failures.fetch_add(1, Ordering::Relaxed),
                    CommitError::FenceAcquisition(_) => metrics.fence_failures.fetch_add(1, Ordering::Relaxed),
                    _ => 0,
                };
                return Err(e);
            }
        };

        let handle = CommitHandle(commit.id());
        self.commits.insert(commit.id(), commit);
        self.ctx.metrics.submitted.fetch_add(1, Ordering::Relaxed);

        // Raced with shutdown, which may already have drained the table.
        if self.shut_down.load(Ordering::Acquire) {
            self.destroy_commit(handle);
            return Err(CommitError::ShutDown);
        }
        Ok(handle)
    }

    /// Drop the pipeline's reference to a commit. If a completion callback is
    /// running for it right now, destruction finishes on the waiter thread.
    pub fn destroy_commit(&self, handle: CommitHandle) -> bool {
        let removed = self.commits.remove(&handle.0);
        removed.is_some()
    }

    pub fn commit(&self, handle: CommitHandle) -> Option<Arc<Commit>> {
        self.commits.get(&handle.0).map(|c| c.value().clone())
    }

    pub fn mark_presented(&self, handle: CommitHandle, timing: PresentTiming) -> bool {
        self.commit(handle).is_some_and(|c| c.mark_presented(timing))
    }

    /// Completion notifications for every commit of this pipeline.
    pub fn events(&self) -> &Receiver<CommitEvent> {
        &self.events
    }

    pub fn live_commits(&self) -> usize {
        self.commits.len()
    }

    pub fn memos(&self) -> &BufferMemoiser {
        &self.ctx.memos
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.ctx.metrics
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Destroy every live commit and stop the fence waiter.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let ids: Vec<CommitId> = self.commits.iter().map(|c| *c.key()).collect();
        let cancelled = ids.len();
        for id in ids {
            // Dropped outside the map's shard lock.
            let removed = self.commits.remove(&id);
            drop(removed);
        }

        let waiter_thread = self.waiter_thread.lock().take();
        if let Some(mut thread) = waiter_thread {
            thread.stop();
        }
        debug!(cancelled, "commit pipeline shut down");
    }
}

impl Drop for CommitPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
