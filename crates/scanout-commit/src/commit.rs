//! One submitted frame: the client buffer, its memo, and the completion
//! signal that tells us when the GPU is done with it.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use scanout_common::monotonic_nanos;
use scanout_core::backend::{Backend, PresentTiming, SwapchainFeedback};
use scanout_core::buffer::ClientBuffer;
use scanout_core::error::CommitError;
use scanout_core::handle::{BufferId, CommitId, FramebufferId, PresentationFeedback, WindowSequence};

use crate::memo::{BufferMemo, BufferMemoiser};
use crate::pipeline::PipelineMetrics;
use crate::sequence::next_commit_id;
use crate::waiter::{FenceWaiter, WaitKey, Waitable};

/// Per-frame state the client submitted alongside its buffer.
#[derive(Debug, Clone, Default)]
pub struct CommitMetadata {
    /// Queue behind earlier frames instead of replacing them
    pub fifo: bool,
    /// Replace-on-vsync without waiting for the previous frame
    pub async_present: bool,
    pub presentation_hint: u32,
    pub swapchain_feedback: Option<Arc<SwapchainFeedback>>,
    pub pending_feedbacks: Vec<PresentationFeedback>,
    pub present_id: Option<u32>,
    /// Client-side frame counter
    pub sequence: u64,
    pub desired_present_time: u64,
    pub last_refresh_cycle: u64,
    pub window: WindowSequence,
}

/// Where a commit's completion signal came from. Chosen once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSource {
    /// Exported from the buffer's dma-buf (implicit sync).
    Transfer,
    /// The imported texture's memory fence.
    Texture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommitState {
    Pending = 0,
    Completed = 1,
    Errored = 2,
}

impl CommitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CommitState::Completed,
            2 => CommitState::Errored,
            _ => CommitState::Pending,
        }
    }
}

/// Completion notifications, delivered on the pipeline's event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitEvent {
    Completed {
        commit: CommitId,
        window: WindowSequence,
        wait_done_time: u64,
        frame_time: Option<u64>,
    },
    HungUp {
        commit: CommitId,
        window: WindowSequence,
    },
}

impl CommitEvent {
    pub fn commit(&self) -> CommitId {
        match self {
            CommitEvent::Completed { commit, .. } | CommitEvent::HungUp { commit, .. } => *commit,
        }
    }
}

/// Everything a commit needs from its pipeline.
pub struct CommitContext {
    pub(crate) waiter: FenceWaiter,
    pub(crate) memos: BufferMemoiser,
    pub(crate) backend: Backend,
    pub(crate) events: Option<Sender<CommitEvent>>,
    pub(crate) lock_framebuffers: bool,
    pub(crate) metrics: PipelineMetrics,
}

impl CommitContext {
    pub fn new(waiter: FenceWaiter, memos: BufferMemoiser, backend: Backend) -> Self {
        Self {
            waiter,
            memos,
            backend,
            events: None,
            lock_framebuffers: true,
            metrics: PipelineMetrics::default(),
        }
    }

    pub fn with_events(mut self, events: Sender<CommitEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_framebuffer_locking(mut self, lock_framebuffers: bool) -> Self {
        self.lock_framebuffers = lock_framebuffers;
        self
    }

    pub fn memos(&self) -> &BufferMemoiser {
        &self.memos
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }
}

/// The open/closed state of a completion signal. Taking the key is the only
/// way to close it, so exactly one closer ever deregisters.
struct FenceSlot {
    key: Mutex<Option<WaitKey>>,
}

impl FenceSlot {
    fn take(&self) -> Option<WaitKey> {
        self.key.lock().take()
    }

    fn is_open(&self) -> bool {
        self.key.lock().is_some()
    }
}

pub struct Commit {
    id: CommitId,
    buffer_id: BufferId,
    buffer: Option<ClientBuffer>,
    memo: BufferMemo,
    framebuffer: FramebufferId,
    source: CompletionSource,
    fence: FenceSlot,
    state: AtomicU8,
    wait_done_time: AtomicU64,
    frame_time: AtomicU64,
    presented: OnceLock<PresentTiming>,
    metadata: CommitMetadata,
    ctx: Arc<CommitContext>,
}

impl Commit {
    /// Lock `buffer`, resolve its memo, pick a completion signal, take the next
    /// sequence id and start waiting on the signal.
    pub fn new(
        buffer: &ClientBuffer,
        metadata: CommitMetadata,
        ctx: &Arc<CommitContext>,
    ) -> Result<Arc<Self>, CommitError> {
        let buffer = buffer.clone();
        let memo = ctx.memos.resolve(&buffer)?;
        let (fence, source) = acquire_completion_signal(&ctx.backend, &buffer, &memo)?;

        let framebuffer = if ctx.lock_framebuffers && !memo.framebuffer().is_none() {
            ctx.backend.display.lock_framebuffer(memo.framebuffer());
            memo.framebuffer()
        } else {
            FramebufferId::NONE
        };

        let commit = Arc::new(Commit {
            id: next_commit_id(),
            buffer_id: buffer.id(),
            buffer: Some(buffer),
            memo,
            framebuffer,
            source,
            fence: FenceSlot {
                key: Mutex::new(None),
            },
            state: AtomicU8::new(CommitState::Pending as u8),
            wait_done_time: AtomicU64::new(0),
            frame_time: AtomicU64::new(0),
            presented: OnceLock::new(),
            metadata,
            ctx: ctx.clone(),
        });

        {
            // Held across registration so a callback that fires immediately
            // finds the key in place.
            let mut slot = commit.fence.key.lock();
            let weak: Weak<Commit> = Arc::downgrade(&commit);
            let weak: Weak<dyn Waitable> = weak;
            *slot = Some(ctx.waiter.add(fence, weak).map_err(CommitError::Register)?);
        }

        debug!(
            commit_id = commit.id.0,
            buffer = %commit.buffer_id,
            fb_id = commit.framebuffer.0,
            source = ?commit.source,
            "commit created"
        );
        Ok(commit)
    }

    pub fn id(&self) -> CommitId {
        self.id
    }

    pub fn buffer_id(&self) -> BufferId {
        self.buffer_id
    }

    pub fn memo(&self) -> &BufferMemo {
        &self.memo
    }

    /// Framebuffer reference held by this commit, `NONE` if it holds none.
    pub fn framebuffer(&self) -> FramebufferId {
        self.framebuffer
    }

    pub fn completion_source(&self) -> CompletionSource {
        self.source
    }

    pub fn metadata(&self) -> &CommitMetadata {
        &self.metadata
    }

    pub fn state(&self) -> CommitState {
        CommitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_fence_open(&self) -> bool {
        self.fence.is_open()
    }

    pub fn wait_done_time(&self) -> Option<u64> {
        match self.wait_done_time.load(Ordering::Acquire) {
            0 => None,
            t => Some(t),
        }
    }

    /// Time since the session's previous completed commit.
    pub fn frame_time(&self) -> Option<u64> {
        match self.frame_time.load(Ordering::Acquire) {
            0 => None,
            t => Some(t),
        }
    }

    /// Record that this commit reached the screen. Its pending feedback is then
    /// delivered instead of discarded when it is destroyed. Only the first call counts.
    pub fn mark_presented(&self, timing: PresentTiming) -> bool {
        self.presented.set(timing).is_ok()
    }

    pub fn presented(&self) -> Option<PresentTiming> {
        self.presented.get().copied()
    }

    /// Stop waiting on the completion signal and close it.
    /// Returns false if it was already closed.
    pub fn close_fence(&self) -> bool {
        let Some(key) = self.fence.take() else {
            return false;
        };
        self.ctx.waiter.remove(key);
        trace!(commit_id = self.id.0, "fence closed");
        true
    }

    fn notify(&self, event: CommitEvent) {
        let Some(events) = &self.ctx.events else {
            return;
        };
        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(commit_id = self.id.0, "commit event queue full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl Waitable for Commit {
    fn on_ready(&self) {
        let now = monotonic_nanos();
        if !self.close_fence() {
            return;
        }
        self.wait_done_time.store(now, Ordering::Release);
        self.state.store(CommitState::Completed as u8, Ordering::Release);
        self.ctx.metrics.completed.fetch_add(1, Ordering::Relaxed);

        let mut frame_time = None;
        if let Some(session) = self.ctx.backend.sessions.find_session(self.metadata.window) {
            let last = session.last_commit_done_time();
            if last != 0 && now > last {
                frame_time = Some(now - last);
                self.frame_time.store(now - last, Ordering::Release);
            }
            session.record_commit_done(self.id, now);
        }

        debug!(commit_id = self.id.0, wait_done_time = now, ?frame_time, "commit completed");
        self.notify(CommitEvent::Completed {
            commit: self.id,
            window: self.metadata.window,
            wait_done_time: now,
            frame_time,
        });
    }

    fn on_hang_up(&self) {
        if !self.close_fence() {
            return;
        }
        self.state.store(CommitState::Errored as u8, Ordering::Release);
        self.ctx.metrics.hung_up.fetch_add(1, Ordering::Relaxed);
        warn!(commit_id = self.id.0, buffer = %self.buffer_id, "completion signal hung up");
        self.notify(CommitEvent::HungUp {
            commit: self.id,
            window: self.metadata.window,
        });
    }
}

impl Drop for Commit {
    fn drop(&mut self) {
        self.close_fence();

        if !self.framebuffer.is_none() {
            self.ctx.backend.display.release_framebuffer(self.framebuffer);
            self.framebuffer = FramebufferId::NONE;
        }

        let feedbacks = std::mem::take(&mut self.metadata.pending_feedbacks);
        let swapchain = self.metadata.swapchain_feedback.take();
        if !feedbacks.is_empty() || swapchain.is_some() {
            let window = self.metadata.window;
            match self.presented.get() {
                Some(timing) => self.ctx.backend.feedback.deliver(window, feedbacks, swapchain, *timing),
                None => self.ctx.backend.feedback.discard(window, feedbacks, swapchain),
            }
        }

        // Last, so the memo's destroy listener (if this was the final lock) sees
        // the framebuffer reference above already released.
        drop(self.buffer.take());

        self.ctx.metrics.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(commit_id = self.id.0, state = ?self.state(), "commit destroyed");
    }
}

/// Prefer the buffer's own transfer fence; fall back to the texture's memory fence.
fn acquire_completion_signal(
    backend: &Backend,
    buffer: &ClientBuffer,
    memo: &BufferMemo,
) -> Result<(OwnedFd, CompletionSource), CommitError> {
    match backend.fences.export_transfer_completion(buffer) {
        Ok(Some(fd)) => return Ok((fd, CompletionSource::Transfer)),
        Ok(None) => {}
        Err(e) => {
            warn!(buffer = %buffer.id(), "transfer fence export failed, using texture fence: {}", e);
        }
    }

    backend
        .fences
        .export_texture_completion(&**memo.texture())
        .map(|fd| (fd, CompletionSource::Texture))
        .map_err(|e| CommitError::FenceAcquisition(e.to_string()))
}
