//! Recording test doubles for the display backend.

#![allow(dead_code)]

use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use scanout_commit::CommitEvent;
use scanout_core::backend::{
    Backend, BufferImporter, CommitSession, DisplayDevice, FeedbackSink, FenceExporter,
    ImportedBuffer, PresentTiming, SessionLookup, SwapchainFeedback,
};
use scanout_core::buffer::{ClientBuffer, Texture};
use scanout_core::error::ImportError;
use scanout_core::fence::SoftwareFence;
use scanout_core::handle::{CommitId, FramebufferId, PresentationFeedback, WindowSequence};

/// Window the mock session answers for.
pub const WINDOW: WindowSequence = WindowSequence(7);

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct MockTexture {
    pub width: u32,
    pub height: u32,
}

impl Texture for MockTexture {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> u32 {
        0x3432_5258
    }
}

#[derive(Default)]
pub struct MockImporter {
    pub imports: AtomicU64,
    pub fail: AtomicBool,
    /// Import without a scanout framebuffer
    pub texture_only: AtomicBool,
    /// Milliseconds each import takes
    pub delay_ms: AtomicU64,
    next_fb: AtomicU32,
}

impl BufferImporter for MockImporter {
    fn import_buffer(&self, buffer: &ClientBuffer) -> Result<ImportedBuffer, ImportError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ImportError::Failed("mock import failure".to_string()));
        }
        self.imports.fetch_add(1, Ordering::SeqCst);
        let framebuffer = if self.texture_only.load(Ordering::SeqCst) {
            FramebufferId::NONE
        } else {
            FramebufferId(self.next_fb.fetch_add(1, Ordering::SeqCst) + 100)
        };
        Ok(ImportedBuffer {
            framebuffer,
            texture: Arc::new(MockTexture {
                width: buffer.width(),
                height: buffer.height(),
            }),
        })
    }
}

/// Texture fences are software fences whose signaling sides are kept here.
#[derive(Default)]
pub struct MockFences {
    pub signalers: Mutex<Vec<SoftwareFence>>,
    pub texture_exports: AtomicU64,
    pub fail_texture: AtomicBool,
    pub fail_transfer: AtomicBool,
}

impl MockFences {
    /// Signaling side of the most recent texture fence.
    pub fn take_last(&self) -> SoftwareFence {
        self.signalers
            .lock()
            .pop()
            .expect("no texture fence exported")
    }
}

impl FenceExporter for MockFences {
    fn export_transfer_completion(&self, buffer: &ClientBuffer) -> io::Result<Option<OwnedFd>> {
        if self.fail_transfer.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "mock transfer failure"));
        }
        match buffer.dmabuf().and_then(|d| d.planes.first()) {
            Some(plane) => plane.fd.try_clone().map(Some),
            None => Ok(None),
        }
    }

    fn export_texture_completion(&self, _texture: &dyn Texture) -> io::Result<OwnedFd> {
        if self.fail_texture.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "mock texture fence failure"));
        }
        let (fence, pollable) = SoftwareFence::new()?;
        self.signalers.lock().push(fence);
        self.texture_exports.fetch_add(1, Ordering::SeqCst);
        Ok(pollable)
    }
}

#[derive(Default)]
pub struct MockDisplay {
    pub locks: Mutex<Vec<FramebufferId>>,
    pub releases: Mutex<Vec<FramebufferId>>,
}

impl MockDisplay {
    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn release_count(&self) -> usize {
        self.releases.lock().len()
    }

    pub fn releases_of(&self, fb: FramebufferId) -> usize {
        self.releases.lock().iter().filter(|r| **r == fb).count()
    }

    pub fn locks_of(&self, fb: FramebufferId) -> usize {
        self.locks.lock().iter().filter(|l| **l == fb).count()
    }
}

impl DisplayDevice for MockDisplay {
    fn lock_framebuffer(&self, framebuffer: FramebufferId) {
        self.locks.lock().push(framebuffer);
    }

    fn release_framebuffer(&self, framebuffer: FramebufferId) {
        self.releases.lock().push(framebuffer);
    }
}

#[derive(Default)]
pub struct MockFeedback {
    pub delivered: Mutex<Vec<(WindowSequence, Vec<PresentationFeedback>, bool, PresentTiming)>>,
    pub discarded: Mutex<Vec<(WindowSequence, Vec<PresentationFeedback>, bool)>>,
}

impl FeedbackSink for MockFeedback {
    fn deliver(
        &self,
        window: WindowSequence,
        feedbacks: Vec<PresentationFeedback>,
        swapchain: Option<Arc<SwapchainFeedback>>,
        timing: PresentTiming,
    ) {
        self.delivered
            .lock()
            .push((window, feedbacks, swapchain.is_some(), timing));
    }

    fn discard(
        &self,
        window: WindowSequence,
        feedbacks: Vec<PresentationFeedback>,
        swapchain: Option<Arc<SwapchainFeedback>>,
    ) {
        self.discarded
            .lock()
            .push((window, feedbacks, swapchain.is_some()));
    }
}

#[derive(Default)]
pub struct MockSession {
    pub last_done: AtomicU64,
    pub done: Mutex<Vec<(CommitId, u64)>>,
}

impl CommitSession for MockSession {
    fn last_commit_done_time(&self) -> u64 {
        self.last_done.load(Ordering::SeqCst)
    }

    fn record_commit_done(&self, commit: CommitId, done_time: u64) {
        self.last_done.store(done_time, Ordering::SeqCst);
        self.done.lock().push((commit, done_time));
    }
}

pub struct MockSessions {
    pub session: Arc<MockSession>,
}

impl SessionLookup for MockSessions {
    fn find_session(&self, window: WindowSequence) -> Option<Arc<dyn CommitSession>> {
        (window == WINDOW).then(|| self.session.clone() as Arc<dyn CommitSession>)
    }
}

/// All mocks plus a [`Backend`] wired to them.
pub struct Harness {
    pub importer: Arc<MockImporter>,
    pub fences: Arc<MockFences>,
    pub display: Arc<MockDisplay>,
    pub feedback: Arc<MockFeedback>,
    pub session: Arc<MockSession>,
    pub backend: Backend,
}

impl Harness {
    pub fn new() -> Self {
        let importer = Arc::new(MockImporter::default());
        let fences = Arc::new(MockFences::default());
        let display = Arc::new(MockDisplay::default());
        let feedback = Arc::new(MockFeedback::default());
        let session = Arc::new(MockSession::default());
        let backend = Backend {
            importer: importer.clone(),
            fences: fences.clone(),
            sessions: Arc::new(MockSessions {
                session: session.clone(),
            }),
            feedback: feedback.clone(),
            display: display.clone(),
        };
        Self {
            importer,
            fences,
            display,
            feedback,
            session,
            backend,
        }
    }
}

pub fn buffer() -> ClientBuffer {
    ClientBuffer::new(640, 480)
}

pub fn recv_event(events: &Receiver<CommitEvent>) -> CommitEvent {
    events
        .recv_timeout(EVENT_TIMEOUT)
        .expect("timed out waiting for a commit event")
}

/// Poll `cond` until it holds. Destruction may finish on the waiter thread
/// right after an event is sent, so post-destroy checks go through here.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
