//! Simulated display backend for `scanout simulate`.
//!
//! Imports are free, framebuffer references are only counted, and the "GPU"
//! completes each texture fence after a random delay. Completions therefore
//! arrive out of submission order, and a configurable share of fences is
//! abandoned to exercise the hang-up path.

use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use scanout_commit::{CommitEvent, CommitHandle, CommitMetadata, CommitPipeline, MetricsSnapshot};
use scanout_core::backend::{
    Backend, BufferImporter, CommitSession, DisplayDevice, FeedbackSink, FenceExporter,
    ImportedBuffer, PresentTiming, SessionLookup, SwapchainFeedback,
};
use scanout_core::buffer::{ClientBuffer, Texture};
use scanout_core::config::{ScanoutConfig, SimulationConfig};
use scanout_core::error::ImportError;
use scanout_core::fence::SoftwareFence;
use scanout_core::handle::{CommitId, FramebufferId, PresentationFeedback, WindowSequence};

const WINDOW: WindowSequence = WindowSequence(1);
const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
/// XRGB8888
const FORMAT: u32 = 0x3432_5258;
/// Extra time allowed for in-flight GPU work once all frames are submitted.
const DRAIN_SLACK: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct SimTexture {
    width: u32,
    height: u32,
}

impl Texture for SimTexture {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> u32 {
        FORMAT
    }
}

#[derive(Default)]
struct SimImporter {
    next_fb: AtomicU32,
    imports: AtomicU64,
}

impl BufferImporter for SimImporter {
    fn import_buffer(&self, buffer: &ClientBuffer) -> Result<ImportedBuffer, ImportError> {
        let fb = FramebufferId(self.next_fb.fetch_add(1, Ordering::Relaxed) + 1);
        self.imports.fetch_add(1, Ordering::Relaxed);
        debug!(buffer = %buffer.id(), %fb, "simulated import");
        Ok(ImportedBuffer {
            framebuffer: fb,
            texture: Arc::new(SimTexture {
                width: buffer.width(),
                height: buffer.height(),
            }),
        })
    }
}

/// Hands every texture fence's signaling side to the simulated GPU.
struct SimGpu {
    jobs: mpsc::UnboundedSender<SoftwareFence>,
}

impl FenceExporter for SimGpu {
    fn export_texture_completion(&self, texture: &dyn Texture) -> io::Result<OwnedFd> {
        let (fence, pollable) = SoftwareFence::new()?;
        trace!(width = texture.width(), height = texture.height(), "queued GPU job");
        if self.jobs.send(fence).is_err() {
            // GPU gone; the dropped fence reads as a hang-up.
            warn!("simulated GPU stopped, fence abandoned");
        }
        Ok(pollable)
    }
}

#[derive(Default)]
struct SimSession {
    last_done: AtomicU64,
    completed: AtomicU64,
}

impl CommitSession for SimSession {
    fn last_commit_done_time(&self) -> u64 {
        self.last_done.load(Ordering::Acquire)
    }

    fn record_commit_done(&self, commit: CommitId, done_time: u64) {
        self.last_done.store(done_time, Ordering::Release);
        self.completed.fetch_add(1, Ordering::Relaxed);
        trace!(%commit, done_time, "session saw commit done");
    }
}

struct SimSessions {
    session: Arc<SimSession>,
}

impl SessionLookup for SimSessions {
    fn find_session(&self, window: WindowSequence) -> Option<Arc<dyn CommitSession>> {
        if window == WINDOW {
            Some(self.session.clone())
        } else {
            None
        }
    }
}

#[derive(Default)]
struct SimFeedback {
    delivered: AtomicU64,
    discarded: AtomicU64,
}

impl FeedbackSink for SimFeedback {
    fn deliver(
        &self,
        _window: WindowSequence,
        feedbacks: Vec<PresentationFeedback>,
        _swapchain: Option<Arc<SwapchainFeedback>>,
        timing: PresentTiming,
    ) {
        self.delivered
            .fetch_add(feedbacks.len() as u64, Ordering::Relaxed);
        trace!(count = feedbacks.len(), present_time = timing.present_time, "feedback delivered");
    }

    fn discard(
        &self,
        _window: WindowSequence,
        feedbacks: Vec<PresentationFeedback>,
        _swapchain: Option<Arc<SwapchainFeedback>>,
    ) {
        self.discarded
            .fetch_add(feedbacks.len() as u64, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct SimDisplay {
    locks: AtomicU64,
    releases: AtomicU64,
}

impl DisplayDevice for SimDisplay {
    fn lock_framebuffer(&self, framebuffer: FramebufferId) {
        self.locks.fetch_add(1, Ordering::Relaxed);
        trace!(%framebuffer, "framebuffer locked");
    }

    fn release_framebuffer(&self, framebuffer: FramebufferId) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        trace!(%framebuffer, "framebuffer released");
    }
}

/// Counters gathered over one simulation run.
#[derive(Debug)]
pub struct Report {
    pub elapsed: Duration,
    pub metrics: MetricsSnapshot,
    pub presented: u64,
    pub imports: u64,
    pub framebuffer_locks: u64,
    pub framebuffer_releases: u64,
    pub feedback_delivered: u64,
    pub feedback_discarded: u64,
    pub session_completions: u64,
    pub memos_left: usize,
}

impl Report {
    /// References still held on simulated framebuffers. Zero after a clean run.
    pub fn outstanding_framebuffers(&self) -> i64 {
        (self.imports + self.framebuffer_locks) as i64 - self.framebuffer_releases as i64
    }

    pub fn print(&self) {
        let m = &self.metrics;
        println!("Simulation finished in {:.2?}", self.elapsed);
        println!();
        println!("  Commits submitted:     {}", m.submitted);
        println!("  Commits completed:     {}", m.completed);
        println!("  Commits hung up:       {}", m.hung_up);
        println!("  Commits destroyed:     {}", m.destroyed);
        println!("  Frames presented:      {}", self.presented);
        println!("  Import failures:       {}", m.import_failures);
        println!("  Fence failures:        {}", m.fence_failures);
        println!();
        println!("  Buffer imports:        {}", self.imports);
        println!("  Framebuffer locks:     {}", self.framebuffer_locks);
        println!("  Framebuffer releases:  {}", self.framebuffer_releases);
        println!("  Outstanding refs:      {}", self.outstanding_framebuffers());
        println!("  Memos left:            {}", self.memos_left);
        println!();
        println!("  Feedback delivered:    {}", self.feedback_delivered);
        println!("  Feedback discarded:    {}", self.feedback_discarded);
        println!("  Session completions:   {}", self.session_completions);
    }
}

/// Drive a pipeline with `config.simulation` frames and report what happened.
pub async fn run(config: ScanoutConfig) -> anyhow::Result<Report> {
    config.validate()?;
    let started = Instant::now();
    let sim = config.simulation.clone();

    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let (gpu_stop_tx, gpu_stop_rx) = oneshot::channel();
    let gpu = tokio::spawn(run_gpu(jobs_rx, sim.clone(), gpu_stop_rx));

    let importer = Arc::new(SimImporter::default());
    let session = Arc::new(SimSession::default());
    let feedback = Arc::new(SimFeedback::default());
    let display = Arc::new(SimDisplay::default());
    let backend = Backend {
        importer: importer.clone(),
        fences: Arc::new(SimGpu { jobs: jobs_tx }),
        sessions: Arc::new(SimSessions {
            session: session.clone(),
        }),
        feedback: feedback.clone(),
        display: display.clone(),
    };

    let pipeline = Arc::new(CommitPipeline::new(&config, backend)?);
    let buffers: Vec<ClientBuffer> = (0..sim.buffers)
        .map(|_| ClientBuffer::new(WIDTH, HEIGHT))
        .collect();

    let consumer_stop = Arc::new(AtomicBool::new(false));
    let consumer = {
        let pipeline = pipeline.clone();
        let stop = consumer_stop.clone();
        let refresh_ns = sim.frame_interval_ms.max(1) * 1_000_000;
        tokio::task::spawn_blocking(move || consume_events(&pipeline, &stop, refresh_ns))
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let interval = Duration::from_millis(sim.frame_interval_ms);

    for frame in 0..sim.frames {
        let buffer = &buffers[frame as usize % buffers.len()];
        let metadata = CommitMetadata {
            fifo: true,
            pending_feedbacks: vec![PresentationFeedback(frame)],
            present_id: Some(frame),
            sequence: u64::from(frame),
            window: WINDOW,
            ..Default::default()
        };
        if let Err(e) = pipeline.submit_commit(buffer, metadata) {
            warn!(frame, "commit rejected: {}", e);
        }

        tokio::select! {
            _ = &mut ctrl_c => {
                warn!(frame, "interrupted, stopping early");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }

    // Give outstanding GPU work time to finish.
    let deadline = Instant::now() + Duration::from_millis(sim.max_latency_ms) + DRAIN_SLACK;
    loop {
        let m = pipeline.metrics().snapshot();
        if m.completed + m.hung_up >= m.submitted || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    consumer_stop.store(true, Ordering::Release);
    let presented = consumer.await?;

    pipeline.shutdown();
    let _ = gpu_stop_tx.send(());
    gpu.await?;

    // Last locks gone: the memo cache evicts and releases every import.
    drop(buffers);

    let report = Report {
        elapsed: started.elapsed(),
        metrics: pipeline.metrics().snapshot(),
        presented,
        imports: importer.imports.load(Ordering::Relaxed),
        framebuffer_locks: display.locks.load(Ordering::Relaxed),
        framebuffer_releases: display.releases.load(Ordering::Relaxed),
        feedback_delivered: feedback.delivered.load(Ordering::Relaxed),
        feedback_discarded: feedback.discarded.load(Ordering::Relaxed),
        session_completions: session.completed.load(Ordering::Relaxed),
        memos_left: pipeline.memos().len(),
    };
    info!(
        submitted = report.metrics.submitted,
        completed = report.metrics.completed,
        hung_up = report.metrics.hung_up,
        "simulation done"
    );
    Ok(report)
}

/// Plays the compositor: the newest completed commit goes on screen and the one
/// it replaces is destroyed. Hung-up commits are destroyed straight away.
fn consume_events(pipeline: &CommitPipeline, stop: &AtomicBool, refresh_ns: u64) -> u64 {
    let mut on_screen: Option<CommitHandle> = None;
    let mut presented = 0u64;

    while !stop.load(Ordering::Acquire) {
        let event = match pipeline.events().recv_timeout(Duration::from_millis(20)) {
            Ok(event) => event,
            Err(e) if e.is_timeout() => continue,
            Err(_) => break,
        };

        match event {
            CommitEvent::Completed {
                commit,
                wait_done_time,
                frame_time,
                ..
            } => {
                let handle = CommitHandle::from(commit);
                let timing = PresentTiming {
                    present_time: wait_done_time,
                    refresh_cycle: refresh_ns,
                };
                if pipeline.mark_presented(handle, timing) {
                    presented += 1;
                }
                trace!(%commit, ?frame_time, "presented");
                if let Some(previous) = on_screen.replace(handle) {
                    pipeline.destroy_commit(previous);
                }
            }
            CommitEvent::HungUp { commit, .. } => {
                pipeline.destroy_commit(CommitHandle::from(commit));
            }
        }
    }

    if let Some(last) = on_screen {
        pipeline.destroy_commit(last);
    }
    presented
}

/// Completes queued fences after a random latency until told to stop, then
/// waits for the work already in flight.
async fn run_gpu(
    mut jobs: mpsc::UnboundedReceiver<SoftwareFence>,
    sim: SimulationConfig,
    mut stop: oneshot::Receiver<()>,
) {
    let mut work = JoinSet::new();
    let (min, max) = (sim.min_latency_ms, sim.max_latency_ms);

    loop {
        tokio::select! {
            job = jobs.recv() => {
                let Some(fence) = job else { break };
                let (latency, hang_up) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(min..=max), rng.gen_bool(sim.hang_up_ratio))
                };
                work.spawn(complete(fence, Duration::from_millis(latency), hang_up));
            }
            Some(_) = work.join_next(), if !work.is_empty() => {}
            _ = &mut stop => break,
        }
    }

    while work.join_next().await.is_some() {}
    debug!("simulated GPU stopped");
}

async fn complete(fence: SoftwareFence, latency: Duration, hang_up: bool) {
    tokio::time::sleep(latency).await;
    if hang_up {
        debug!(?latency, "abandoning fence");
        fence.abandon();
        return;
    }
    if let Err(e) = fence.signal() {
        warn!("failed to signal fence: {}", e);
    }
}
