//! Interfaces to the collaborators the commit path depends on: buffer import,
//! fence export, window lookup, presentation feedback and the display device.

use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::buffer::{ClientBuffer, Texture};
use crate::error::ImportError;
use crate::handle::{CommitId, FramebufferId, PresentationFeedback, WindowSequence};

/// Result of making a client buffer display-resident.
#[derive(Debug, Clone)]
pub struct ImportedBuffer {
    /// `FramebufferId::NONE` when the buffer cannot be scanned out directly.
    pub framebuffer: FramebufferId,
    pub texture: Arc<dyn Texture>,
}

pub trait BufferImporter: Send + Sync {
    fn import_buffer(&self, buffer: &ClientBuffer) -> Result<ImportedBuffer, ImportError>;
}

pub trait FenceExporter: Send + Sync {
    /// Completion signal of the buffer's backing transfer, if it has one.
    /// By default this duplicates the first dma-buf plane, which polls
    /// readable once every implicit fence on the buffer has signaled.
    fn export_transfer_completion(&self, buffer: &ClientBuffer) -> io::Result<Option<OwnedFd>> {
        match buffer.dmabuf().and_then(|d| d.planes.first()) {
            Some(plane) => plane.fd.try_clone().map(Some),
            None => Ok(None),
        }
    }

    /// Completion signal for GPU work on an imported texture's memory.
    fn export_texture_completion(&self, texture: &dyn Texture) -> io::Result<OwnedFd>;
}

/// A window/session that wants to know when its commits complete.
pub trait CommitSession: Send + Sync {
    /// Monotonic time of the previous completed commit, 0 if none.
    fn last_commit_done_time(&self) -> u64;
    fn record_commit_done(&self, commit: CommitId, done_time: u64);
}

pub trait SessionLookup: Send + Sync {
    fn find_session(&self, window: WindowSequence) -> Option<Arc<dyn CommitSession>>;
}

/// Swapchain parameters reported by a Vulkan client's WSI layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapchainFeedback {
    pub image_count: u32,
    pub vk_format: u32,
    pub vk_colorspace: u32,
    pub vk_composite_alpha: u32,
    pub vk_pre_transform: u32,
    pub vk_present_mode: u32,
    pub vk_clipped: bool,
}

/// When a commit reached the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentTiming {
    pub present_time: u64,
    pub refresh_cycle: u64,
}

pub trait FeedbackSink: Send + Sync {
    fn deliver(
        &self,
        window: WindowSequence,
        feedbacks: Vec<PresentationFeedback>,
        swapchain: Option<Arc<SwapchainFeedback>>,
        timing: PresentTiming,
    );

    fn discard(
        &self,
        window: WindowSequence,
        feedbacks: Vec<PresentationFeedback>,
        swapchain: Option<Arc<SwapchainFeedback>>,
    );
}

/// Reference counting of framebuffer handles on the display device.
pub trait DisplayDevice: Send + Sync {
    fn lock_framebuffer(&self, framebuffer: FramebufferId);
    fn release_framebuffer(&self, framebuffer: FramebufferId);
}

/// The set of collaborators a commit pipeline runs against.
#[derive(Clone)]
pub struct Backend {
    pub importer: Arc<dyn BufferImporter>,
    pub fences: Arc<dyn FenceExporter>,
    pub sessions: Arc<dyn SessionLookup>,
    pub feedback: Arc<dyn FeedbackSink>,
    pub display: Arc<dyn DisplayDevice>,
}
