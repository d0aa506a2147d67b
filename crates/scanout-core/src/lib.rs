pub mod backend;
pub mod buffer;
pub mod config;
pub mod error;
pub mod fence;
pub mod handle;

pub use backend::{
    Backend, BufferImporter, CommitSession, DisplayDevice, FeedbackSink, FenceExporter,
    ImportedBuffer, PresentTiming, SessionLookup, SwapchainFeedback,
};
pub use buffer::{ClientBuffer, DmabufAttributes, DmabufPlane, ListenerId, Texture, WeakClientBuffer};
pub use config::ScanoutConfig;
pub use error::{CommitError, ConfigError, ImportError};
pub use fence::SoftwareFence;
pub use handle::{BufferId, CommitId, FramebufferId, PresentationFeedback, WindowSequence};
