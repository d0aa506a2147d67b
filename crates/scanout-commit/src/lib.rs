pub mod commit;
pub mod memo;
pub mod pipeline;
pub mod sequence;
pub mod waiter;

pub use commit::{Commit, CommitContext, CommitEvent, CommitMetadata, CommitState, CompletionSource};
pub use memo::{BufferMemo, BufferMemoiser};
pub use pipeline::{CommitHandle, CommitPipeline, MetricsSnapshot, PipelineMetrics};
pub use waiter::{FenceWaiter, WaitKey, Waitable, WaiterThread};
