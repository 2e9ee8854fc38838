//! Server-push stream handling: wire frames and the update classifier.
//!
//! The backend streams NDJSON frames during a turn. `frame` defines the wire
//! types, `classifier` turns raw lines into typed handler calls.

mod classifier;
mod frame;

pub use classifier::{Dispatch, FrameHandler, UpdateClassifier};
pub use frame::{
    status_is_failure, CompressionDoneFrame, CompressionStartFrame, ContextStats,
    ContextStatsFrame, ExecPhase, ExecutionEvent, FilesGeneratedFrame, FinalResultFrame, Frame,
    IterationDoneFrame, IterationStartFrame, NoteFrame, PlanStep, PlanUpdateFrame, ProgressFrame,
    ThinkingFrame, TERMINAL_SENTINEL,
};
