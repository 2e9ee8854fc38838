//! Wire frames pushed by the backend during a turn.
//!
//! Each NDJSON line is one frame; `kind` selects the variant. Unknown kinds
//! deserialize to `Frame::Unknown` so new server frames never break old clients.

use serde::{Deserialize, Serialize};

/// Raw line that marks the end of a turn's stream. Not JSON; checked before parsing.
pub const TERMINAL_SENTINEL: &str = "[DONE]";

/// One server-push frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Frame {
    IterationStart(IterationStartFrame),
    IterationDone(IterationDoneFrame),
    Thinking(ThinkingFrame),
    Note(NoteFrame),
    ExecutionEvent(ExecutionEvent),
    Progress(ProgressFrame),
    FinalResult(FinalResultFrame),
    ContextStats(ContextStatsFrame),
    CompressionStart(CompressionStartFrame),
    CompressionDone(CompressionDoneFrame),
    FilesGenerated(FilesGeneratedFrame),
    PlanUpdate(PlanUpdateFrame),
    #[serde(other)]
    Unknown,
}

/// Opens agent iteration `iter` (the server's global counter, not per-turn).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationStartFrame {
    #[serde(default)]
    pub iter: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationDoneFrame {
    #[serde(default)]
    pub iter: Option<u64>,
    /// Terminal status for the iteration, e.g. "ok" or "failed".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingFrame {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub iter: Option<u64>,
}

/// Incremental assistant text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteFrame {
    #[serde(default)]
    pub delta: String,
    #[serde(default)]
    pub iter: Option<u64>,
}

/// Tool lifecycle event. `phase` says which stage; the other fields are
/// phase-dependent and all optional on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(default)]
    pub iter: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub phase: ExecPhase,
    /// Argument preview shown next to the tool name on `start`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    /// Free text for `info` and `error` phases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Artifact paths for the `files` phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    /// Seconds since the tool started, carried by `heartbeat`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecPhase {
    Start,
    Heartbeat,
    Done,
    Error,
    Files,
    Info,
}

/// Legacy frame kept for older servers; fans out to both an execution note
/// and a progress-bar update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressFrame {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub iter: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResultFrame {
    #[serde(default)]
    pub result: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextStatsFrame {
    #[serde(default)]
    pub stats: ContextStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionStartFrame {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ContextStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionDoneFrame {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_stats: Option<ContextStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_stats: Option<ContextStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesGeneratedFrame {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub iter: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanUpdateFrame {
    #[serde(default)]
    pub plan: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(default)]
    pub step: String,
    /// Loose status string ("pending", "in_progress", "completed", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Token usage snapshot. Servers differ on which fields they send, so
/// everything is optional and extras are kept as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// True when an iteration status string reports failure.
pub fn status_is_failure(status: Option<&str>) -> bool {
    match status.map(str::trim) {
        Some(s) => s.eq_ignore_ascii_case("failed") || s.eq_ignore_ascii_case("error"),
        None => false,
    }
}
