//! Outbound notifications from the console core to its display collaborator.
//!
//! `ConsoleSink` is the one seam between reconciliation logic and whatever
//! renders it (terminal, desktop view, test recorder). Every method has an
//! empty default so collaborators implement only what they show.

use std::fmt;

use crate::coordination::ClaimRecord;
use crate::stream::{ContextStats, PlanStep};

/// Opaque handle for one tool row within a round. Unique for the life of a
/// session; collaborators use it to update a row in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowId(u64);

impl RowId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Succeeded,
    Failed,
}

/// Why the turn's stream closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server sent the terminal sentinel.
    Finished,
    /// The user stopped the turn locally.
    Stopped,
    /// The channel failed before completion.
    Transport(String),
}

pub trait ConsoleSink: Send + Sync {
    /// A new round container appeared.
    fn round_opened(&self, round: u64) {
        let _ = round;
    }
    /// The round finished; `ok` is false when its status reported failure.
    fn round_closed(&self, round: u64, ok: bool) {
        let _ = (round, ok);
    }
    /// The round finished without ever producing content and was dropped.
    fn round_discarded(&self, round: u64) {
        let _ = round;
    }
    fn thinking(&self, round: u64, content: &str) {
        let _ = (round, content);
    }
    fn note_delta(&self, round: u64, delta: &str) {
        let _ = (round, delta);
    }
    fn row_started(&self, row: RowId, round: u64, tool: &str, args: Option<&str>) {
        let _ = (row, round, tool, args);
    }
    fn row_elapsed(&self, row: RowId, round: u64, tool: &str, seconds: f64) {
        let _ = (row, round, tool, seconds);
    }
    fn row_finished(&self, row: RowId, round: u64, tool: &str, outcome: RowOutcome) {
        let _ = (row, round, tool, outcome);
    }
    /// Standalone informational line inside a round.
    fn round_info(&self, round: u64, message: &str) {
        let _ = (round, message);
    }
    fn artifacts_listed(&self, round: u64, files: &[String]) {
        let _ = (round, files);
    }
    fn progress(&self, round: u64, message: &str, status: Option<&str>) {
        let _ = (round, message, status);
    }
    fn plan_updated(&self, steps: &[PlanStep], summary: Option<&str>) {
        let _ = (steps, summary);
    }
    fn context_stats(&self, stats: &ContextStats) {
        let _ = stats;
    }
    fn compression_started(&self, message: &str) {
        let _ = message;
    }
    fn compression_finished(&self, message: &str) {
        let _ = message;
    }
    fn final_result(&self, result: &str) {
        let _ = result;
    }
    /// The turn is over. Delivered exactly once per turn, whatever the reason.
    fn stream_closed(&self, reason: &CloseReason) {
        let _ = reason;
    }
    /// Another context holds the send claim; input should be disabled.
    fn send_blocked(&self, claim: &ClaimRecord) {
        let _ = claim;
    }
    /// The blocking claim went away; input can be re-enabled.
    fn send_unblocked(&self) {}
}
