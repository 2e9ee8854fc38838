//! Per-tool execution rows, grouped by round.
//!
//! Keeps one live row per (round, tool name) and reconciles the start /
//! heartbeat / done / error / files phases against it, tolerating missing
//! and duplicated phases. Rounds that finish without any content are
//! discarded instead of closed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::notify::{ConsoleSink, RowId, RowOutcome};

#[derive(Default)]
struct RoundSlot {
    has_content: bool,
    /// Tool name -> row currently running in this round.
    live: HashMap<String, RowId>,
    /// Signatures of artifact lists already shown, for duplicate suppression.
    listed: HashSet<String>,
}

pub struct ExecutionTracker {
    sink: Arc<dyn ConsoleSink>,
    rounds: BTreeMap<u64, RoundSlot>,
    next_row_id: u64,
}

impl ExecutionTracker {
    pub fn new(sink: Arc<dyn ConsoleSink>) -> Self {
        Self {
            sink,
            rounds: BTreeMap::new(),
            next_row_id: 0,
        }
    }

    /// Open the round's container without marking it as having content.
    pub fn begin_round(&mut self, round: u64) {
        self.ensure_round(round);
    }

    pub fn tool_started(&mut self, round: u64, tool: &str, args: Option<&str>) {
        self.touch(round);
        let existing = self
            .rounds
            .get(&round)
            .and_then(|slot| slot.live.get(tool))
            .copied();
        let id = match existing {
            Some(id) => {
                // Redelivered start for a row that is still live: rebind it
                // rather than spawning a sibling.
                log::debug!("duplicate start for {tool} in round {round}, rebinding row {id}");
                id
            }
            None => {
                let id = self.next_row();
                if let Some(slot) = self.rounds.get_mut(&round) {
                    slot.live.insert(tool.to_string(), id);
                }
                id
            }
        };
        self.sink.row_started(id, round, tool, args);
    }

    pub fn tool_heartbeat(&mut self, round: u64, tool: &str, elapsed: Option<f64>) {
        self.touch(round);
        let existing = self
            .rounds
            .get(&round)
            .and_then(|slot| slot.live.get(tool))
            .copied();
        let id = match existing {
            Some(id) => id,
            None => {
                // The start was lost or the row already completed. A fresh
                // row keeps the heartbeat visible either way.
                let id = self.next_row();
                if let Some(slot) = self.rounds.get_mut(&round) {
                    slot.live.insert(tool.to_string(), id);
                }
                self.sink.row_started(id, round, tool, None);
                id
            }
        };
        if let Some(seconds) = elapsed {
            self.sink.row_elapsed(id, round, tool, seconds);
        }
    }

    pub fn tool_finished(&mut self, round: u64, tool: &str, outcome: RowOutcome) {
        self.touch(round);
        let removed = self
            .rounds
            .get_mut(&round)
            .and_then(|slot| slot.live.remove(tool));
        match removed {
            Some(id) => self.sink.row_finished(id, round, tool, outcome),
            None => {
                // Completion without a live row: synthesize one so the
                // outcome still shows, then complete it immediately.
                let id = self.next_row();
                self.sink.row_started(id, round, tool, None);
                self.sink.row_finished(id, round, tool, outcome);
            }
        }
    }

    /// Artifact list for a round. Identical sets (order-insensitive) are
    /// shown only once.
    pub fn artifacts(&mut self, round: u64, files: &[String]) {
        self.touch(round);
        let mut sorted: Vec<&str> = files.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let signature = sorted.join(",");
        let fresh = self
            .rounds
            .get_mut(&round)
            .map(|slot| slot.listed.insert(signature))
            .unwrap_or(false);
        if fresh {
            self.sink.artifacts_listed(round, files);
        } else {
            log::debug!("suppressing duplicate artifact list for round {round}");
        }
    }

    pub fn info(&mut self, round: u64, message: &str) {
        self.touch(round);
        self.sink.round_info(round, message);
    }

    pub fn thinking(&mut self, round: u64, content: &str) {
        self.touch(round);
        self.sink.thinking(round, content);
    }

    pub fn note_delta(&mut self, round: u64, delta: &str) {
        self.touch(round);
        self.sink.note_delta(round, delta);
    }

    pub fn progress(&mut self, round: u64, message: &str, status: Option<&str>) {
        self.touch(round);
        self.sink.progress(round, message, status);
    }

    /// Close a round. Unknown rounds are ignored; rounds that never produced
    /// content are discarded instead of closed.
    pub fn close_round(&mut self, round: u64, ok: bool) {
        match self.rounds.get(&round) {
            None => {
                log::debug!("iteration-done for unopened round {round}, ignoring");
            }
            Some(slot) if !slot.has_content => {
                self.rounds.remove(&round);
                self.sink.round_discarded(round);
            }
            Some(_) => self.sink.round_closed(round, ok),
        }
    }

    /// Drop all round state for a new turn. Row ids keep counting up so they
    /// stay unique across turns.
    pub fn reset(&mut self) {
        self.rounds.clear();
    }

    fn ensure_round(&mut self, round: u64) {
        if !self.rounds.contains_key(&round) {
            self.rounds.insert(round, RoundSlot::default());
            self.sink.round_opened(round);
        }
    }

    fn touch(&mut self, round: u64) {
        self.ensure_round(round);
        if let Some(slot) = self.rounds.get_mut(&round) {
            slot.has_content = true;
        }
    }

    fn next_row(&mut self) -> RowId {
        self.next_row_id += 1;
        RowId::new(self.next_row_id)
    }
}
