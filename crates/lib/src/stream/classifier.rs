//! Classifies raw stream lines into typed handler calls.
//!
//! One entry point, `feed_line`: empty lines are skipped, the terminal
//! sentinel completes the turn, malformed JSON is logged and dropped, and
//! everything else dispatches to exactly one `FrameHandler` method in
//! arrival order.

use super::frame::{
    ContextStats, ExecPhase, ExecutionEvent, Frame, PlanStep, TERMINAL_SENTINEL,
};

/// Receiver for classified frames. One method per frame kind, called in
/// arrival order on the task that reads the stream.
pub trait FrameHandler {
    fn iteration_started(&mut self, iter: Option<u64>);
    fn iteration_finished(&mut self, iter: Option<u64>, status: Option<String>);
    fn thinking(&mut self, iter: Option<u64>, content: String);
    fn note_delta(&mut self, iter: Option<u64>, delta: String);
    fn execution_event(&mut self, event: ExecutionEvent);
    fn progress_bar(&mut self, iter: Option<u64>, message: String, status: Option<String>);
    fn final_result(&mut self, result: String);
    fn context_stats(&mut self, stats: ContextStats);
    fn compression_started(&mut self, message: String, stats: Option<ContextStats>);
    fn compression_finished(
        &mut self,
        message: String,
        old_stats: Option<ContextStats>,
        new_stats: Option<ContextStats>,
    );
    fn files_generated(&mut self, iter: Option<u64>, files: Vec<String>);
    fn plan_updated(&mut self, plan: Vec<PlanStep>, summary: Option<String>);
    /// Called exactly once per turn, when the terminal sentinel arrives.
    fn stream_completed(&mut self);
}

/// What the caller should do after feeding a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Finished,
}

pub struct UpdateClassifier<H> {
    handler: H,
    completed: bool,
}

impl<H: FrameHandler> UpdateClassifier<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            completed: false,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Re-arm for a new turn. Completion fires once per turn between resets.
    pub fn reset(&mut self) {
        self.completed = false;
    }

    /// Feed one raw line from the push channel.
    pub fn feed_line(&mut self, line: &str) -> Dispatch {
        let line = line.trim();
        if line.is_empty() {
            return Dispatch::Continue;
        }
        if line == TERMINAL_SENTINEL {
            return self.finish();
        }
        let frame: Frame = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("dropping malformed frame ({err}): {}", excerpt(line));
                return Dispatch::Continue;
            }
        };
        self.dispatch(frame);
        Dispatch::Continue
    }

    /// Route one parsed frame to its handler method.
    pub fn dispatch(&mut self, frame: Frame) {
        match frame {
            Frame::IterationStart(f) => self.handler.iteration_started(f.iter),
            Frame::IterationDone(f) => self.handler.iteration_finished(f.iter, f.status),
            Frame::Thinking(f) => self.handler.thinking(f.iter, f.content),
            Frame::Note(f) => self.handler.note_delta(f.iter, f.delta),
            Frame::ExecutionEvent(ev) => self.handler.execution_event(ev),
            Frame::Progress(f) => {
                // Older servers still send this kind. Newer consumers want it as
                // an execution note, progress-bar consumers want it verbatim, so
                // it fans out to both.
                self.handler.execution_event(ExecutionEvent {
                    iter: f.iter,
                    tool: None,
                    phase: ExecPhase::Info,
                    args: None,
                    message: Some(f.message.clone()),
                    files: None,
                    elapsed: None,
                });
                self.handler.progress_bar(f.iter, f.message, f.status);
            }
            Frame::FinalResult(f) => self.handler.final_result(f.result),
            Frame::ContextStats(f) => self.handler.context_stats(f.stats),
            Frame::CompressionStart(f) => self.handler.compression_started(f.message, f.stats),
            Frame::CompressionDone(f) => {
                self.handler
                    .compression_finished(f.message, f.old_stats, f.new_stats)
            }
            Frame::FilesGenerated(f) => self.handler.files_generated(f.iter, f.files),
            Frame::PlanUpdate(f) => self.handler.plan_updated(f.plan, f.summary),
            Frame::Unknown => {
                log::debug!("dropping frame with unknown kind");
            }
        }
    }

    /// Complete the turn. Safe to call more than once; completion is
    /// delivered only the first time.
    pub fn finish(&mut self) -> Dispatch {
        if !self.completed {
            self.completed = true;
            self.handler.stream_completed();
        }
        Dispatch::Finished
    }
}

fn excerpt(line: &str) -> &str {
    let mut end = line.len().min(200);
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}
