//! Console session: the send/stream lifecycle for one conversation.
//!
//! `send` claims the conversation, opens the push channel, and pumps frames
//! through the classifier into per-turn state (round numbering + execution
//! rows). `stop` closes the channel locally. Whatever ends a turn, the sink
//! hears `stream_closed` exactly once and the claim is given back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::backend::{BackendClient, BackendError, EventStream, SendRequest};
use crate::coordination::{ClaimOutcome, SendCoordinator, SharedStore};
use crate::execution::ExecutionTracker;
use crate::notify::{CloseReason, ConsoleSink, RowOutcome};
use crate::rounds::RoundMap;
use crate::stream::{
    status_is_failure, ContextStats, Dispatch, ExecPhase, ExecutionEvent, FrameHandler, PlanStep,
    UpdateClassifier,
};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("another context is already sending for this conversation (held by {holder})")]
    Blocked { holder: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Per-turn reconciliation state behind the classifier.
struct TurnState {
    rounds: RoundMap,
    tracker: ExecutionTracker,
    sink: Arc<dyn ConsoleSink>,
    finished: bool,
}

impl TurnState {
    fn new(sink: Arc<dyn ConsoleSink>) -> Self {
        Self {
            rounds: RoundMap::new(),
            tracker: ExecutionTracker::new(sink.clone()),
            sink,
            finished: false,
        }
    }

    fn reset(&mut self) {
        self.rounds.reset();
        self.tracker.reset();
        self.finished = false;
    }

    /// Mark the turn over and tell the sink, first caller wins.
    fn finish(&mut self, reason: CloseReason) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.sink.stream_closed(&reason);
    }
}

impl FrameHandler for TurnState {
    fn iteration_started(&mut self, iter: Option<u64>) {
        let round = self.rounds.round_of(iter);
        self.tracker.begin_round(round);
    }

    fn iteration_finished(&mut self, iter: Option<u64>, status: Option<String>) {
        let round = self.rounds.round_of(iter);
        let ok = !status_is_failure(status.as_deref());
        self.tracker.close_round(round, ok);
    }

    fn thinking(&mut self, iter: Option<u64>, content: String) {
        let round = self.rounds.round_of(iter);
        self.tracker.thinking(round, &content);
    }

    fn note_delta(&mut self, iter: Option<u64>, delta: String) {
        let round = self.rounds.round_of(iter);
        self.tracker.note_delta(round, &delta);
    }

    fn execution_event(&mut self, event: ExecutionEvent) {
        let round = self.rounds.round_of(event.iter);
        match event.phase {
            ExecPhase::Info => {
                self.tracker
                    .info(round, event.message.as_deref().unwrap_or(""));
                return;
            }
            ExecPhase::Files => {
                self.tracker.artifacts(round, &event.files.unwrap_or_default());
                return;
            }
            _ => {}
        }
        // The remaining phases address a row by tool name.
        let Some(tool) = event.tool.as_deref() else {
            log::debug!("execution {:?} without a tool name, dropping", event.phase);
            return;
        };
        match event.phase {
            ExecPhase::Start => self.tracker.tool_started(round, tool, event.args.as_deref()),
            ExecPhase::Heartbeat => self.tracker.tool_heartbeat(round, tool, event.elapsed),
            ExecPhase::Done => self.tracker.tool_finished(round, tool, RowOutcome::Succeeded),
            ExecPhase::Error => self.tracker.tool_finished(round, tool, RowOutcome::Failed),
            ExecPhase::Files | ExecPhase::Info => {}
        }
    }

    fn progress_bar(&mut self, iter: Option<u64>, message: String, status: Option<String>) {
        let round = self.rounds.round_of(iter);
        self.tracker.progress(round, &message, status.as_deref());
    }

    fn final_result(&mut self, result: String) {
        self.sink.final_result(&result);
    }

    fn context_stats(&mut self, stats: ContextStats) {
        self.sink.context_stats(&stats);
    }

    fn compression_started(&mut self, message: String, _stats: Option<ContextStats>) {
        self.sink.compression_started(&message);
    }

    fn compression_finished(
        &mut self,
        message: String,
        _old_stats: Option<ContextStats>,
        new_stats: Option<ContextStats>,
    ) {
        self.sink.compression_finished(&message);
        if let Some(stats) = new_stats {
            self.sink.context_stats(&stats);
        }
    }

    fn files_generated(&mut self, iter: Option<u64>, files: Vec<String>) {
        let round = self.rounds.round_of(iter);
        self.tracker.artifacts(round, &files);
    }

    fn plan_updated(&mut self, plan: Vec<PlanStep>, summary: Option<String>) {
        self.sink.plan_updated(&plan, summary.as_deref());
    }

    fn stream_completed(&mut self) {
        self.finish(CloseReason::Finished);
    }
}

/// One console bound to one conversation.
pub struct ConsoleSession {
    conversation_id: String,
    backend: BackendClient,
    store: Arc<dyn SharedStore>,
    coordinator: Arc<SendCoordinator>,
    sink: Arc<dyn ConsoleSink>,
    turn: Arc<Mutex<UpdateClassifier<TurnState>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    unblock_watch: Mutex<Option<JoinHandle<()>>>,
    blocked: Arc<AtomicBool>,
}

impl ConsoleSession {
    pub fn new(
        backend: BackendClient,
        store: Arc<dyn SharedStore>,
        conversation_id: impl Into<String>,
        sink: Arc<dyn ConsoleSink>,
    ) -> Self {
        let conversation_id = conversation_id.into();
        let tab_id = format!("tab-{}", uuid::Uuid::new_v4());
        let coordinator = Arc::new(SendCoordinator::new(
            store.clone(),
            &conversation_id,
            tab_id,
        ));
        Self {
            conversation_id,
            backend,
            store,
            coordinator,
            sink: sink.clone(),
            turn: Arc::new(Mutex::new(UpdateClassifier::new(TurnState::new(sink)))),
            pump: Mutex::new(None),
            unblock_watch: Mutex::new(None),
            blocked: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Identity this console uses in send claims.
    pub fn tab_id(&self) -> &str {
        self.coordinator.tab_id()
    }

    /// Submit a message and start streaming its turn. Any prior turn is
    /// stopped first. Fails fast when another context holds the send claim.
    pub async fn send(
        &self,
        message: &str,
        model: Option<&str>,
        client_request_id: &str,
    ) -> Result<(), SendError> {
        self.stop().await;

        match self.coordinator.try_acquire().await {
            ClaimOutcome::Acquired => {}
            ClaimOutcome::Blocked(record) => {
                self.blocked.store(true, Ordering::SeqCst);
                self.sink.send_blocked(&record);
                self.spawn_unblock_watch().await;
                return Err(SendError::Blocked {
                    holder: record.tab_id,
                });
            }
        }
        self.clear_blocked().await;

        {
            let mut turn = self.turn.lock().await;
            turn.reset();
            turn.handler_mut().reset();
        }

        let request = SendRequest {
            message: message.to_string(),
            model: model.map(String::from),
            client_request_id: client_request_id.to_string(),
        };
        let stream = match self.backend.open_stream(&self.conversation_id, &request).await {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!("opening stream for {} failed: {err}", self.conversation_id);
                {
                    let mut turn = self.turn.lock().await;
                    turn.handler_mut()
                        .finish(CloseReason::Transport(err.to_string()));
                }
                self.coordinator.release().await;
                return Err(SendError::Backend(err));
            }
        };

        let pump = tokio::spawn(pump_stream(
            stream,
            self.turn.clone(),
            self.coordinator.clone(),
        ));
        *self.pump.lock().await = Some(pump);
        Ok(())
    }

    /// Stop the current turn locally: close the channel, mark the turn over,
    /// give the claim back. Safe to call when nothing is streaming.
    pub async fn stop(&self) {
        let handle = self.pump.lock().await.take();
        let Some(handle) = handle else {
            return;
        };
        handle.abort();
        {
            let mut turn = self.turn.lock().await;
            turn.handler_mut().finish(CloseReason::Stopped);
        }
        self.coordinator.release().await;
    }

    /// True while a turn is streaming (claimed, channel open, not yet closed).
    pub async fn is_active(&self) -> bool {
        if self.pump.lock().await.is_none() {
            return false;
        }
        !self.turn.lock().await.handler().finished
    }

    /// Re-check a standing block against the store, e.g. when the console
    /// regains focus. The blocked notice clears only when the claim record is
    /// gone; a claim still present keeps the block, whoever holds it.
    pub async fn refresh_block(&self) {
        if !self.blocked.load(Ordering::SeqCst) {
            return;
        }
        if self.coordinator.peek().await.is_none() {
            self.clear_blocked().await;
        }
    }

    async fn clear_blocked(&self) {
        if self.blocked.swap(false, Ordering::SeqCst) {
            self.sink.send_unblocked();
        }
        if let Some(handle) = self.unblock_watch.lock().await.take() {
            handle.abort();
        }
    }

    /// Watch the store's change feed for the claim key being cleared.
    async fn spawn_unblock_watch(&self) {
        let mut guard = self.unblock_watch.lock().await;
        if let Some(old) = guard.take() {
            old.abort();
        }
        let mut rx = self.store.watch();
        let store = self.store.clone();
        let key = self.coordinator.key().to_string();
        let sink = self.sink.clone();
        let blocked = self.blocked.clone();
        // The holder may have released between the blocked read and the
        // subscription above; one direct read closes that window.
        if let Ok(None) = store.read(&key).await {
            if blocked.swap(false, Ordering::SeqCst) {
                sink.send_unblocked();
            }
            return;
        }
        *guard = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) if change.key == key => {
                        if change.value.is_none() && blocked.swap(false, Ordering::SeqCst) {
                            sink.send_unblocked();
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        // The removal may be among the dropped events.
                        log::debug!("claim watch lagged {n} events, re-reading {key}");
                        if let Ok(None) = store.read(&key).await {
                            if blocked.swap(false, Ordering::SeqCst) {
                                sink.send_unblocked();
                            }
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }
}

/// Reads the push channel line by line until the sentinel, the channel ends,
/// or the task is aborted by `stop`.
async fn pump_stream(
    mut stream: EventStream,
    turn: Arc<Mutex<UpdateClassifier<TurnState>>>,
    coordinator: Arc<SendCoordinator>,
) {
    let abnormal = loop {
        match stream.next_line().await {
            Ok(Some(line)) => {
                let mut turn = turn.lock().await;
                if turn.feed_line(&line) == Dispatch::Finished {
                    break None;
                }
            }
            Ok(None) => break Some(CloseReason::Transport("channel ended early".to_string())),
            Err(err) => break Some(CloseReason::Transport(err.to_string())),
        }
    };
    if let Some(reason) = abnormal {
        let mut turn = turn.lock().await;
        turn.handler_mut().finish(reason);
    }
    coordinator.release().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{sending_key, unix_millis, ClaimRecord, MemoryStore};
    use crate::notify::RowId;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.events.lock().unwrap())
        }
        fn push(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }
    }

    impl ConsoleSink for Recorder {
        fn round_opened(&self, round: u64) {
            self.push(format!("opened:{round}"));
        }
        fn round_closed(&self, round: u64, ok: bool) {
            self.push(format!("closed:{round}:{ok}"));
        }
        fn round_discarded(&self, round: u64) {
            self.push(format!("discarded:{round}"));
        }
        fn row_started(&self, _row: RowId, round: u64, tool: &str, _args: Option<&str>) {
            self.push(format!("row-start:{round}:{tool}"));
        }
        fn row_finished(&self, _row: RowId, round: u64, tool: &str, outcome: RowOutcome) {
            self.push(format!("row-end:{round}:{tool}:{outcome:?}"));
        }
        fn final_result(&self, result: &str) {
            self.push(format!("final:{result}"));
        }
        fn stream_closed(&self, reason: &CloseReason) {
            self.push(format!("stream-closed:{reason:?}"));
        }
        fn send_blocked(&self, claim: &ClaimRecord) {
            self.push(format!("blocked:{}", claim.tab_id));
        }
        fn send_unblocked(&self) {
            self.push("unblocked");
        }
    }

    fn turn_state() -> (TurnState, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (TurnState::new(recorder.clone()), recorder)
    }

    #[test]
    fn turn_state_renumbers_iterations_per_turn() {
        let (mut state, recorder) = turn_state();
        state.iteration_started(Some(40));
        state.execution_event(ExecutionEvent {
            iter: Some(40),
            tool: Some("search".into()),
            phase: ExecPhase::Start,
            args: None,
            message: None,
            files: None,
            elapsed: None,
        });
        state.iteration_started(Some(41));
        assert_eq!(
            recorder.take(),
            vec!["opened:1", "row-start:1:search", "opened:2"]
        );

        state.reset();
        state.iteration_started(Some(90));
        assert_eq!(recorder.take(), vec!["opened:1"]);
    }

    #[test]
    fn execution_event_without_tool_is_dropped() {
        let (mut state, recorder) = turn_state();
        state.execution_event(ExecutionEvent {
            iter: Some(1),
            tool: None,
            phase: ExecPhase::Done,
            args: None,
            message: None,
            files: None,
            elapsed: None,
        });
        // The round container opens lazily but no row appears.
        assert_eq!(recorder.take(), Vec::<String>::new());
    }

    #[test]
    fn failed_iteration_status_closes_round_as_not_ok() {
        let (mut state, recorder) = turn_state();
        state.iteration_started(Some(5));
        state.thinking(Some(5), "working".into());
        state.iteration_finished(Some(5), Some("failed".into()));
        let events = recorder.take();
        assert!(events.contains(&"closed:1:false".to_string()));
    }

    #[test]
    fn finish_notifies_exactly_once() {
        let (mut state, recorder) = turn_state();
        state.finish(CloseReason::Finished);
        state.finish(CloseReason::Stopped);
        assert_eq!(
            recorder.take(),
            vec!["stream-closed:Finished".to_string()]
        );
    }

    #[tokio::test]
    async fn blocked_send_fails_fast_without_touching_the_backend() {
        let store = Arc::new(MemoryStore::new());
        let record = ClaimRecord::new("tab-other", unix_millis());
        store
            .write(&sending_key("c1"), &serde_json::to_string(&record).unwrap())
            .await
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        // Unroutable port: the blocked path must return before any request.
        let session = ConsoleSession::new(
            BackendClient::new(Some("http://127.0.0.1:1".into())),
            store,
            "c1",
            recorder.clone(),
        );

        match session.send("hello", None, "req-1").await {
            Err(SendError::Blocked { holder }) => assert_eq!(holder, "tab-other"),
            other => panic!("expected blocked send, got {other:?}"),
        }
        assert!(!session.is_active().await);
        assert_eq!(recorder.take(), vec!["blocked:tab-other"]);
    }

    #[tokio::test]
    async fn refresh_block_clears_once_the_claim_is_gone() {
        let store = Arc::new(MemoryStore::new());
        let record = ClaimRecord::new("tab-other", unix_millis());
        store
            .write(&sending_key("c1"), &serde_json::to_string(&record).unwrap())
            .await
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let session = ConsoleSession::new(
            BackendClient::new(Some("http://127.0.0.1:1".into())),
            store.clone(),
            "c1",
            recorder.clone(),
        );
        let _ = session.send("hello", None, "req-1").await;

        // Claim still present: the block must hold.
        session.refresh_block().await;
        assert_eq!(recorder.take(), vec!["blocked:tab-other"]);

        store.remove(&sending_key("c1")).await.unwrap();
        session.refresh_block().await;
        assert_eq!(recorder.take(), vec!["unblocked"]);
    }

    #[tokio::test]
    async fn stop_without_a_stream_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(Recorder::default());
        let session = ConsoleSession::new(
            BackendClient::new(Some("http://127.0.0.1:1".into())),
            store,
            "c1",
            recorder.clone(),
        );
        session.stop().await;
        assert!(!session.is_active().await);
        assert!(recorder.take().is_empty());
    }

    #[tokio::test]
    async fn failed_open_releases_the_claim_and_reports_transport() {
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(Recorder::default());
        let session = ConsoleSession::new(
            BackendClient::new(Some("http://127.0.0.1:1".into())),
            store.clone(),
            "c1",
            recorder.clone(),
        );

        match session.send("hello", None, "req-1").await {
            Err(SendError::Backend(_)) => {}
            other => panic!("expected backend error, got {other:?}"),
        }
        assert!(store.read(&sending_key("c1")).await.unwrap().is_none());
        let events = recorder.take();
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with("stream-closed:Transport"));
        assert!(!session.is_active().await);
    }
}
