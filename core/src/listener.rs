//! Listener Runtime (C13): the WebSocket session that drives the
//! approval-loop state machine. Ties together the Permission Engine, the
//! Classifier, the Approval Executor, the Protocol Codec, the Queue
//! Runtime and the Turn Recovery Policy around a single control channel,
//! the way the teacher's `Codex`/`Session` pair ties a submission queue
//! and an event queue around one conversation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::oneshot;

use crate::approval_analyzer;
use crate::classifier::ApprovalRequest;
use crate::classifier::ClassificationOutcome;
use crate::classifier::ClassifiedRequest;
use crate::classifier::ClassifierOptions;
use crate::classifier::classify;
use crate::config::RuntimeConfig;
use crate::conversation::ConversationService;
use crate::conversation::ConversationStream;
use crate::conversation::ControlChannel;
use crate::conversation::PendingApproval;
use crate::conversation::StopReason;
use crate::engine::EngineContext;
use crate::error::ListenerError;
use crate::error::PreStreamError;
use crate::error::Result;
use crate::executor::Approval;
use crate::executor::ExecutorDecision;
use crate::executor::ToolResult;
use crate::executor::ToolRunner;
use crate::executor::execute_approval_batch;
use crate::mode::ModeController;
use crate::mode::PermissionMode;
use crate::pending_approval_recovery::RecoveryLatch;
use crate::protocol::ActiveRun;
use crate::protocol::ActiveRunSnapshot;
use crate::protocol::ControlResponsePayload;
use crate::protocol::InboundFrame;
use crate::protocol::OutboundEvent;
use crate::protocol::PendingControlRequest;
use crate::protocol::QueueSnapshot;
use crate::protocol::QueueSnapshotItem;
use crate::protocol::encode;
use crate::protocol::permission_request_id;
use crate::queue::QueueEvent;
use crate::queue::QueueItem;
use crate::queue::QueueItemKind;
use crate::queue::QueueItemSource;
use crate::queue::QueueRuntime;
use crate::recovery::RecoveryAction;
use crate::recovery::classify as classify_recovery;
use crate::rules::RuleStore;
use crate::types::ToolQuery;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_BUDGET: Duration = Duration::from_secs(300);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// A batch of user messages, the payload a queued `Message` frame is
/// serialized into while it waits for its turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedTurn {
    agent_id: String,
    conversation_id: Option<String>,
    messages: Vec<Value>,
}

enum FirstStep {
    Open(Vec<Value>),
    Resumed(Box<dyn ConversationStream>),
}

/// The permission/mode/queue state plus the bookkeeping one connected
/// control-channel session needs. Lives for the lifetime of the runtime,
/// independent of how many times the socket reconnects.
pub struct ListenerRuntime {
    session_id: String,
    config: RuntimeConfig,
    rules: Mutex<RuleStore>,
    mode: Mutex<ModeController>,
    queue: Mutex<QueueRuntime>,
    event_seq: AtomicU64,
    state_seq: AtomicU64,
    pending_resolvers: Mutex<HashMap<String, (Value, oneshot::Sender<ControlResponsePayload>)>>,
    active_run: Mutex<Option<ActiveRun>>,
    is_processing: AtomicBool,
    last_stop_reason: Mutex<Option<String>>,
    control_response_capable: AtomicBool,
    turn_chain: Mutex<()>,
    recovery_latch: RecoveryLatch,
    intentionally_closed: AtomicBool,
}

impl ListenerRuntime {
    pub fn new(session_id: impl Into<String>, config: RuntimeConfig) -> Arc<Self> {
        let mode = ModeController::new(config.initial_mode);
        Arc::new(Self {
            session_id: session_id.into(),
            rules: Mutex::new(RuleStore {
                cli: config.cli_rules.clone(),
                ..RuleStore::default()
            }),
            mode: Mutex::new(mode),
            queue: Mutex::new(QueueRuntime::new()),
            event_seq: AtomicU64::new(0),
            state_seq: AtomicU64::new(0),
            pending_resolvers: Mutex::new(HashMap::new()),
            active_run: Mutex::new(None),
            is_processing: AtomicBool::new(false),
            last_stop_reason: Mutex::new(None),
            control_response_capable: AtomicBool::new(false),
            turn_chain: Mutex::new(()),
            recovery_latch: RecoveryLatch::default(),
            intentionally_closed: AtomicBool::new(false),
            config,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stops the reconnect loop once the current connection (if any) ends.
    pub fn stop(&self) {
        self.intentionally_closed.store(true, Ordering::SeqCst);
    }

    fn next_event_seq(&self) -> u64 {
        self.event_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn emit(&self, channel: &dyn ControlChannel, event: OutboundEvent) -> Result<()> {
        let seq = self.next_event_seq();
        let value = encode(&event, &self.session_id, seq);
        channel
            .send(value)
            .await
            .map_err(|e| ListenerError::ControlTransport(e.to_string()))
    }

    async fn resolve_control_response(&self, payload: ControlResponsePayload) -> bool {
        let mut resolvers = self.pending_resolvers.lock().await;
        match resolvers.remove(payload.request_id()) {
            Some((_, tx)) => {
                let _ = tx.send(payload);
                true
            }
            None => false,
        }
    }

    /// Drops every outstanding resolver so any turn awaiting a control
    /// response observes the channel closing instead of hanging forever.
    async fn reject_all_resolvers(&self) {
        self.pending_resolvers.lock().await.clear();
    }

    /// This connection is pinned to one agent (`--agent-id`); a frame
    /// addressed to a different agent indicates a server-side routing bug
    /// rather than something this runtime should act on.
    fn reject_foreign_agent(&self, agent_id: &str) -> Option<OutboundEvent> {
        let configured = self.config.agent_id.as_deref()?;
        if configured == agent_id {
            return None;
        }
        tracing::warn!(configured, received = agent_id, "dropping frame addressed to a different agent");
        Some(OutboundEvent::Error {
            message: format!("frame addressed to agent {agent_id} but this listener is pinned to {configured}"),
            stop_reason: None,
            run_id: None,
        })
    }

    /// Logs each classified request's decision trace at `debug` level,
    /// gated by `LETTA_PERMISSION_TRACE`/`LETTA_PERMISSION_TRACE_ALL`.
    /// Deny/ask outcomes log under plain `PERMISSION_TRACE`; `_ALL` also
    /// logs allow outcomes that would otherwise stay silent.
    fn log_permission_traces(&self, outcome: &ClassificationOutcome) {
        let env = &self.config.env;
        if !env.permission_trace && !env.permission_trace_all {
            return;
        }

        let log_one = |classified: &ClassifiedRequest, decision: &str| {
            tracing::debug!(
                tool_call_id = %classified.request.tool_call_id,
                tool_name = classified.request.tool_name.as_deref().unwrap_or("<missing>"),
                decision,
                trace = ?classified.result.trace,
                "permission decision trace"
            );
        };

        for classified in &outcome.auto_denied {
            log_one(classified, "deny");
        }
        for classified in &outcome.needs_user_input {
            log_one(classified, "ask");
        }
        if env.permission_trace_all {
            for classified in &outcome.auto_allowed {
                log_one(classified, "allow");
            }
        }
    }

    fn classifier_options() -> ClassifierOptions<'static> {
        ClassifierOptions {
            always_requires_user_input: &|tool| {
                matches!(tool, "AskUserQuestion" | "EnterPlanMode" | "ExitPlanMode")
            },
            treat_ask_as_deny: false,
            deny_reason_for_ask: "awaiting user approval".to_string(),
            missing_name_reason: "tool call is missing a name".to_string(),
            require_args_for_auto_approve: true,
            required_args: &|tool| match tool {
                "Write" | "Edit" => &["file_path"],
                "Bash" => &["command"],
                _ => &[],
            },
        }
    }

    // ---- reconnect loop -------------------------------------------------

    /// Reconnect-with-retry loop: `connect` is invoked fresh on every
    /// attempt. The 5 minute budget resets whenever a connection is
    /// actually established, so a flapping link doesn't exhaust it during
    /// a single long-lived session.
    pub async fn run<F, Fut>(
        self: Arc<Self>,
        connect: F,
        conversation: Arc<dyn ConversationService>,
        tool_runner: Arc<dyn ToolRunner>,
    ) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<Box<dyn ControlChannel>, String>>,
    {
        let mut attempt = 0u32;
        let mut first_failure_at: Option<Instant> = None;

        loop {
            if self.intentionally_closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            match connect().await {
                Ok(channel) => {
                    attempt = 0;
                    first_failure_at = None;
                    let channel: Arc<dyn ControlChannel> = Arc::from(channel);
                    let result = self
                        .clone()
                        .run_connected(channel.clone(), conversation.clone(), tool_runner.clone())
                        .await;
                    channel.close().await;
                    self.reject_all_resolvers().await;

                    match result {
                        Ok(()) => return Ok(()),
                        Err(ListenerError::EnvironmentNotFound) => {
                            tracing::warn!("environment not found (close code 1008), re-registering on next connect attempt");
                        }
                        Err(err) => tracing::warn!(error = %err, "listener connection dropped, reconnecting"),
                    }
                }
                Err(err) => tracing::warn!(error = %err, "failed to open control channel"),
            }

            if self.intentionally_closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            let first = *first_failure_at.get_or_insert_with(Instant::now);
            if first.elapsed() >= RECONNECT_BUDGET {
                return Err(ListenerError::RetryBudgetExceeded);
            }

            attempt += 1;
            let delay = crate::util::backoff(attempt, RECONNECT_BASE, RECONNECT_CAP);
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_connected(
        self: Arc<Self>,
        channel: Arc<dyn ControlChannel>,
        conversation: Arc<dyn ConversationService>,
        tool_runner: Arc<dyn ToolRunner>,
    ) -> Result<()> {
        let current_mode = mode_label(self.mode.lock().await.mode()).to_string();
        let _ = self.emit(&*channel, OutboundEvent::ModeChanged { mode: current_mode, success: true, error: None }).await;

        let heartbeat_channel = channel.clone();
        let heartbeat_self = self.clone();
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if heartbeat_self.emit(&*heartbeat_channel, OutboundEvent::Ping).await.is_err() {
                    break;
                }
            }
        });

        let result = loop {
            if self.intentionally_closed.load(Ordering::SeqCst) {
                break Ok(());
            }
            match channel.recv().await {
                None => break Ok(()),
                Some(Err(reason)) => break Err(classify_socket_error(&reason)),
                Some(Ok(raw)) => {
                    let frame: InboundFrame = match serde_json::from_value(raw) {
                        Ok(frame) => frame,
                        Err(err) => {
                            tracing::debug!(error = %err, "failed to parse inbound frame");
                            continue;
                        }
                    };
                    if let Err(err) = self
                        .clone()
                        .handle_frame(frame, channel.clone(), conversation.clone(), tool_runner.clone())
                        .await
                    {
                        break Err(err);
                    }
                }
            }
        };

        heartbeat.abort();

        self.queue.lock().await.clear("shutdown".to_string());
        let _ = self.emit(&*channel, OutboundEvent::QueueCleared { reason: "shutdown".to_string() }).await;

        result
    }

    // ---- inbound frame dispatch ------------------------------------------

    async fn handle_frame(
        self: Arc<Self>,
        frame: InboundFrame,
        channel: Arc<dyn ControlChannel>,
        conversation: Arc<dyn ConversationService>,
        tool_runner: Arc<dyn ToolRunner>,
    ) -> Result<()> {
        match frame {
            InboundFrame::Pong => Ok(()),
            InboundFrame::Status { last_stop_reason, .. } => {
                if !self.is_processing.load(Ordering::SeqCst) {
                    *self.last_stop_reason.lock().await = last_stop_reason;
                }
                Ok(())
            }
            InboundFrame::Message {
                agent_id,
                conversation_id,
                messages,
                supports_control_response,
            } => {
                if let Some(mismatch) = self.reject_foreign_agent(&agent_id) {
                    return self.emit(&*channel, mismatch).await;
                }
                // Latch: false -> true exactly once. A later `message` frame
                // omitting `supportsControlResponse` must never flip an
                // already-latched `true` back to `false`.
                if supports_control_response.unwrap_or(false) {
                    self.control_response_capable.store(true, Ordering::SeqCst);
                }
                self.enqueue_turn(&channel, QueuedTurn { agent_id, conversation_id, messages }).await?;
                tokio::spawn(self.clone().drain_queue(channel, conversation, tool_runner));
                Ok(())
            }
            InboundFrame::ModeChange { mode } => self.handle_mode_change(&channel, &mode).await,
            InboundFrame::GetStatus {} => self.handle_get_status(&channel).await,
            InboundFrame::GetState {} => self.handle_get_state(&channel).await,
            InboundFrame::RecoverPendingApprovals { agent_id, conversation_id } => {
                if let Some(mismatch) = self.reject_foreign_agent(&agent_id) {
                    return self.emit(&*channel, mismatch).await;
                }
                tokio::spawn(self.clone().recover_pending_approvals(channel, conversation, tool_runner, agent_id, conversation_id));
                Ok(())
            }
            InboundFrame::ControlResponse { response } => {
                self.resolve_control_response(response).await;
                Ok(())
            }
        }
    }

    async fn handle_mode_change(&self, channel: &dyn ControlChannel, mode: &str) -> Result<()> {
        match parse_mode(mode) {
            Some(new_mode) => {
                let mut guard = self.mode.lock().await;
                if new_mode == PermissionMode::Plan {
                    match self.config.plan_file_path.clone() {
                        Some(plan_path) => guard.enter_plan(plan_path),
                        None => guard.set_mode(new_mode),
                    }
                } else {
                    if guard.mode() == PermissionMode::Plan {
                        guard.exit_plan();
                    }
                    guard.set_mode(new_mode);
                }
                drop(guard);
                self.emit(channel, OutboundEvent::ModeChanged { mode: mode.to_string(), success: true, error: None }).await
            }
            None => {
                self.emit(
                    channel,
                    OutboundEvent::ModeChanged {
                        mode: mode.to_string(),
                        success: false,
                        error: Some(format!("unknown mode {mode}")),
                    },
                )
                .await
            }
        }
    }

    async fn handle_get_status(&self, channel: &dyn ControlChannel) -> Result<()> {
        let _chain = self.turn_chain.lock().await;
        let current_mode = mode_label(self.mode.lock().await.mode()).to_string();
        let last_stop_reason = self.last_stop_reason.lock().await.clone();
        let is_processing = self.is_processing.load(Ordering::SeqCst);
        self.emit(channel, OutboundEvent::StatusResponse { current_mode, last_stop_reason, is_processing }).await
    }

    async fn handle_get_state(&self, channel: &dyn ControlChannel) -> Result<()> {
        let _chain = self.turn_chain.lock().await;
        let state_seq = self.state_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mode = mode_label(self.mode.lock().await.mode()).to_string();
        let is_processing = self.is_processing.load(Ordering::SeqCst);
        let last_stop_reason = self.last_stop_reason.lock().await.clone();
        let control_response_capable = self.control_response_capable.load(Ordering::SeqCst);

        let active_run = self.active_run.lock().await.clone();
        let active_run = active_run.map(|run| ActiveRunSnapshot {
            run_id: run.run_id,
            agent_id: run.agent_id,
            conversation_id: run.conversation_id,
            started_at: run.started_at,
        }).unwrap_or(ActiveRunSnapshot { run_id: None, agent_id: None, conversation_id: None, started_at: None });

        let pending_control_requests: Vec<PendingControlRequest> = self
            .pending_resolvers
            .lock()
            .await
            .iter()
            .map(|(request_id, (request, _))| PendingControlRequest { request_id: request_id.clone(), request: request.clone() })
            .collect();

        let queue = self.queue.lock().await;
        let queue_snapshot = QueueSnapshot {
            queue_len: queue.len(),
            pending_turns: queue.pending_turns(),
            items: queue.items().iter().map(queue_item_snapshot).collect(),
        };
        drop(queue);

        self.emit(
            channel,
            OutboundEvent::StateResponse {
                snapshot_id: uuid::Uuid::new_v4().to_string(),
                state_seq,
                mode,
                is_processing,
                last_stop_reason,
                control_response_capable,
                active_run,
                pending_control_requests,
                queue: queue_snapshot,
            },
        )
        .await
    }

    // ---- queue lifecycle --------------------------------------------------

    async fn enqueue_turn(&self, channel: &dyn ControlChannel, turn: QueuedTurn) -> Result<()> {
        let content = serde_json::to_string(&turn)?;
        let mut queue = self.queue.lock().await;
        let event = queue.enqueue(QueueItemKind::Message, QueueItemSource::User, content, Utc::now());
        drop(queue);
        if let QueueEvent::Enqueued(item) = event {
            self.emit(channel, OutboundEvent::QueueEnqueued { item: queue_item_to_json(&item) }).await?;
        }
        Ok(())
    }

    /// Merges everything currently queued into one turn and runs it, then
    /// loops to pick up anything that arrived while that turn was running.
    /// Latches on `blocked` (via `try_dequeue`) if another drain is already
    /// mid-turn; that caller's own end-of-turn drain will pick this back up.
    async fn drain_queue(
        self: Arc<Self>,
        channel: Arc<dyn ControlChannel>,
        conversation: Arc<dyn ConversationService>,
        tool_runner: Arc<dyn ToolRunner>,
    ) {
        loop {
            let merged = {
                let _chain = self.turn_chain.lock().await;
                let mut queue = self.queue.lock().await;
                if let Some(QueueEvent::Blocked { reason }) = queue.try_dequeue("a turn is already in progress".to_string()) {
                    drop(queue);
                    let _ = self.emit(&*channel, OutboundEvent::QueueBlocked { reason }).await;
                    return;
                }
                if queue.is_empty() {
                    return;
                }
                let drained: Vec<QueueItem> = queue.items().to_vec();
                queue.begin_turn();
                let len = queue.len();
                let event = queue.consume(len);
                if let QueueEvent::BatchDequeued { batch_id, item_ids, merged_count, queue_len_after } = &event {
                    let batch_json = serde_json::json!({
                        "batch_id": batch_id,
                        "item_ids": item_ids,
                        "merged_count": merged_count,
                        "queue_len_after": queue_len_after,
                    });
                    drop(queue);
                    let _ = self.emit(&*channel, OutboundEvent::QueueBatchDequeued { batch: batch_json }).await;
                }
                merge_queued_turns(&drained)
            };

            let Some(merged) = merged else {
                let mut queue = self.queue.lock().await;
                queue.end_turn();
                continue;
            };

            self.is_processing.store(true, Ordering::SeqCst);
            *self.active_run.lock().await = Some(ActiveRun {
                run_id: None,
                agent_id: Some(merged.agent_id.clone()),
                conversation_id: merged.conversation_id.clone(),
                started_at: Some(Utc::now()),
            });

            self.run_turn(&channel, &*conversation, &*tool_runner, merged).await;

            self.is_processing.store(false, Ordering::SeqCst);
            *self.active_run.lock().await = None;
            self.queue.lock().await.end_turn();
        }
    }

    // ---- turn / approval loop ---------------------------------------------

    async fn run_turn(
        &self,
        channel: &dyn ControlChannel,
        conversation: &dyn ConversationService,
        tool_runner: &dyn ToolRunner,
        merged: QueuedTurn,
    ) {
        let start = Instant::now();
        let agent_id = merged.agent_id;
        let mut conversation_id = merged.conversation_id;
        let mut transient_attempt = 0u32;
        let mut busy_attempt = 0u32;
        let mut run_ids: Vec<String> = vec![];
        let mut num_turns = 0u32;
        let mut next = FirstStep::Open(merged.messages);

        let final_stop = loop {
            let open_result = match next {
                FirstStep::Resumed(stream) => Ok(stream),
                FirstStep::Open(ref messages) => conversation.open_stream(&agent_id, conversation_id.as_deref(), messages).await,
            };

            let mut stream = match open_result {
                Ok(stream) => {
                    transient_attempt = 0;
                    busy_attempt = 0;
                    num_turns += 1;
                    stream
                }
                Err(err) => {
                    let attempt = if matches!(err, PreStreamError::ConversationBusy) { busy_attempt } else { transient_attempt };
                    match classify_recovery(&err, attempt) {
                        RecoveryAction::ResolveApprovalPending => {
                            let results = self.fetch_and_resolve_pending(channel, conversation, tool_runner, &agent_id, conversation_id.as_deref()).await;
                            next = FirstStep::Open(vec![]);
                            if let (Some(conv_id), Some(results)) = (conversation_id.clone(), results) {
                                match conversation.submit_tool_results(&agent_id, &conv_id, &results).await {
                                    Ok(stream) => next = FirstStep::Resumed(stream),
                                    Err(_) => break "error".to_string(),
                                }
                            }
                            continue;
                        }
                        RecoveryAction::RetryTransient { delay, attempt, max_attempts } => {
                            transient_attempt = attempt;
                            let _ = self
                                .emit(channel, OutboundEvent::Retry { reason: "transient".to_string(), attempt, max_attempts, delay_ms: delay.as_millis() as u64 })
                                .await;
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        RecoveryAction::RetryConversationBusy { delay, attempt, max_attempts } => {
                            busy_attempt = attempt;
                            let _ = self
                                .emit(channel, OutboundEvent::Retry { reason: "conversation_busy".to_string(), attempt, max_attempts, delay_ms: delay.as_millis() as u64 })
                                .await;
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        RecoveryAction::Fatal => {
                            let _ = self.emit(channel, OutboundEvent::Error { message: err.to_string(), stop_reason: Some("error".to_string()), run_id: None }).await;
                            break "error".to_string();
                        }
                    }
                }
            };

            let saw_stop = self.drain_chunks(channel, &mut stream, &mut run_ids).await;

            match saw_stop {
                Some(StopReason::RequiresApproval) => {
                    let Some(conv_id) = conversation_id.clone() else {
                        break stop_reason_label(StopReason::Error);
                    };
                    let pending = conversation.pending_approvals(&agent_id, Some(&conv_id)).await.unwrap_or_default();
                    let results = self.resolve_approvals(channel, tool_runner, &agent_id, pending).await;
                    match conversation.submit_tool_results(&agent_id, &conv_id, &results).await {
                        Ok(stream) => {
                            next = FirstStep::Resumed(stream);
                            continue;
                        }
                        Err(_) => break stop_reason_label(StopReason::Error),
                    }
                }
                Some(other) => break stop_reason_label(other),
                None => break "cancelled".to_string(),
            }
        };

        *self.last_stop_reason.lock().await = Some(final_stop.clone());
        let duration_ms = start.elapsed().as_millis() as u64;
        if self.config.env.debug_timings {
            tracing::debug!(duration_ms, num_turns, stop_reason = %final_stop, "turn completed");
        }

        let _ = self
            .emit(
                channel,
                OutboundEvent::TurnResult {
                    subtype: final_stop.clone(),
                    agent_id,
                    conversation_id: conversation_id.take().unwrap_or_default(),
                    duration_ms,
                    duration_api_ms: duration_ms,
                    num_turns,
                    result: None,
                    run_ids,
                    usage: None,
                    stop_reason: Some(final_stop.clone()),
                },
            )
            .await;
        let _ = self
            .emit(channel, OutboundEvent::Result { success: final_stop == "end_turn", stop_reason: Some(final_stop) })
            .await;
    }

    async fn drain_chunks(
        &self,
        channel: &dyn ControlChannel,
        stream: &mut Box<dyn ConversationStream>,
        run_ids: &mut Vec<String>,
    ) -> Option<StopReason> {
        loop {
            match stream.next_chunk().await {
                None => return None,
                Some(chunk) => {
                    if let Some(run_id) = chunk.run_id.clone() {
                        if !run_ids.contains(&run_id) {
                            run_ids.push(run_id.clone());
                            let _ = self.emit(channel, OutboundEvent::RunStarted { run_id }).await;
                        }
                    }
                    if chunk.is_error {
                        let message = chunk.payload.get("message").and_then(Value::as_str).unwrap_or("turn error").to_string();
                        let _ = self
                            .emit(channel, OutboundEvent::Error { message, stop_reason: chunk.stop_reason.map(stop_reason_label), run_id: chunk.run_id.clone() })
                            .await;
                    } else {
                        let _ = self.emit(channel, OutboundEvent::Message { payload: chunk.payload.clone() }).await;
                    }
                    if let Some(stop_reason) = chunk.stop_reason {
                        return Some(stop_reason);
                    }
                }
            }
        }
    }

    async fn fetch_and_resolve_pending(
        &self,
        channel: &dyn ControlChannel,
        conversation: &dyn ConversationService,
        tool_runner: &dyn ToolRunner,
        agent_id: &str,
        conversation_id: Option<&str>,
    ) -> Option<Vec<ToolResult>> {
        let pending = conversation.pending_approvals(agent_id, conversation_id).await.ok()?;
        Some(self.resolve_approvals(channel, tool_runner, agent_id, pending).await)
    }

    /// Classifies a batch of pending approvals, auto-executes what the
    /// engine decides on its own, and round-trips the rest through
    /// `control_request`/`control_response` before executing them too.
    /// Preserves the order `pending` arrived in.
    async fn resolve_approvals(
        &self,
        channel: &dyn ControlChannel,
        tool_runner: &dyn ToolRunner,
        agent_id: &str,
        pending: Vec<PendingApproval>,
    ) -> Vec<ToolResult> {
        if pending.is_empty() {
            return vec![];
        }

        let requests: Vec<ApprovalRequest> = pending
            .iter()
            .map(|p| ApprovalRequest {
                tool_call_id: p.tool_call_id.clone(),
                tool_name: p.tool_name.clone(),
                tool_args_json: p.tool_args_json.clone(),
            })
            .collect();

        let outcome = {
            let rules = self.rules.lock().await;
            let mode = self.mode.lock().await;
            let ctx = EngineContext {
                rules: &rules,
                mode: &mode,
                working_dir: &self.config.working_dir,
                agent_id: Some(agent_id),
            };
            classify(&requests, &ctx, &Self::classifier_options())
        };

        self.log_permission_traces(&outcome);

        let mut decisions: HashMap<String, ExecutorDecision> = HashMap::new();

        for classified in &outcome.auto_allowed {
            let approval = to_approval(classified);
            let reason = classified
                .result
                .matched_rule
                .clone()
                .unwrap_or_else(|| "auto-approved".to_string());
            let _ = self
                .emit(
                    channel,
                    OutboundEvent::AutoApproval {
                        tool_name: approval.tool_name.clone(),
                        tool_call_id: approval.tool_call_id.clone(),
                        arguments: approval.args.clone(),
                        reason,
                        matched_rule: classified.result.matched_rule.clone(),
                    },
                )
                .await;
            decisions.insert(approval.tool_call_id.clone(), ExecutorDecision::Approve(approval));
        }

        for classified in &outcome.auto_denied {
            let approval = to_approval(classified);
            let reason = classified.result.reason.clone().unwrap_or_else(|| "denied".to_string());
            let tool_call_id = approval.tool_call_id.clone();
            decisions.insert(tool_call_id, ExecutorDecision::Deny { approval, reason });
        }

        for classified in outcome.needs_user_input {
            let approval = to_approval(&classified);
            let tool_call_id = approval.tool_call_id.clone();
            let query = ToolQuery::new(approval.tool_name.clone(), classified.args.clone());
            let analysis = approval_analyzer::analyze(&query, &self.config.working_dir);
            let request_id = permission_request_id(&tool_call_id);
            let request = serde_json::json!({
                "subtype": "can_use_tool",
                "tool_name": approval.tool_name,
                "input": approval.args,
                "tool_call_id": tool_call_id,
                "permission_suggestions": [analysis.recommended_rule.clone()],
            });

            let rx = {
                let (tx, rx) = oneshot::channel();
                self.pending_resolvers.lock().await.insert(request_id.clone(), (request.clone(), tx));
                rx
            };

            let emitted = self
                .emit(
                    channel,
                    OutboundEvent::ControlRequest {
                        request_id: request_id.clone(),
                        tool_name: approval.tool_name.clone(),
                        input: approval.args.clone(),
                        tool_call_id: tool_call_id.clone(),
                        permission_suggestions: vec![analysis.recommended_rule.clone()],
                        blocked_path: None,
                        diffs: None,
                    },
                )
                .await;

            let decision = if emitted.is_err() {
                self.pending_resolvers.lock().await.remove(&request_id);
                ExecutorDecision::Deny { approval, reason: "control channel closed".to_string() }
            } else {
                match rx.await {
                    Ok(payload) => control_response_to_decision(payload, approval),
                    Err(_) => ExecutorDecision::Deny { approval, reason: "control channel closed before a decision arrived".to_string() },
                }
            };
            decisions.insert(tool_call_id, decision);
        }

        let ordered: Vec<ExecutorDecision> = pending.iter().filter_map(|p| decisions.remove(&p.tool_call_id)).collect();
        execute_approval_batch(ordered, tool_runner).await
    }

    // ---- pending-approval recovery (C14) -----------------------------------

    async fn recover_pending_approvals(
        self: Arc<Self>,
        channel: Arc<dyn ControlChannel>,
        conversation: Arc<dyn ConversationService>,
        tool_runner: Arc<dyn ToolRunner>,
        agent_id: String,
        conversation_id: Option<String>,
    ) {
        if !self.recovery_latch.try_begin() {
            return;
        }

        let pending = conversation.pending_approvals(&agent_id, conversation_id.as_deref()).await.unwrap_or_default();
        if pending.is_empty() {
            self.recovery_latch.end();
            return;
        }

        let results = self.resolve_approvals(&channel, &*tool_runner, &agent_id, pending).await;
        if let Some(conv_id) = conversation_id {
            if let Ok(stream) = conversation.submit_tool_results(&agent_id, &conv_id, &results).await {
                let _ = self
                    .emit(&*channel, OutboundEvent::Recovery { recovery_type: "pending_approvals".to_string(), message: "resumed a pending turn after reconnect".to_string() })
                    .await;
                self.is_processing.store(true, Ordering::SeqCst);
                *self.active_run.lock().await = Some(ActiveRun {
                    run_id: None,
                    agent_id: Some(agent_id.clone()),
                    conversation_id: Some(conv_id.clone()),
                    started_at: Some(Utc::now()),
                });
                let merged = QueuedTurn { agent_id, conversation_id: Some(conv_id), messages: vec![] };
                self.run_resumed_turn(&channel, &*conversation, &*tool_runner, merged, stream).await;
                self.is_processing.store(false, Ordering::SeqCst);
                *self.active_run.lock().await = None;
            }
        }

        self.recovery_latch.end();
    }

    /// Identical to `run_turn` except it starts from an already-open
    /// stream (the one `submit_tool_results` returned while recovering).
    async fn run_resumed_turn(
        &self,
        channel: &dyn ControlChannel,
        conversation: &dyn ConversationService,
        tool_runner: &dyn ToolRunner,
        merged: QueuedTurn,
        stream: Box<dyn ConversationStream>,
    ) {
        let mut turn = merged;
        turn.messages = vec![];
        let start = Instant::now();
        let agent_id = turn.agent_id;
        let mut conversation_id = turn.conversation_id;
        let mut run_ids: Vec<String> = vec![];
        let mut num_turns = 1u32;
        let mut next = FirstStep::Resumed(stream);

        let final_stop = loop {
            let mut stream = match next {
                FirstStep::Resumed(stream) => stream,
                FirstStep::Open(ref messages) => match conversation.open_stream(&agent_id, conversation_id.as_deref(), messages).await {
                    Ok(stream) => {
                        num_turns += 1;
                        stream
                    }
                    Err(err) => {
                        let _ = self.emit(channel, OutboundEvent::Error { message: err.to_string(), stop_reason: Some("error".to_string()), run_id: None }).await;
                        break "error".to_string();
                    }
                },
            };

            let saw_stop = self.drain_chunks(channel, &mut stream, &mut run_ids).await;
            match saw_stop {
                Some(StopReason::RequiresApproval) => {
                    let Some(conv_id) = conversation_id.clone() else {
                        break stop_reason_label(StopReason::Error);
                    };
                    let pending = conversation.pending_approvals(&agent_id, Some(&conv_id)).await.unwrap_or_default();
                    let results = self.resolve_approvals(channel, tool_runner, &agent_id, pending).await;
                    match conversation.submit_tool_results(&agent_id, &conv_id, &results).await {
                        Ok(stream) => {
                            next = FirstStep::Resumed(stream);
                            continue;
                        }
                        Err(_) => break stop_reason_label(StopReason::Error),
                    }
                }
                Some(other) => break stop_reason_label(other),
                None => break "cancelled".to_string(),
            }
        };

        *self.last_stop_reason.lock().await = Some(final_stop.clone());
        let duration_ms = start.elapsed().as_millis() as u64;
        let _ = self
            .emit(
                channel,
                OutboundEvent::TurnResult {
                    subtype: final_stop.clone(),
                    agent_id,
                    conversation_id: conversation_id.take().unwrap_or_default(),
                    duration_ms,
                    duration_api_ms: duration_ms,
                    num_turns,
                    result: None,
                    run_ids,
                    usage: None,
                    stop_reason: Some(final_stop.clone()),
                },
            )
            .await;
        let _ = self.emit(channel, OutboundEvent::Result { success: final_stop == "end_turn", stop_reason: Some(final_stop) }).await;
    }
}

fn to_approval(classified: &ClassifiedRequest) -> Approval {
    Approval {
        tool_call_id: classified.request.tool_call_id.clone(),
        tool_name: classified.request.tool_name.clone().unwrap_or_default(),
        args: serde_json::to_value(&classified.args).unwrap_or(Value::Null),
    }
}

fn control_response_to_decision(payload: ControlResponsePayload, approval: Approval) -> ExecutorDecision {
    match payload {
        ControlResponsePayload::Success { response, .. } => {
            let allow = response
                .as_ref()
                .and_then(|v| v.get("behavior"))
                .and_then(Value::as_str)
                .map(|behavior| behavior == "allow")
                .unwrap_or(true);
            if allow {
                ExecutorDecision::Approve(approval)
            } else {
                let reason = response
                    .as_ref()
                    .and_then(|v| v.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("denied by user")
                    .to_string();
                ExecutorDecision::Deny { approval, reason }
            }
        }
        ControlResponsePayload::Error { error, .. } => ExecutorDecision::Deny { approval, reason: error.unwrap_or_else(|| "denied".to_string()) },
    }
}

fn merge_queued_turns(items: &[QueueItem]) -> Option<QueuedTurn> {
    let parsed: Vec<QueuedTurn> = items
        .iter()
        .filter(|item| item.kind == QueueItemKind::Message)
        .filter_map(|item| serde_json::from_str::<QueuedTurn>(&item.content).ok())
        .collect();
    let first = parsed.first()?;
    let agent_id = first.agent_id.clone();
    let conversation_id = parsed.iter().find_map(|t| t.conversation_id.clone());
    let messages = parsed.into_iter().flat_map(|t| t.messages).collect();
    Some(QueuedTurn { agent_id, conversation_id, messages })
}

fn queue_item_to_json(item: &QueueItem) -> Value {
    serde_json::json!({
        "id": item.id,
        "kind": queue_item_kind_label(item.kind),
        "source": queue_item_source_label(item.source),
        "content": item.content,
        "enqueued_at": item.enqueued_at,
    })
}

fn queue_item_snapshot(item: &QueueItem) -> QueueSnapshotItem {
    QueueSnapshotItem {
        id: item.id,
        kind: queue_item_kind_label(item.kind).to_string(),
        source: queue_item_source_label(item.source).to_string(),
        content: item.content.clone(),
        enqueued_at: item.enqueued_at,
    }
}

fn queue_item_kind_label(kind: QueueItemKind) -> &'static str {
    match kind {
        QueueItemKind::Message => "message",
        QueueItemKind::Approval => "approval",
    }
}

fn queue_item_source_label(source: QueueItemSource) -> &'static str {
    match source {
        QueueItemSource::User => "user",
        QueueItemSource::System => "system",
    }
}

fn parse_mode(mode: &str) -> Option<PermissionMode> {
    match mode {
        "default" => Some(PermissionMode::Default),
        "acceptEdits" => Some(PermissionMode::AcceptEdits),
        "plan" => Some(PermissionMode::Plan),
        "bypassPermissions" => Some(PermissionMode::BypassPermissions),
        _ => None,
    }
}

fn mode_label(mode: PermissionMode) -> &'static str {
    match mode {
        PermissionMode::Default => "default",
        PermissionMode::AcceptEdits => "acceptEdits",
        PermissionMode::Plan => "plan",
        PermissionMode::BypassPermissions => "bypassPermissions",
    }
}

fn stop_reason_label(reason: StopReason) -> String {
    match reason {
        StopReason::EndTurn => "end_turn".to_string(),
        StopReason::RequiresApproval => "requires_approval".to_string(),
        StopReason::Error => "error".to_string(),
        StopReason::Cancelled => "cancelled".to_string(),
    }
}

fn classify_socket_error(reason: &str) -> ListenerError {
    if reason.contains("1008") {
        ListenerError::EnvironmentNotFound
    } else {
        ListenerError::Socket(reason.to_string())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::config::EnvConfig;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    struct FakeChannel {
        outbox: StdMutex<Vec<Value>>,
        inbox: Mutex<mpsc::UnboundedReceiver<Value>>,
    }

    #[async_trait]
    impl ControlChannel for FakeChannel {
        async fn send(&self, frame: Value) -> std::result::Result<(), ListenerError> {
            self.outbox.lock().unwrap().push(frame);
            Ok(())
        }

        async fn recv(&self) -> Option<std::result::Result<Value, String>> {
            self.inbox.lock().await.recv().await.map(Ok)
        }

        async fn close(&self) {}
    }

    struct EchoStream {
        sent: bool,
    }

    #[async_trait]
    impl ConversationStream for EchoStream {
        async fn next_chunk(&mut self) -> Option<crate::conversation::StreamChunk> {
            if self.sent {
                return None;
            }
            self.sent = true;
            Some(crate::conversation::StreamChunk {
                run_id: Some("run-1".to_string()),
                payload: serde_json::json!({"text": "hello"}),
                is_error: false,
                stop_reason: Some(StopReason::EndTurn),
            })
        }
    }

    struct FakeConversation;

    #[async_trait]
    impl ConversationService for FakeConversation {
        async fn open_stream(
            &self,
            _agent_id: &str,
            _conversation_id: Option<&str>,
            _messages: &[Value],
        ) -> std::result::Result<Box<dyn ConversationStream>, PreStreamError> {
            Ok(Box::new(EchoStream { sent: false }))
        }

        async fn submit_tool_results(
            &self,
            _agent_id: &str,
            _conversation_id: &str,
            _results: &[ToolResult],
        ) -> std::result::Result<Box<dyn ConversationStream>, PreStreamError> {
            Ok(Box::new(EchoStream { sent: false }))
        }

        async fn pending_approvals(&self, _agent_id: &str, _conversation_id: Option<&str>) -> Result<Vec<PendingApproval>> {
            Ok(vec![])
        }
    }

    struct NoopRunner;

    #[async_trait]
    impl ToolRunner for NoopRunner {
        async fn run(&self, _tool_name: &str, _args: &Value) -> std::result::Result<Value, String> {
            Ok(Value::Null)
        }
    }

    fn runtime() -> Arc<ListenerRuntime> {
        let config = RuntimeConfig::new(PathBuf::from("/tmp/work"), PermissionMode::Default, EnvConfig::default());
        ListenerRuntime::new("sess-1", config)
    }

    #[tokio::test]
    async fn simple_turn_ends_with_a_result_event() {
        let runtime = runtime();
        let (_tx, rx) = mpsc::unbounded_channel();
        let fake = Arc::new(FakeChannel { outbox: StdMutex::new(vec![]), inbox: Mutex::new(rx) });
        let channel: Arc<dyn ControlChannel> = fake.clone();
        let conversation: Arc<dyn ConversationService> = Arc::new(FakeConversation);
        let tool_runner: Arc<dyn ToolRunner> = Arc::new(NoopRunner);

        let frame: InboundFrame = serde_json::from_value(serde_json::json!({
            "type": "message",
            "agentId": "agent-1",
            "conversationId": "conv-1",
            "messages": [{"role": "user", "content": "hi"}],
            "supportsControlResponse": true,
        }))
        .unwrap();

        runtime
            .clone()
            .handle_frame(frame, channel, conversation, tool_runner)
            .await
            .unwrap();

        // give the spawned drain task a chance to run to completion.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outbox = fake.outbox.lock().unwrap().clone();
        assert!(outbox.iter().any(|v| v["type"] == "queue_item_enqueued"));
        assert!(outbox.iter().any(|v| v["type"] == "result" && v["success"] == true));
        assert_eq!(*runtime.last_stop_reason.lock().await, Some("end_turn".to_string()));
        assert!(!runtime.is_processing.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn run_connected_announces_current_mode_on_open() {
        let runtime = runtime();
        let (_tx, rx) = mpsc::unbounded_channel();
        let fake = Arc::new(FakeChannel { outbox: StdMutex::new(vec![]), inbox: Mutex::new(rx) });
        let channel: Arc<dyn ControlChannel> = fake.clone();
        let conversation: Arc<dyn ConversationService> = Arc::new(FakeConversation);
        let tool_runner: Arc<dyn ToolRunner> = Arc::new(NoopRunner);

        // dropping `_tx` makes `channel.recv()` return `None` immediately,
        // so `run_connected` exits right after announcing the open-time mode.
        drop(_tx);
        runtime.clone().run_connected(channel, conversation, tool_runner).await.unwrap();

        let outbox = fake.outbox.lock().unwrap().clone();
        assert_eq!(outbox[0]["type"], "mode_changed");
        assert_eq!(outbox[0]["mode"], "default");
        let last = outbox.last().expect("at least the open/close events");
        assert_eq!(last["type"], "queue_cleared");
        assert_eq!(last["reason"], "shutdown");
    }

    #[tokio::test]
    async fn mode_change_updates_controller_and_acks() {
        let runtime = runtime();
        let (_tx, rx) = mpsc::unbounded_channel();
        let channel = FakeChannel { outbox: StdMutex::new(vec![]), inbox: Mutex::new(rx) };

        runtime.handle_mode_change(&channel, "plan").await.unwrap();
        assert_eq!(runtime.mode.lock().await.mode(), PermissionMode::Plan);
        let outbox = channel.outbox.lock().unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0]["type"], "mode_changed");
        assert_eq!(outbox[0]["success"], true);
    }

    #[tokio::test]
    async fn message_for_a_different_agent_is_rejected_without_enqueueing() {
        let config = RuntimeConfig::new(PathBuf::from("/tmp/work"), PermissionMode::Default, EnvConfig::default())
            .with_agent_id("agent-1");
        let runtime = ListenerRuntime::new("sess-1", config);
        let (_tx, rx) = mpsc::unbounded_channel();
        let fake = Arc::new(FakeChannel { outbox: StdMutex::new(vec![]), inbox: Mutex::new(rx) });
        let channel: Arc<dyn ControlChannel> = fake.clone();
        let conversation: Arc<dyn ConversationService> = Arc::new(FakeConversation);
        let tool_runner: Arc<dyn ToolRunner> = Arc::new(NoopRunner);

        let frame: InboundFrame = serde_json::from_value(serde_json::json!({
            "type": "message",
            "agentId": "agent-2",
            "conversationId": "conv-1",
            "messages": [{"role": "user", "content": "hi"}],
            "supportsControlResponse": true,
        }))
        .unwrap();

        runtime.clone().handle_frame(frame, channel, conversation, tool_runner).await.unwrap();

        let outbox = fake.outbox.lock().unwrap().clone();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0]["type"], "error");
        assert!(outbox[0]["message"].as_str().unwrap().contains("agent-2"));
        assert!(runtime.queue.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_mode_reports_failure_without_changing_state() {
        let runtime = runtime();
        let (_tx, rx) = mpsc::unbounded_channel();
        let channel = FakeChannel { outbox: StdMutex::new(vec![]), inbox: Mutex::new(rx) };

        runtime.handle_mode_change(&channel, "not-a-mode").await.unwrap();
        assert_eq!(runtime.mode.lock().await.mode(), PermissionMode::Default);
        let outbox = channel.outbox.lock().unwrap();
        assert_eq!(outbox[0]["success"], false);
    }

    #[tokio::test]
    async fn inbound_status_updates_last_stop_reason_when_idle() {
        let runtime = runtime();
        let (_tx, rx) = mpsc::unbounded_channel();
        let channel: Arc<dyn ControlChannel> = Arc::new(FakeChannel { outbox: StdMutex::new(vec![]), inbox: Mutex::new(rx) });
        let conversation: Arc<dyn ConversationService> = Arc::new(FakeConversation);
        let tool_runner: Arc<dyn ToolRunner> = Arc::new(NoopRunner);

        let frame = InboundFrame::Status {
            current_mode: "default".to_string(),
            last_stop_reason: Some("end_turn".to_string()),
            is_processing: false,
        };
        runtime.clone().handle_frame(frame, channel, conversation, tool_runner).await.unwrap();
        assert_eq!(runtime.last_stop_reason.lock().await.as_deref(), Some("end_turn"));
    }

    #[tokio::test]
    async fn inbound_status_ignored_while_processing() {
        let runtime = runtime();
        runtime.is_processing.store(true, Ordering::SeqCst);
        let (_tx, rx) = mpsc::unbounded_channel();
        let channel: Arc<dyn ControlChannel> = Arc::new(FakeChannel { outbox: StdMutex::new(vec![]), inbox: Mutex::new(rx) });
        let conversation: Arc<dyn ConversationService> = Arc::new(FakeConversation);
        let tool_runner: Arc<dyn ToolRunner> = Arc::new(NoopRunner);

        let frame = InboundFrame::Status {
            current_mode: "default".to_string(),
            last_stop_reason: Some("end_turn".to_string()),
            is_processing: false,
        };
        runtime.clone().handle_frame(frame, channel, conversation, tool_runner).await.unwrap();
        assert!(runtime.last_stop_reason.lock().await.is_none());
    }

    #[test]
    fn merge_queued_turns_concatenates_messages_in_order() {
        let items = vec![
            QueueItem {
                id: 0,
                kind: QueueItemKind::Message,
                source: QueueItemSource::User,
                content: serde_json::to_string(&QueuedTurn {
                    agent_id: "agent-1".to_string(),
                    conversation_id: Some("conv-1".to_string()),
                    messages: vec![serde_json::json!("a")],
                })
                .unwrap(),
                enqueued_at: Utc::now(),
            },
            QueueItem {
                id: 1,
                kind: QueueItemKind::Message,
                source: QueueItemSource::User,
                content: serde_json::to_string(&QueuedTurn { agent_id: "agent-1".to_string(), conversation_id: None, messages: vec![serde_json::json!("b")] })
                    .unwrap(),
                enqueued_at: Utc::now(),
            },
        ];
        let merged = merge_queued_turns(&items).unwrap();
        assert_eq!(merged.messages, vec![serde_json::json!("a"), serde_json::json!("b")]);
        assert_eq!(merged.conversation_id.as_deref(), Some("conv-1"));
    }
}
