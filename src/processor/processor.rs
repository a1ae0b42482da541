//! 任务派发与执行
//!
//! 每条路径都先拿监视器预算槽位（`TaskSlot` drop 即归还），再按优先级选择：
//! 1. 主 Agent 空闲：直接在主 Agent 上执行，保持 Provider 侧会话连续
//! 2. 主 Agent 忙：尝试转向，把新内容注入进行中的轮次
//! 3. 转向不支持或被拒：新建一次性 Agent 并行执行，用完即销毁
//! 4. 无法新建：进入主队列并报告位置；队列满则报 QueueFull
//!
//! 每次轮次结束后排空主队列，`processing` 标志保证同一时刻只有一个排空过程。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::cache::{Fingerprint, ReloadCache};
use crate::core::{BudgetError, OrchestratorError, ProviderError};
use crate::memory::{ContextTape, InteractionTimeline, TapeMessage, TapeRole, TapeSource, UserInteraction};
use crate::policy::{CloseDecision, MainQueuePolicy, MonitorBudgetPolicy, TaskSlot, WindowConnectionPolicy};
use crate::pool::{AgentPool, PoolStats, PooledAgent, Role};
use crate::provider::{ActionKind, MessageOptions, SessionEvent, SteerOutcome, UiAction};
use crate::windows::{ApplyOutcome, WindowRegistry, WindowStore};

use super::prompt::{build_prompt, PromptParts};
use super::Task;

const SESSION_EVENT_BUFFER: usize = 64;
const REPLAY_AGENT: &str = "reload-cache";

/// 处理器推送给连接的事件
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorEvent {
    AgentResponse {
        message_id: String,
        agent: String,
        content: String,
    },
    Actions {
        message_id: String,
        agent: String,
        actions: Vec<UiAction>,
    },
    Queued {
        message_id: String,
        position: usize,
    },
    QueueFull {
        message_id: String,
        max: usize,
    },
    Steered {
        message_id: String,
    },
    Error {
        message_id: String,
        message: String,
    },
    CacheReplayed {
        entry_id: String,
        actions: Vec<UiAction>,
    },
    /// 窗口解锁后按序重放的积压动作
    WindowActionsReplayed {
        window_id: String,
        actions: Vec<UiAction>,
    },
}

/// 任务最终走的路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Main,
    Steered,
    Ephemeral,
    Queued(usize),
    Window,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// prompt 中附带的回放缓存提示条数
    pub cache_hint_limit: usize,
    /// 主 Agent prompt 中附带的最近主线程消息条数
    pub history_limit: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            cache_hint_limit: 3,
            history_limit: 20,
        }
    }
}

/// 构建处理器所需的全部组件（由连接上下文持有并注入）
pub struct ProcessorParts {
    pub pool: AgentPool,
    pub budget: MonitorBudgetPolicy,
    pub registry: Arc<WindowRegistry>,
    pub cache: Arc<ReloadCache>,
    pub queue: MainQueuePolicy,
    pub tape: ContextTape,
    pub timeline: InteractionTimeline,
    pub windows: WindowConnectionPolicy,
    pub config: ProcessorConfig,
}

#[derive(Debug, Clone)]
enum Turn {
    Main,
    Ephemeral,
    Window(String),
}

impl Turn {
    fn tape_source(&self) -> Option<TapeSource> {
        match self {
            Turn::Main => Some(TapeSource::Main),
            Turn::Ephemeral => None,
            Turn::Window(id) => Some(TapeSource::Window(id.clone())),
        }
    }
}

#[derive(Debug, Default)]
struct TurnOutput {
    text: String,
    actions: Vec<UiAction>,
    session_id: Option<String>,
    error: Option<String>,
    budget_interrupted: bool,
    /// 本轮由 Agent 动作关闭的窗口
    closed: Vec<String>,
}

struct ProcessorState {
    queue: MainQueuePolicy,
    timeline: InteractionTimeline,
    tape: ContextTape,
    windows: WindowConnectionPolicy,
    /// 监视器 -> 正占用主 Agent 的角色
    main_busy: HashMap<String, Role>,
    /// 监视器 -> 上次主 Agent 轮次的 Provider 会话 ID
    resume: HashMap<String, String>,
    processing: bool,
}

struct ProcessorInner {
    pool: AgentPool,
    budget: MonitorBudgetPolicy,
    registry: Arc<WindowRegistry>,
    cache: Arc<ReloadCache>,
    config: ProcessorConfig,
    state: Mutex<ProcessorState>,
    events: mpsc::UnboundedSender<ProcessorEvent>,
    shutting_down: AtomicBool,
}

/// 任务处理器（可廉价克隆，内部共享）
#[derive(Clone)]
pub struct TaskProcessor {
    inner: Arc<ProcessorInner>,
}

impl TaskProcessor {
    pub fn new(parts: ProcessorParts) -> (Self, mpsc::UnboundedReceiver<ProcessorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let processor = Self {
            inner: Arc::new(ProcessorInner {
                pool: parts.pool,
                budget: parts.budget,
                registry: parts.registry,
                cache: parts.cache,
                config: parts.config,
                state: Mutex::new(ProcessorState {
                    queue: parts.queue,
                    timeline: parts.timeline,
                    tape: parts.tape,
                    windows: parts.windows,
                    main_busy: HashMap::new(),
                    resume: HashMap::new(),
                    processing: false,
                }),
                events,
                shutting_down: AtomicBool::new(false),
            }),
        };
        (processor, rx)
    }

    fn state(&self) -> MutexGuard<'_, ProcessorState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ProcessorEvent) {
        // 连接已断开时事件无人接收，丢弃即可
        let _ = self.inner.events.send(event);
    }

    fn emit_error(&self, message_id: &str, message: impl Into<String>) {
        self.emit(ProcessorEvent::Error {
            message_id: message_id.to_string(),
            message: message.into(),
        });
    }

    fn ensure_running(&self) -> Result<(), OrchestratorError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        Ok(())
    }

    async fn acquire_slot(&self, task: &Task) -> Result<TaskSlot, OrchestratorError> {
        match self.inner.budget.acquire_task_slot(&task.monitor_id).await {
            Ok(slot) => Ok(slot),
            Err(e) => {
                tracing::warn!(monitor_id = %task.monitor_id, message_id = %task.message_id, "Budget slot unavailable: {}", e);
                self.emit_error(&task.message_id, e.to_string());
                Err(e.into())
            }
        }
    }

    /// 记录一条客户端上报的用户交互
    pub fn record_interaction(&self, interaction: &UserInteraction) {
        self.state().timeline.push_user(interaction);
    }

    /// 派发一个主线程任务
    pub async fn queue_main_task(&self, task: Task) -> Result<DispatchOutcome, OrchestratorError> {
        self.ensure_running()?;
        let slot = self.acquire_slot(&task).await?;
        {
            let mut state = self.state();
            for interaction in &task.interactions {
                state.timeline.push_user(interaction);
            }
        }
        let outcome = self.dispatch(task, slot).await;
        self.drain_queue().await;
        outcome
    }

    async fn dispatch(&self, task: Task, slot: TaskSlot) -> Result<DispatchOutcome, OrchestratorError> {
        let main_role = Role::main(&task.monitor_id, &task.message_id);

        if self.reserve_main(&task.monitor_id, &main_role) {
            match self.inner.pool.acquire(main_role.clone()).await {
                Some(agent) => {
                    let result = self.run_on(&agent, &main_role, &task, Turn::Main).await;
                    self.inner.pool.release(&agent);
                    self.unreserve_main(&task.monitor_id);
                    drop(slot);
                    return result.map(|_| DispatchOutcome::Main);
                }
                None => {
                    self.unreserve_main(&task.monitor_id);
                    tracing::debug!(monitor_id = %task.monitor_id, "No agent for main role");
                }
            }
        } else if self.try_steer(&task).await {
            return Ok(DispatchOutcome::Steered);
        }

        let role = Role::ephemeral(&task.message_id);
        if let Some(agent) = self.inner.pool.create_for(role.clone()).await {
            let result = self.run_on(&agent, &role, &task, Turn::Ephemeral).await;
            self.inner.pool.dispose(agent.id).await;
            drop(slot);
            return result.map(|_| DispatchOutcome::Ephemeral);
        }

        drop(slot);
        self.enqueue(task)
    }

    fn reserve_main(&self, monitor_id: &str, role: &Role) -> bool {
        let mut state = self.state();
        if state.main_busy.contains_key(monitor_id) {
            return false;
        }
        state.main_busy.insert(monitor_id.to_string(), role.clone());
        true
    }

    fn unreserve_main(&self, monitor_id: &str) {
        self.state().main_busy.remove(monitor_id);
    }

    /// 向忙碌的主 Agent 注入内容；只有 Accepted 算成功
    async fn try_steer(&self, task: &Task) -> bool {
        let busy_role = self.state().main_busy.get(&task.monitor_id).cloned();
        let Some(agent) = busy_role.and_then(|role| self.inner.pool.get_by_role(&role)) else {
            return false;
        };
        match agent.session().steer(&task.content).await {
            Ok(SteerOutcome::Accepted) => {
                self.state()
                    .tape
                    .append(TapeRole::User, task.content.clone(), TapeSource::Main);
                tracing::info!(agent_id = agent.id, message_id = %task.message_id, "Task steered into running turn");
                self.emit(ProcessorEvent::Steered {
                    message_id: task.message_id.clone(),
                });
                true
            }
            Ok(outcome) => {
                tracing::debug!(?outcome, message_id = %task.message_id, "Steer not accepted, using ephemeral agent");
                false
            }
            Err(e) => {
                tracing::warn!(agent_id = agent.id, "Steer failed: {}", e);
                false
            }
        }
    }

    fn enqueue(&self, task: Task) -> Result<DispatchOutcome, OrchestratorError> {
        let message_id = task.message_id.clone();
        let result = self.state().queue.enqueue(task);
        match result {
            Ok(position) => {
                tracing::info!(message_id = %message_id, position, "Task queued for main agent");
                self.emit(ProcessorEvent::Queued {
                    message_id,
                    position,
                });
                Ok(DispatchOutcome::Queued(position))
            }
            Err(e) => {
                if let OrchestratorError::QueueFull { max } = &e {
                    self.emit(ProcessorEvent::QueueFull {
                        message_id,
                        max: *max,
                    });
                }
                Err(e)
            }
        }
    }

    /// 按 FIFO 把排队任务交给空闲的主 Agent；队首的监视器仍忙时停下，等它的轮次结束再排空
    async fn drain_queue(&self) {
        {
            let mut state = self.state();
            if state.processing || state.queue.is_empty() {
                return;
            }
            state.processing = true;
        }

        loop {
            let next = {
                let mut state = self.state();
                let ready = state
                    .queue
                    .peek()
                    .is_some_and(|t| !state.main_busy.contains_key(&t.monitor_id));
                if !ready {
                    state.processing = false;
                    return;
                }
                let task = state.queue.dequeue();
                if let Some(task) = &task {
                    state.main_busy.insert(
                        task.monitor_id.clone(),
                        Role::main(&task.monitor_id, &task.message_id),
                    );
                }
                task
            };
            let Some(task) = next else {
                self.state().processing = false;
                return;
            };

            let role = Role::main(&task.monitor_id, &task.message_id);
            let slot = match self.acquire_slot(&task).await {
                Ok(slot) => slot,
                Err(_) => {
                    self.unreserve_main(&task.monitor_id);
                    continue;
                }
            };
            let Some(agent) = self.inner.pool.acquire(role.clone()).await else {
                let mut state = self.state();
                state.main_busy.remove(&task.monitor_id);
                state.queue.requeue_front(task);
                state.processing = false;
                return;
            };

            tracing::info!(message_id = %task.message_id, agent_id = agent.id, "Dequeued task dispatched to main agent");
            if let Err(e) = self.run_on(&agent, &role, &task, Turn::Main).await {
                tracing::debug!(message_id = %task.message_id, "Queued task failed: {}", e);
            }
            self.inner.pool.release(&agent);
            self.unreserve_main(&task.monitor_id);
            drop(slot);
        }
    }

    /// 在指定 Agent 上跑一个轮次：构建 prompt，消费事件流，记录结果
    async fn run_on(
        &self,
        agent: &Arc<PooledAgent>,
        role: &Role,
        task: &Task,
        turn: Turn,
    ) -> Result<(), OrchestratorError> {
        let open_windows = self.inner.registry.window_ids();
        let fingerprint = Fingerprint::new(&task.content, &open_windows);
        let hints = self
            .inner
            .cache
            .find_matches(&fingerprint, self.inner.config.cache_hint_limit);

        let (history, timeline, resume_session_id) = {
            let mut state = self.state();
            let context = match &turn {
                Turn::Main => {
                    let main = state.tape.messages(false);
                    let skip = main.len().saturating_sub(self.inner.config.history_limit);
                    let history: Vec<TapeMessage> = main.into_iter().skip(skip).cloned().collect();
                    let timeline = state.timeline.drain();
                    (history, timeline, state.resume.get(&task.monitor_id).cloned())
                }
                Turn::Ephemeral => (Vec::new(), Vec::new(), None),
                Turn::Window(id) => {
                    let history = state.tape.window_messages(id).into_iter().cloned().collect();
                    (history, Vec::new(), None)
                }
            };
            if let Some(source) = turn.tape_source() {
                state.tape.append(TapeRole::User, task.content.clone(), source);
            }
            context
        };

        let prompt = build_prompt(&PromptParts {
            history: &history,
            timeline: &timeline,
            open_windows: &open_windows,
            cache_hints: &hints,
            content: &task.content,
        });
        let options = MessageOptions {
            role: role.clone(),
            monitor_id: task.monitor_id.clone(),
            interactions: task.interactions.clone(),
            resume_session_id,
        };

        tracing::info!(agent_id = agent.id, role = %role, message_id = %task.message_id, "Running task");
        let (tx, rx) = mpsc::channel(SESSION_EVENT_BUFFER);
        let session = Arc::clone(agent.session());
        let (result, output) = tokio::join!(
            session.handle_message(&prompt, options, tx),
            self.consume_events(rx, role, &task.monitor_id, &turn),
        );

        for window_id in &output.closed {
            self.settle_closed_window(window_id, Some(role)).await;
        }
        if output.budget_interrupted {
            self.emit_error(&task.message_id, "Output budget exceeded, agent interrupted");
        }
        match result {
            Ok(()) => {}
            Err(ProviderError::Interrupted) if output.budget_interrupted => {}
            Err(e) => {
                tracing::warn!(agent_id = agent.id, role = %role, message_id = %task.message_id, "Task failed: {}", e);
                self.emit_error(&task.message_id, e.to_string());
                return Err(e.into());
            }
        }
        if let Some(message) = &output.error {
            self.emit_error(&task.message_id, message.clone());
        }

        self.record_turn(task, role, &turn, fingerprint, &open_windows, output);
        Ok(())
    }

    async fn consume_events(
        &self,
        mut rx: mpsc::Receiver<SessionEvent>,
        role: &Role,
        monitor_id: &str,
        turn: &Turn,
    ) -> TurnOutput {
        let agent_label = role.to_string();
        let mut output = TurnOutput::default();
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Text(text) => {
                    self.inner.budget.record_output(monitor_id, text.len());
                    output.text.push_str(&text);
                    if !output.budget_interrupted && !self.inner.budget.check_output_budget(monitor_id) {
                        tracing::warn!(monitor_id, role = %role, "Output budget exceeded, interrupting agent");
                        output.budget_interrupted = true;
                        self.inner.pool.interrupt_by_role(role).await;
                    }
                }
                SessionEvent::Thinking(text) => {
                    self.inner.budget.record_output(monitor_id, text.len());
                }
                SessionEvent::Actions(actions) => {
                    self.apply_actions(actions, &agent_label, monitor_id, turn, &mut output);
                }
                SessionEvent::SessionId(id) => output.session_id = Some(id),
                SessionEvent::Complete => {}
                SessionEvent::Error(message) => {
                    tracing::warn!(role = %role, "Session reported error: {}", message);
                    output.error = Some(message);
                }
            }
        }
        output
    }

    fn apply_actions(
        &self,
        actions: Vec<UiAction>,
        agent_label: &str,
        monitor_id: &str,
        turn: &Turn,
        output: &mut TurnOutput,
    ) {
        for action in actions {
            if action.kind() == ActionKind::CacheReplay {
                // 被重放的动作各自计入预算
                match action.param_str("id") {
                    Some(entry_id) => {
                        if let Err(e) = self.replay_entry(entry_id, monitor_id, &mut output.closed) {
                            tracing::warn!(entry_id, "Cache replay requested by agent failed: {}", e);
                        }
                    }
                    None => tracing::debug!(agent = agent_label, "cache.replay action without id ignored"),
                }
                continue;
            }
            if !self.inner.budget.check_action_budget(monitor_id) {
                tracing::warn!(monitor_id, action = %action.action_type, "Action budget exhausted, dropping action");
                continue;
            }
            self.inner.budget.record_action(monitor_id);
            match self.inner.registry.apply_action(&action, agent_label) {
                ApplyOutcome::Created(id) => {
                    // 窗口 Agent 派生的窗口与来源窗口共享该 Agent
                    if let Turn::Window(parent) = turn {
                        self.state().windows.connect_window(parent, &id);
                    }
                }
                ApplyOutcome::Missing(id) => {
                    tracing::debug!(window_id = %id, action = %action.action_type, "Action target window missing");
                }
                ApplyOutcome::Queued(position) => {
                    tracing::debug!(position, action = %action.action_type, "Action queued behind window lock");
                }
                ApplyOutcome::Closed(id) => output.closed.push(id),
                ApplyOutcome::Applied => {}
            }
            output.actions.push(action);
        }
    }

    fn record_turn(
        &self,
        task: &Task,
        role: &Role,
        turn: &Turn,
        fingerprint: Fingerprint,
        open_windows: &[String],
        output: TurnOutput,
    ) {
        let agent_label = role.to_string();
        {
            let mut state = self.state();
            if let (Turn::Main, Some(id)) = (turn, &output.session_id) {
                state.resume.insert(task.monitor_id.clone(), id.clone());
            }
            if let Some(source) = turn.tape_source() {
                if !output.text.is_empty() {
                    state.tape.append(TapeRole::Assistant, output.text.clone(), source);
                }
            }
            state.timeline.push_ai(&output.actions, &agent_label);
        }

        if !output.actions.is_empty() && output.error.is_none() && !output.budget_interrupted {
            let mut required: Vec<String> = output
                .actions
                .iter()
                .filter(|a| a.kind() != ActionKind::Create)
                .filter_map(|a| a.window_id.clone())
                .filter(|id| open_windows.contains(id) && !output.closed.contains(id))
                .collect();
            required.sort();
            required.dedup();
            self.inner
                .cache
                .record(fingerprint, output.actions.clone(), task.label(), required);
        }

        if !output.text.is_empty() {
            self.emit(ProcessorEvent::AgentResponse {
                message_id: task.message_id.clone(),
                agent: agent_label.clone(),
                content: output.text,
            });
        }
        if !output.actions.is_empty() {
            self.emit(ProcessorEvent::Actions {
                message_id: task.message_id.clone(),
                agent: agent_label,
                actions: output.actions,
            });
        }
    }

    /// 由窗口所在组的 Agent 处理窗口内发起的任务
    pub async fn process_window_task(
        &self,
        window_id: &str,
        task: Task,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        self.ensure_running()?;
        if !self.inner.registry.has_window(window_id) {
            return Err(OrchestratorError::WindowNotFound(window_id.to_string()));
        }
        let slot = self.acquire_slot(&task).await?;
        let role = Role::window(self.state().windows.agent_key(window_id));

        let Some(agent) = self.inner.pool.acquire(role.clone()).await else {
            drop(slot);
            if let Some(busy) = self.inner.pool.get_by_role(&role) {
                if let Ok(SteerOutcome::Accepted) = busy.session().steer(&task.content).await {
                    self.state().tape.append(
                        TapeRole::User,
                        task.content.clone(),
                        TapeSource::Window(window_id.to_string()),
                    );
                    self.emit(ProcessorEvent::Steered {
                        message_id: task.message_id.clone(),
                    });
                    return Ok(DispatchOutcome::Steered);
                }
            }
            tracing::warn!(window_id, role = %role, "No agent available for window task");
            self.emit_error(&task.message_id, format!("No agent available for {}", role));
            return Err(OrchestratorError::AgentUnavailable(role.to_string()));
        };

        // 轮次期间其他 Agent 对该窗口的组件动作排队，结束后按序重放
        let label = role.to_string();
        let locked = match self.inner.registry.lock(window_id, &label) {
            Ok(locked) => locked,
            Err(e) => {
                self.inner.pool.release(&agent);
                drop(slot);
                self.emit_error(&task.message_id, e.to_string());
                return Err(e);
            }
        };
        if !locked {
            tracing::debug!(window_id, role = %role, "Window held by another agent, running unlocked");
        }

        let result = self
            .run_on(&agent, &role, &task, Turn::Window(window_id.to_string()))
            .await;
        if locked {
            let replayed = self.inner.registry.unlock(window_id, &label);
            if !replayed.is_empty() {
                self.emit(ProcessorEvent::WindowActionsReplayed {
                    window_id: window_id.to_string(),
                    actions: replayed,
                });
            }
        }
        self.inner.pool.release(&agent);
        drop(slot);
        self.drain_queue().await;
        result.map(|_| DispatchOutcome::Window)
    }

    /// 用户关闭窗口：从注册表移除后与 Agent 关窗走同一套收尾
    pub async fn handle_window_closed(&self, window_id: &str) -> CloseDecision {
        self.inner.registry.close_window(window_id);
        self.settle_closed_window(window_id, None).await
    }

    /// 窗口已从注册表移除：更新分组，必要时销毁其 Agent，并让依赖该窗口的缓存失效。
    /// `running` 为正在执行本轮的角色，它关掉自己的窗口时不在轮次中途销毁，轮次结束后照常归还
    async fn settle_closed_window(&self, window_id: &str, running: Option<&Role>) -> CloseDecision {
        let (decision, agent_key) = {
            let mut state = self.state();
            let agent_key = state.windows.agent_key(window_id);
            (state.windows.handle_close(window_id), agent_key)
        };
        let invalidated = self.inner.cache.invalidate_for_window(window_id);
        if decision.should_dispose_agent {
            let owner = Role::window(agent_key);
            if running == Some(&owner) {
                tracing::debug!(window_id, role = %owner, "Agent closed its own window, released after the turn");
            } else {
                self.inner.pool.dispose_by_role(&owner).await;
            }
        }
        tracing::info!(
            window_id,
            dispose = decision.should_dispose_agent,
            new_root = ?decision.new_root,
            invalidated,
            "Window closed"
        );
        decision
    }

    /// 不经 Provider 直接重放缓存的动作；所需窗口已不存在时记为失败并返回 false
    pub async fn replay_cached(&self, entry_id: &str, monitor_id: &str) -> Result<bool, OrchestratorError> {
        let mut closed = Vec::new();
        let replayed = self.replay_entry(entry_id, monitor_id, &mut closed)?;
        for window_id in &closed {
            self.settle_closed_window(window_id, None).await;
        }
        Ok(replayed)
    }

    /// 重放关闭的窗口追加到 `closed`，由调用方收尾
    fn replay_entry(&self, entry_id: &str, monitor_id: &str, closed: &mut Vec<String>) -> Result<bool, OrchestratorError> {
        self.ensure_running()?;
        let entry = self
            .inner
            .cache
            .get(entry_id)
            .ok_or_else(|| OrchestratorError::CacheEntryNotFound(entry_id.to_string()))?;

        let missing: Vec<&String> = entry
            .required_window_ids
            .iter()
            .filter(|id| !self.inner.registry.has_window(id))
            .collect();
        if !missing.is_empty() {
            tracing::info!(entry_id, ?missing, "Cached actions need windows that are gone");
            self.inner.cache.mark_failed(entry_id)?;
            return Ok(false);
        }

        let mut applied = Vec::with_capacity(entry.actions.len());
        for action in &entry.actions {
            if !self.record_monitor_action(monitor_id) {
                tracing::warn!(entry_id, monitor_id, "Action budget exhausted during replay");
                break;
            }
            if let ApplyOutcome::Closed(id) = self.inner.registry.apply_action(action, REPLAY_AGENT) {
                closed.push(id);
            }
            applied.push(action.clone());
        }
        self.inner.cache.mark_used(entry_id)?;
        self.state().timeline.push_ai(&applied, REPLAY_AGENT);
        tracing::info!(entry_id, actions = applied.len(), "Replayed cached actions");
        self.emit(ProcessorEvent::CacheReplayed {
            entry_id: entry_id.to_string(),
            actions: applied,
        });
        Ok(true)
    }

    /// 计入一次监视器动作；超出预算返回 false（不计入）
    pub fn record_monitor_action(&self, monitor_id: &str) -> bool {
        if !self.inner.budget.check_action_budget(monitor_id) {
            return false;
        }
        self.inner.budget.record_action(monitor_id);
        true
    }

    /// 手动关联窗口（客户端告知某窗口由另一窗口派生）
    pub fn connect_windows(&self, parent: &str, child: &str) {
        self.state().windows.connect_window(parent, child);
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub fn cache(&self) -> &Arc<ReloadCache> {
        &self.inner.cache
    }

    pub fn registry(&self) -> &Arc<WindowRegistry> {
        &self.inner.registry
    }

    pub fn budget(&self) -> &MonitorBudgetPolicy {
        &self.inner.budget
    }

    pub fn queue_len(&self) -> usize {
        self.state().queue.len()
    }

    /// 主线程对话记录（不含窗口线程）
    pub fn main_history(&self) -> Vec<TapeMessage> {
        self.state().tape.messages(false).into_iter().cloned().collect()
    }

    pub fn window_history(&self, window_id: &str) -> Vec<TapeMessage> {
        self.state().tape.window_messages(window_id).into_iter().cloned().collect()
    }

    pub fn pending_interactions(&self) -> usize {
        self.state().timeline.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// 拒绝等待中的槽位、丢弃排队任务、两阶段清理 Agent 池、写出缓存
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner
            .budget
            .clear_waiting(BudgetError::Rejected("shutting down".to_string()));
        let dropped = self.state().queue.clear();
        if dropped > 0 {
            tracing::info!(dropped, "Dropped queued tasks on shutdown");
        }
        self.inner.pool.cleanup().await;
        self.inner.cache.flush().await;
        tracing::info!("Task processor shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::policy::BudgetConfig;
    use crate::pool::{AgentLimiter, PoolConfig};
    use crate::provider::{ProviderKind, ScriptedSessionFactory};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn processor_with(factory: Arc<ScriptedSessionFactory>, max_agents: usize) -> (TaskProcessor, mpsc::UnboundedReceiver<ProcessorEvent>) {
        let pool = AgentPool::new(
            factory,
            AgentLimiter::new(16),
            PoolConfig {
                max_agents,
                idle_timeout: Duration::from_secs(300),
                system_prompt: "sys".into(),
            },
        );
        TaskProcessor::new(ProcessorParts {
            pool,
            budget: MonitorBudgetPolicy::new(BudgetConfig::default()),
            registry: Arc::new(WindowRegistry::new()),
            cache: Arc::new(ReloadCache::new(CacheConfig::default())),
            queue: MainQueuePolicy::new(1),
            tape: ContextTape::new(200),
            timeline: InteractionTimeline::new(),
            windows: WindowConnectionPolicy::new(),
            config: ProcessorConfig::default(),
        })
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<ProcessorEvent>) -> Vec<ProcessorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_idle_main_agent_runs_task() {
        let factory = Arc::new(ScriptedSessionFactory::new(ProviderKind::Claude));
        let (processor, mut rx) = processor_with(factory.clone(), 2);

        let task = Task::new("hello there", "main");
        let outcome = processor.queue_main_task(task.clone()).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Main);

        let events = drain_events(&mut rx);
        assert!(events.contains(&ProcessorEvent::AgentResponse {
            message_id: task.message_id.clone(),
            agent: format!("main-main-{}", task.message_id),
            content: "Echo: hello there".into(),
        }));
        let history = processor.main_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, TapeRole::Assistant);
        assert_eq!(processor.pool_stats().idle_agents, 1);
    }

    #[tokio::test]
    async fn test_resume_session_and_timeline_flow_into_next_prompt() {
        let factory = Arc::new(ScriptedSessionFactory::new(ProviderKind::Claude).with_responses([
            "done\n```json\n{\"type\": \"window.create\", \"windowId\": \"w1\", \"title\": \"Notes\"}\n```\n",
        ]));
        let (processor, _rx) = processor_with(factory.clone(), 2);

        processor.queue_main_task(Task::new("open notes", "main")).await.unwrap();
        assert!(processor.registry().has_window("w1"));
        processor.record_interaction(&UserInteraction::new("click", Some("w1")));
        processor.queue_main_task(Task::new("next", "main")).await.unwrap();

        let prompts = factory.prompts();
        assert!(prompts[1].contains("<conversation_history>"));
        assert!(prompts[1].contains("<recent_interactions>"));
        assert!(prompts[1].contains("<open_windows>w1</open_windows>"));
        assert_eq!(processor.pending_interactions(), 0);
    }

    #[tokio::test]
    async fn test_replay_with_missing_window_marks_failure() {
        let factory = Arc::new(ScriptedSessionFactory::new(ProviderKind::Claude));
        let (processor, mut rx) = processor_with(factory, 2);
        let id = processor.cache().record(
            Fingerprint::new("retitle", &["ghost"]),
            vec![UiAction::new("window.setTitle", Some("ghost")).with_param("title", "x")],
            "retitle",
            vec!["ghost".into()],
        );

        assert!(!processor.replay_cached(&id, "main").await.unwrap());
        assert_eq!(processor.cache().get(&id).unwrap().failure_count, 1);
        assert!(drain_events(&mut rx).is_empty());
        assert!(matches!(
            processor.replay_cached("cache-99", "main").await,
            Err(OrchestratorError::CacheEntryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_agent_close_settles_group_and_cache() {
        let factory = Arc::new(ScriptedSessionFactory::new(ProviderKind::Claude).with_responses([
            "```json\n{\"type\": \"window.create\", \"windowId\": \"w1\", \"title\": \"Notes\"}\n```\n",
            "```json\n{\"type\": \"window.setTitle\", \"windowId\": \"w1\", \"title\": \"Todo\"}\n```\n",
            "```json\n{\"type\": \"window.close\", \"windowId\": \"w1\"}\n```\n",
        ]));
        let (processor, _rx) = processor_with(factory, 2);

        processor.queue_main_task(Task::new("open notes", "main")).await.unwrap();
        processor.process_window_task("w1", Task::new("rename", "main")).await.unwrap();
        let renamed = processor
            .cache()
            .list_entries()
            .into_iter()
            .find(|e| e.label == "rename")
            .unwrap();
        assert_eq!(renamed.required_window_ids, vec!["w1".to_string()]);

        processor.process_window_task("w1", Task::new("close it", "main")).await.unwrap();
        assert!(!processor.registry().has_window("w1"));
        assert!(processor.cache().get(&renamed.id).is_none());
        // 关窗的是本轮 Agent 自己，它被归还而不是在轮次中途销毁
        assert_eq!(processor.pool_stats().total_agents, 1);
        assert_eq!(processor.pool_stats().idle_agents, 1);
        assert!(processor
            .cache()
            .list_entries()
            .iter()
            .all(|e| !e.required_window_ids.contains(&"w1".to_string())));
    }

    #[tokio::test]
    async fn test_main_agent_close_updates_window_group() {
        let factory = Arc::new(ScriptedSessionFactory::new(ProviderKind::Claude).with_responses([
            "```json\n{\"type\": \"window.create\", \"windowId\": \"w1\"}\n```\n```json\n{\"type\": \"window.create\", \"windowId\": \"w2\"}\n```\n",
            "```json\n{\"type\": \"window.close\", \"windowId\": \"w1\"}\n```\n",
        ]));
        let (processor, _rx) = processor_with(factory, 2);
        processor.queue_main_task(Task::new("open two", "main")).await.unwrap();
        processor.connect_windows("w1", "w2");

        processor.queue_main_task(Task::new("close the first", "main")).await.unwrap();
        assert!(!processor.registry().has_window("w1"));

        // w1 已从组中移除，w2 成为最后一个窗口
        let decision = processor.handle_window_closed("w2").await;
        assert!(decision.should_dispose_agent);
        assert!(decision.new_root.is_none());
    }

    #[tokio::test]
    async fn test_agent_emitted_cache_replay_runs_entry() {
        let factory = Arc::new(ScriptedSessionFactory::new(ProviderKind::Claude).with_responses([
            "```json\n{\"type\": \"window.create\", \"windowId\": \"w1\", \"title\": \"Notes\"}\n```\n",
            "Seen this before.\n```json\n{\"type\": \"cache.replay\", \"id\": \"cache-2\"}\n```\n",
        ]));
        let (processor, mut rx) = processor_with(factory, 2);
        processor.queue_main_task(Task::new("open notes", "main")).await.unwrap();
        let id = processor.cache().record(
            Fingerprint::new("retitle notes", &["w1"]),
            vec![UiAction::new("window.setTitle", Some("w1")).with_param("title", "Cached")],
            "retitle notes",
            vec!["w1".into()],
        );
        assert_eq!(id, "cache-2");
        drain_events(&mut rx);

        processor.queue_main_task(Task::new("retitle notes", "main")).await.unwrap();
        assert_eq!(processor.registry().get_window("w1").unwrap().title, "Cached");
        assert_eq!(processor.cache().get(&id).unwrap().use_count, 1);
        let events = drain_events(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ProcessorEvent::CacheReplayed { entry_id, .. } if *entry_id == id)));
        // replay 指令本身不作为 UI 动作下发
        assert!(!events.iter().any(|e| matches!(e, ProcessorEvent::Actions { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let gate = Arc::new(Notify::new());
        let factory = Arc::new(ScriptedSessionFactory::new(ProviderKind::Claude).with_gate(gate));
        let (processor, _rx) = processor_with(factory.clone(), 2);

        let running = processor.clone();
        let turn = tokio::spawn(async move { running.queue_main_task(Task::new("long", "main")).await });
        while !factory.log().contains(&"handle:0".to_string()) {
            tokio::task::yield_now().await;
        }

        processor.shutdown().await;
        // 池清理会中断进行中的轮次
        assert!(matches!(
            turn.await.unwrap(),
            Err(OrchestratorError::Provider(ProviderError::Interrupted))
        ));
        assert!(matches!(
            processor.queue_main_task(Task::new("late", "main")).await,
            Err(OrchestratorError::ShuttingDown)
        ));
        assert!(factory.log().contains(&"interrupt:0".to_string()));
    }
}
