//! 窗口状态登记表
//!
//! 多个 Agent 并发修改窗口，按窗口串行化：窗口带 `locked_by`，
//! 被其他 Agent 锁住时，组件动作进入该窗口的待执行队列，解锁时按 FIFO 重放。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::OrchestratorError;
use crate::provider::{ActionKind, UiAction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowInfo {
    pub id: String,
    pub title: String,
    pub content: String,
    /// 创建该窗口的 Agent（角色显示名）
    pub created_by: Option<String>,
    pub locked_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// 应用内命令记录（窗口里组件发出的、非窗口管理类动作）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppCommand {
    pub window_id: String,
    pub command: String,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub agent: String,
    pub timestamp: i64,
}

/// 单个动作的执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created(String),
    Closed(String),
    Applied,
    /// 窗口被其他 Agent 锁住，排在第 n 位
    Queued(usize),
    /// 目标窗口不存在
    Missing(String),
}

/// 编排核心读取窗口状态的端口
pub trait WindowStore: Send + Sync {
    fn list_windows(&self) -> Vec<WindowInfo>;
    fn has_window(&self, id: &str) -> bool;
    fn get_window(&self, id: &str) -> Option<WindowInfo>;
    fn record_app_command(&self, window_id: &str, command: &str, params: serde_json::Map<String, serde_json::Value>, agent: &str);

    /// 打开的窗口 ID（有序）
    fn window_ids(&self) -> Vec<String> {
        self.list_windows().into_iter().map(|w| w.id).collect()
    }
}

#[derive(Default)]
struct RegistryState {
    windows: BTreeMap<String, WindowInfo>,
    pending: HashMap<String, VecDeque<(String, UiAction)>>,
    commands: Vec<AppCommand>,
    next_id: u64,
}

#[derive(Default)]
pub struct WindowRegistry {
    state: Mutex<RegistryState>,
}

impl WindowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 执行 Agent 发出的一条动作
    pub fn apply_action(&self, action: &UiAction, agent: &str) -> ApplyOutcome {
        match action.kind() {
            ActionKind::Create => self.create_window(action, agent),
            ActionKind::Close => {
                let Some(id) = action.window_id.as_deref() else {
                    return ApplyOutcome::Missing(String::new());
                };
                if self.close_window(id) {
                    ApplyOutcome::Closed(id.to_string())
                } else {
                    ApplyOutcome::Missing(id.to_string())
                }
            }
            ActionKind::Notify => ApplyOutcome::Applied,
            ActionKind::Focus => match action.window_id.as_deref() {
                Some(id) if self.has_window(id) => ApplyOutcome::Applied,
                other => ApplyOutcome::Missing(other.unwrap_or_default().to_string()),
            },
            _ => match action.window_id.as_deref() {
                Some(id) => self.apply_component_action(id, agent, action.clone()),
                None => ApplyOutcome::Missing(String::new()),
            },
        }
    }

    fn create_window(&self, action: &UiAction, agent: &str) -> ApplyOutcome {
        let now = Utc::now().timestamp_millis();
        let mut state = self.lock_state();
        let id = match &action.window_id {
            Some(id) => id.clone(),
            None => {
                state.next_id += 1;
                format!("win-{}", state.next_id)
            }
        };
        let info = WindowInfo {
            id: id.clone(),
            title: action.param_str("title").unwrap_or_default().to_string(),
            content: action.param_str("content").unwrap_or_default().to_string(),
            created_by: Some(agent.to_string()),
            locked_by: None,
            created_at: now,
            updated_at: now,
        };
        if state.windows.insert(id.clone(), info).is_some() {
            tracing::debug!(window_id = %id, "Window recreated");
        }
        ApplyOutcome::Created(id)
    }

    /// 关闭窗口并丢弃其待执行动作
    pub fn close_window(&self, window_id: &str) -> bool {
        let mut state = self.lock_state();
        let dropped = state.pending.remove(window_id).map_or(0, |q| q.len());
        if dropped > 0 {
            tracing::debug!(window_id, dropped, "Dropped pending actions of closed window");
        }
        state.windows.remove(window_id).is_some()
    }

    /// 窗口内组件动作：被其他 Agent 锁住时入队
    pub fn apply_component_action(&self, window_id: &str, agent: &str, action: UiAction) -> ApplyOutcome {
        let mut state = self.lock_state();
        let locked_by_other = match state.windows.get(window_id) {
            None => return ApplyOutcome::Missing(window_id.to_string()),
            Some(window) => window.locked_by.as_deref().is_some_and(|owner| owner != agent),
        };
        if locked_by_other {
            let queue = state.pending.entry(window_id.to_string()).or_default();
            queue.push_back((agent.to_string(), action));
            tracing::debug!(window_id, agent, position = queue.len(), "Window locked, action queued");
            return ApplyOutcome::Queued(queue.len());
        }
        Self::mutate(&mut state, window_id, agent, &action);
        ApplyOutcome::Applied
    }

    fn mutate(state: &mut RegistryState, window_id: &str, agent: &str, action: &UiAction) {
        let now = Utc::now().timestamp_millis();
        let kind = action.kind();
        let Some(window) = state.windows.get_mut(window_id) else {
            return;
        };
        match kind {
            ActionKind::SetTitle => {
                if let Some(title) = action.param_str("title") {
                    window.title = title.to_string();
                }
            }
            ActionKind::SetContent | ActionKind::Update => {
                if let Some(content) = action.param_str("content") {
                    window.content = content.to_string();
                }
            }
            _ => {}
        }
        window.updated_at = now;
        if let ActionKind::Other(command) = kind {
            state.commands.push(AppCommand {
                window_id: window_id.to_string(),
                command,
                params: action.params.clone(),
                agent: agent.to_string(),
                timestamp: now,
            });
        }
    }

    /// 加锁；已被同一 Agent 持有视为成功，被其他 Agent 持有返回 false
    pub fn lock(&self, window_id: &str, agent: &str) -> Result<bool, OrchestratorError> {
        let mut state = self.lock_state();
        let window = state
            .windows
            .get_mut(window_id)
            .ok_or_else(|| OrchestratorError::WindowNotFound(window_id.to_string()))?;
        match window.locked_by.as_deref() {
            Some(owner) if owner != agent => Ok(false),
            _ => {
                window.locked_by = Some(agent.to_string());
                Ok(true)
            }
        }
    }

    /// 解锁并按入队顺序重放积压的动作，返回重放的动作；非持有者解锁无效
    pub fn unlock(&self, window_id: &str, agent: &str) -> Vec<UiAction> {
        let mut state = self.lock_state();
        let Some(window) = state.windows.get_mut(window_id) else {
            return Vec::new();
        };
        if window.locked_by.as_deref() != Some(agent) {
            tracing::warn!(window_id, agent, "Unlock by non-owner ignored");
            return Vec::new();
        }
        window.locked_by = None;

        let queued = state.pending.remove(window_id).unwrap_or_default();
        let mut replayed = Vec::with_capacity(queued.len());
        for (owner, action) in queued {
            Self::mutate(&mut state, window_id, &owner, &action);
            replayed.push(action);
        }
        if !replayed.is_empty() {
            tracing::debug!(window_id, count = replayed.len(), "Replayed queued window actions");
        }
        replayed
    }

    pub fn pending_count(&self, window_id: &str) -> usize {
        self.lock_state().pending.get(window_id).map_or(0, VecDeque::len)
    }

    pub fn app_commands(&self, window_id: &str) -> Vec<AppCommand> {
        self.lock_state()
            .commands
            .iter()
            .filter(|c| c.window_id == window_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock_state().windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WindowStore for WindowRegistry {
    fn list_windows(&self) -> Vec<WindowInfo> {
        self.lock_state().windows.values().cloned().collect()
    }

    fn has_window(&self, id: &str) -> bool {
        self.lock_state().windows.contains_key(id)
    }

    fn get_window(&self, id: &str) -> Option<WindowInfo> {
        self.lock_state().windows.get(id).cloned()
    }

    fn record_app_command(
        &self,
        window_id: &str,
        command: &str,
        params: serde_json::Map<String, serde_json::Value>,
        agent: &str,
    ) {
        self.lock_state().commands.push(AppCommand {
            window_id: window_id.to_string(),
            command: command.to_string(),
            params,
            agent: agent.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        });
    }

    fn window_ids(&self) -> Vec<String> {
        self.lock_state().windows.keys().cloned().collect()
    }
}
