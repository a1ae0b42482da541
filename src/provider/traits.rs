//! AI Provider 会话抽象
//!
//! 核心只依赖这一端口：初始化、发送 prompt 并接收事件流、中断、清理。
//! 流式输出通过有界 mpsc 通道推送 `SessionEvent`，取代回调。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::ProviderError;
use crate::memory::UserInteraction;
use crate::pool::Role;

use super::ProviderKind;

/// Agent 发出的一条 UI 动作（window.create / window.close / toast.show ...）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(rename = "windowId", default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// 动作类型归一化（去掉 `window.` 前缀）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    Close,
    Focus,
    SetTitle,
    SetContent,
    Update,
    Notify,
    /// 重放回放缓存中的条目（`id` 参数）
    CacheReplay,
    Other(String),
}

impl UiAction {
    pub fn new(action_type: impl Into<String>, window_id: Option<&str>) -> Self {
        Self {
            action_type: action_type.into(),
            window_id: window_id.map(str::to_string),
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn kind(&self) -> ActionKind {
        let name = self
            .action_type
            .strip_prefix("window.")
            .unwrap_or(&self.action_type);
        match name {
            "create" => ActionKind::Create,
            "close" => ActionKind::Close,
            "focus" => ActionKind::Focus,
            "setTitle" => ActionKind::SetTitle,
            "setContent" => ActionKind::SetContent,
            "update" => ActionKind::Update,
            "notify" | "toast.show" | "notification.show" => ActionKind::Notify,
            "cache.replay" => ActionKind::CacheReplay,
            _ => ActionKind::Other(self.action_type.clone()),
        }
    }
}

/// 会话推送给编排层的事件
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// 助手输出增量
    Text(String),
    Thinking(String),
    Actions(Vec<UiAction>),
    /// Provider 侧会话 ID（用于下次 resume）
    SessionId(String),
    Complete,
    Error(String),
}

/// 每次 handle_message 的附加参数
#[derive(Debug, Clone)]
pub struct MessageOptions {
    pub role: Role,
    pub monitor_id: String,
    pub interactions: Vec<UserInteraction>,
    pub resume_session_id: Option<String>,
}

/// 转向（向进行中的轮次注入新输入）的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteerOutcome {
    Accepted,
    Rejected,
    /// Provider 不支持转向，直接改走临时 Agent
    Unsupported,
}

/// 一个 Provider 会话
#[async_trait]
pub trait AgentSession: Send + Sync {
    async fn initialize(&self) -> Result<bool, ProviderError>;

    /// 处理一条消息，期间把事件推入 `events`；被中断时应尽快返回
    async fn handle_message(
        &self,
        prompt: &str,
        options: MessageOptions,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<(), ProviderError>;

    async fn interrupt(&self) -> Result<(), ProviderError>;

    async fn cleanup(&self);

    fn is_running(&self) -> bool;

    /// 默认不支持转向
    async fn steer(&self, _content: &str) -> Result<SteerOutcome, ProviderError> {
        Ok(SteerOutcome::Unsupported)
    }
}

/// 创建会话的工厂（每个 Provider 一个）
#[async_trait]
pub trait SessionFactory: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// 检查二进制、认证等是否就绪
    async fn check_availability(&self) -> bool {
        true
    }

    fn create_session(&self, system_prompt: &str) -> Arc<dyn AgentSession>;
}
