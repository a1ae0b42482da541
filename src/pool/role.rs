//! Agent 角色：标识某个池化 Agent 当前为哪个逻辑任务服务
//!
//! 取代 `main-<monitor>-<id>` / `window-<id>` 这类字符串标签，匹配改为穷尽的模式匹配。

use std::fmt;

/// Agent 当前承担的角色；池中 `None` 表示空闲
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    /// 监视器的主 Agent（保留会话上下文）
    Main { monitor_id: String, task_id: String },
    /// 窗口组专属 Agent，`window_id` 为组 ID 或独立窗口 ID
    Window { window_id: String },
    /// 一次性 Agent，无历史，用完即销毁
    Ephemeral { task_id: String },
}

impl Role {
    pub fn main(monitor_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Role::Main {
            monitor_id: monitor_id.into(),
            task_id: task_id.into(),
        }
    }

    pub fn window(window_id: impl Into<String>) -> Self {
        Role::Window {
            window_id: window_id.into(),
        }
    }

    pub fn ephemeral(task_id: impl Into<String>) -> Self {
        Role::Ephemeral {
            task_id: task_id.into(),
        }
    }

    /// 是否是指定监视器的主 Agent（不看 task_id）
    pub fn is_main_for(&self, monitor: &str) -> bool {
        matches!(self, Role::Main { monitor_id, .. } if monitor_id == monitor)
    }

    pub fn is_window(&self, id: &str) -> bool {
        matches!(self, Role::Window { window_id } if window_id == id)
    }

    pub fn monitor_id(&self) -> Option<&str> {
        match self {
            Role::Main { monitor_id, .. } => Some(monitor_id),
            Role::Window { .. } | Role::Ephemeral { .. } => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Main { monitor_id, task_id } => write!(f, "main-{}-{}", monitor_id, task_id),
            Role::Window { window_id } => write!(f, "window-{}", window_id),
            Role::Ephemeral { task_id } => write!(f, "ephemeral-{}", task_id),
        }
    }
}
