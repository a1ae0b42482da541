//! 窗口关联：由同一 Agent 派生出的窗口归为一组，共享该 Agent
//!
//! 组 ID 固定为第一个窗口（父窗口）的 ID，根窗口关闭后也不改变。
//! 不在任何组里的窗口是「独立窗口」，关闭时总是销毁其 Agent。

use std::collections::{BTreeSet, HashMap};

/// 一组共享 Agent 的窗口
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowGroup {
    pub windows: BTreeSet<String>,
    pub root: String,
}

/// 窗口关闭后的处理决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseDecision {
    pub should_dispose_agent: bool,
    /// 窗口所在的组（独立窗口为 None）
    pub group_id: Option<String>,
    /// 关闭的是根窗口且组仍存在时，新选出的根
    pub new_root: Option<String>,
}

#[derive(Debug, Default)]
pub struct WindowConnectionPolicy {
    groups: HashMap<String, WindowGroup>,
    window_to_group: HashMap<String, String>,
}

impl WindowConnectionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// 把 child 接到 parent 所在的组；parent 无组时以它为根新建一组
    pub fn connect_window(&mut self, parent: &str, child: &str) {
        if parent == child {
            return;
        }
        let group_id = match self.window_to_group.get(parent) {
            Some(id) => id.clone(),
            None => {
                self.groups.insert(
                    parent.to_string(),
                    WindowGroup {
                        windows: BTreeSet::from([parent.to_string()]),
                        root: parent.to_string(),
                    },
                );
                self.window_to_group
                    .insert(parent.to_string(), parent.to_string());
                parent.to_string()
            }
        };

        if self.window_to_group.get(child) == Some(&group_id) {
            return;
        }
        // 每个窗口最多属于一个组
        if self.window_to_group.contains_key(child) {
            self.detach(child);
        }
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.windows.insert(child.to_string());
        }
        self.window_to_group
            .insert(child.to_string(), group_id.clone());
        tracing::debug!(parent, child, group_id = %group_id, "Window connected to group");
    }

    pub fn handle_close(&mut self, window_id: &str) -> CloseDecision {
        let Some(group_id) = self.window_to_group.get(window_id).cloned() else {
            return CloseDecision {
                should_dispose_agent: true,
                group_id: None,
                new_root: None,
            };
        };
        let (emptied, new_root) = self.detach(window_id);
        CloseDecision {
            should_dispose_agent: emptied,
            group_id: Some(group_id),
            new_root,
        }
    }

    /// 从组中移除窗口；返回（组是否被删除，新根）
    fn detach(&mut self, window_id: &str) -> (bool, Option<String>) {
        let Some(group_id) = self.window_to_group.remove(window_id) else {
            return (false, None);
        };
        let Some(group) = self.groups.get_mut(&group_id) else {
            return (false, None);
        };
        group.windows.remove(window_id);

        if group.windows.is_empty() {
            self.groups.remove(&group_id);
            tracing::debug!(group_id = %group_id, "Window group emptied");
            return (true, None);
        }
        if group.root == window_id {
            // BTreeSet 有序：取字典序最小的剩余窗口
            if let Some(next) = group.windows.iter().next().cloned() {
                group.root = next.clone();
                return (false, Some(next));
            }
        }
        (false, None)
    }

    /// 窗口所在组的 ID
    pub fn group_of(&self, window_id: &str) -> Option<&str> {
        self.window_to_group.get(window_id).map(String::as_str)
    }

    pub fn group(&self, group_id: &str) -> Option<&WindowGroup> {
        self.groups.get(group_id)
    }

    /// 窗口对应 Agent 的键：组 ID，独立窗口则为自身 ID
    pub fn agent_key(&self, window_id: &str) -> String {
        self.group_of(window_id)
            .unwrap_or(window_id)
            .to_string()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standalone_close_disposes() {
        let mut policy = WindowConnectionPolicy::new();
        let decision = policy.handle_close("w9");
        assert!(decision.should_dispose_agent);
        assert_eq!(decision.group_id, None);
    }

    #[test]
    fn test_root_close_keeps_agent_and_picks_smallest() {
        let mut policy = WindowConnectionPolicy::new();
        policy.connect_window("w1", "w2");
        let decision = policy.handle_close("w1");
        assert!(!decision.should_dispose_agent);
        assert_eq!(decision.new_root.as_deref(), Some("w2"));
        assert_eq!(decision.group_id.as_deref(), Some("w1"));

        // 组 ID 不随根变化
        assert_eq!(policy.group_of("w2"), Some("w1"));
        assert_eq!(policy.agent_key("w2"), "w1");
    }

    #[test]
    fn test_new_root_is_lexicographic_not_insertion_order() {
        let mut policy = WindowConnectionPolicy::new();
        policy.connect_window("root", "zeta");
        policy.connect_window("root", "alpha");
        policy.connect_window("zeta", "mid");
        let decision = policy.handle_close("root");
        assert_eq!(decision.new_root.as_deref(), Some("alpha"));
        assert_eq!(policy.group("root").unwrap().root, "alpha");
    }

    #[test]
    fn test_last_window_close_disposes_group() {
        let mut policy = WindowConnectionPolicy::new();
        policy.connect_window("w1", "w2");
        assert!(!policy.handle_close("w2").should_dispose_agent);
        let decision = policy.handle_close("w1");
        assert!(decision.should_dispose_agent);
        assert_eq!(policy.group_count(), 0);
        assert_eq!(policy.group_of("w1"), None);
    }

    #[test]
    fn test_window_moves_between_groups() {
        let mut policy = WindowConnectionPolicy::new();
        policy.connect_window("a", "x");
        policy.connect_window("b", "x");
        assert_eq!(policy.group_of("x"), Some("b"));
        assert!(!policy.group("a").unwrap().windows.contains("x"));
        assert_eq!(policy.group_count(), 2);
    }
}
