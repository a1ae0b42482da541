//! 交互时间线：用户事件与 AI 动作摘要按时间合并
//!
//! 每次构建主 Agent 的 prompt 时 `drain()` 一次，取出并清空全部条目。
//! 去重规则：
//! - 同一窗口上连续两次内容相同的 focus，丢弃后一次
//! - 紧跟在 focus 之后的同窗口 move / resize，先移除那条 focus（移动即聚焦）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::{ActionKind, UiAction};

/// 客户端上报的一次用户交互
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInteraction {
    /// focus / move / resize / click / close / input ...
    pub kind: String,
    #[serde(default)]
    pub window_id: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    /// 毫秒时间戳
    pub timestamp: i64,
}

impl UserInteraction {
    pub fn new(kind: impl Into<String>, window_id: Option<&str>) -> Self {
        Self {
            kind: kind.into(),
            window_id: window_id.map(str::to_string),
            detail: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    fn describe(&self) -> String {
        let mut text = match &self.window_id {
            Some(id) => format!("{} window {}", self.kind, id),
            None => self.kind.clone(),
        };
        if let Some(detail) = &self.detail {
            text.push_str(": ");
            text.push_str(detail);
        }
        text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    User,
    Ai,
}

/// 时间线条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub kind: EntryKind,
    pub content: String,
    pub agent: Option<String>,
    pub timestamp: i64,
    /// 用户交互类型，仅用于去重
    #[serde(skip)]
    interaction: Option<String>,
    #[serde(skip)]
    window_id: Option<String>,
}

impl TimelineEntry {
    fn is_focus_on(&self, window: &str) -> bool {
        self.kind == EntryKind::User
            && self.interaction.as_deref() == Some("focus")
            && self.window_id.as_deref() == Some(window)
    }
}

#[derive(Debug, Default, Clone)]
pub struct InteractionTimeline {
    entries: Vec<TimelineEntry>,
}

impl InteractionTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, interaction: &UserInteraction) {
        let content = interaction.describe();

        let follows_focus = match (interaction.window_id.as_deref(), self.entries.last()) {
            (Some(window), Some(last)) if last.is_focus_on(window) => Some(last.content == content),
            _ => None,
        };
        match (interaction.kind.as_str(), follows_focus) {
            ("focus", Some(true)) => return,
            ("move" | "resize", Some(_)) => {
                self.entries.pop();
            }
            _ => {}
        }

        self.entries.push(TimelineEntry {
            kind: EntryKind::User,
            content,
            agent: None,
            timestamp: interaction.timestamp,
            interaction: Some(interaction.kind.clone()),
            window_id: interaction.window_id.clone(),
        });
    }

    /// 把一批 AI 动作压成一条摘要；空批次不记录
    pub fn push_ai(&mut self, actions: &[UiAction], agent: &str) {
        if actions.is_empty() {
            return;
        }
        self.entries.push(TimelineEntry {
            kind: EntryKind::Ai,
            content: summarize_actions(actions),
            agent: Some(agent.to_string()),
            timestamp: Utc::now().timestamp_millis(),
            interaction: None,
            window_id: None,
        });
    }

    /// 渲染待处理条目，不改变状态；无条目时返回空串
    pub fn format(&self) -> String {
        format_entries(&self.sorted())
    }

    /// 原子地取出并清空所有条目
    pub fn drain(&mut self) -> Vec<TimelineEntry> {
        let mut drained = std::mem::take(&mut self.entries);
        drained.sort_by_key(|e| e.timestamp);
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sorted(&self) -> Vec<TimelineEntry> {
        let mut entries = self.entries.clone();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }
}

/// 把条目渲染成带标签的文本块
pub fn format_entries(entries: &[TimelineEntry]) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let mut out = String::from("<recent_interactions>\n");
    for entry in entries {
        let time = DateTime::<Utc>::from_timestamp_millis(entry.timestamp)
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_default();
        match entry.kind {
            EntryKind::User => {
                out.push_str(&format!("<user time=\"{}\">{}</user>\n", time, entry.content));
            }
            EntryKind::Ai => {
                out.push_str(&format!(
                    "<ai agent=\"{}\" time=\"{}\">{}</ai>\n",
                    entry.agent.as_deref().unwrap_or("agent"),
                    time,
                    entry.content
                ));
            }
        }
    }
    out.push_str("</recent_interactions>");
    out
}

/// 按动作类型各生成一句话，类型顺序按首次出现
pub fn summarize_actions(actions: &[UiAction]) -> String {
    let mut groups: Vec<(ActionKind, Vec<&UiAction>)> = Vec::new();
    for action in actions {
        let kind = action.kind();
        match groups.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, list)) => list.push(action),
            None => groups.push((kind, vec![action])),
        }
    }

    groups
        .iter()
        .map(|(kind, list)| summarize_group(kind, list))
        .collect::<Vec<_>>()
        .join(" ")
}

fn summarize_group(kind: &ActionKind, actions: &[&UiAction]) -> String {
    match kind {
        ActionKind::Create => format!(
            "Created window {}.",
            join_targets(actions, |a| format!(
                "\"{}\" ({})",
                a.param_str("title").unwrap_or("untitled"),
                window_label(a)
            ))
        ),
        ActionKind::Close => format!("Closed window {}.", join_targets(actions, window_label)),
        ActionKind::SetTitle => format!(
            "Renamed window {}.",
            join_targets(actions, |a| format!(
                "{} to \"{}\"",
                window_label(a),
                a.param_str("title").unwrap_or("")
            ))
        ),
        ActionKind::SetContent => {
            format!("Updated content of window {}.", join_targets(actions, window_label))
        }
        ActionKind::Update => format!("Updated window {}.", join_targets(actions, window_label)),
        ActionKind::Notify => format!(
            "Sent notification: {}.",
            join_targets(actions, |a| format!("\"{}\"", a.param_str("message").unwrap_or("")))
        ),
        ActionKind::Focus => format!("Focused window {}.", join_targets(actions, window_label)),
        ActionKind::CacheReplay => format!(
            "Replayed cached result {}.",
            join_targets(actions, |a| a.param_str("id").unwrap_or("?").to_string())
        ),
        ActionKind::Other(name) => format!("Action: {}", name),
    }
}

fn join_targets(actions: &[&UiAction], f: impl Fn(&UiAction) -> String) -> String {
    actions.iter().map(|a| f(a)).collect::<Vec<_>>().join(", ")
}

fn window_label(action: &UiAction) -> String {
    action.window_id.clone().unwrap_or_else(|| "?".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn focus(window: &str, ts: i64) -> UserInteraction {
        UserInteraction::new("focus", Some(window)).at(ts)
    }

    #[test]
    fn test_duplicate_focus_dropped() {
        let mut timeline = InteractionTimeline::new();
        timeline.push_user(&focus("w1", 1));
        timeline.push_user(&focus("w1", 2));
        assert_eq!(timeline.len(), 1);

        timeline.push_user(&focus("w2", 3));
        timeline.push_user(&focus("w1", 4));
        assert_eq!(timeline.len(), 3);
    }

    #[test]
    fn test_move_replaces_preceding_focus() {
        let mut timeline = InteractionTimeline::new();
        timeline.push_user(&focus("w1", 1));
        timeline.push_user(&UserInteraction::new("move", Some("w1")).with_detail("x=10,y=20").at(2));
        let entries = timeline.drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "move window w1: x=10,y=20");

        timeline.push_user(&focus("w2", 3));
        timeline.push_user(&UserInteraction::new("resize", Some("w1")).at(4));
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn test_drain_twice_and_empty_format() {
        let mut timeline = InteractionTimeline::new();
        assert_eq!(timeline.format(), "");
        timeline.push_user(&focus("w1", 1));
        assert!(!timeline.format().is_empty());
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.drain().len(), 1);
        assert!(timeline.drain().is_empty());
        assert_eq!(timeline.format(), "");
    }

    #[test]
    fn test_format_is_chronological_and_tagged() {
        let mut timeline = InteractionTimeline::new();
        timeline.push_user(&UserInteraction::new("click", Some("w2")).at(2_000));
        timeline.push_user(&focus("w1", 1_000));
        let text = timeline.format();
        let first = text.find("focus window w1").unwrap();
        let second = text.find("click window w2").unwrap();
        assert!(first < second);
        assert!(text.starts_with("<recent_interactions>"));
        assert!(text.ends_with("</recent_interactions>"));
    }

    #[test]
    fn test_ai_summary_one_sentence_per_type() {
        let actions = vec![
            UiAction::new("window.create", Some("w1")).with_param("title", "Notes"),
            UiAction::new("window.create", Some("w2")).with_param("title", "Todo"),
            UiAction::new("window.close", Some("w3")),
            UiAction::new("toast.show", None).with_param("message", "Saved"),
            UiAction::new("window.shake", Some("w1")),
        ];
        let summary = summarize_actions(&actions);
        assert_eq!(
            summary,
            "Created window \"Notes\" (w1), \"Todo\" (w2). Closed window w3. \
             Sent notification: \"Saved\". Action: window.shake"
        );

        let mut timeline = InteractionTimeline::new();
        timeline.push_ai(&actions, "main-agent");
        timeline.push_ai(&[], "main-agent");
        let entries = timeline.drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Ai);
        assert_eq!(entries[0].agent.as_deref(), Some("main-agent"));
    }
}
