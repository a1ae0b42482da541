//! 上下文磁带：主线程与窗口线程的对话记录
//!
//! 主线程消息超过上限时只保留最近的一半；窗口线程消息无条件保留。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapeRole {
    User,
    Assistant,
}

/// 消息来源：主线程或某个窗口
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapeSource {
    Main,
    Window(String),
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TapeMessage {
    pub role: TapeRole,
    pub content: String,
    pub source: TapeSource,
}

#[derive(Clone, Debug)]
pub struct ContextTape {
    messages: Vec<TapeMessage>,
    max_main_messages: usize,
}

impl ContextTape {
    pub fn new(max_main_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_main_messages,
        }
    }

    pub fn append(&mut self, role: TapeRole, content: impl Into<String>, source: TapeSource) {
        self.messages.push(TapeMessage {
            role,
            content: content.into(),
            source,
        });
        self.prune();
    }

    /// `include_windows` 为 false 时只返回主线程消息
    pub fn messages(&self, include_windows: bool) -> Vec<&TapeMessage> {
        self.messages
            .iter()
            .filter(|m| include_windows || m.source == TapeSource::Main)
            .collect()
    }

    /// 某个窗口线程的消息
    pub fn window_messages(&self, window_id: &str) -> Vec<&TapeMessage> {
        self.messages
            .iter()
            .filter(|m| matches!(&m.source, TapeSource::Window(id) if id == window_id))
            .collect()
    }

    pub fn main_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.source == TapeSource::Main)
            .count()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// 主线程消息超过上限时丢弃最旧的部分，只留 max/2 条
    fn prune(&mut self) {
        let main_count = self.main_count();
        if main_count <= self.max_main_messages {
            return;
        }
        let mut to_drop = main_count - self.max_main_messages / 2;
        self.messages.retain(|m| {
            if to_drop > 0 && m.source == TapeSource::Main {
                to_drop -= 1;
                false
            } else {
                true
            }
        });
        tracing::debug!(
            remaining = self.messages.len(),
            "Context tape pruned main-thread history"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_keeps_recent_half_of_main() {
        let mut tape = ContextTape::new(200);
        for i in 0..201 {
            tape.append(TapeRole::User, format!("main-{}", i), TapeSource::Main);
            if i % 10 == 0 {
                tape.append(
                    TapeRole::Assistant,
                    format!("win-{}", i),
                    TapeSource::Window("w1".into()),
                );
            }
        }

        assert_eq!(tape.main_count(), 100);
        let main = tape.messages(false);
        assert_eq!(main.first().unwrap().content, "main-101");
        assert_eq!(main.last().unwrap().content, "main-200");
        assert_eq!(tape.window_messages("w1").len(), 21);
    }

    #[test]
    fn test_messages_filter_by_source() {
        let mut tape = ContextTape::new(10);
        tape.append(TapeRole::User, "hi", TapeSource::Main);
        tape.append(TapeRole::Assistant, "in window", TapeSource::Window("w1".into()));
        tape.append(TapeRole::Assistant, "hello", TapeSource::Main);

        assert_eq!(tape.messages(true).len(), 3);
        let main: Vec<_> = tape.messages(false).iter().map(|m| m.content.as_str()).collect();
        assert_eq!(main, vec!["hi", "hello"]);
        assert!(tape.window_messages("w2").is_empty());
    }

    #[test]
    fn test_window_messages_survive_any_count() {
        let mut tape = ContextTape::new(4);
        for i in 0..50 {
            tape.append(TapeRole::User, format!("w{}", i), TapeSource::Window("w".into()));
        }
        for i in 0..5 {
            tape.append(TapeRole::User, format!("m{}", i), TapeSource::Main);
        }
        assert_eq!(tape.window_messages("w").len(), 50);
        assert_eq!(tape.main_count(), 2);
    }
}
