//! Prompt 构建（纯函数）
//!
//! 主 Agent：对话历史 + 交互时间线 + 打开的窗口 + 回放缓存提示 + 任务内容。
//! 临时 Agent：不带历史和时间线。任务内容总在最后。

use crate::cache::CacheMatch;
use crate::memory::{format_entries, TapeMessage, TapeRole, TimelineEntry};

#[derive(Debug, Default)]
pub struct PromptParts<'a> {
    pub history: &'a [TapeMessage],
    pub timeline: &'a [TimelineEntry],
    pub open_windows: &'a [String],
    pub cache_hints: &'a [CacheMatch],
    pub content: &'a str,
}

pub fn build_prompt(parts: &PromptParts<'_>) -> String {
    let mut sections: Vec<String> = Vec::new();

    if !parts.history.is_empty() {
        sections.push(format_history(parts.history));
    }
    let timeline = format_entries(parts.timeline);
    if !timeline.is_empty() {
        sections.push(timeline);
    }
    sections.push(format_open_windows(parts.open_windows));
    if !parts.cache_hints.is_empty() {
        sections.push(format_cache_hints(parts.cache_hints));
    }
    sections.push(parts.content.trim().to_string());

    sections.join("\n\n")
}

fn format_history(history: &[TapeMessage]) -> String {
    let mut out = String::from("<conversation_history>\n");
    for message in history {
        let role = match message.role {
            TapeRole::User => "user",
            TapeRole::Assistant => "assistant",
        };
        out.push_str(&format!("{}: {}\n", role, message.content));
    }
    out.push_str("</conversation_history>");
    out
}

fn format_open_windows(windows: &[String]) -> String {
    if windows.is_empty() {
        "<open_windows>none</open_windows>".to_string()
    } else {
        format!("<open_windows>{}</open_windows>", windows.join(", "))
    }
}

/// 供 Agent 选择直接重放的缓存条目
pub fn format_cache_hints(matches: &[CacheMatch]) -> String {
    let mut out = String::from("<reload_cache_hints>\n");
    for m in matches {
        out.push_str(&format!(
            "- [{}] {} (similarity {:.2}, {} actions{})\n",
            m.entry.id,
            m.entry.label,
            m.similarity,
            m.entry.actions.len(),
            if m.exact { ", exact" } else { "" }
        ));
    }
    out.push_str(
        "If one of these matches the request, emit a `cache.replay` action with its id \
         ({\"type\": \"cache.replay\", \"id\": \"cache-N\"}) instead of redoing the work.\n",
    );
    out.push_str("</reload_cache_hints>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntry, Fingerprint};
    use crate::memory::{InteractionTimeline, TapeSource, UserInteraction};

    #[test]
    fn test_minimal_prompt_ends_with_content() {
        let prompt = build_prompt(&PromptParts {
            content: "  open the calculator ",
            ..Default::default()
        });
        assert_eq!(prompt, "<open_windows>none</open_windows>\n\nopen the calculator");
    }

    #[test]
    fn test_full_prompt_section_order() {
        let history = vec![TapeMessage {
            role: TapeRole::User,
            content: "earlier".into(),
            source: TapeSource::Main,
        }];
        let mut timeline = InteractionTimeline::new();
        timeline.push_user(&UserInteraction::new("click", Some("w1")).at(1_000));
        let entries = timeline.drain();
        let windows = vec!["w1".to_string(), "w2".to_string()];
        let hints = vec![CacheMatch {
            entry: CacheEntry {
                id: "cache-4".into(),
                fingerprint: Fingerprint::new("weather", &windows),
                actions: Vec::new(),
                label: "weather".into(),
                created_at: 0,
                last_used_at: 0,
                use_count: 0,
                failure_count: 0,
                required_window_ids: Vec::new(),
            },
            similarity: 0.75,
            exact: false,
        }];

        let prompt = build_prompt(&PromptParts {
            history: &history,
            timeline: &entries,
            open_windows: &windows,
            cache_hints: &hints,
            content: "what now",
        });

        let history_at = prompt.find("<conversation_history>").unwrap();
        let timeline_at = prompt.find("<recent_interactions>").unwrap();
        let windows_at = prompt.find("<open_windows>w1, w2</open_windows>").unwrap();
        let hints_at = prompt.find("[cache-4] weather (similarity 0.75, 0 actions)").unwrap();
        assert!(history_at < timeline_at && timeline_at < windows_at && windows_at < hints_at);
        assert!(prompt.contains(r#"{"type": "cache.replay", "id": "cache-N"}"#));
        assert!(prompt.ends_with("what now"));
    }
}
