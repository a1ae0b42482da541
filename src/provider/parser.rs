//! 从助手文本中提取 UI 动作
//!
//! 动作写在 ```json 代码块中，`type` 以 window / notification / toast / cache 开头。

use std::sync::OnceLock;

use regex::Regex;

use super::UiAction;

static ACTION_BLOCK_RE: OnceLock<Regex> = OnceLock::new();

fn action_block_re() -> &'static Regex {
    ACTION_BLOCK_RE.get_or_init(|| {
        Regex::new(
            r#"(?s)```(?:json)?\s*\n(\{[^`]*"type"\s*:\s*"(?:window|notification|toast|cache)[^`]*\})\s*\n```"#,
        )
        .expect("action block pattern is valid")
    })
}

/// 提取文本中所有合法的动作块，格式错误的块被跳过
pub fn extract_actions(text: &str) -> Vec<UiAction> {
    action_block_re()
        .captures_iter(text)
        .filter_map(|caps| {
            let raw = caps.get(1)?.as_str();
            match serde_json::from_str::<UiAction>(raw) {
                Ok(action) => Some(action),
                Err(e) => {
                    tracing::debug!("Skipping malformed action block: {}", e);
                    None
                }
            }
        })
        .collect()
}
