//! 任务指纹：内容哈希 + 窗口状态哈希
//!
//! 精确匹配用 `content_hash:window_state_hash` 作键；模糊匹配对归一化内容做词集 Jaccard。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 窗口状态不同时相似度打折
const WINDOW_MISMATCH_FACTOR: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub content_hash: String,
    pub window_state_hash: String,
    /// 归一化后的任务内容，仅用于模糊匹配
    #[serde(default)]
    pub content: String,
}

impl Fingerprint {
    /// 由任务内容与当前打开的窗口 ID 计算指纹（窗口顺序无关）
    pub fn new<S: AsRef<str>>(content: &str, open_windows: &[S]) -> Self {
        let normalized = normalize(content);
        let mut windows: Vec<&str> = open_windows.iter().map(AsRef::as_ref).collect();
        windows.sort_unstable();
        windows.dedup();
        Self {
            content_hash: sha256_hex(&normalized),
            window_state_hash: sha256_hex(&windows.join(",")),
            content: normalized,
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.content_hash, self.window_state_hash)
    }

    /// 0.0 ~ 1.0；键相同即 1.0
    pub fn similarity(&self, other: &Fingerprint) -> f64 {
        if self.content_hash == other.content_hash && self.window_state_hash == other.window_state_hash {
            return 1.0;
        }
        let a: HashSet<&str> = self.content.split_whitespace().collect();
        let b: HashSet<&str> = other.content.split_whitespace().collect();
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let intersection = a.intersection(&b).count() as f64;
        let union = a.union(&b).count() as f64;
        let jaccard = intersection / union;
        if self.window_state_hash == other.window_state_hash {
            jaccard
        } else {
            jaccard * WINDOW_MISMATCH_FACTOR
        }
    }
}

/// 小写、去首尾空白、合并连续空白
pub fn normalize(content: &str) -> String {
    content
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}
