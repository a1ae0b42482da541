//! 进入编排层的一个工作单元

use serde::{Deserialize, Serialize};

use crate::memory::UserInteraction;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub message_id: String,
    pub content: String,
    /// 发起任务的监视器（前台循环或某个后台轮询）
    pub monitor_id: String,
    /// 自上次任务以来客户端上报的用户交互
    #[serde(default)]
    pub interactions: Vec<UserInteraction>,
    #[serde(default)]
    pub images: Vec<String>,
}

impl Task {
    pub fn new(content: impl Into<String>, monitor_id: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            monitor_id: monitor_id.into(),
            interactions: Vec::new(),
            images: Vec::new(),
        }
    }

    pub fn with_interactions(mut self, interactions: Vec<UserInteraction>) -> Self {
        self.interactions = interactions;
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    /// 日志与缓存标签用的短摘要
    pub fn label(&self) -> String {
        const MAX_CHARS: usize = 60;
        let first_line = self.content.lines().next().unwrap_or_default().trim();
        if first_line.chars().count() <= MAX_CHARS {
            first_line.to_string()
        } else {
            let truncated: String = first_line.chars().take(MAX_CHARS).collect();
            format!("{}...", truncated)
        }
    }
}
