//! 脚本化会话（用于测试与本地演示，无需真实 Provider）
//!
//! 依次返回预设回复（用尽后回显 prompt 末行），回复中的动作块会作为 `Actions` 事件推送。
//! 可选「闸门」让轮次一直挂起，直到测试放行或被中断。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::core::ProviderError;

use super::{
    extract_actions, AgentSession, MessageOptions, ProviderKind, SessionEvent, SessionFactory,
    SteerOutcome,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 工厂与其创建的所有会话共享的脚本与调用记录
#[derive(Debug)]
struct Script {
    responses: Mutex<VecDeque<String>>,
    gate: Option<Arc<Notify>>,
    steer: SteerOutcome,
    init_delay: Option<Duration>,
    init_fails: AtomicBool,
    available: bool,
    log: Mutex<Vec<String>>,
    prompts: Mutex<Vec<String>>,
    created: AtomicUsize,
}

impl Script {
    fn record(&self, entry: String) {
        lock(&self.log).push(entry);
    }

    fn next_response(&self, prompt: &str) -> String {
        lock(&self.responses).pop_front().unwrap_or_else(|| {
            let last = prompt.lines().last().unwrap_or_default();
            format!("Echo: {}", last)
        })
    }
}

pub struct ScriptedSessionFactory {
    kind: ProviderKind,
    script: Arc<Script>,
}

impl ScriptedSessionFactory {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            script: Arc::new(Script {
                responses: Mutex::new(VecDeque::new()),
                gate: None,
                steer: SteerOutcome::Unsupported,
                init_delay: None,
                init_fails: AtomicBool::new(false),
                available: true,
                log: Mutex::new(Vec::new()),
                prompts: Mutex::new(Vec::new()),
                created: AtomicUsize::new(0),
            }),
        }
    }

    fn script_mut(&mut self) -> &mut Script {
        Arc::get_mut(&mut self.script).expect("script is configured before sessions are created")
    }

    pub fn unavailable(mut self) -> Self {
        self.script_mut().available = false;
        self
    }

    pub fn with_responses<I, S>(self, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.script.responses).extend(responses.into_iter().map(Into::into));
        self
    }

    /// 每个轮次在完成前等待一次 `gate.notify_one()`
    pub fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.script_mut().gate = Some(gate);
        self
    }

    pub fn with_steer(mut self, outcome: SteerOutcome) -> Self {
        self.script_mut().steer = outcome;
        self
    }

    /// 初始化前先等待，模拟较慢的 Provider 启动
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.script_mut().init_delay = Some(delay);
        self
    }

    pub fn set_init_fails(&self, fails: bool) {
        self.script.init_fails.store(fails, Ordering::SeqCst);
    }

    /// 按发生顺序的调用记录，如 `init:0`、`interrupt:1`、`cleanup:1`
    pub fn log(&self) -> Vec<String> {
        lock(&self.script.log).clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.script.prompts).clone()
    }

    pub fn sessions_created(&self) -> usize {
        self.script.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for ScriptedSessionFactory {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn check_availability(&self) -> bool {
        self.script.available
    }

    fn create_session(&self, _system_prompt: &str) -> Arc<dyn AgentSession> {
        let n = self.script.created.fetch_add(1, Ordering::SeqCst);
        Arc::new(ScriptedSession {
            n,
            script: Arc::clone(&self.script),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }
}

pub struct ScriptedSession {
    n: usize,
    script: Arc<Script>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl ScriptedSession {
    async fn run_turn(
        &self,
        prompt: &str,
        events: &mpsc::Sender<SessionEvent>,
        token: CancellationToken,
    ) -> Result<(), ProviderError> {
        let text = self.script.next_response(prompt);
        let _ = events
            .send(SessionEvent::SessionId(format!("scripted-{}", self.n)))
            .await;

        if let Some(gate) = &self.script.gate {
            tokio::select! {
                _ = gate.notified() => {}
                _ = token.cancelled() => return Err(ProviderError::Interrupted),
            }
        }

        let actions = extract_actions(&text);
        let _ = events.send(SessionEvent::Text(text)).await;
        if !actions.is_empty() {
            let _ = events.send(SessionEvent::Actions(actions)).await;
        }
        let _ = events.send(SessionEvent::Complete).await;
        Ok(())
    }
}

#[async_trait]
impl AgentSession for ScriptedSession {
    async fn initialize(&self) -> Result<bool, ProviderError> {
        self.script.record(format!("init:{}", self.n));
        if let Some(delay) = self.script.init_delay {
            tokio::time::sleep(delay).await;
        }
        if self.script.init_fails.load(Ordering::SeqCst) {
            return Err(ProviderError::Initialize("scripted failure".to_string()));
        }
        Ok(true)
    }

    async fn handle_message(
        &self,
        prompt: &str,
        _options: MessageOptions,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<(), ProviderError> {
        let token = CancellationToken::new();
        *lock(&self.cancel) = token.clone();
        self.running.store(true, Ordering::SeqCst);
        self.script.record(format!("handle:{}", self.n));
        lock(&self.script.prompts).push(prompt.to_string());

        let result = self.run_turn(prompt, &events, token).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn interrupt(&self) -> Result<(), ProviderError> {
        self.script.record(format!("interrupt:{}", self.n));
        lock(&self.cancel).cancel();
        Ok(())
    }

    async fn cleanup(&self) {
        self.script.record(format!("cleanup:{}", self.n));
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn steer(&self, content: &str) -> Result<SteerOutcome, ProviderError> {
        if self.script.steer == SteerOutcome::Accepted {
            self.script.record(format!("steer:{}:{}", self.n, content));
        }
        Ok(self.script.steer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Role;

    fn options() -> MessageOptions {
        MessageOptions {
            role: Role::main("main", "t1"),
            monitor_id: "main".into(),
            interactions: Vec::new(),
            resume_session_id: None,
        }
    }

    #[tokio::test]
    async fn test_scripted_turn_emits_actions() {
        let factory = ScriptedSessionFactory::new(ProviderKind::Claude).with_responses([
            "ok\n```json\n{\"type\": \"window.create\", \"windowId\": \"w1\"}\n```\n",
        ]);
        let session = factory.create_session("sys");
        let (tx, mut rx) = mpsc::channel(16);
        session.handle_message("hello", options(), tx).await.unwrap();

        let mut saw_actions = false;
        while let Some(event) = rx.recv().await {
            if let SessionEvent::Actions(actions) = event {
                assert_eq!(actions[0].window_id.as_deref(), Some("w1"));
                saw_actions = true;
            }
        }
        assert!(saw_actions);
        assert!(!session.is_running());
        assert_eq!(factory.prompts(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_interrupt_releases_gated_turn() {
        let gate = Arc::new(Notify::new());
        let factory = ScriptedSessionFactory::new(ProviderKind::Claude).with_gate(gate);
        let session = factory.create_session("sys");

        let running = Arc::clone(&session);
        let handle = tokio::spawn(async move {
            let (tx, _rx) = mpsc::channel(16);
            running.handle_message("wait", options(), tx).await
        });
        while !session.is_running() {
            tokio::task::yield_now().await;
        }
        session.interrupt().await.unwrap();
        let result = handle.await.unwrap();
        assert_eq!(result, Err(ProviderError::Interrupted));
        assert!(!session.is_running());
    }
}
