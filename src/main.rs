//! AgentDesk - 编排核心的本地演示入口
//!
//! 初始化日志与配置，选择 Provider，创建一个连接上下文，从标准输入读取任务。
//! 命令：`/stats`、`/cache`、`/replay <id>`、`/close <window>`、`/window <id> <task>`、`/quit`。

use std::sync::Arc;

use anyhow::Context;
use agentdesk::config::load_config;
use agentdesk::core::shutdown::{run_until_shutdown, ShutdownManager, ShutdownReason};
use agentdesk::pool::AgentLimiter;
use agentdesk::provider::{select_factory, ProviderKind, ScriptedSessionFactory, SessionFactory};
use agentdesk::{ConnectionContext, ProcessorEvent, Task};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    agentdesk::observability::init();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    // 本地演示使用脚本化会话；真实 Provider 实现同一个 SessionFactory 端口即可接入
    let factories: Vec<Arc<dyn SessionFactory>> = vec![
        Arc::new(ScriptedSessionFactory::new(ProviderKind::Claude)),
        Arc::new(ScriptedSessionFactory::new(ProviderKind::Codex)),
    ];
    let factory = select_factory(&config.provider.priority, &factories)
        .await
        .context("No AI provider available")?;

    let limiter = AgentLimiter::new(config.pool.global_max_agents);
    let (context, mut events) = ConnectionContext::new(&config, limiter, factory);
    let context = Arc::new(context);
    let primary = config.budget.primary_monitor_id.clone();

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.register(Arc::clone(&context));
    let app_shutdown = Arc::clone(&shutdown);
    run_until_shutdown(Arc::clone(&shutdown), async move {
        let reason = match read_tasks(&context, &primary).await {
            Ok(true) => ShutdownReason::UserInitiated,
            Ok(false) => ShutdownReason::InputClosed,
            Err(e) => ShutdownReason::FatalError(e.to_string()),
        };
        app_shutdown.trigger(reason);
    })
    .await;

    Ok(())
}

/// 返回 true 表示用户输入了 /quit，false 表示输入流结束
async fn read_tasks(context: &ConnectionContext, monitor_id: &str) -> std::io::Result<bool> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let processor = context.processor();
        let mut parts = line.splitn(3, ' ');
        match parts.next().unwrap_or_default() {
            "/quit" => return Ok(true),
            "/stats" => println!("{:?}", processor.pool_stats()),
            "/cache" => {
                for entry in processor.cache().list_entries() {
                    println!(
                        "[{}] {} ({} actions, used {}, failed {})",
                        entry.id,
                        entry.label,
                        entry.actions.len(),
                        entry.use_count,
                        entry.failure_count
                    );
                }
            }
            "/replay" => {
                let id = parts.next().unwrap_or_default();
                match processor.replay_cached(id, monitor_id).await {
                    Ok(true) => {}
                    Ok(false) => println!("replay of {} skipped: required windows are gone", id),
                    Err(e) => println!("replay failed: {}", e),
                }
            }
            "/close" => {
                let window_id = parts.next().unwrap_or_default();
                let decision = processor.handle_window_closed(window_id).await;
                println!("{:?}", decision);
            }
            "/window" => {
                let window_id = parts.next().unwrap_or_default();
                let content = parts.next().unwrap_or_default();
                if let Err(e) = processor
                    .process_window_task(window_id, Task::new(content, monitor_id))
                    .await
                {
                    println!("window task failed: {}", e);
                }
            }
            _ => {
                let processor = processor.clone();
                let task = Task::new(line, monitor_id);
                tokio::spawn(async move {
                    if let Err(e) = processor.queue_main_task(task).await {
                        tracing::debug!("Task not processed: {}", e);
                    }
                });
            }
        }
    }
    Ok(false)
}

fn print_event(event: &ProcessorEvent) {
    match event {
        ProcessorEvent::AgentResponse { agent, content, .. } => println!("[{}] {}", agent, content),
        ProcessorEvent::Actions { agent, actions, .. } => {
            for action in actions {
                println!("[{}] action {}", agent, action.action_type);
            }
        }
        ProcessorEvent::Queued { position, .. } => println!("queued at position {}", position),
        ProcessorEvent::QueueFull { max, .. } => println!("queue full ({} waiting), task dropped", max),
        ProcessorEvent::Steered { .. } => println!("steered into running task"),
        ProcessorEvent::Error { message, .. } => println!("error: {}", message),
        ProcessorEvent::CacheReplayed { entry_id, actions } => {
            println!("replayed {} ({} actions)", entry_id, actions.len())
        }
        ProcessorEvent::WindowActionsReplayed { window_id, actions } => {
            println!("window {} unlocked, {} queued actions applied", window_id, actions.len())
        }
    }
}
