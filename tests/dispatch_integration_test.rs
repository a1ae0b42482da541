//! 派发集成测试：通过脚本化会话端到端驱动 TaskProcessor

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use agentdesk::config::AppConfig;
    use agentdesk::core::OrchestratorError;
    use agentdesk::pool::AgentLimiter;
    use agentdesk::provider::{ProviderKind, ScriptedSessionFactory, SteerOutcome};
    use agentdesk::windows::WindowStore;
    use agentdesk::{ConnectionContext, DispatchOutcome, ProcessorEvent, Task};
    use tokio::sync::{mpsc, Notify};

    fn context(
        config: &AppConfig,
        factory: Arc<ScriptedSessionFactory>,
    ) -> (Arc<ConnectionContext>, mpsc::UnboundedReceiver<ProcessorEvent>) {
        let (context, events) = ConnectionContext::new(config, AgentLimiter::new(16), factory);
        (Arc::new(context), events)
    }

    fn collect(rx: &mut mpsc::UnboundedReceiver<ProcessorEvent>, into: &mut Vec<ProcessorEvent>) {
        while let Ok(event) = rx.try_recv() {
            into.push(event);
        }
    }

    async fn wait_for_log(factory: &ScriptedSessionFactory, entry: &str) {
        for _ in 0..500 {
            if factory.log().iter().any(|e| e == entry) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("log entry {} never appeared: {:?}", entry, factory.log());
    }

    async fn wait_for_turns(factory: &ScriptedSessionFactory, count: usize) {
        for _ in 0..500 {
            if factory.log().iter().filter(|e| e.starts_with("handle:")).count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("only saw {:?}, expected {} turns", factory.log(), count);
    }

    fn response_for(events: &[ProcessorEvent], message_id: &str) -> Option<String> {
        events.iter().find_map(|e| match e {
            ProcessorEvent::AgentResponse { message_id: id, content, .. } if id == message_id => {
                Some(content.clone())
            }
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_busy_main_falls_back_to_ephemeral_then_queue() {
        let gate = Arc::new(Notify::new());
        let factory = Arc::new(ScriptedSessionFactory::new(ProviderKind::Claude).with_gate(Arc::clone(&gate)));
        let mut config = AppConfig::default();
        config.pool.max_agents = 2;
        config.queue.max_size = 1;
        let (context, mut rx) = context(&config, factory.clone());

        let first = Task::new("first", "main");
        let processor = context.processor().clone();
        let t1 = {
            let task = first.clone();
            tokio::spawn(async move { processor.queue_main_task(task).await })
        };
        wait_for_log(&factory, "handle:0").await;

        let processor = context.processor().clone();
        let t2 = tokio::spawn(async move { processor.queue_main_task(Task::new("second", "main")).await });
        wait_for_log(&factory, "handle:1").await;
        assert_eq!(context.processor().pool_stats().busy_agents, 2);

        let third = Task::new("third", "main");
        let outcome = context.processor().queue_main_task(third.clone()).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Queued(1));

        let err = context
            .processor()
            .queue_main_task(Task::new("fourth", "main"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::QueueFull { max: 1 }));

        let mut events = Vec::new();
        for _ in 0..500 {
            gate.notify_waiters();
            tokio::time::sleep(Duration::from_millis(2)).await;
            collect(&mut rx, &mut events);
            if response_for(&events, &third.message_id).is_some() {
                break;
            }
        }

        assert_eq!(t1.await.unwrap().unwrap(), DispatchOutcome::Main);
        assert_eq!(t2.await.unwrap().unwrap(), DispatchOutcome::Ephemeral);
        assert_eq!(response_for(&events, &first.message_id).as_deref(), Some("Echo: first"));
        assert_eq!(response_for(&events, &third.message_id).as_deref(), Some("Echo: third"));
        assert!(events.iter().any(|e| matches!(e, ProcessorEvent::Queued { position: 1, .. })));
        assert!(events.iter().any(|e| matches!(e, ProcessorEvent::QueueFull { max: 1, .. })));

        // 一次性 Agent 用完即销毁
        assert!(factory.log().contains(&"cleanup:1".to_string()));
        let prompts = factory.prompts();
        let order: Vec<&str> = prompts.iter().filter_map(|p| p.lines().last()).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
        assert_eq!(context.processor().queue_len(), 0);
    }

    #[tokio::test]
    async fn test_steering_accepted_by_running_main_agent() {
        let gate = Arc::new(Notify::new());
        let factory = Arc::new(
            ScriptedSessionFactory::new(ProviderKind::Claude)
                .with_gate(Arc::clone(&gate))
                .with_steer(SteerOutcome::Accepted),
        );
        let (context, mut rx) = context(&AppConfig::default(), factory.clone());

        let processor = context.processor().clone();
        let t1 = tokio::spawn(async move { processor.queue_main_task(Task::new("draft a note", "main")).await });
        wait_for_log(&factory, "handle:0").await;

        let steer = Task::new("make it shorter", "main");
        let outcome = context.processor().queue_main_task(steer.clone()).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Steered);
        assert!(factory.log().contains(&"steer:0:make it shorter".to_string()));
        assert_eq!(factory.sessions_created(), 1);

        while !t1.is_finished() {
            gate.notify_waiters();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let mut events = Vec::new();
        collect(&mut rx, &mut events);
        assert!(events.contains(&ProcessorEvent::Steered {
            message_id: steer.message_id
        }));
    }

    #[tokio::test]
    async fn test_output_budget_interrupts_background_monitor() {
        let factory = Arc::new(
            ScriptedSessionFactory::new(ProviderKind::Claude)
                .with_responses(["a very long response that blows the output budget"]),
        );
        let mut config = AppConfig::default();
        config.budget.max_output_bytes_per_minute = 10;
        let (context, mut rx) = context(&config, factory.clone());

        let outcome = context
            .processor()
            .queue_main_task(Task::new("poll inbox", "bg-mail"))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Main);
        assert!(factory.log().contains(&"interrupt:0".to_string()));
        assert!(!context.budget().check_output_budget("bg-mail"));

        let mut events = Vec::new();
        collect(&mut rx, &mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            ProcessorEvent::Error { message, .. } if message.contains("Output budget exceeded")
        )));

        // 主监视器不受限
        assert!(context.budget().check_output_budget("main"));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_budget_waiters() {
        let gate = Arc::new(Notify::new());
        let factory = Arc::new(ScriptedSessionFactory::new(ProviderKind::Claude).with_gate(gate));
        let mut config = AppConfig::default();
        config.budget.max_concurrent = 1;
        let (context, _rx) = context(&config, factory.clone());

        let processor = context.processor().clone();
        let running = tokio::spawn(async move { processor.queue_main_task(Task::new("scan", "bg-1")).await });
        wait_for_log(&factory, "handle:0").await;

        let processor = context.processor().clone();
        let waiting = tokio::spawn(async move { processor.queue_main_task(Task::new("scan", "bg-2")).await });
        while context.budget().waiting() == 0 {
            tokio::task::yield_now().await;
        }

        context.shutdown().await;
        assert!(matches!(
            waiting.await.unwrap(),
            Err(OrchestratorError::BudgetRejected(_))
        ));
        assert!(running.await.unwrap().is_err());
        assert_eq!(context.pool().len(), 0);
    }

    #[tokio::test]
    async fn test_window_group_cache_replay_and_invalidation() {
        let factory = Arc::new(ScriptedSessionFactory::new(ProviderKind::Claude).with_responses([
            "Opened.\n```json\n{\"type\": \"window.create\", \"windowId\": \"w1\", \"title\": \"Notes\"}\n```\n",
            "Split.\n```json\n{\"type\": \"window.create\", \"windowId\": \"w2\"}\n```\n```json\n{\"type\": \"window.setTitle\", \"windowId\": \"w1\", \"title\": \"Left\"}\n```\n",
        ]));
        let (context, mut rx) = context(&AppConfig::default(), factory.clone());
        let processor = context.processor();

        processor.queue_main_task(Task::new("open notes", "main")).await.unwrap();
        assert!(context.registry().has_window("w1"));

        let outcome = processor
            .process_window_task("w1", Task::new("split view", "main"))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Window);
        assert_eq!(context.registry().get_window("w1").unwrap().title, "Left");
        assert_eq!(processor.window_history("w1").len(), 2);
        assert!(factory.prompts()[1].contains("<open_windows>w1</open_windows>"));

        let entry = context
            .cache()
            .list_entries()
            .into_iter()
            .find(|e| e.label == "split view")
            .unwrap();
        assert_eq!(entry.required_window_ids, vec!["w1".to_string()]);

        assert!(processor.replay_cached(&entry.id, "main").await.unwrap());
        assert_eq!(context.cache().get(&entry.id).unwrap().use_count, 1);
        let mut events = Vec::new();
        collect(&mut rx, &mut events);
        assert!(events
            .iter()
            .any(|e| matches!(e, ProcessorEvent::CacheReplayed { entry_id, .. } if *entry_id == entry.id)));

        // w2 由 w1 的 Agent 派生，关闭根窗口后组仍在
        let decision = processor.handle_window_closed("w1").await;
        assert!(!decision.should_dispose_agent);
        assert_eq!(decision.new_root.as_deref(), Some("w2"));
        assert!(context.cache().get(&entry.id).is_none());
        assert!(!context.registry().has_window("w1"));

        let decision = processor.handle_window_closed("w2").await;
        assert!(decision.should_dispose_agent);

        assert!(matches!(
            processor.process_window_task("w1", Task::new("again", "main")).await,
            Err(OrchestratorError::WindowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_window_turn_holds_lock_and_replays_queued_actions() {
        let gate = Arc::new(Notify::new());
        let factory = Arc::new(
            ScriptedSessionFactory::new(ProviderKind::Claude)
                .with_gate(Arc::clone(&gate))
                .with_responses([
                    "```json\n{\"type\": \"window.create\", \"windowId\": \"w1\", \"title\": \"Notes\"}\n```\n",
                    "```json\n{\"type\": \"window.setTitle\", \"windowId\": \"w1\", \"title\": \"Main\"}\n```\n",
                    "```json\n{\"type\": \"window.setTitle\", \"windowId\": \"w1\", \"title\": \"Left\"}\n```\n",
                ]),
        );
        let (context, mut rx) = context(&AppConfig::default(), factory.clone());

        let processor = context.processor().clone();
        let opened = tokio::spawn(async move { processor.queue_main_task(Task::new("open notes", "main")).await });
        while !opened.is_finished() {
            gate.notify_waiters();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        opened.await.unwrap().unwrap();
        assert_eq!(context.registry().get_window("w1").unwrap().title, "Notes");

        let processor = context.processor().clone();
        let main_turn = tokio::spawn(async move { processor.queue_main_task(Task::new("rename it", "main")).await });
        wait_for_turns(&factory, 2).await;

        let processor = context.processor().clone();
        let window_turn = tokio::spawn(async move {
            processor.process_window_task("w1", Task::new("retitle", "main")).await
        });
        wait_for_turns(&factory, 3).await;
        assert!(context.registry().get_window("w1").unwrap().locked_by.is_some());

        // 先放行主 Agent：它对 w1 的改动排在窗口锁后面
        gate.notify_one();
        assert_eq!(main_turn.await.unwrap().unwrap(), DispatchOutcome::Main);
        assert_eq!(context.registry().get_window("w1").unwrap().title, "Notes");
        assert_eq!(context.registry().pending_count("w1"), 1);

        gate.notify_one();
        assert_eq!(window_turn.await.unwrap().unwrap(), DispatchOutcome::Window);
        let window = context.registry().get_window("w1").unwrap();
        assert_eq!(window.title, "Main");
        assert!(window.locked_by.is_none());
        assert_eq!(context.registry().pending_count("w1"), 0);

        let mut events = Vec::new();
        collect(&mut rx, &mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            ProcessorEvent::WindowActionsReplayed { window_id, actions }
                if window_id == "w1" && actions.len() == 1
        )));
    }
}
