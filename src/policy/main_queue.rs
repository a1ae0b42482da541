//! 主队列：暂时无法派发的任务按 FIFO 等待主 Agent 空闲

use std::collections::VecDeque;

use crate::core::OrchestratorError;
use crate::processor::Task;

#[derive(Debug)]
pub struct MainQueuePolicy {
    tasks: VecDeque<Task>,
    max_size: usize,
}

impl MainQueuePolicy {
    pub fn new(max_size: usize) -> Self {
        Self {
            tasks: VecDeque::new(),
            max_size,
        }
    }

    /// 入队，返回从 1 开始的排队位置；满时返回 QueueFull，任务被丢弃
    pub fn enqueue(&mut self, task: Task) -> Result<usize, OrchestratorError> {
        if self.tasks.len() >= self.max_size {
            tracing::warn!(message_id = %task.message_id, max = self.max_size, "Main queue full, dropping task");
            return Err(OrchestratorError::QueueFull { max: self.max_size });
        }
        self.tasks.push_back(task);
        Ok(self.tasks.len())
    }

    pub fn dequeue(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    pub fn peek(&self) -> Option<&Task> {
        self.tasks.front()
    }

    /// 取出后未能派发的任务放回队首（不受容量限制，保持 FIFO）
    pub fn requeue_front(&mut self, task: Task) {
        self.tasks.push_front(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tasks.len() >= self.max_size
    }

    pub fn clear(&mut self) -> usize {
        let n = self.tasks.len();
        self.tasks.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_and_positions() {
        let mut queue = MainQueuePolicy::new(2);
        assert_eq!(queue.enqueue(Task::new("first", "main")).unwrap(), 1);
        assert_eq!(queue.enqueue(Task::new("second", "main")).unwrap(), 2);
        assert!(queue.is_full());

        let err = queue.enqueue(Task::new("third", "main")).unwrap_err();
        assert!(matches!(err, OrchestratorError::QueueFull { max: 2 }));

        assert_eq!(queue.dequeue().unwrap().content, "first");
        assert_eq!(queue.dequeue().unwrap().content, "second");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let mut queue = MainQueuePolicy::new(2);
        queue.enqueue(Task::new("a", "main")).unwrap();
        queue.enqueue(Task::new("b", "main")).unwrap();
        let head = queue.dequeue().unwrap();
        queue.requeue_front(head);
        assert_eq!(queue.peek().unwrap().content, "a");
        assert_eq!(queue.clear(), 2);
    }
}
