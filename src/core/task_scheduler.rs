//! 工具并发调度
//!
//! 同一批 RunTools 内的工具调用互不依赖，可并发执行；Semaphore 限制同时运行的工具数量。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 任务调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    /// 工具并发限制
    tool_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_concurrent_tools.max(1))),
        }
    }

    /// 获取工具执行许可；Semaphore 从不关闭，None 只在关闭后出现
    pub async fn acquire_tool(&self) -> Option<OwnedSemaphorePermit> {
        self.tool_semaphore.clone().acquire_owned().await.ok()
    }

    pub fn available_permits(&self) -> usize {
        self.tool_semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_are_bounded() {
        let scheduler = TaskScheduler::new(2);
        let p1 = scheduler.acquire_tool().await;
        let _p2 = scheduler.acquire_tool().await;
        assert_eq!(scheduler.available_permits(), 0);
        drop(p1);
        assert_eq!(scheduler.available_permits(), 1);
    }

    #[test]
    fn test_zero_is_clamped_to_one() {
        assert_eq!(TaskScheduler::new(0).available_permits(), 1);
    }
}
