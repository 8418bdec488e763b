//! 工具并发调度：Semaphore 限制单回合内的并发工具调用数

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// 工具调度器
pub struct ToolScheduler {
    tool_semaphore: Arc<Semaphore>,
}

impl ToolScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_concurrent_tools.max(1))),
        }
    }

    /// 获取工具执行许可
    pub async fn acquire_tool(&self) -> tokio::sync::OwnedSemaphorePermit {
        // Semaphore 在进程生命周期内不关闭
        self.tool_semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed")
    }

    /// 检查是否应取消
    pub fn is_cancelled(token: &CancellationToken) -> bool {
        token.is_cancelled()
    }
}

impl Default for ToolScheduler {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_capped() {
        let scheduler = Arc::new(ToolScheduler::new(2));
        let p1 = scheduler.acquire_tool().await;
        let _p2 = scheduler.acquire_tool().await;

        let third = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _p3 = scheduler.acquire_tool().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!third.is_finished());

        drop(p1);
        tokio::time::timeout(Duration::from_millis(100), third)
            .await
            .unwrap()
            .unwrap();
    }
}
