//! 会话存储
//!
//! SessionStore 是核心唯一的共享可变资源：按会话键提供「读快照、提交变更」的原子原语，
//! 以及跨回合串行化所需的 FIFO 回合许可。Router / Aggregator 不直接持有会话记录。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::session::conversation::{
    Conversation, ConversationKey, ConversationSnapshot, PendingPlan, Turn,
};

/// 存储层错误：仅持久化失败一种；回合进入 Aborted 的唯一来源
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage failure: {0}")]
    Persistence(String),
}

/// 计划字段的提交方式
#[derive(Debug, Clone)]
pub enum PlanUpdate {
    /// 不动（快照中的计划保持原样）
    Keep,
    /// 覆盖为新计划（新建或推进一步后的剩余部分）
    Set(PendingPlan),
    /// 清除（完成 / 放弃 / 超时）
    Clear,
}

/// 一次回合提交：新回合 + 计划处置 + 可选时区更新，按会话键原子应用
#[derive(Debug, Clone)]
pub struct TurnCommit {
    pub turn: Turn,
    pub plan: PlanUpdate,
    pub utc_offset_minutes: Option<i32>,
}

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 获取该会话的回合许可；许可按到达顺序发放（FIFO），持有期间该会话不会有并发回合
    async fn turn_permit(&self, key: &ConversationKey) -> OwnedMutexGuard<()>;

    /// 读取会话快照；不存在则创建新会话
    async fn snapshot(&self, key: &ConversationKey) -> ConversationSnapshot;

    /// 原子提交一个回合
    async fn commit(&self, key: &ConversationKey, commit: TurnCommit) -> Result<(), StoreError>;

    /// 清理过期会话（留存策略归存储所有，路由器不关心）
    async fn cleanup_expired(&self) -> usize;

    /// 活跃会话数
    async fn active_count(&self) -> usize;
}

struct Entry {
    conversation: Conversation,
    /// 回合串行锁：tokio Mutex 按请求顺序公平发放
    turn_lock: Arc<Mutex<()>>,
}

/// 内存会话存储
pub struct MemorySessionStore {
    entries: RwLock<HashMap<ConversationKey, Entry>>,
    max_history_turns: usize,
    session_timeout: Duration,
    default_utc_offset_minutes: i32,
}

impl MemorySessionStore {
    pub fn new(max_history_turns: usize, session_timeout_secs: u64, default_utc_offset_minutes: i32) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_history_turns,
            session_timeout: Duration::from_secs(session_timeout_secs),
            default_utc_offset_minutes,
        }
    }

    async fn ensure_entry(&self, key: &ConversationKey) -> Arc<Mutex<()>> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                return entry.turn_lock.clone();
            }
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(key.clone())
            .or_insert_with(|| Entry {
                conversation: Conversation::new(key.clone(), self.default_utc_offset_minutes),
                turn_lock: Arc::new(Mutex::new(())),
            })
            .turn_lock
            .clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn turn_permit(&self, key: &ConversationKey) -> OwnedMutexGuard<()> {
        let lock = self.ensure_entry(key).await;
        lock.lock_owned().await
    }

    async fn snapshot(&self, key: &ConversationKey) -> ConversationSnapshot {
        self.ensure_entry(key).await;
        let entries = self.entries.read().await;
        entries
            .get(key)
            .map(|e| e.conversation.snapshot())
            .unwrap_or_else(|| Conversation::new(key.clone(), self.default_utc_offset_minutes).snapshot())
    }

    async fn commit(&self, key: &ConversationKey, commit: TurnCommit) -> Result<(), StoreError> {
        self.ensure_entry(key).await;
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| StoreError::Persistence(format!("conversation {key} vanished")))?;

        let convo = &mut entry.conversation;
        convo.push_turn(commit.turn, self.max_history_turns);
        match commit.plan {
            PlanUpdate::Keep => {}
            PlanUpdate::Set(plan) => convo.pending_plan = Some(plan),
            PlanUpdate::Clear => convo.pending_plan = None,
        }
        if let Some(offset) = commit.utc_offset_minutes {
            convo.utc_offset_minutes = offset;
        }
        Ok(())
    }

    async fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        // 回合进行中或许可已被取走（Arc 在外部持有，可能正在等锁）的会话不回收，
        // 否则等锁方会锁到孤儿互斥量，同键回合失去串行保证
        entries.retain(|_, e| {
            !e.conversation.is_expired(self.session_timeout)
                || Arc::strong_count(&e.turn_lock) > 1
                || e.turn_lock.try_lock().is_err()
        });
        before - entries.len()
    }

    async fn active_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::envelope::ReplyStatus;
    use std::sync::Arc;

    fn store() -> MemorySessionStore {
        MemorySessionStore::new(20, 3600, 0)
    }

    #[tokio::test]
    async fn test_snapshot_creates_conversation() {
        let store = store();
        let key = ConversationKey::new("api", "alice");
        let snap = store.snapshot(&key).await;
        assert!(snap.turns.is_empty());
        assert_eq!(store.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_commit_appends_turn_and_sets_plan() {
        let store = store();
        let key = ConversationKey::new("api", "alice");

        store
            .commit(
                &key,
                TurnCommit {
                    turn: Turn::new("hi", vec![], "hello", ReplyStatus::Ok),
                    plan: PlanUpdate::Set(PendingPlan::new("goal", vec![])),
                    utc_offset_minutes: Some(420),
                },
            )
            .await
            .unwrap();

        let snap = store.snapshot(&key).await;
        assert_eq!(snap.turns.len(), 1);
        assert!(snap.pending_plan.is_some());
        assert_eq!(snap.utc_offset_minutes, 420);
    }

    #[tokio::test]
    async fn test_turns_serialized_in_arrival_order() {
        let store = Arc::new(store());
        let key = ConversationKey::new("slack", "bob");
        let order = Arc::new(Mutex::new(Vec::new()));

        // 先到先得：第一个任务先拿到许可并短暂持有
        let first_permit = store.turn_permit(&key).await;

        let mut handles = Vec::new();
        for i in 0..3 {
            let store = store.clone();
            let key = key.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                // 错开提交时刻，保证许可请求按 i 顺序排队
                tokio::time::sleep(Duration::from_millis(10 * (i as u64 + 1))).await;
                let _permit = store.turn_permit(&key).await;
                order.lock().await.push(i);
            }));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(first_permit);
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block_each_other() {
        let store = store();
        let a = ConversationKey::new("api", "a");
        let b = ConversationKey::new("api", "b");
        let _permit_a = store.turn_permit(&a).await;
        // 另一会话的许可立即可得
        let _permit_b = store.turn_permit(&b).await;
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let store = MemorySessionStore::new(20, 0, 0);
        let key = ConversationKey::new("api", "stale");
        store.snapshot(&key).await;
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.cleanup_expired().await, 1);
        assert_eq!(store.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_entry_while_permit_is_pending() {
        let store = MemorySessionStore::new(20, 0, 0);
        let key = ConversationKey::new("api", "racer");

        // 锁 Arc 已被取走但尚未 lock：等同于 turn_permit 进行到一半
        let pending_lock = store.ensure_entry(&key).await;
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.cleanup_expired().await, 0);
        assert_eq!(store.active_count().await, 1);

        // 拿到许可后仍指向同一互斥量，串行保证未被破坏
        let _permit = pending_lock.lock_owned().await;
        assert_eq!(store.cleanup_expired().await, 0);

        // 许可释放且 Arc 归还后，过期会话照常回收
        drop(_permit);
        assert_eq!(store.cleanup_expired().await, 1);
    }
}
