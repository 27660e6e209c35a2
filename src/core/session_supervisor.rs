//! 会话监管：取消与按会话串行化
//!
//! - 持有根 CancellationToken，用户 Ctrl+C 时取消所有正在进行的转移（不写检查点）；
//!   取消后立即换上新的根 token，之后的 turn 不受影响
//! - 为每个 session_id 提供一把异步互斥锁，保证同一会话的 turn / replay 串行执行，
//!   不同会话互不阻塞；最后一个持有者释放后锁条目被移除

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

fn lock_map(locks: &Mutex<LockMap>) -> MutexGuard<'_, LockMap> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 会话级生命周期管理
#[derive(Debug, Default)]
pub struct SessionSupervisor {
    /// 当前根 token：触发后所有子 token 一并取消
    cancel_token: Mutex<CancellationToken>,
    /// session_id -> 串行化锁
    locks: Arc<Mutex<LockMap>>,
}

/// 会话锁；drop 时释放，若已无人等待则清理条目
pub struct SessionLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    session_id: String,
    locks: Arc<Mutex<LockMap>>,
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = lock_map(&self.locks);
        // 只剩 map 自己持有时，没有等待者
        if locks
            .get(&self.session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.session_id);
        }
    }
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn root(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel_token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.root().clone()
    }

    /// 取消当前正在进行的 turn / replay（用户 Ctrl+C）；之后创建的子 token 不受影响
    pub fn cancel(&self) {
        let previous = std::mem::take(&mut *self.root());
        previous.cancel();
    }

    /// 创建子 token（用于单次 turn）
    pub fn child_token(&self) -> CancellationToken {
        self.root().child_token()
    }

    /// 获取会话锁；guard 释放前同一会话的其他操作会等待
    pub async fn lock_session(&self, session_id: &str) -> SessionLockGuard {
        let lock = lock_map(&self.locks)
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        SessionLockGuard {
            guard: Some(lock.lock_owned().await),
            session_id: session_id.to_string(),
            locks: self.locks.clone(),
        }
    }

    /// 当前持有锁条目的会话数
    pub fn tracked_sessions(&self) -> usize {
        lock_map(&self.locks).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_session_is_serialized() {
        let supervisor = Arc::new(SessionSupervisor::new());
        let guard = supervisor.lock_session("s1").await;

        let sup = supervisor.clone();
        let waiter = tokio::spawn(async move {
            let _g = sup.lock_session("s1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_sessions_do_not_block() {
        let supervisor = SessionSupervisor::new();
        let _a = supervisor.lock_session("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), supervisor.lock_session("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_lock_entries_are_released() {
        let supervisor = Arc::new(SessionSupervisor::new());
        for i in 0..10 {
            let _g = supervisor.lock_session(&format!("s{i}")).await;
        }
        assert_eq!(supervisor.tracked_sessions(), 0);

        // 有等待者时条目保留，等待者结束后再移除
        let guard = supervisor.lock_session("busy").await;
        let sup = supervisor.clone();
        let waiter = tokio::spawn(async move {
            let _g = sup.lock_session("busy").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert_eq!(supervisor.tracked_sessions(), 1);
        waiter.await.unwrap();
        assert_eq!(supervisor.tracked_sessions(), 0);
    }

    #[test]
    fn test_child_token_follows_parent() {
        let supervisor = SessionSupervisor::new();
        let child = supervisor.child_token();
        assert!(!child.is_cancelled());
        supervisor.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_cancel_only_affects_existing_tokens() {
        let supervisor = SessionSupervisor::new();
        let before = supervisor.child_token();
        supervisor.cancel();
        let after = supervisor.child_token();
        assert!(before.is_cancelled());
        assert!(!after.is_cancelled());
        assert!(!supervisor.cancel_token().is_cancelled());
    }
}
