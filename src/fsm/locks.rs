//! 会话级单写者锁
//!
//! 同一会话上的并发 `apply` 串行执行；不再被持有的锁在下次获取时清理。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取会话锁，守卫释放前同一会话的其他调用在此等待
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // 引用计数为 1 说明只剩表内这一份，没有持有者也没有等待者
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// 表内锁的数量（含已释放、尚未清理的）
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_session_serializes() {
        let locks = Arc::new(SessionLocks::new());
        let guard = locks.acquire("s1").await;

        let locks2 = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let _g = locks2.acquire("s1").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_released_locks_are_pruned() {
        let locks = SessionLocks::new();
        drop(locks.acquire("s1").await);
        drop(locks.acquire("s2").await);
        // 获取 s3 时清理 s1 / s2
        let _g = locks.acquire("s3").await;
        assert_eq!(locks.len().await, 1);
    }
}
