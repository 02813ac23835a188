//! 请求/响应关联器
//!
//! 每个发往外部的请求（工具调用、用户确认）登记一个一次性通道；回复到达时按 id 取出并唤醒等待方。
//! 工具调用与确认使用互相独立的 id 空间。
//!
//! 保证：
//! - 同一时刻每个 key 至多一个条目，重复登记返回 `CorrelationError::Duplicate`
//! - 每个等待方恰好收到一次结果（回复 / 取消 / 超时），进程退出除外
//! - 未知或迟到的回复只记日志，不影响任何任务
//!
//! 映射表由单个互斥锁保护，锁从不跨越 `.await`。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::core::CorrelationError;

/// id 空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdSpace {
    ToolCall,
    Confirm,
}

/// 关联键：id 空间 + 不透明 id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub space: IdSpace,
    pub id: String,
}

impl CorrelationKey {
    pub fn tool_call(id: impl Into<String>) -> Self {
        Self {
            space: IdSpace::ToolCall,
            id: id.into(),
        }
    }

    pub fn confirm(id: impl Into<String>) -> Self {
        Self {
            space: IdSpace::Confirm,
            id: id.into(),
        }
    }

    /// 生成一个新的随机 id
    pub fn fresh(space: IdSpace) -> Self {
        Self {
            space,
            id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.space {
            IdSpace::ToolCall => write!(f, "tool_call:{}", self.id),
            IdSpace::Confirm => write!(f, "confirm:{}", self.id),
        }
    }
}

/// 条目归属：用于按任务 / 按连接批量取消
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub connection_id: String,
    pub task_id: String,
}

impl Owner {
    pub fn new(connection_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            task_id: task_id.into(),
        }
    }
}

/// 等待方最终收到的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// 外部回复（TOOL_RESPONSE.result / CONFIRM_RESPONSE）
    Reply(serde_json::Value),
    /// 被取消（任务取消、连接断开）
    Cancelled(String),
    /// 在时限内没有回复
    TimedOut,
}

struct Entry {
    owner: Owner,
    continuation: oneshot::Sender<Resolution>,
}

/// 挂起的等待方；只知道自己的 key
#[derive(Debug)]
pub struct Waiter {
    key: CorrelationKey,
    rx: oneshot::Receiver<Resolution>,
}

impl Waiter {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }
}

/// 关联器
#[derive(Default)]
pub struct Correlator {
    entries: Mutex<HashMap<CorrelationKey, Entry>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationKey, Entry>> {
        // 持锁期间不会 panic，中毒时直接取回数据
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 登记一个续体；key 仍在等待时返回 Duplicate
    pub fn register(
        &self,
        key: CorrelationKey,
        owner: Owner,
        continuation: oneshot::Sender<Resolution>,
    ) -> Result<(), CorrelationError> {
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            tracing::error!(%key, "duplicate correlation registration");
            return Err(CorrelationError::Duplicate(key));
        }
        tracing::debug!(%key, task_id = %owner.task_id, "correlation registered");
        entries.insert(
            key,
            Entry {
                owner,
                continuation,
            },
        );
        Ok(())
    }

    /// 创建通道并登记，返回等待方
    pub fn expect(&self, key: CorrelationKey, owner: Owner) -> Result<Waiter, CorrelationError> {
        let (tx, rx) = oneshot::channel();
        self.register(key.clone(), owner, tx)?;
        Ok(Waiter { key, rx })
    }

    /// 取出条目并以回复唤醒；没有条目时返回 Unknown（调用方记日志后丢弃）
    pub fn resolve(
        &self,
        key: &CorrelationKey,
        reply: serde_json::Value,
    ) -> Result<(), CorrelationError> {
        let entry = self.lock().remove(key);
        match entry {
            Some(entry) => {
                if entry.continuation.send(Resolution::Reply(reply)).is_err() {
                    tracing::debug!(%key, "waiter already gone, reply dropped");
                }
                Ok(())
            }
            None => {
                tracing::warn!(%key, "reply for unknown correlation, discarded");
                Err(CorrelationError::Unknown(key.clone()))
            }
        }
    }

    /// 取消单个条目；返回是否存在
    pub fn cancel(&self, key: &CorrelationKey, reason: &str) -> bool {
        let entry = self.lock().remove(key);
        match entry {
            Some(entry) => {
                let _ = entry
                    .continuation
                    .send(Resolution::Cancelled(reason.to_string()));
                tracing::info!(%key, reason, "correlation cancelled");
                true
            }
            None => false,
        }
    }

    /// 取消某任务的全部条目
    pub fn cancel_task(&self, task_id: &str, reason: &str) -> usize {
        self.cancel_where(|owner| owner.task_id == task_id, reason)
    }

    /// 连接关闭：取消该连接的全部条目
    pub fn cancel_connection(&self, connection_id: &str, reason: &str) -> usize {
        self.cancel_where(|owner| owner.connection_id == connection_id, reason)
    }

    fn cancel_where(&self, pred: impl Fn(&Owner) -> bool, reason: &str) -> usize {
        let removed: Vec<(CorrelationKey, Entry)> = {
            let mut entries = self.lock();
            let keys: Vec<CorrelationKey> = entries
                .iter()
                .filter(|(_, e)| pred(&e.owner))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
                .collect()
        };

        let count = removed.len();
        for (key, entry) in removed {
            tracing::info!(%key, task_id = %entry.owner.task_id, reason, "correlation cancelled");
            let _ = entry
                .continuation
                .send(Resolution::Cancelled(reason.to_string()));
        }
        count
    }

    /// 超时后移除条目；返回是否仍在表中
    pub fn expire(&self, key: &CorrelationKey) -> bool {
        self.lock().remove(key).is_some()
    }

    /// 等待回复；超时则移除条目并返回 `Resolution::TimedOut`
    pub async fn wait(&self, waiter: Waiter, timeout: Duration) -> Resolution {
        let Waiter { key, mut rx } = waiter;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Resolution::Cancelled("correlation dropped".to_string()),
            Err(_) => self.settle_timed_out(&key, &mut rx, timeout),
        }
    }

    /// 超时与回复同时到达：条目已被取走时，回复仍在通道里
    fn settle_timed_out(
        &self,
        key: &CorrelationKey,
        rx: &mut oneshot::Receiver<Resolution>,
        timeout: Duration,
    ) -> Resolution {
        if self.expire(key) {
            tracing::warn!(%key, timeout_secs = timeout.as_secs(), "correlation timed out");
            return Resolution::TimedOut;
        }
        match rx.try_recv() {
            Ok(resolution) => {
                tracing::debug!(%key, "reply arrived at timeout, delivered");
                resolution
            }
            Err(_) => Resolution::TimedOut,
        }
    }

    pub fn is_pending(&self, key: &CorrelationKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn owner(task: &str) -> Owner {
        Owner::new("conn-1", task)
    }

    #[tokio::test]
    async fn test_register_then_resolve_delivers_once() {
        let correlator = Correlator::new();
        let key = CorrelationKey::tool_call("abc");
        let waiter = correlator.expect(key.clone(), owner("t1")).unwrap();

        correlator.resolve(&key, json!({"success": true})).unwrap();
        assert!(!correlator.is_pending(&key));

        let res = correlator.wait(waiter, Duration::from_secs(1)).await;
        assert_eq!(res, Resolution::Reply(json!({"success": true})));

        // 第二次回复属于迟到回复
        let again = correlator.resolve(&key, json!({"success": false}));
        assert!(matches!(again, Err(CorrelationError::Unknown(_))));
    }

    #[test]
    fn test_reply_racing_timeout_is_kept() {
        let correlator = Correlator::new();
        let key = CorrelationKey::tool_call("late-but-in-time");
        let Waiter { key: _, mut rx } = correlator.expect(key.clone(), owner("t1")).unwrap();

        // 回复在超时触发之后、过期之前取走了条目
        correlator.resolve(&key, json!({"success": true})).unwrap();

        let res = correlator.settle_timed_out(&key, &mut rx, Duration::from_millis(10));
        assert_eq!(res, Resolution::Reply(json!({"success": true})));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_expired_entry_reports_timeout() {
        let correlator = Correlator::new();
        let key = CorrelationKey::tool_call("silent");
        let Waiter { key: _, mut rx } = correlator.expect(key.clone(), owner("t1")).unwrap();

        let res = correlator.settle_timed_out(&key, &mut rx, Duration::from_millis(10));
        assert_eq!(res, Resolution::TimedOut);
        assert!(!correlator.is_pending(&key));
        assert!(matches!(
            correlator.resolve(&key, json!({})),
            Err(CorrelationError::Unknown(_))
        ));
    }

    #[test]
    fn test_resolve_before_register_is_unknown() {
        let correlator = Correlator::new();
        let key = CorrelationKey::tool_call("never-sent");
        let res = correlator.resolve(&key, json!({}));
        assert_eq!(res, Err(CorrelationError::Unknown(key)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let correlator = Correlator::new();
        let key = CorrelationKey::tool_call("dup");
        let _w = correlator.expect(key.clone(), owner("t1")).unwrap();
        let second = correlator.expect(key.clone(), owner("t2"));
        assert!(matches!(second, Err(CorrelationError::Duplicate(k)) if k == key));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[test]
    fn test_id_spaces_are_independent() {
        let correlator = Correlator::new();
        let _a = correlator
            .expect(CorrelationKey::tool_call("same"), owner("t1"))
            .unwrap();
        let b = correlator.expect(CorrelationKey::confirm("same"), owner("t1"));
        assert!(b.is_ok());
        assert_eq!(correlator.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_task_resumes_with_cancellation() {
        let correlator = Correlator::new();
        let w1 = correlator
            .expect(CorrelationKey::tool_call("a"), owner("t1"))
            .unwrap();
        let _w2 = correlator
            .expect(CorrelationKey::tool_call("b"), owner("t2"))
            .unwrap();

        assert_eq!(correlator.cancel_task("t1", "user cancelled"), 1);
        let res = correlator.wait(w1, Duration::from_secs(1)).await;
        assert_eq!(res, Resolution::Cancelled("user cancelled".to_string()));
        assert_eq!(correlator.pending_count(), 1);

        // 取消后到达的回复被当作未知
        let late = correlator.resolve(&CorrelationKey::tool_call("a"), json!({}));
        assert!(matches!(late, Err(CorrelationError::Unknown(_))));
    }

    #[tokio::test]
    async fn test_cancel_connection_releases_all_entries() {
        let correlator = Correlator::new();
        let _a = correlator
            .expect(CorrelationKey::tool_call("a"), Owner::new("c1", "t1"))
            .unwrap();
        let _b = correlator
            .expect(CorrelationKey::confirm("b"), Owner::new("c1", "t2"))
            .unwrap();
        let _c = correlator
            .expect(CorrelationKey::tool_call("c"), Owner::new("c2", "t3"))
            .unwrap();

        assert_eq!(correlator.cancel_connection("c1", "connection closed"), 2);
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_wait_times_out_and_expires_entry() {
        let correlator = Correlator::new();
        let key = CorrelationKey::tool_call("slow");
        let waiter = correlator.expect(key.clone(), owner("t1")).unwrap();

        let res = correlator.wait(waiter, Duration::from_millis(10)).await;
        assert_eq!(res, Resolution::TimedOut);
        assert!(!correlator.is_pending(&key));
        assert!(correlator.resolve(&key, json!({})).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_replies_reach_matching_waiters() {
        let correlator = Arc::new(Correlator::new());
        let mut handles = Vec::new();

        for i in 0..32 {
            let key = CorrelationKey::tool_call(format!("id-{i}"));
            let waiter = correlator.expect(key, owner(&format!("t{i}"))).unwrap();
            let c = Arc::clone(&correlator);
            handles.push(tokio::spawn(async move {
                c.wait(waiter, Duration::from_secs(5)).await
            }));
        }

        for i in (0..32).rev() {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move {
                c.resolve(&CorrelationKey::tool_call(format!("id-{i}")), json!({ "n": i }))
                    .unwrap();
            });
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let res = handle.await.unwrap();
            assert_eq!(res, Resolution::Reply(json!({ "n": i })));
        }
        assert_eq!(correlator.pending_count(), 0);
    }
}
