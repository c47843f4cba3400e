//! 编排实例注册表（conversation_id -> 实例）
//!
//! 生命周期显式管理：`close` 主动关闭，`cleanup_expired` 清理闲置超时与已退出的实例，
//! 超出容量时驱逐最久未活跃的实例。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestrationConfig;
use crate::core::OrchestrationError;
use crate::orchestration::actors::PhaseActors;
use crate::orchestration::events::OrchestrationEvent;
use crate::orchestration::runtime::{self, OrchestratorHandle, OrchestratorOptions};

/// 活跃时间记在句柄上：经注册表、或直接经句柄发送的事件都会刷新
fn is_expired(handle: &OrchestratorHandle, timeout: Duration) -> bool {
    handle.is_finished() || handle.idle_for() > timeout
}

pub struct OrchestrationRegistry {
    instances: RwLock<HashMap<String, OrchestratorHandle>>,
    actors: PhaseActors,
    options: OrchestratorOptions,
    idle_timeout: Duration,
    max_instances: usize,
}

impl OrchestrationRegistry {
    pub fn new(
        actors: PhaseActors,
        options: OrchestratorOptions,
        idle_timeout: Duration,
        max_instances: usize,
    ) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            actors,
            options,
            idle_timeout,
            max_instances: max_instances.max(1),
        }
    }

    pub fn from_config(actors: PhaseActors, config: &OrchestrationConfig) -> Self {
        Self::new(
            actors,
            OrchestratorOptions::from(config),
            Duration::from_secs(config.idle_timeout_secs),
            config.max_instances,
        )
    }

    /// 获取会话的实例，不存在（或已退出）时启动新实例
    pub async fn get_or_spawn(&self, conversation_id: &str) -> OrchestratorHandle {
        let (handle, evicted) = {
            let mut instances = self.instances.write().await;

            if let Some(handle) = instances.get(conversation_id) {
                if !handle.is_finished() {
                    handle.touch();
                    return handle.clone();
                }
                instances.remove(conversation_id);
            }

            let evicted = if instances.len() >= self.max_instances {
                let lru = instances
                    .iter()
                    .min_by_key(|(_, h)| h.last_active())
                    .map(|(id, _)| id.clone());
                lru.and_then(|id| instances.remove(&id))
            } else {
                None
            };

            let handle =
                runtime::spawn(conversation_id, self.actors.clone(), self.options.clone());
            instances.insert(conversation_id.to_string(), handle.clone());
            (handle, evicted)
        };

        if let Some(lru) = evicted {
            tracing::info!(
                conversation_id = lru.conversation_id(),
                "Registry full, evicting least recently active orchestration"
            );
            stop(&lru).await;
        }
        handle
    }

    pub async fn get(&self, conversation_id: &str) -> Option<OrchestratorHandle> {
        self.instances
            .read()
            .await
            .get(conversation_id)
            .filter(|h| !h.is_finished())
            .cloned()
    }

    /// 向会话的实例发送事件（按需启动）
    pub async fn send(
        &self,
        conversation_id: &str,
        event: OrchestrationEvent,
    ) -> Result<(), OrchestrationError> {
        let handle = self.get_or_spawn(conversation_id).await;
        handle.send(event).await
    }

    /// 关闭并移除实例
    pub async fn close(&self, conversation_id: &str) -> bool {
        let removed = self.instances.write().await.remove(conversation_id);
        match removed {
            Some(handle) => {
                stop(&handle).await;
                true
            }
            None => false,
        }
    }

    /// 清理闲置超时或已退出的实例
    pub async fn cleanup_expired(&self) -> usize {
        let expired: Vec<OrchestratorHandle> = {
            let mut instances = self.instances.write().await;
            let ids: Vec<String> = instances
                .iter()
                .filter(|(_, h)| is_expired(h, self.idle_timeout))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| instances.remove(id)).collect()
        };

        for handle in &expired {
            stop(handle).await;
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// 后台定期清理，`shutdown` 触发后退出
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => {
                        let expired = self.cleanup_expired().await;
                        if expired > 0 {
                            tracing::info!("Cleaned up {} expired orchestrations", expired);
                        }
                    }
                }
            }
        })
    }
}

async fn stop(handle: &OrchestratorHandle) {
    // 已退出的实例无需再停
    let _ = handle.send(OrchestrationEvent::Stop).await;
}
