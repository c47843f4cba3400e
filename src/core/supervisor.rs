//! Actor 监管：在途任务的取消令牌
//!
//! 每个编排实例只有一个在途 actor。开启新任务时取消上一个任务的令牌；实例停止时取消根令牌，所有子令牌随之失效。

use tokio_util::sync::CancellationToken;

/// 编排实例级的取消管理：根令牌 + 当前在途任务的子令牌
#[derive(Debug)]
pub struct ActorSupervisor {
    /// 实例停止时触发
    root: CancellationToken,
    /// 当前在途 actor 的令牌
    current: Option<CancellationToken>,
}

impl ActorSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            current: None,
        }
    }

    /// 取消上一个在途任务，并为下一个任务创建子令牌
    pub fn fresh_token(&mut self) -> CancellationToken {
        self.cancel_in_flight();
        let token = self.root.child_token();
        self.current = Some(token.clone());
        token
    }

    /// 取消当前在途任务（抢占 / 离开 running）
    pub fn cancel_in_flight(&mut self) {
        if let Some(token) = self.current.take() {
            token.cancel();
        }
    }

    /// 停止实例：取消根令牌
    pub fn shutdown(&mut self) {
        self.current = None;
        self.root.cancel();
    }
}

impl Default for ActorSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_token_cancels_previous() {
        let mut supervisor = ActorSupervisor::new();
        let first = supervisor.fresh_token();
        let second = supervisor.fresh_token();

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        supervisor.cancel_in_flight();
        assert!(second.is_cancelled());
    }

    #[test]
    fn test_shutdown_cancels_children() {
        let mut supervisor = ActorSupervisor::new();
        let token = supervisor.fresh_token();
        supervisor.shutdown();

        assert!(token.is_cancelled());
        // 停止后领取的令牌同样已取消
        assert!(supervisor.fresh_token().is_cancelled());
    }
}
