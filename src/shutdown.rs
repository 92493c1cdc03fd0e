//! 停机钩子
//!
//! 组件在启动时登记自己的关闭函数，停机时按登记的逆序执行：
//! 后创建的组件先关闭，依赖的存储最后释放。

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::Result;

type CloseFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type CloseFunc = Box<dyn FnOnce() -> CloseFuture + Send>;

struct Hook {
    name: String,
    func: CloseFunc,
}

/// 停机时执行的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Ok,
    Failed(String),
    TimedOut,
}

pub struct ShutdownHooks {
    grace: Duration,
    hooks: Mutex<Vec<Hook>>,
}

impl ShutdownHooks {
    /// `grace` 为单个钩子的最长执行时间
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            hooks: Mutex::new(Vec::new()),
        }
    }

    pub async fn register_close_func<F, Fut>(&self, name: impl Into<String>, func: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hooks.lock().await.push(Hook {
            name: name.into(),
            func: Box::new(move || Box::pin(func())),
        });
    }

    pub async fn len(&self) -> usize {
        self.hooks.lock().await.len()
    }

    /// 逆序执行并清空全部钩子；单个钩子失败或超时不影响后续钩子
    pub async fn run(&self) -> Vec<(String, HookOutcome)> {
        let hooks: Vec<Hook> = self.hooks.lock().await.drain(..).collect();
        let mut outcomes = Vec::with_capacity(hooks.len());

        for hook in hooks.into_iter().rev() {
            let outcome = match tokio::time::timeout(self.grace, (hook.func)()).await {
                Ok(Ok(())) => {
                    info!(hook = %hook.name, "close hook finished");
                    HookOutcome::Ok
                }
                Ok(Err(err)) => {
                    error!(hook = %hook.name, error = %err, "close hook failed");
                    HookOutcome::Failed(err.to_string())
                }
                Err(_) => {
                    warn!(hook = %hook.name, grace_ms = self.grace.as_millis() as u64, "close hook timed out");
                    HookOutcome::TimedOut
                }
            };
            outcomes.push((hook.name, outcome));
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::Error;

    #[tokio::test(start_paused = true)]
    async fn runs_in_reverse_and_continues_after_failure() {
        let hooks = ShutdownHooks::new(Duration::from_secs(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["store", "registrar", "services"] {
            let order = order.clone();
            hooks
                .register_close_func(name, move || async move {
                    order.lock().await.push(name);
                    if name == "registrar" {
                        return Err(Error::config("boom"));
                    }
                    Ok(())
                })
                .await;
        }
        hooks
            .register_close_func("slow", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        let outcomes = hooks.run().await;
        assert_eq!(*order.lock().await, vec!["services", "registrar", "store"]);
        assert_eq!(outcomes[0], ("slow".to_string(), HookOutcome::TimedOut));
        assert!(matches!(outcomes[2].1, HookOutcome::Failed(_)));
        assert_eq!(outcomes[3], ("store".to_string(), HookOutcome::Ok));

        // 钩子只执行一次
        assert!(hooks.run().await.is_empty());
        assert_eq!(hooks.len().await, 0);
    }
}
