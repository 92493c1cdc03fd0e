//! 资源上下文
//!
//! 启动过程中构造的全部组件都挂在 [`Resources`] 上，由调用方显式传递。

use std::sync::Arc;

use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::HttpClient;
use crate::config::{AppConfig, ConfigReader, Environment};
use crate::error::{Error, Result};
use crate::metrics::RegistryMetrics;
use crate::registry::Registrar;
use crate::servicer::ServiceResolver;
use crate::shutdown::{HookOutcome, ShutdownHooks};
use crate::store::StoreRef;

pub struct Resources {
    pub(crate) environment: Environment,
    pub(crate) config: ConfigReader,
    pub(crate) app: AppConfig,
    pub(crate) metrics_registry: Registry,
    pub(crate) metrics: RegistryMetrics,
    pub(crate) store: Option<StoreRef>,
    pub(crate) registrar: Option<Arc<Registrar>>,
    pub(crate) services: Arc<ServiceResolver>,
    pub(crate) http: Arc<HttpClient>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) hooks: Arc<ShutdownHooks>,
}

impl Resources {
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn config(&self) -> &ConfigReader {
        &self.config
    }

    pub fn app(&self) -> &AppConfig {
        &self.app
    }

    /// 供服务暴露 `/metrics` 使用
    pub fn metrics_registry(&self) -> &Registry {
        &self.metrics_registry
    }

    pub fn metrics(&self) -> &RegistryMetrics {
        &self.metrics
    }

    pub fn store(&self) -> Option<&StoreRef> {
        self.store.as_ref()
    }

    pub fn registrar(&self) -> Option<&Arc<Registrar>> {
        self.registrar.as_ref()
    }

    pub fn services(&self) -> &Arc<ServiceResolver> {
        &self.services
    }

    pub fn http(&self) -> &Arc<HttpClient> {
        &self.http
    }

    /// 进程级取消令牌，所有后台任务持有它的子令牌
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn hooks(&self) -> &Arc<ShutdownHooks> {
        &self.hooks
    }

    /// 服务开始监听后调用，把自己注册到协调存储；未配置 `registry.toml` 时什么都不做
    pub async fn register_self(&self) -> Result<()> {
        match &self.registrar {
            Some(registrar) => registrar.register().await,
            None => {
                info!(app = %self.app.app_name, "registry not configured, skipping self registration");
                Ok(())
            }
        }
    }

    /// 按逆序执行全部关闭钩子
    pub async fn shutdown(&self) -> Vec<(String, HookOutcome)> {
        info!(app = %self.app.app_name, "shutting down");
        let outcomes = self.hooks.run().await;
        self.shutdown.cancel();
        outcomes
    }

    /// 执行关闭钩子，任一钩子失败或超时时返回错误
    pub async fn shutdown_checked(&self) -> Result<()> {
        let failed: Vec<String> = self
            .shutdown()
            .await
            .into_iter()
            .filter(|(_, outcome)| *outcome != HookOutcome::Ok)
            .map(|(name, outcome)| format!("{name}: {outcome:?}"))
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Shutdown(failed.join(", ")))
        }
    }
}
