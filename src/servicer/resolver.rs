//! 服务解析器
//!
//! 读取服务声明并构造 [`Servicer`]。同名的 `registry` 服务共享同一个 [`Discovery`]。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{RegistryServicer, ServiceConfig, ServiceType, Servicer, StaticServicer};
use crate::config::ConfigReader;
use crate::error::{Error, Result};
use crate::metrics::RegistryMetrics;
use crate::registry::{Discovery, DiscoveryOptions, Node};
use crate::store::StoreRef;

const SERVICES_DIR: &str = "services";

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
}

pub struct ServiceResolver {
    store: Option<StoreRef>,
    options: ResolverOptions,
    shutdown: CancellationToken,
    metrics: Option<RegistryMetrics>,
    discoveries: Mutex<HashMap<String, Arc<Discovery>>>,
    servicers: DashMap<String, Arc<dyn Servicer>>,
    /// 串行化 `load_service`，重名检查与插入之间存在 await
    loading: Mutex<()>,
}

impl ServiceResolver {
    /// `store` 为 `None` 时只能解析 `static` 服务
    pub fn new(
        store: Option<StoreRef>,
        options: ResolverOptions,
        shutdown: &CancellationToken,
        metrics: Option<RegistryMetrics>,
    ) -> Self {
        Self {
            store,
            options,
            shutdown: shutdown.clone(),
            metrics,
            discoveries: Mutex::new(HashMap::new()),
            servicers: DashMap::new(),
            loading: Mutex::new(()),
        }
    }

    /// 加载 `services/` 下的全部声明，按文件路径顺序，返回加载的数量
    pub async fn load_from_config(&self, reader: &ConfigReader) -> Result<usize> {
        let names = reader.list(SERVICES_DIR, "toml")?;
        for name in &names {
            let config: ServiceConfig = reader.read_config(name, "toml")?;
            self.load_service(&config).await?;
        }
        Ok(names.len())
    }

    /// 解析一个服务声明
    pub async fn load_service(&self, config: &ServiceConfig) -> Result<Arc<dyn Servicer>> {
        let service_type = config.validate()?;
        let _loading = self.loading.lock().await;
        if self.servicers.contains_key(&config.service_name) {
            return Err(Error::config(format!(
                "service {} is declared more than once",
                config.service_name
            )));
        }

        let servicer: Arc<dyn Servicer> = match service_type {
            ServiceType::Static => Arc::new(StaticServicer::new(
                config.service_name.clone(),
                config.nodes.clone(),
            )),
            ServiceType::Registry => {
                let discovery = self
                    .discovery(
                        &config.service_name,
                        Duration::from_secs(config.refresh_second),
                    )
                    .await?;
                Arc::new(RegistryServicer::new(discovery))
            }
        };

        info!(
            service = %config.service_name,
            kind = ?service_type,
            "service loaded"
        );
        self.servicers
            .insert(config.service_name.clone(), servicer.clone());
        Ok(servicer)
    }

    /// 获取或创建服务的共享发现器；首个调用方的刷新周期生效
    pub async fn discovery(
        &self,
        service_name: &str,
        refresh_interval: Duration,
    ) -> Result<Arc<Discovery>> {
        let store = self.store.clone().ok_or_else(|| {
            Error::config(format!(
                "service {service_name} uses the registry but no store is configured"
            ))
        })?;

        let mut discoveries = self.discoveries.lock().await;
        if let Some(discovery) = discoveries.get(service_name) {
            return Ok(discovery.clone());
        }

        let discovery = Discovery::new(
            store,
            service_name,
            DiscoveryOptions {
                refresh_interval,
                request_timeout: self.options.request_timeout,
                shutdown_grace: self.options.shutdown_grace,
            },
            &self.shutdown,
            self.metrics.clone(),
        )
        .await?;
        discoveries.insert(service_name.to_string(), discovery.clone());
        Ok(discovery)
    }

    pub fn get(&self, service_name: &str) -> Result<Arc<dyn Servicer>> {
        self.servicers
            .get(service_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::ServiceNotFound(service_name.to_string()))
    }

    pub fn get_nodes(&self, service_name: &str) -> Result<Vec<Node>> {
        Ok(self.get(service_name)?.get_nodes())
    }

    /// 已声明的服务名，按字典序
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servicers.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// 关闭全部服务与发现器
    pub async fn close(&self) {
        let servicers: Vec<Arc<dyn Servicer>> = self
            .servicers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for servicer in servicers {
            servicer.close().await;
        }

        let discoveries: Vec<Arc<Discovery>> =
            self.discoveries.lock().await.values().cloned().collect();
        for discovery in discoveries {
            discovery.close().await;
        }
    }
}
