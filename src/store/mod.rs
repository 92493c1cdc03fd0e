//! 协调存储抽象
//!
//! 服务注册发现只依赖存储的一个子集：带 TTL 的租约、续租、绑定租约的写入、删除、
//! 前缀查询以及前缀 watch。所有后端都通过 [`CoordinationStore`] 暴露这些能力。

pub mod interceptor;
pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::StoreConfig;
use crate::error::{Error, Result};

pub use interceptor::{InterceptedStore, LoggingInterceptor, MetricsInterceptor, StoreInterceptor};
pub use memory::MemoryStore;

pub type LeaseId = i64;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// 存储层错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("watch canceled: {0}")]
    WatchCanceled(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Backend(String),
}

/// 租约
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    /// 存储实际授予的 TTL（秒）
    pub ttl: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: i64,
}

/// 前缀查询结果，`revision` 为查询时刻存储的全局版本号
#[derive(Debug, Clone, Default)]
pub struct PrefixSnapshot {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(kv) => &kv.key,
            WatchEvent::Delete { key } => key,
        }
    }
}

/// 一次 watch 响应中的事件，按存储顺序排列，需要整体应用
#[derive(Debug, Clone, Default)]
pub struct WatchBatch {
    pub revision: i64,
    pub events: Vec<WatchEvent>,
}

/// watch 事件流；流结束或返回错误都视为连接断开，drop 即释放 watch
pub type WatchStream = BoxStream<'static, StoreResult<WatchBatch>>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// 创建租约
    async fn grant_lease(&self, ttl: i64) -> StoreResult<Lease>;

    /// 续租一次，返回剩余 TTL；`<= 0` 表示租约已过期
    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<i64>;

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()>;

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn get_prefix(&self, prefix: &str) -> StoreResult<PrefixSnapshot>;

    /// 监听前缀；`start_revision` 为 `Some` 时从该版本开始回放
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> StoreResult<WatchStream>;
}

pub type StoreRef = Arc<dyn CoordinationStore>;

/// 存储后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Etcd,
    Memory,
}

/// 将后端类型字符串转换为 BackendType
pub fn parse_backend_type(backend: &str) -> Result<BackendType> {
    match backend.to_lowercase().as_str() {
        "etcd" => Ok(BackendType::Etcd),
        "memory" => Ok(BackendType::Memory),
        other => Err(Error::config(format!("unsupported store backend: {other}"))),
    }
}

/// 根据配置创建存储客户端，并按顺序套上拦截器
pub async fn connect(
    config: &StoreConfig,
    interceptors: Vec<Arc<dyn StoreInterceptor>>,
) -> Result<StoreRef> {
    let backend: StoreRef = match parse_backend_type(&config.backend)? {
        BackendType::Memory => MemoryStore::new(),
        BackendType::Etcd => connect_etcd(config).await?,
    };

    if interceptors.is_empty() {
        return Ok(backend);
    }
    Ok(Arc::new(InterceptedStore::new(backend, interceptors)))
}

#[cfg(feature = "etcd")]
async fn connect_etcd(config: &StoreConfig) -> Result<StoreRef> {
    let store = etcd::EtcdStore::connect(config.endpoint_list(), config.dial_timeout()).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "etcd"))]
async fn connect_etcd(_config: &StoreConfig) -> Result<StoreRef> {
    Err(Error::config(
        "store backend `etcd` requires the `etcd` feature",
    ))
}

/// 给存储调用加上超时
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_type_is_case_insensitive() {
        assert_eq!(parse_backend_type("ETCD").unwrap(), BackendType::Etcd);
        assert_eq!(parse_backend_type("memory").unwrap(), BackendType::Memory);
        assert!(matches!(
            parse_backend_type("consul"),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_maps_elapsed() {
        let res: StoreResult<()> = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(StoreError::Timeout(_))));
    }
}
