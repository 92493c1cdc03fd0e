//! 错误定义模块
//!
//! - 启动阶段的构造错误（配置、注册、发现初始化、未知服务类型）向上传播，由 `main` 统一决定退出
//! - 运行期的瞬时错误（续租失败、watch 断开）只在内部重试并记录日志，不会返回给调用方

use crate::store::StoreError;

/// 统一结果类型
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 配置缺失或格式错误
    #[error("config error: {0}")]
    Config(String),

    /// 租约创建或首次写入失败
    #[error("registration failed for {service}: {source}")]
    Registration {
        service: String,
        #[source]
        source: StoreError,
    },

    /// 主动注销时删除 key 失败
    #[error("deregistration failed for {service}: {source}")]
    Deregistration {
        service: String,
        #[source]
        source: StoreError,
    },

    /// 首次全量拉取失败
    #[error("discovery init failed for {service}: {source}")]
    DiscoveryInit {
        service: String,
        #[source]
        source: StoreError,
    },

    /// watch 流断开（只在发现循环内部使用，从不返回给调用方）
    #[error("watch disconnected for {service}: {reason}")]
    WatchDisconnected { service: String, reason: String },

    #[error("unknown service type `{kind}` for service {service}")]
    UnknownServiceType { service: String, kind: String },

    #[error("service {0} is not declared")]
    ServiceNotFound(String),

    #[error("no available endpoint for service {0}")]
    NoAvailableEndpoint(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// 下游响应体无法解析
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("logging init failed: {0}")]
    Logging(String),

    /// 停机时有关闭钩子失败或超时
    #[error("shutdown incomplete: {0}")]
    Shutdown(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// 是否属于启动期致命错误
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Registration { .. }
                | Error::DiscoveryInit { .. }
                | Error::UnknownServiceType { .. }
                | Error::Logging(_)
                | Error::Metrics(_)
        )
    }
}
