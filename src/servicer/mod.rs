//! # 下游服务
//!
//! 每个下游服务在 `services/*.toml` 中声明，按类型解析为一个 [`Servicer`]：
//!
//! - `static`：固定节点列表，不访问网络
//! - `registry`：通过 [`Discovery`] 从协调存储中动态获取
//!
//! ```toml
//! service_name = "user"
//! type = "registry"
//! refresh_second = 10
//! ```

mod resolver;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::registry::{Discovery, Node};

pub use resolver::{ResolverOptions, ServiceResolver};

/// 服务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    Static,
    Registry,
}

/// 单个下游服务的配置
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub service_name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// 对账周期（秒），仅 `registry` 类型使用
    #[serde(default = "default_refresh_second")]
    pub refresh_second: u64,
    /// 固定节点，仅 `static` 类型使用
    #[serde(default)]
    pub nodes: Vec<Node>,
}

fn default_refresh_second() -> u64 {
    10
}

impl ServiceConfig {
    pub fn service_type(&self) -> Result<ServiceType> {
        match self.kind.to_lowercase().as_str() {
            "static" => Ok(ServiceType::Static),
            "registry" => Ok(ServiceType::Registry),
            _ => Err(Error::UnknownServiceType {
                service: self.service_name.clone(),
                kind: self.kind.clone(),
            }),
        }
    }

    /// 校验并返回服务类型
    pub fn validate(&self) -> Result<ServiceType> {
        if self.service_name.trim().is_empty() {
            return Err(Error::config("service_name must not be empty"));
        }
        let service_type = self.service_type()?;
        match service_type {
            ServiceType::Static if self.nodes.is_empty() => Err(Error::config(format!(
                "static service {} has no nodes",
                self.service_name
            ))),
            ServiceType::Registry if self.refresh_second == 0 => Err(Error::config(format!(
                "refresh_second of service {} must be positive",
                self.service_name
            ))),
            _ => Ok(service_type),
        }
    }
}

/// 可解析的下游服务
#[async_trait]
pub trait Servicer: Send + Sync {
    fn name(&self) -> &str;

    /// 当前可用节点，不访问网络；没有节点时返回空列表
    fn get_nodes(&self) -> Vec<Node>;

    async fn close(&self);
}

/// 固定地址的服务
pub struct StaticServicer {
    name: String,
    nodes: Vec<Node>,
}

impl StaticServicer {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }
}

#[async_trait]
impl Servicer for StaticServicer {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_nodes(&self) -> Vec<Node> {
        self.nodes.clone()
    }

    async fn close(&self) {}
}

/// 基于注册中心的服务
pub struct RegistryServicer {
    discovery: Arc<Discovery>,
}

impl RegistryServicer {
    pub fn new(discovery: Arc<Discovery>) -> Self {
        Self { discovery }
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }
}

#[async_trait]
impl Servicer for RegistryServicer {
    fn name(&self) -> &str {
        self.discovery.service_name()
    }

    fn get_nodes(&self) -> Vec<Node> {
        self.discovery.get_nodes()
    }

    async fn close(&self) {
        self.discovery.close().await;
    }
}
