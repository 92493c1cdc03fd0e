//! Flare Bootstrap 公共库
//!
//! 微服务启动脚手架：加载配置、初始化日志与指标、连接协调存储，
//! 完成服务自注册与下游服务发现，并构造出站 HTTP 客户端。
//!
//! ```rust,ignore
//! use flare_bootstrap::{BootstrapOptions, Environment, bootstrap};
//!
//! let resources = bootstrap(Environment::from_env()?, BootstrapOptions::default()).await?;
//! // 启动自己的服务器后
//! resources.register_self().await?;
//! // ...
//! resources.shutdown().await;
//! ```

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod resource;
pub mod servicer;
pub mod shutdown;
pub mod store;

pub use bootstrap::{BootstrapOptions, bootstrap, local_ip};
pub use client::{HttpClient, Request, Response};
pub use config::{ConfigReader, Environment};
pub use error::{Error, Result};
pub use registry::{Discovery, Node, Registrar, ServiceNodeSet};
pub use resource::Resources;
pub use servicer::{ServiceConfig, ServiceResolver, Servicer};
pub use shutdown::ShutdownHooks;
pub use store::{CoordinationStore, MemoryStore, StoreRef};
