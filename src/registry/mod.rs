//! # 服务注册与发现
//!
//! - [`Registrar`]：本进程的自注册（租约 + 续租）
//! - [`Discovery`]：下游服务的节点缓存（watch + 定期对账）
//!
//! 存储中的布局：key 为 `{service}/{host}:{port}`，value 为节点的 JSON。

mod discovery;
mod node;
mod registrar;

pub use discovery::{Discovery, DiscoveryOptions, ServiceNodeSet};
pub use node::{Node, node_key, service_prefix};
pub use registrar::{Registrar, RegistrarOptions, RegistrationRecord};
