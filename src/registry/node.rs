//! 服务节点模型

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// 一个服务端点
///
/// 节点一旦被观察到即不可变，更新时整体替换。身份为 `host:port`。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
    pub port: u16,
    /// 权重，仅 `Weighted` 负载均衡使用
    #[serde(default)]
    pub weight: u32,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 0,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// 节点身份 `host:port`
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 序列化为存储中的 value
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Backend(format!("encode node: {e}")))
    }

    pub fn decode(value: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(value).map_err(|e| StoreError::Backend(format!("decode node: {e}")))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 服务前缀 `{service}/`
pub fn service_prefix(service: &str) -> String {
    format!("{service}/")
}

/// 节点 key `{service}/{host}:{port}`
pub fn node_key(service: &str, node: &Node) -> String {
    format!("{service}/{}", node.id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let node = Node::new("10.0.0.1", 8080);
        assert_eq!(node.id(), "10.0.0.1:8080");
        assert_eq!(service_prefix("user"), "user/");
        assert_eq!(node_key("user", &node), "user/10.0.0.1:8080");
    }

    #[test]
    fn encode_keeps_weight() {
        let node = Node::new("10.0.0.1", 8080).with_weight(5);
        let decoded = Node::decode(&node.encode().unwrap()).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn weight_defaults_to_zero() {
        let node = Node::decode(br#"{"host":"h","port":1}"#).unwrap();
        assert_eq!(node.weight, 0);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Node::decode(b"not json").is_err());
        assert!(Node::decode(br#"{"host":"h","port":70000}"#).is_err());
    }
}
