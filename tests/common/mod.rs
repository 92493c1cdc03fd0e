// 集成测试共用的辅助函数
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use flare_bootstrap::registry::{DiscoveryOptions, Node, node_key};
use flare_bootstrap::store::{CoordinationStore, MemoryStore};

pub fn discovery_options(refresh_interval: Duration) -> DiscoveryOptions {
    DiscoveryOptions {
        refresh_interval,
        request_timeout: Duration::from_secs(1),
        shutdown_grace: Duration::from_secs(1),
    }
}

pub async fn put_node(store: &Arc<MemoryStore>, service: &str, node: &Node) {
    store
        .put(&node_key(service, node), node.encode().unwrap(), None)
        .await
        .unwrap();
}

pub async fn delete_node(store: &Arc<MemoryStore>, service: &str, node: &Node) {
    store.delete(&node_key(service, node)).await.unwrap();
}

/// 每 10ms 检查一次条件，超过 `limit` 仍不满足则返回 false
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn sorted_ids(nodes: &[Node]) -> Vec<String> {
    let mut ids: Vec<String> = nodes.iter().map(Node::id).collect();
    ids.sort();
    ids
}
