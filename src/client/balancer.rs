//! 负载均衡

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::registry::Node;

/// 从候选节点中选择一个
pub trait Balancer: Send + Sync {
    fn name(&self) -> &'static str;

    /// 候选为空时返回 `None`
    fn select(&self, service: &str, nodes: &[Node]) -> Option<Node>;
}

/// 按服务轮询，忽略权重
#[derive(Default)]
pub struct RoundRobin {
    counters: DashMap<String, AtomicUsize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, service: &str, nodes: &[Node]) -> Option<Node> {
        if nodes.is_empty() {
            return None;
        }
        let counter = self.counters.entry(service.to_string()).or_default();
        let index = counter.fetch_add(1, Ordering::Relaxed) % nodes.len();
        nodes.get(index).cloned()
    }
}

/// 按权重随机，权重为 0 的节点按 1 计
pub struct Weighted {
    rng: Mutex<StdRng>,
}

impl Weighted {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// 固定种子，结果可复现
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for Weighted {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for Weighted {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select(&self, _service: &str, nodes: &[Node]) -> Option<Node> {
        if nodes.is_empty() {
            return None;
        }
        let total: u64 = nodes.iter().map(|node| u64::from(node.weight.max(1))).sum();
        let mut point = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rng.gen_range(0..total)
        };
        for node in nodes {
            let weight = u64::from(node.weight.max(1));
            if point < weight {
                return Some(node.clone());
            }
            point -= weight;
        }
        nodes.last().cloned()
    }
}
