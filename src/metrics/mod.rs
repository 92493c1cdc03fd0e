//! # Prometheus 指标
//!
//! 注册发现相关的指标。注册表由 `Resources` 持有，不使用全局静态变量。

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};

use crate::error::Result;

/// 注册发现指标
#[derive(Clone)]
pub struct RegistryMetrics {
    /// 每个下游服务当前已知的节点数
    pub discovery_nodes: IntGaugeVec,
    /// watch 断开后的重新同步次数
    pub discovery_watch_resync_total: IntCounterVec,
    /// 定期对账时发现缓存与存储不一致并整体替换的次数
    pub discovery_reconcile_replacements_total: IntCounterVec,
    /// 续租失败次数
    pub registrar_renewal_failures_total: IntCounterVec,
    /// 存储调用耗时（秒）
    pub store_request_duration_seconds: HistogramVec,
}

impl RegistryMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let discovery_nodes = IntGaugeVec::new(
            Opts::new("discovery_nodes", "Number of known nodes per service"),
            &["service"],
        )?;

        let discovery_watch_resync_total = IntCounterVec::new(
            Opts::new(
                "discovery_watch_resync_total",
                "Total number of full resyncs after a watch disconnect",
            ),
            &["service"],
        )?;

        let discovery_reconcile_replacements_total = IntCounterVec::new(
            Opts::new(
                "discovery_reconcile_replacements_total",
                "Total number of cache replacements made by periodic reconciliation",
            ),
            &["service"],
        )?;

        let registrar_renewal_failures_total = IntCounterVec::new(
            Opts::new(
                "registrar_renewal_failures_total",
                "Total number of failed lease renewals",
            ),
            &["service"],
        )?;

        let store_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "store_request_duration_seconds",
                "Coordination store request duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["op", "outcome"],
        )?;

        registry.register(Box::new(discovery_nodes.clone()))?;
        registry.register(Box::new(discovery_watch_resync_total.clone()))?;
        registry.register(Box::new(discovery_reconcile_replacements_total.clone()))?;
        registry.register(Box::new(registrar_renewal_failures_total.clone()))?;
        registry.register(Box::new(store_request_duration_seconds.clone()))?;

        Ok(Self {
            discovery_nodes,
            discovery_watch_resync_total,
            discovery_reconcile_replacements_total,
            registrar_renewal_failures_total,
            store_request_duration_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_once_per_registry() {
        let registry = Registry::new();
        let metrics = RegistryMetrics::new(&registry).unwrap();
        metrics.discovery_nodes.with_label_values(&["user"]).set(3);
        // 只有设置过值的向量指标才会出现在采集结果中
        assert_eq!(registry.gather().len(), 1);

        // 同一个注册表重复注册会失败
        assert!(RegistryMetrics::new(&registry).is_err());
        // 独立注册表互不影响
        assert!(RegistryMetrics::new(&Registry::new()).is_ok());
    }
}
