//! 服务发现
//!
//! 每个下游服务一个 [`Discovery`]，内部维护该服务的节点缓存：
//!
//! - watch 任务：按存储顺序逐批应用 put / delete 事件，断开后全量拉取并从新版本继续 watch
//! - 对账任务：每个刷新周期全量拉取一次，缓存与存储不一致时整体替换
//!
//! 缓存通过 `tokio::sync::watch` 发布不可变的 `Arc<ServiceNodeSet>`，读操作从不访问网络。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::node::{Node, service_prefix};
use crate::error::{Error, Result};
use crate::metrics::RegistryMetrics;
use crate::store::{KeyValue, PrefixSnapshot, StoreRef, StoreResult, WatchBatch, WatchEvent, WatchStream, with_timeout};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// 某个服务在某一时刻的节点集合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNodeSet {
    pub service_name: String,
    /// 按首次出现顺序排列，`host:port` 唯一
    pub nodes: Vec<Node>,
    /// 已应用的存储版本号
    pub revision: i64,
    /// 最近一次成功全量拉取的时间
    pub last_refreshed: DateTime<Utc>,
}

impl ServiceNodeSet {
    fn ids(&self) -> HashSet<String> {
        self.nodes.iter().map(Node::id).collect()
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// 对账周期
    pub refresh_interval: Duration,
    pub request_timeout: Duration,
    /// `close` 等待后台任务退出的宽限时间
    pub shutdown_grace: Duration,
}

fn upsert(nodes: &mut Vec<Node>, node: Node) {
    match nodes.iter_mut().find(|existing| existing.id() == node.id()) {
        Some(existing) => *existing = node,
        None => nodes.push(node),
    }
}

/// watch 任务与对账任务共享的状态
struct Shared {
    store: StoreRef,
    service_name: String,
    prefix: String,
    request_timeout: Duration,
    state: watch::Sender<Arc<ServiceNodeSet>>,
    metrics: Option<RegistryMetrics>,
}

impl Shared {
    /// key 去掉服务前缀后的节点身份
    fn key_id<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.prefix).unwrap_or(key)
    }

    /// 解析 key 对应的节点；value 无法解析或节点身份与 key 不一致时返回错误
    fn node_from_kv(&self, kv: &KeyValue) -> std::result::Result<Node, String> {
        let node = Node::decode(&kv.value).map_err(|e| e.to_string())?;
        if node.id() != self.key_id(&kv.key) {
            return Err(format!("node {} does not match its key", node.id()));
        }
        Ok(node)
    }

    fn decode_nodes(&self, kvs: &[KeyValue]) -> Vec<Node> {
        let mut nodes = Vec::with_capacity(kvs.len());
        for kv in kvs {
            match self.node_from_kv(kv) {
                Ok(node) => upsert(&mut nodes, node),
                Err(err) => {
                    warn!(service = %self.service_name, key = %kv.key, error = %err, "skipping undecodable node")
                }
            }
        }
        nodes
    }

    async fn full_read(&self) -> StoreResult<PrefixSnapshot> {
        with_timeout(self.request_timeout, self.store.get_prefix(&self.prefix)).await
    }

    fn applied_revision(&self) -> i64 {
        self.state.borrow().revision
    }

    fn update_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            let count = self.state.borrow().nodes.len();
            metrics
                .discovery_nodes
                .with_label_values(&[self.service_name.as_str()])
                .set(count as i64);
        }
    }

    /// 按顺序应用一批事件；早于已应用版本的批次直接忽略
    fn apply_batch(&self, batch: WatchBatch) {
        let changed = self.state.send_if_modified(|current| {
            if batch.events.is_empty() || batch.revision <= current.revision {
                return false;
            }

            let mut nodes = current.nodes.clone();
            for event in &batch.events {
                match event {
                    WatchEvent::Put(kv) => match self.node_from_kv(kv) {
                        Ok(node) => upsert(&mut nodes, node),
                        Err(err) => {
                            // key 不再指向一个有效节点，旧值一并作废
                            warn!(service = %self.service_name, key = %kv.key, error = %err, "skipping undecodable node");
                            let id = self.key_id(&kv.key);
                            nodes.retain(|node| node.id() != id);
                        }
                    },
                    WatchEvent::Delete { key } => {
                        let id = self.key_id(key);
                        nodes.retain(|node| node.id() != id);
                    }
                }
            }

            let changed = nodes != current.nodes;
            *current = Arc::new(ServiceNodeSet {
                service_name: self.service_name.clone(),
                nodes,
                revision: batch.revision,
                last_refreshed: current.last_refreshed,
            });
            changed
        });

        if changed {
            debug!(service = %self.service_name, revision = self.applied_revision(), "applied watch batch");
            self.update_gauge();
        }
    }

    /// 用全量结果替换缓存；结果比已应用版本旧时只刷新时间戳。返回节点集合是否被替换
    fn apply_snapshot(&self, snapshot: PrefixSnapshot) -> bool {
        let nodes = self.decode_nodes(&snapshot.kvs);
        let now = Utc::now();

        let replaced = self.state.send_if_modified(|current| {
            if snapshot.revision < current.revision {
                *current = Arc::new(ServiceNodeSet {
                    last_refreshed: now,
                    ..(**current).clone()
                });
                return false;
            }

            let ids: HashSet<String> = nodes.iter().map(Node::id).collect();
            let differs = ids != current.ids() || nodes.iter().any(|node| !current.nodes.contains(node));
            let next_nodes = if differs {
                nodes.clone()
            } else {
                current.nodes.clone()
            };
            *current = Arc::new(ServiceNodeSet {
                service_name: self.service_name.clone(),
                nodes: next_nodes,
                revision: snapshot.revision,
                last_refreshed: now,
            });
            differs
        });

        if replaced {
            self.update_gauge();
        }
        replaced
    }

    /// 消费 watch 流直到断开，返回断开原因
    async fn consume(&self, mut stream: WatchStream) -> String {
        while let Some(item) = stream.next().await {
            match item {
                Ok(batch) => self.apply_batch(batch),
                Err(err) => return err.to_string(),
            }
        }
        "watch stream closed".to_string()
    }

    fn disconnected(&self, reason: String) {
        let err = Error::WatchDisconnected {
            service: self.service_name.clone(),
            reason,
        };
        warn!(error = %err, "resynchronizing");
        if let Some(metrics) = &self.metrics {
            metrics
                .discovery_watch_resync_total
                .with_label_values(&[self.service_name.as_str()])
                .inc();
        }
    }
}

/// 可被取消的退避等待，返回 `false` 表示已取消
async fn backoff_sleep(cancel: &CancellationToken, backoff: &mut Duration) -> bool {
    let wait = *backoff;
    *backoff = (*backoff * 2).min(MAX_BACKOFF);
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

/// 全量拉取直到成功，返回 `false` 表示已取消
async fn resync(shared: &Shared, cancel: &CancellationToken, backoff: &mut Duration) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        match shared.full_read().await {
            Ok(snapshot) => {
                shared.apply_snapshot(snapshot);
                return true;
            }
            Err(err) => {
                warn!(service = %shared.service_name, error = %err, "resync failed, store unreachable");
                if !backoff_sleep(cancel, backoff).await {
                    return false;
                }
            }
        }
    }
}

async fn watch_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut backoff = INITIAL_BACKOFF;
    // 首次 watch 紧接着构造时的全量结果，之后每次重建前都先全量拉取
    let mut first = true;

    loop {
        if !first && !resync(&shared, &cancel, &mut backoff).await {
            break;
        }
        first = false;

        let start = shared.applied_revision() + 1;
        let stream = match with_timeout(
            shared.request_timeout,
            shared.store.watch_prefix(&shared.prefix, Some(start)),
        )
        .await
        {
            Ok(stream) => stream,
            Err(err) => {
                warn!(service = %shared.service_name, error = %err, "failed to establish watch");
                if !backoff_sleep(&cancel, &mut backoff).await {
                    break;
                }
                continue;
            }
        };

        debug!(service = %shared.service_name, start_revision = start, "watch established");
        backoff = INITIAL_BACKOFF;

        let reason = tokio::select! {
            _ = cancel.cancelled() => break,
            reason = shared.consume(stream) => reason,
        };
        shared.disconnected(reason);
    }

    debug!(service = %shared.service_name, "watch task stopped");
}

async fn reconcile_loop(shared: Arc<Shared>, refresh_interval: Duration, cancel: CancellationToken) {
    let start = tokio::time::Instant::now() + refresh_interval;
    let mut ticker = tokio::time::interval_at(start, refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match shared.full_read().await {
            Ok(snapshot) => {
                let revision = snapshot.revision;
                if shared.apply_snapshot(snapshot) {
                    info!(service = %shared.service_name, revision, "reconciliation replaced node set");
                    if let Some(metrics) = &shared.metrics {
                        metrics
                            .discovery_reconcile_replacements_total
                            .with_label_values(&[shared.service_name.as_str()])
                            .inc();
                    }
                }
            }
            Err(err) => {
                warn!(service = %shared.service_name, error = %err, "reconciliation read failed");
            }
        }
    }

    debug!(service = %shared.service_name, "reconcile task stopped");
}

/// 单个下游服务的发现器
pub struct Discovery {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    shutdown_grace: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Discovery {
    /// 全量拉取一次并启动 watch 与对账任务；首次拉取失败返回 [`Error::DiscoveryInit`]
    pub async fn new(
        store: StoreRef,
        service_name: impl Into<String>,
        options: DiscoveryOptions,
        shutdown: &CancellationToken,
        metrics: Option<RegistryMetrics>,
    ) -> Result<Arc<Self>> {
        let service_name = service_name.into();
        if options.refresh_interval.is_zero() {
            return Err(Error::config(format!(
                "refresh interval of service {service_name} must be positive"
            )));
        }

        let prefix = service_prefix(&service_name);
        let snapshot = with_timeout(options.request_timeout, store.get_prefix(&prefix))
            .await
            .map_err(|source| Error::DiscoveryInit {
                service: service_name.clone(),
                source,
            })?;

        let (state, _) = watch::channel(Arc::new(ServiceNodeSet {
            service_name: service_name.clone(),
            nodes: Vec::new(),
            revision: 0,
            last_refreshed: Utc::now(),
        }));
        let shared = Arc::new(Shared {
            store,
            service_name,
            prefix,
            request_timeout: options.request_timeout,
            state,
            metrics,
        });
        shared.apply_snapshot(snapshot);
        shared.update_gauge();

        let cancel = shutdown.child_token();
        let tasks = vec![
            tokio::spawn(watch_loop(shared.clone(), cancel.clone())),
            tokio::spawn(reconcile_loop(
                shared.clone(),
                options.refresh_interval,
                cancel.clone(),
            )),
        ];

        info!(
            service = %shared.service_name,
            nodes = shared.state.borrow().nodes.len(),
            revision = shared.applied_revision(),
            "discovery started"
        );

        Ok(Arc::new(Self {
            shared,
            cancel,
            shutdown_grace: options.shutdown_grace,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn service_name(&self) -> &str {
        &self.shared.service_name
    }

    /// 当前节点列表，不访问网络
    pub fn get_nodes(&self) -> Vec<Node> {
        self.shared.state.borrow().nodes.clone()
    }

    pub fn snapshot(&self) -> Arc<ServiceNodeSet> {
        self.shared.state.borrow().clone()
    }

    /// 订阅节点集合变化
    pub fn subscribe(&self) -> watch::Receiver<Arc<ServiceNodeSet>> {
        self.shared.state.subscribe()
    }

    /// 停止后台任务并释放 watch，可重复调用
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        if tasks.is_empty() {
            return;
        }

        for mut task in tasks {
            if tokio::time::timeout(self.shutdown_grace, &mut task).await.is_err() {
                warn!(service = %self.shared.service_name, "discovery task did not stop within grace period");
                task.abort();
            }
        }
        info!(service = %self.shared.service_name, "discovery closed");
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(nodes: Vec<Node>, revision: i64) -> ServiceNodeSet {
        ServiceNodeSet {
            service_name: "user".to_string(),
            nodes,
            revision,
            last_refreshed: Utc::now(),
        }
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut nodes = vec![Node::new("a", 1), Node::new("b", 2)];
        upsert(&mut nodes, Node::new("a", 1).with_weight(7));
        upsert(&mut nodes, Node::new("c", 3));
        assert_eq!(
            nodes,
            vec![
                Node::new("a", 1).with_weight(7),
                Node::new("b", 2),
                Node::new("c", 3)
            ]
        );
    }

    #[test]
    fn ids_ignore_order() {
        let left = set(vec![Node::new("a", 1), Node::new("b", 2)], 1);
        let right = set(vec![Node::new("b", 2), Node::new("a", 1)], 1);
        assert_eq!(left.ids(), right.ids());
    }
}
