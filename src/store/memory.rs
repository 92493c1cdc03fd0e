//! 进程内协调存储
//!
//! 语义与 etcd 保持一致：全局单调递增的 revision、租约到期自动删除绑定的 key、
//! 前缀 watch 支持从指定 revision 回放。用于本地开发（`backend = "memory"`）和测试。
//!
//! 另外提供一组故障注入方法（断开 watch、整体不可用、静默丢弃事件），
//! 用来验证注册器和发现器的恢复路径。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::{
    CoordinationStore, KeyValue, Lease, LeaseId, PrefixSnapshot, StoreError, StoreResult,
    WatchBatch, WatchEvent, WatchStream,
};

const REAP_INTERVAL: Duration = Duration::from_millis(100);
/// 默认保留的历史事件数，超出后压缩最早的 revision
const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// 事务操作
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
    mod_revision: i64,
}

struct LeaseState {
    ttl: i64,
    deadline: Instant,
}

struct Subscriber {
    prefix: String,
    tx: mpsc::UnboundedSender<StoreResult<WatchBatch>>,
}

struct State {
    revision: i64,
    next_lease: LeaseId,
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
    history: VecDeque<(i64, WatchEvent)>,
    history_limit: usize,
    /// 已压缩的最大 revision，从它及更早版本开始的 watch 会被拒绝
    compacted: i64,
    subscribers: Vec<Subscriber>,
    available: bool,
    deliver_events: bool,
    write_requests: u64,
}

impl State {
    fn new(history_limit: usize) -> Self {
        Self {
            revision: 1,
            next_lease: 1,
            kvs: BTreeMap::new(),
            leases: HashMap::new(),
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            compacted: 0,
            subscribers: Vec::new(),
            available: true,
            deliver_events: true,
            write_requests: 0,
        }
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    /// 以一个新 revision 提交一组已生效的事件
    fn commit(&mut self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        let revision = self.revision;
        for event in &events {
            self.history.push_back((revision, event.clone()));
        }
        self.compact();
        if self.deliver_events {
            self.publish(revision, &events);
        }
    }

    /// 历史超过上限时丢弃最早的整批 revision
    fn compact(&mut self) {
        while self.history.len() > self.history_limit {
            let Some((revision, _)) = self.history.front().cloned() else {
                break;
            };
            while self.history.front().is_some_and(|(r, _)| *r == revision) {
                self.history.pop_front();
            }
            self.compacted = revision;
        }
    }

    fn publish(&mut self, revision: i64, events: &[WatchEvent]) {
        self.subscribers.retain(|sub| {
            let matched: Vec<WatchEvent> = events
                .iter()
                .filter(|event| event.key().starts_with(&sub.prefix))
                .cloned()
                .collect();
            if matched.is_empty() {
                return !sub.tx.is_closed();
            }
            sub.tx
                .send(Ok(WatchBatch {
                    revision,
                    events: matched,
                }))
                .is_ok()
        });
    }

    fn apply_put(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> WatchEvent {
        let revision = self.revision;
        self.kvs.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
                mod_revision: revision,
            },
        );
        WatchEvent::Put(KeyValue {
            key: key.to_string(),
            value,
            mod_revision: revision,
        })
    }

    fn apply_delete(&mut self, key: &str) -> Option<WatchEvent> {
        self.kvs.remove(key).map(|_| WatchEvent::Delete {
            key: key.to_string(),
        })
    }

    /// 删除租约及其绑定的 key
    fn drop_lease(&mut self, lease: LeaseId) {
        self.leases.remove(&lease);
        let keys: Vec<String> = self
            .kvs
            .iter()
            .filter(|(_, entry)| entry.lease == Some(lease))
            .map(|(key, _)| key.clone())
            .collect();
        if keys.is_empty() {
            return;
        }
        self.revision += 1;
        let events = keys
            .iter()
            .filter_map(|key| self.apply_delete(key))
            .collect();
        self.commit(events);
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            debug!(lease, "memory store lease expired");
            self.drop_lease(lease);
        }
    }
}

/// 进程内协调存储
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// 创建存储并启动租约回收任务，必须在 tokio 运行时内调用
    pub fn new() -> Arc<Self> {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// 指定保留的历史事件数
    pub fn with_history_limit(limit: usize) -> Arc<Self> {
        let state = Arc::new(Mutex::new(State::new(limit)));
        spawn_reaper(Arc::downgrade(&state));
        Arc::new(Self { state })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock_state(&self.state)
    }

    /// 当前全局 revision
    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().kvs.get(key).map(|entry| entry.value.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().kvs.keys().cloned().collect()
    }

    /// 已接受的写请求数（put / delete / revoke）
    pub fn write_requests(&self) -> u64 {
        self.lock().write_requests
    }

    /// 仍然存活的 watch 数量
    pub fn watcher_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        state.subscribers.len()
    }

    pub fn lease_count(&self) -> usize {
        self.lock().leases.len()
    }

    /// 断开所有 watch 流（模拟连接中断），存储本身仍可用
    pub fn disconnect_watchers(&self) {
        self.lock().subscribers.clear();
    }

    /// 切换存储可用性；不可用时所有请求失败，已有 watch 收到错误后断开
    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        state.available = available;
        if !available {
            for sub in state.subscribers.drain(..) {
                let _ = sub
                    .tx
                    .send(Err(StoreError::Unavailable("connection lost".to_string())));
            }
        }
    }

    /// 关闭后写入照常生效，但不再推送给 watcher（模拟事件丢失）
    pub fn set_event_delivery(&self, deliver: bool) {
        self.lock().deliver_events = deliver;
    }

    /// 原子执行一组写操作，共享同一个 revision，watcher 在一个批次中收到
    pub fn transaction(&self, ops: Vec<TxnOp>) -> StoreResult<()> {
        let mut state = self.lock();
        state.ensure_available()?;
        state.write_requests += 1;
        state.revision += 1;
        let mut events = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxnOp::Put { key, value } => events.push(state.apply_put(&key, value, None)),
                TxnOp::Delete { key } => {
                    if let Some(event) = state.apply_delete(&key) {
                        events.push(event);
                    }
                }
            }
        }
        if events.is_empty() {
            state.revision -= 1;
        }
        state.commit(events);
        Ok(())
    }
}

fn lock_state(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn spawn_reaper(state: Weak<Mutex<State>>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        loop {
            ticker.tick().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            lock_state(&state).expire_leases(Instant::now());
        }
    });
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant_lease(&self, ttl: i64) -> StoreResult<Lease> {
        let mut state = self.lock();
        state.ensure_available()?;
        if ttl <= 0 {
            return Err(StoreError::Backend(format!("invalid lease ttl {ttl}")));
        }
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline: Instant::now() + Duration::from_secs(ttl as u64),
            },
        );
        Ok(Lease { id, ttl })
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<i64> {
        let mut state = self.lock();
        state.ensure_available()?;
        let now = Instant::now();
        state.expire_leases(now);
        match state.leases.get_mut(&lease) {
            Some(current) => {
                current.deadline = now + Duration::from_secs(current.ttl as u64);
                Ok(current.ttl)
            }
            None => Ok(0),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        let mut state = self.lock();
        state.ensure_available()?;
        state.expire_leases(Instant::now());
        if !state.leases.contains_key(&lease) {
            return Err(StoreError::LeaseNotFound(lease));
        }
        state.write_requests += 1;
        state.drop_lease(lease);
        Ok(())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut state = self.lock();
        state.ensure_available()?;
        state.expire_leases(Instant::now());
        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }
        state.write_requests += 1;
        state.revision += 1;
        let event = state.apply_put(key, value, lease);
        state.commit(vec![event]);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut state = self.lock();
        state.ensure_available()?;
        state.write_requests += 1;
        if state.kvs.contains_key(key) {
            state.revision += 1;
            let events = state.apply_delete(key).into_iter().collect();
            state.commit(events);
        }
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<PrefixSnapshot> {
        let mut state = self.lock();
        state.ensure_available()?;
        state.expire_leases(Instant::now());
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
                mod_revision: entry.mod_revision,
            })
            .collect();
        Ok(PrefixSnapshot {
            kvs,
            revision: state.revision,
        })
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> StoreResult<WatchStream> {
        let mut state = self.lock();
        state.ensure_available()?;
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(start) = start_revision {
            if start <= state.compacted {
                return Err(StoreError::WatchCanceled(format!(
                    "required revision {start} has been compacted, compact_revision={}",
                    state.compacted
                )));
            }
            let mut pending: Option<WatchBatch> = None;
            for (revision, event) in state.history.iter() {
                if *revision < start || !event.key().starts_with(prefix) {
                    continue;
                }
                match pending.as_mut() {
                    Some(batch) if batch.revision == *revision => batch.events.push(event.clone()),
                    _ => {
                        if let Some(batch) = pending.take() {
                            let _ = tx.send(Ok(batch));
                        }
                        pending = Some(WatchBatch {
                            revision: *revision,
                            events: vec![event.clone()],
                        });
                    }
                }
            }
            if let Some(batch) = pending {
                let _ = tx.send(Ok(batch));
            }
        }

        state.subscribers.push(Subscriber {
            prefix: prefix.to_string(),
            tx,
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}
