//! etcd 协调存储后端

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, DeleteOptions, EventType, GetOptions, LeaseGrantOptions, PutOptions,
    WatchOptions,
};
use futures::StreamExt;
use tracing::{debug, info};

use super::{
    CoordinationStore, KeyValue, Lease, LeaseId, PrefixSnapshot, StoreError, StoreResult,
    WatchBatch, WatchEvent, WatchStream,
};

impl From<etcd_client::Error> for StoreError {
    fn from(err: etcd_client::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// etcd 客户端封装；`Client` 内部共享同一个 channel，按调用克隆即可并发使用
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(endpoints: Vec<String>, dial_timeout: Duration) -> StoreResult<Self> {
        let options = ConnectOptions::new()
            .with_timeout(dial_timeout)
            .with_keep_alive(Duration::from_secs(30), Duration::from_secs(10));

        let client = Client::connect(endpoints.clone(), Some(options))
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to connect to etcd: {e}")))?;

        info!(endpoints = ?endpoints, "etcd client connected");
        Ok(Self { client })
    }

    fn client(&self) -> Client {
        self.client.clone()
    }
}

fn to_key_value(kv: &etcd_client::KeyValue) -> StoreResult<KeyValue> {
    let key = kv
        .key_str()
        .map_err(|e| StoreError::Backend(format!("non utf-8 key: {e}")))?;
    Ok(KeyValue {
        key: key.to_string(),
        value: kv.value().to_vec(),
        mod_revision: kv.mod_revision(),
    })
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant_lease(&self, ttl: i64) -> StoreResult<Lease> {
        let resp = self
            .client()
            .lease_grant(ttl, Some(LeaseGrantOptions::new()))
            .await?;
        Ok(Lease {
            id: resp.id(),
            ttl: resp.ttl(),
        })
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<i64> {
        let (mut keeper, mut stream) = self.client().lease_keep_alive(lease).await?;
        keeper.keep_alive().await?;
        match stream.message().await? {
            Some(resp) => Ok(resp.ttl()),
            None => Err(StoreError::Unavailable(
                "keep-alive stream closed".to_string(),
            )),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        self.client().lease_revoke(lease).await?;
        Ok(())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        self.client().put(key, value, options).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.client()
            .delete(key, Some(DeleteOptions::new()))
            .await?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<PrefixSnapshot> {
        let resp = self
            .client()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        let kvs = resp
            .kvs()
            .iter()
            .map(to_key_value)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(PrefixSnapshot { kvs, revision })
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> StoreResult<WatchStream> {
        let mut options = WatchOptions::new().with_prefix();
        if let Some(revision) = start_revision {
            options = options.with_start_revision(revision);
        }
        let (watcher, stream) = self.client().watch(prefix, Some(options)).await?;
        debug!(prefix, watch_id = watcher.watch_id(), "etcd watch established");

        // watcher 随流一起保存，流被 drop 时一并释放
        let stream = futures::stream::unfold(
            Some((watcher, stream)),
            |state| async move {
                let (watcher, mut stream) = state?;
                let item = loop {
                    match stream.message().await {
                        Ok(Some(resp)) if resp.canceled() => {
                            break Err(StoreError::WatchCanceled(format!(
                                "compact_revision={}",
                                resp.compact_revision()
                            )));
                        }
                        Ok(Some(resp)) => match convert_watch_response(&resp) {
                            // created / progress 通知不带事件
                            Ok(None) => continue,
                            Ok(Some(batch)) => break Ok(batch),
                            Err(e) => break Err(e),
                        },
                        Ok(None) => return None,
                        Err(e) => break Err(StoreError::from(e)),
                    }
                };
                let next = if item.is_ok() {
                    Some((watcher, stream))
                } else {
                    None
                };
                Some((item, next))
            },
        );
        Ok(stream.boxed())
    }
}

/// 批次版本取事件中最大的 mod_revision；响应头里的 revision 是存储当前版本，回放历史时会偏大
fn convert_watch_response(resp: &etcd_client::WatchResponse) -> StoreResult<Option<WatchBatch>> {
    let mut revision = 0;
    let mut events = Vec::with_capacity(resp.events().len());
    for event in resp.events() {
        let Some(kv) = event.kv() else {
            continue;
        };
        let kv = to_key_value(kv)?;
        revision = revision.max(kv.mod_revision);
        match event.event_type() {
            EventType::Put => events.push(WatchEvent::Put(kv)),
            EventType::Delete => events.push(WatchEvent::Delete { key: kv.key }),
        }
    }
    if events.is_empty() {
        return Ok(None);
    }
    Ok(Some(WatchBatch { revision, events }))
}
