//! 服务自注册
//!
//! 注册流程：申请租约 → 写入 `{service}/{host}:{port}` 并绑定租约 → 启动续租任务。
//! 续租失败时指数退避重试，直到租约截止时间；租约丢失后在后续周期中重新注册。
//! 停机令牌被取消时，续租任务退出前尽力注销一次（删除 key 并撤销租约）。
//! 进程崩溃（或未注销直接 drop）时不删除 key，由存储在租约到期后自动清理。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::node::{Node, node_key};
use crate::error::{Error, Result};
use crate::metrics::RegistryMetrics;
use crate::store::{Lease, LeaseId, StoreError, StoreRef, StoreResult, with_timeout};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(100);

/// 注册参数
#[derive(Debug, Clone)]
pub struct RegistrarOptions {
    pub service_name: String,
    pub node: Node,
    /// 申请的租约 TTL（秒）
    pub lease_ttl: i64,
    /// 单次存储请求超时
    pub request_timeout: Duration,
    /// 注销时等待续租任务退出的宽限时间
    pub shutdown_grace: Duration,
}

/// 当前注册记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub service_name: String,
    pub node: Node,
    pub lease_id: LeaseId,
    /// 存储实际授予的 TTL（秒）
    pub lease_ttl: i64,
}

/// 续租间隔为 TTL 的三分之一
fn renew_interval(ttl: i64) -> Duration {
    let millis = u64::try_from(ttl.max(0)).unwrap_or(0) * 1000 / 3;
    Duration::from_millis(millis).max(MIN_RENEW_INTERVAL)
}

/// 注册任务与续租任务共享的上下文
struct RenewalContext {
    store: StoreRef,
    service_name: String,
    node: Node,
    key: String,
    lease_ttl: i64,
    request_timeout: Duration,
    record: watch::Sender<Option<RegistrationRecord>>,
    metrics: Option<RegistryMetrics>,
}

impl RenewalContext {
    /// 申请租约并写入节点；写入失败时尽力撤销租约
    async fn register_once(&self) -> StoreResult<Lease> {
        let value = self.node.encode()?;
        let lease = with_timeout(self.request_timeout, self.store.grant_lease(self.lease_ttl)).await?;

        if let Err(err) = with_timeout(
            self.request_timeout,
            self.store.put(&self.key, value, Some(lease.id)),
        )
        .await
        {
            if let Err(revoke_err) =
                with_timeout(self.request_timeout, self.store.revoke_lease(lease.id)).await
            {
                debug!(lease = lease.id, error = %revoke_err, "failed to revoke lease after put failure");
            }
            return Err(err);
        }

        self.record.send_replace(Some(RegistrationRecord {
            service_name: self.service_name.clone(),
            node: self.node.clone(),
            lease_id: lease.id,
            lease_ttl: lease.ttl,
        }));
        Ok(lease)
    }

    /// 进程停机时尽力注销一次：删除 key、撤销租约，每个请求都受超时约束
    async fn release(&self) {
        let Some(record) = self.record.send_replace(None) else {
            return;
        };
        if let Err(err) = with_timeout(self.request_timeout, self.store.delete(&self.key)).await {
            warn!(service = %self.service_name, key = %self.key, error = %err, "best-effort deregistration failed");
        }
        if let Err(err) =
            with_timeout(self.request_timeout, self.store.revoke_lease(record.lease_id)).await
        {
            debug!(lease = record.lease_id, error = %err, "lease revoke failed");
        }
        info!(service = %self.service_name, key = %self.key, "released registration on shutdown");
    }

    fn record_failure(&self) {
        if let Some(metrics) = &self.metrics {
            metrics
                .registrar_renewal_failures_total
                .with_label_values(&[self.service_name.as_str()])
                .inc();
        }
    }

    /// 续租直到成功、租约丢失或被取消；返回 `false` 表示租约已丢失
    async fn renew(&self, lease: &mut Lease, last_renewed: &mut Instant, cancel: &CancellationToken) -> bool {
        let deadline = *last_renewed + Duration::from_secs(u64::try_from(lease.ttl).unwrap_or(0));
        let cap = renew_interval(lease.ttl);
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match with_timeout(self.request_timeout, self.store.keep_alive(lease.id)).await {
                Ok(ttl) if ttl > 0 => {
                    *last_renewed = Instant::now();
                    if ttl != lease.ttl {
                        lease.ttl = ttl;
                        self.record.send_modify(|record| {
                            if let Some(record) = record {
                                record.lease_ttl = ttl;
                            }
                        });
                    }
                    return true;
                }
                Ok(_) => {
                    error!(service = %self.service_name, lease = lease.id, "lease expired in store");
                    return false;
                }
                Err(err) => {
                    self.record_failure();
                    if Instant::now() + backoff >= deadline {
                        error!(
                            service = %self.service_name,
                            lease = lease.id,
                            error = %err,
                            "lease renewal failed past deadline, lease lost"
                        );
                        return false;
                    }
                    warn!(
                        service = %self.service_name,
                        lease = lease.id,
                        error = %err,
                        retry_in_ms = backoff.as_millis() as u64,
                        "lease renewal failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return true,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(cap);
                }
            }
        }
    }
}

async fn renewal_loop(ctx: Arc<RenewalContext>, mut lease: Lease, cancel: CancellationToken) {
    let mut last_renewed = Instant::now();
    let mut lost = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                ctx.release().await;
                break;
            }
            _ = tokio::time::sleep(renew_interval(lease.ttl)) => {}
        }

        if lost {
            match ctx.register_once().await {
                Ok(new_lease) => {
                    info!(service = %ctx.service_name, lease = new_lease.id, "re-registered after lease loss");
                    lease = new_lease;
                    last_renewed = Instant::now();
                    lost = false;
                }
                Err(err) => {
                    ctx.record_failure();
                    warn!(service = %ctx.service_name, error = %err, "re-registration failed");
                }
            }
            continue;
        }

        if !ctx.renew(&mut lease, &mut last_renewed, &cancel).await {
            ctx.record.send_replace(None);
            lost = true;
        }
    }

    debug!(service = %ctx.service_name, "renewal task stopped");
}

struct Registration {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// 本进程的注册器
pub struct Registrar {
    ctx: Arc<RenewalContext>,
    shutdown: CancellationToken,
    shutdown_grace: Duration,
    registration: Mutex<Option<Registration>>,
}

impl Registrar {
    /// 创建注册器，不访问存储
    ///
    /// `shutdown` 为进程级取消令牌，续租任务持有它的子令牌。
    pub fn new(
        store: StoreRef,
        options: RegistrarOptions,
        shutdown: &CancellationToken,
        metrics: Option<RegistryMetrics>,
    ) -> Result<Self> {
        if options.lease_ttl <= 0 {
            return Err(Error::config(format!(
                "lease ttl must be positive, got {}",
                options.lease_ttl
            )));
        }

        let key = node_key(&options.service_name, &options.node);
        let (record, _) = watch::channel(None);
        Ok(Self {
            ctx: Arc::new(RenewalContext {
                store,
                service_name: options.service_name,
                node: options.node,
                key,
                lease_ttl: options.lease_ttl,
                request_timeout: options.request_timeout,
                record,
                metrics,
            }),
            shutdown: shutdown.clone(),
            shutdown_grace: options.shutdown_grace,
            registration: Mutex::new(None),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.ctx.service_name
    }

    /// 注册到存储的 key
    pub fn key(&self) -> &str {
        &self.ctx.key
    }

    /// 注册并启动续租；已注册时直接返回成功
    pub async fn register(&self) -> Result<()> {
        let mut registration = self.registration.lock().await;
        if registration.is_some() {
            debug!(service = %self.ctx.service_name, "already registered");
            return Ok(());
        }

        let lease = self
            .ctx
            .register_once()
            .await
            .map_err(|source| Error::Registration {
                service: self.ctx.service_name.clone(),
                source,
            })?;

        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(renewal_loop(self.ctx.clone(), lease, cancel.clone()));
        *registration = Some(Registration { cancel, task });

        info!(
            service = %self.ctx.service_name,
            key = %self.ctx.key,
            lease = lease.id,
            ttl = lease.ttl,
            "service registered"
        );
        Ok(())
    }

    /// 停止续租、删除 key 并尽力撤销租约；未注册时不做任何事
    pub async fn deregister(&self) -> Result<()> {
        let Some(mut registration) = self.registration.lock().await.take() else {
            return Ok(());
        };

        registration.cancel.cancel();
        if tokio::time::timeout(self.shutdown_grace, &mut registration.task)
            .await
            .is_err()
        {
            warn!(service = %self.ctx.service_name, "renewal task did not stop within grace period");
            registration.task.abort();
        }

        let record = self.ctx.record.send_replace(None);
        let deleted = with_timeout(self.ctx.request_timeout, self.ctx.store.delete(&self.ctx.key)).await;

        if let Some(record) = record {
            if let Err(err) = with_timeout(
                self.ctx.request_timeout,
                self.ctx.store.revoke_lease(record.lease_id),
            )
            .await
            {
                debug!(lease = record.lease_id, error = %err, "lease revoke failed");
            }
        }

        deleted.map_err(|source: StoreError| Error::Deregistration {
            service: self.ctx.service_name.clone(),
            source,
        })?;

        info!(service = %self.ctx.service_name, key = %self.ctx.key, "service deregistered");
        Ok(())
    }

    /// 当前注册记录；租约丢失且尚未重新注册时为 `None`
    pub fn record(&self) -> Option<RegistrationRecord> {
        self.ctx.record.borrow().clone()
    }
}

impl Drop for Registrar {
    fn drop(&mut self) {
        // 只停止续租，不注销：key 由存储在租约到期后清理
        if let Some(registration) = self.registration.get_mut() {
            registration.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renew_interval_is_a_third_of_ttl() {
        assert_eq!(renew_interval(3), Duration::from_secs(1));
        assert_eq!(renew_interval(10), Duration::from_millis(3333));
        assert_eq!(renew_interval(0), MIN_RENEW_INTERVAL);
    }
}
