//! 存储调用拦截器链
//!
//! 每个拦截器在调用前后各执行一次：`before` 按注册顺序，`after` 按逆序（洋葱模型）。
//! 拦截器只观察调用，不修改参数和结果。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use prometheus::HistogramVec;
use tracing::{debug, warn};

use super::{
    CoordinationStore, Lease, LeaseId, PrefixSnapshot, StoreError, StoreRef, StoreResult,
    WatchStream,
};

/// 一次存储调用的描述
#[derive(Debug, Clone, Copy)]
pub struct StoreCall<'a> {
    pub op: &'static str,
    pub key: &'a str,
}

pub trait StoreInterceptor: Send + Sync {
    fn before(&self, _call: &StoreCall<'_>) {}

    fn after(&self, _call: &StoreCall<'_>, _elapsed: Duration, _error: Option<&StoreError>) {}
}

/// 带拦截器链的存储
pub struct InterceptedStore {
    inner: StoreRef,
    chain: Vec<Arc<dyn StoreInterceptor>>,
}

impl InterceptedStore {
    pub fn new(inner: StoreRef, chain: Vec<Arc<dyn StoreInterceptor>>) -> Self {
        Self { inner, chain }
    }

    async fn run<T, F>(&self, op: &'static str, key: &str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let call = StoreCall { op, key };
        for interceptor in &self.chain {
            interceptor.before(&call);
        }
        let started = Instant::now();
        let result = fut.await;
        let elapsed = started.elapsed();
        let error = result.as_ref().err();
        for interceptor in self.chain.iter().rev() {
            interceptor.after(&call, elapsed, error);
        }
        result
    }
}

#[async_trait]
impl CoordinationStore for InterceptedStore {
    async fn grant_lease(&self, ttl: i64) -> StoreResult<Lease> {
        self.run("grant_lease", "", self.inner.grant_lease(ttl)).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<i64> {
        self.run("keep_alive", "", self.inner.keep_alive(lease)).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        self.run("revoke_lease", "", self.inner.revoke_lease(lease))
            .await
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        self.run("put", key, self.inner.put(key, value, lease)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.run("delete", key, self.inner.delete(key)).await
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<PrefixSnapshot> {
        self.run("get_prefix", prefix, self.inner.get_prefix(prefix))
            .await
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> StoreResult<WatchStream> {
        self.run(
            "watch_prefix",
            prefix,
            self.inner.watch_prefix(prefix, start_revision),
        )
        .await
    }
}

/// 日志拦截器
#[derive(Debug, Default)]
pub struct LoggingInterceptor;

impl StoreInterceptor for LoggingInterceptor {
    fn after(&self, call: &StoreCall<'_>, elapsed: Duration, error: Option<&StoreError>) {
        let elapsed_ms = elapsed.as_millis() as u64;
        match error {
            None => debug!(op = call.op, key = call.key, elapsed_ms, "store call"),
            Some(err) => warn!(
                op = call.op,
                key = call.key,
                elapsed_ms,
                error = %err,
                "store call failed"
            ),
        }
    }
}

/// 指标拦截器，按操作和结果统计耗时
pub struct MetricsInterceptor {
    duration: HistogramVec,
}

impl MetricsInterceptor {
    pub fn new(duration: HistogramVec) -> Self {
        Self { duration }
    }
}

impl StoreInterceptor for MetricsInterceptor {
    fn after(&self, call: &StoreCall<'_>, elapsed: Duration, error: Option<&StoreError>) {
        let outcome = if error.is_some() { "error" } else { "ok" };
        self.duration
            .with_label_values(&[call.op, outcome])
            .observe(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::store::MemoryStore;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl StoreInterceptor for Recorder {
        fn before(&self, call: &StoreCall<'_>) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:before:{}", self.name, call.op));
        }

        fn after(&self, call: &StoreCall<'_>, _elapsed: Duration, error: Option<&StoreError>) {
            self.log.lock().unwrap().push(format!(
                "{}:after:{}:{}",
                self.name,
                call.op,
                error.is_some()
            ));
        }
    }

    #[tokio::test]
    async fn chain_runs_in_onion_order_and_forwards_result() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let memory = MemoryStore::new();
        let store = InterceptedStore::new(
            memory.clone(),
            vec![
                Arc::new(Recorder {
                    name: "outer",
                    log: log.clone(),
                }),
                Arc::new(Recorder {
                    name: "inner",
                    log: log.clone(),
                }),
            ],
        );

        store.put("svc/a", b"1".to_vec(), None).await.unwrap();
        assert_eq!(memory.get("svc/a"), Some(b"1".to_vec()));

        let err = store.revoke_lease(42).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseNotFound(42)));

        let log = log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "outer:before:put",
                "inner:before:put",
                "inner:after:put:false",
                "outer:after:put:false",
                "outer:before:revoke_lease",
                "inner:before:revoke_lease",
                "inner:after:revoke_lease:true",
                "outer:after:revoke_lease:true",
            ]
        );
    }

    #[tokio::test]
    async fn metrics_interceptor_observes_calls() {
        let histogram = HistogramVec::new(
            prometheus::HistogramOpts::new("test_store_duration", "test"),
            &["op", "outcome"],
        )
        .unwrap();
        let store = InterceptedStore::new(
            MemoryStore::new(),
            vec![Arc::new(MetricsInterceptor::new(histogram.clone()))],
        );
        store.get_prefix("svc/").await.unwrap();
        assert_eq!(
            histogram
                .with_label_values(&["get_prefix", "ok"])
                .get_sample_count(),
            1
        );
    }
}
