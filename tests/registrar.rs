// 服务注册集成测试：续租、注销幂等、崩溃后租约到期、存储短暂不可用
mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use flare_bootstrap::Error;
use flare_bootstrap::metrics::RegistryMetrics;
use flare_bootstrap::registry::{Node, Registrar, RegistrarOptions};
use flare_bootstrap::store::MemoryStore;
use prometheus::Registry;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use common::wait_until;

const SERVICE: &str = "order";
const KEY: &str = "order/10.0.0.7:8080";

fn options(lease_ttl: i64) -> RegistrarOptions {
    RegistrarOptions {
        service_name: SERVICE.to_string(),
        node: Node::new("10.0.0.7", 8080),
        lease_ttl,
        request_timeout: Duration::from_secs(1),
        shutdown_grace: Duration::from_secs(1),
    }
}

fn registrar(store: &Arc<MemoryStore>, lease_ttl: i64) -> Registrar {
    Registrar::new(store.clone(), options(lease_ttl), &CancellationToken::new(), None).unwrap()
}

#[tokio::test(start_paused = true)]
async fn register_writes_node_and_keeps_lease_alive() -> Result<()> {
    let store = MemoryStore::new();
    let registrar = registrar(&store, 3);
    assert_eq!(registrar.key(), KEY);

    registrar.register().await?;
    let value = store.get(KEY).expect("node registered");
    assert_eq!(Node::decode(&value)?, Node::new("10.0.0.7", 8080));

    let record = registrar.record().expect("record present");
    assert_eq!(record.service_name, SERVICE);
    assert_eq!(record.lease_ttl, 3);

    // 远超 TTL 之后仍然存在
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(store.get(KEY).is_some());
    assert_eq!(registrar.record().map(|r| r.lease_id), Some(record.lease_id));
    assert_eq!(store.lease_count(), 1);

    registrar.deregister().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn register_twice_is_a_noop() -> Result<()> {
    let store = MemoryStore::new();
    let registrar = registrar(&store, 3);
    registrar.register().await?;
    let writes = store.write_requests();
    let lease = registrar.record().map(|r| r.lease_id);

    registrar.register().await?;
    assert_eq!(store.write_requests(), writes);
    assert_eq!(registrar.record().map(|r| r.lease_id), lease);
    assert_eq!(store.lease_count(), 1);

    registrar.deregister().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn deregister_is_idempotent() -> Result<()> {
    let store = MemoryStore::new();
    let registrar = registrar(&store, 3);

    // 未注册时不访问存储
    registrar.deregister().await?;
    assert_eq!(store.write_requests(), 0);

    registrar.register().await?;
    registrar.deregister().await?;
    assert!(store.get(KEY).is_none());
    assert_eq!(store.lease_count(), 0);
    assert!(registrar.record().is_none());

    let writes = store.write_requests();
    assert_ok!(registrar.deregister().await);
    assert_eq!(store.write_requests(), writes);

    // 注销后可以重新注册
    registrar.register().await?;
    assert!(store.get(KEY).is_some());
    registrar.deregister().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn register_fails_when_store_is_unreachable() {
    let store = MemoryStore::new();
    store.set_available(false);
    let registrar = registrar(&store, 3);

    let result = registrar.register().await;
    assert!(matches!(result, Err(Error::Registration { service, .. }) if service == SERVICE));
    assert!(registrar.record().is_none());

    store.set_available(true);
    assert_eq!(store.lease_count(), 0);
    assert!(store.get(KEY).is_none());

    // 失败后不算已注册，注销不产生写入
    assert_ok!(registrar.deregister().await);
    assert_eq!(store.write_requests(), 0);
}

#[tokio::test]
async fn invalid_lease_ttl_is_rejected() {
    let store = MemoryStore::new();
    let result = Registrar::new(store, options(0), &CancellationToken::new(), None);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn dropping_registrar_lets_lease_expire() -> Result<()> {
    let store = MemoryStore::new();
    let registrar = registrar(&store, 3);
    registrar.register().await?;
    drop(registrar);

    // drop 本身不删除
    assert!(store.get(KEY).is_some());

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(store.get(KEY).is_none());
    assert_eq!(store.lease_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn renewal_survives_transient_outage() -> Result<()> {
    let store = MemoryStore::new();
    let registry = Registry::new();
    let metrics = RegistryMetrics::new(&registry)?;
    let registrar = Registrar::new(
        store.clone(),
        options(6),
        &CancellationToken::new(),
        Some(metrics.clone()),
    )?;
    registrar.register().await?;
    let lease = registrar.record().map(|r| r.lease_id);

    tokio::time::sleep(Duration::from_millis(4500)).await;
    store.set_available(false);
    tokio::time::sleep(Duration::from_secs(3)).await;
    store.set_available(true);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(store.get(KEY).is_some());
    assert_eq!(registrar.record().map(|r| r.lease_id), lease);
    assert!(
        metrics
            .registrar_renewal_failures_total
            .with_label_values(&[SERVICE])
            .get()
            >= 1
    );

    registrar.deregister().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lost_lease_is_re_registered() -> Result<()> {
    let store = MemoryStore::new();
    let registrar = registrar(&store, 3);
    registrar.register().await?;
    let original = registrar.record().map(|r| r.lease_id);

    store.set_available(false);
    tokio::time::sleep(Duration::from_secs(6)).await;
    // 存储侧租约已过期，注册器也认为租约丢失
    assert!(store.get(KEY).is_none());
    assert!(registrar.record().is_none());

    store.set_available(true);
    assert!(
        wait_until(Duration::from_secs(5), || {
            let store = store.clone();
            async move { store.get(KEY).is_some() }
        })
        .await
    );
    let renewed = registrar.record().map(|r| r.lease_id);
    assert!(renewed.is_some());
    assert_ne!(renewed, original);

    registrar.deregister().await?;
    assert!(store.get(KEY).is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn shutdown_token_releases_registration() -> Result<()> {
    let store = MemoryStore::new();
    let shutdown = CancellationToken::new();
    let registrar = Registrar::new(store.clone(), options(30), &shutdown, None)?;
    registrar.register().await?;

    shutdown.cancel();
    // 远早于租约到期，key 已被删除
    assert!(
        wait_until(Duration::from_millis(500), || {
            let store = store.clone();
            async move { store.get(KEY).is_none() }
        })
        .await
    );
    assert_eq!(store.lease_count(), 0);
    assert!(registrar.record().is_none());

    // 注销仍然幂等
    assert_ok!(registrar.deregister().await);
    assert!(store.get(KEY).is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn parent_token_cancellation_releases_registration() -> Result<()> {
    let store = MemoryStore::new();
    let parent = CancellationToken::new();
    let child = parent.child_token();
    let registrar = Registrar::new(store.clone(), options(30), &child, None)?;
    registrar.register().await?;

    parent.cancel();
    assert!(
        wait_until(Duration::from_millis(500), || {
            let store = store.clone();
            async move { store.get(KEY).is_none() }
        })
        .await
    );
    Ok(())
}
