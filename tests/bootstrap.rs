// 启动流程端到端测试：使用内存存储，自注册后能被自己的发现器看到，停机时注销
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use prometheus::{Encoder, TextEncoder};
use flare_bootstrap::registry::Node;
use flare_bootstrap::shutdown::HookOutcome;
use flare_bootstrap::{BootstrapOptions, Environment, Error, bootstrap};

fn write(root: &Path, name: &str, content: &str) {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

fn options() -> BootstrapOptions {
    BootstrapOptions {
        init_logging: false,
    }
}

fn write_full_config(root: &Path) {
    write(
        root,
        "dev/app.toml",
        r#"
app_name = "order"
app_port = 8080
app_host = "127.0.0.1"
request_timeout_ms = 1000
shutdown_grace_ms = 1000
"#,
    );
    write(root, "dev/log.toml", "level = \"debug\"\nformat = \"json\"\n");
    write(root, "dev/store.toml", "backend = \"memory\"\n");
    write(root, "dev/registry.toml", "lease = 5\n");
    write(
        root,
        "dev/services/order.toml",
        "service_name = \"order\"\ntype = \"registry\"\nrefresh_second = 1\n",
    );
    write(
        root,
        "dev/services/account.toml",
        r#"
service_name = "account"
type = "static"

[[nodes]]
host = "10.0.0.1"
port = 9000
"#,
    );
}

#[tokio::test]
async fn full_lifecycle_with_memory_store() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_full_config(dir.path());

    let resources = bootstrap(Environment::new("dev", dir.path())?, options()).await?;
    assert_eq!(resources.environment().name(), "dev");
    assert_eq!(resources.app().app_name, "order");
    assert_eq!(resources.services().service_names(), vec!["account", "order"]);
    assert_eq!(resources.http().balancer_name(), "round_robin");
    assert_eq!(
        resources.http().pick("account")?,
        Node::new("10.0.0.1", 9000)
    );

    // 自己的发现器能看到自己
    resources.register_self().await?;
    let me = Node::new("127.0.0.1", 8080);
    let mut seen = false;
    for _ in 0..200 {
        if resources.services().get_nodes("order")? == vec![me.clone()] {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen, "self registration never became visible");
    assert_eq!(resources.http().pick("order")?, me);
    assert!(resources.registrar().and_then(|r| r.record()).is_some());

    let store = resources.store().cloned().expect("store configured");
    let outcomes = resources.shutdown().await;
    let names: Vec<&str> = outcomes.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["services", "registrar", "background-tasks"]);
    assert!(outcomes.iter().all(|(_, outcome)| *outcome == HookOutcome::Ok));
    assert!(resources.shutdown_token().is_cancelled());

    // 停机后注册信息已删除
    assert!(store.get_prefix("order/").await?.kvs.is_empty());

    // 指标已经采集到数据
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&resources.metrics_registry().gather(), &mut buffer)?;
    let exposition = String::from_utf8(buffer)?;
    assert!(exposition.contains("store_request_duration_seconds_bucket"));
    assert!(exposition.contains("discovery_nodes{service=\"order\"} 1"));
    Ok(())
}

#[tokio::test]
async fn minimal_config_runs_without_store() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write(
        dir.path(),
        "qa/app.toml",
        "app_name = \"gateway\"\napp_port = 80\n",
    );

    let resources = bootstrap(Environment::new("qa", dir.path())?, options()).await?;
    assert!(resources.store().is_none());
    assert!(resources.registrar().is_none());
    assert!(resources.services().service_names().is_empty());
    resources.register_self().await?;
    resources.shutdown_checked().await?;
    Ok(())
}

#[tokio::test]
async fn missing_app_config_is_fatal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::create_dir_all(dir.path().join("dev"))?;

    let result = bootstrap(Environment::new("dev", dir.path())?, options()).await;
    let err = result.err().expect("bootstrap must fail");
    assert!(matches!(err, Error::Config(_)));
    assert!(err.is_startup_fatal());
    Ok(())
}

#[tokio::test]
async fn registry_without_store_is_fatal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write(
        dir.path(),
        "dev/app.toml",
        "app_name = \"order\"\napp_port = 8080\napp_host = \"127.0.0.1\"\n",
    );
    write(dir.path(), "dev/registry.toml", "lease = 5\n");

    let result = bootstrap(Environment::new("dev", dir.path())?, options()).await;
    assert!(matches!(result, Err(Error::Config(_))));
    Ok(())
}

#[tokio::test]
async fn unknown_service_type_is_fatal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write(
        dir.path(),
        "dev/app.toml",
        "app_name = \"order\"\napp_port = 8080\n",
    );
    write(dir.path(), "dev/store.toml", "backend = \"memory\"\n");
    write(
        dir.path(),
        "dev/services/user.toml",
        "service_name = \"user\"\ntype = \"registry\"\n",
    );
    write(
        dir.path(),
        "dev/services/zz.toml",
        "service_name = \"zz\"\ntype = \"dns\"\n",
    );

    let result = bootstrap(Environment::new("dev", dir.path())?, options()).await;
    assert!(matches!(result, Err(Error::UnknownServiceType { .. })));
    Ok(())
}

#[tokio::test]
async fn unknown_store_backend_is_fatal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write(
        dir.path(),
        "dev/app.toml",
        "app_name = \"order\"\napp_port = 8080\n",
    );
    write(dir.path(), "dev/store.toml", "backend = \"zookeeper\"\n");

    let result = bootstrap(Environment::new("dev", dir.path())?, options()).await;
    assert!(matches!(result, Err(Error::Config(_))));
    Ok(())
}
