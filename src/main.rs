//! 脚手架入口
//!
//! 读取 `APP_ENV` / `APP_CONF_ROOT` 选择配置目录，完成启动并注册自己，
//! 收到 Ctrl-C 后按逆序关闭全部组件。入站服务器由嵌入方自行启动。

use anyhow::Context;
use flare_bootstrap::{BootstrapOptions, Environment, bootstrap};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        // 日志可能尚未初始化
        eprintln!("flare-bootstrap failed: {err:#}");
        error!(error = %format!("{err:#}"), "flare-bootstrap failed");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let environment = Environment::from_env().context("failed to select environment")?;
    let resources = bootstrap(environment, BootstrapOptions::default())
        .await
        .context("bootstrap failed")?;

    if let Err(err) = resources.register_self().await {
        resources.shutdown().await;
        return Err(err).context("self registration failed");
    }

    info!(
        app = %resources.app().app_name,
        port = resources.app().app_port,
        "started, waiting for ctrl-c"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    resources
        .shutdown_checked()
        .await
        .context("shutdown did not complete cleanly")?;
    info!("bye");
    Ok(())
}
