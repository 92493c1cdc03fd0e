//! # 启动流程
//!
//! 唯一的启动顺序：
//!
//! ```text
//! config → app → logger → metrics → store → registrar → services → http client
//! ```
//!
//! 每一步登记自己的关闭钩子；任一步失败时先执行已登记的钩子再返回错误，
//! 不会留下后台任务。

use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;

use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{Balancer, HttpClient, LogIdPlugin, LoggingPlugin, RoundRobin, Weighted};
use crate::config::{
    AppConfig, ConfigReader, Environment, HttpConfig, LogConfig, RegistryConfig, StoreConfig,
};
use crate::error::{Error, Result};
use crate::logging::init_logging;
use crate::metrics::RegistryMetrics;
use crate::registry::{Node, Registrar, RegistrarOptions};
use crate::resource::Resources;
use crate::servicer::{ResolverOptions, ServiceResolver};
use crate::shutdown::ShutdownHooks;
use crate::store::{self, LoggingInterceptor, MetricsInterceptor, StoreInterceptor, StoreRef};

const CONFIG_FORMAT: &str = "toml";

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    /// 是否安装全局日志 subscriber
    pub init_logging: bool,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self { init_logging: true }
    }
}

/// 探测本机出口 IP，不会真正发送数据
pub fn local_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| Error::config(format!("unable to detect local ip: {e}")))?;
    socket
        .connect("8.8.8.8:80")
        .map_err(|e| Error::config(format!("unable to detect local ip: {e}")))?;
    socket
        .local_addr()
        .map(|addr| addr.ip())
        .map_err(|e| Error::config(format!("unable to detect local ip: {e}")))
}

fn build_balancer(name: &str) -> Result<Arc<dyn Balancer>> {
    match name.to_lowercase().as_str() {
        "round_robin" | "" => Ok(Arc::new(RoundRobin::new())),
        "weighted" => Ok(Arc::new(Weighted::new())),
        other => Err(Error::config(format!("unsupported balancer `{other}`"))),
    }
}

/// 按顺序构造全部资源
pub async fn bootstrap(environment: Environment, options: BootstrapOptions) -> Result<Resources> {
    let config = ConfigReader::new(environment.conf_dir())?;

    let app: AppConfig = config.read_config("app", CONFIG_FORMAT)?;
    app.validate()?;

    let log_config: LogConfig = config
        .read_optional("log", CONFIG_FORMAT)?
        .unwrap_or_default();
    if options.init_logging {
        init_logging(&log_config)?;
    }
    info!(env = environment.name(), app = %app.app_name, "bootstrapping");

    let metrics_registry = Registry::new();
    let metrics = RegistryMetrics::new(&metrics_registry)?;

    let shutdown = CancellationToken::new();
    let hooks = Arc::new(ShutdownHooks::new(app.shutdown_grace()));
    {
        let shutdown = shutdown.clone();
        hooks
            .register_close_func("background-tasks", move || async move {
                shutdown.cancel();
                Ok(())
            })
            .await;
    }

    let built = build_components(&config, &app, &metrics, &shutdown, &hooks).await;
    let (store, registrar, services, http) = match built {
        Ok(components) => components,
        Err(err) => {
            hooks.run().await;
            return Err(err);
        }
    };

    info!(
        app = %app.app_name,
        store = store.is_some(),
        registrar = registrar.is_some(),
        services = services.service_names().len(),
        "bootstrap finished"
    );

    Ok(Resources {
        environment,
        config,
        app,
        metrics_registry,
        metrics,
        store,
        registrar,
        services,
        http,
        shutdown,
        hooks,
    })
}

type Components = (
    Option<StoreRef>,
    Option<Arc<Registrar>>,
    Arc<ServiceResolver>,
    Arc<HttpClient>,
);

async fn build_components(
    config: &ConfigReader,
    app: &AppConfig,
    metrics: &RegistryMetrics,
    shutdown: &CancellationToken,
    hooks: &Arc<ShutdownHooks>,
) -> Result<Components> {
    let store = match config.read_optional::<StoreConfig>("store", CONFIG_FORMAT)? {
        Some(store_config) => {
            let interceptors: Vec<Arc<dyn StoreInterceptor>> = vec![
                Arc::new(LoggingInterceptor),
                Arc::new(MetricsInterceptor::new(
                    metrics.store_request_duration_seconds.clone(),
                )),
            ];
            let store = store::connect(&store_config, interceptors).await?;
            info!(backend = %store_config.backend, endpoints = %store_config.endpoints, "store connected");
            Some(store)
        }
        None => {
            debug!("store.toml not found, running without coordination store");
            None
        }
    };

    let registrar = match config.read_optional::<RegistryConfig>("registry", CONFIG_FORMAT)? {
        Some(registry_config) => {
            registry_config.validate()?;
            let store = store.clone().ok_or_else(|| {
                Error::config("registry.toml requires store.toml to be configured")
            })?;
            let host = match &app.app_host {
                Some(host) => host.clone(),
                None => local_ip()?.to_string(),
            };
            let registrar = Arc::new(Registrar::new(
                store,
                RegistrarOptions {
                    service_name: app.app_name.clone(),
                    node: Node::new(host, app.app_port),
                    lease_ttl: registry_config.lease,
                    request_timeout: app.request_timeout(),
                    shutdown_grace: app.shutdown_grace(),
                },
                shutdown,
                Some(metrics.clone()),
            )?);
            let closing = registrar.clone();
            hooks
                .register_close_func("registrar", move || async move { closing.deregister().await })
                .await;
            Some(registrar)
        }
        None => None,
    };

    let services = Arc::new(ServiceResolver::new(
        store.clone(),
        ResolverOptions {
            request_timeout: app.request_timeout(),
            shutdown_grace: app.shutdown_grace(),
        },
        shutdown,
        Some(metrics.clone()),
    ));
    {
        let closing = services.clone();
        hooks
            .register_close_func("services", move || async move {
                closing.close().await;
                Ok(())
            })
            .await;
    }
    let loaded = services.load_from_config(config).await?;
    info!(count = loaded, "services loaded");

    let http_config: HttpConfig = config
        .read_optional("http", CONFIG_FORMAT)?
        .unwrap_or_default();
    let http = HttpClient::builder(services.clone())
        .timeout(http_config.timeout())
        .balancer(build_balancer(&http_config.balancer)?)
        .before_plugin(Arc::new(LogIdPlugin))
        .after_plugin(Arc::new(LoggingPlugin))
        .build()?;

    Ok((store, registrar, services, Arc::new(http)))
}
