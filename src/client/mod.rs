//! # 出站 HTTP 客户端
//!
//! 按服务名通过 [`ServiceResolver`] 取节点，由 [`Balancer`] 选出一个，依次执行插件后发送。

mod balancer;
mod plugin;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, Method};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::registry::Node;
use crate::servicer::ServiceResolver;

pub use balancer::{Balancer, RoundRobin, Weighted};
pub use plugin::{AfterPlugin, BeforePlugin, LOG_ID_HEADER, LogIdPlugin, LoggingPlugin};

/// 出站请求
#[derive(Debug, Clone)]
pub struct Request {
    pub service_name: String,
    pub method: Method,
    /// 以 `/` 开头，可带查询串
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Option<serde_json::Value>,
    /// 覆盖客户端默认超时
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(service_name: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            method,
            path: path.into(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(service_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(service_name, Method::GET, path)
    }

    pub fn post(service_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(service_name, Method::POST, path)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 出站响应
#[derive(Debug, Clone)]
pub struct Response {
    /// 实际处理请求的节点
    pub node: Node,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::InvalidResponse(format!("body from {}: {e}", self.node)))
    }
}

pub struct HttpClientBuilder {
    resolver: Arc<ServiceResolver>,
    timeout: Duration,
    balancer: Arc<dyn Balancer>,
    before: Vec<Arc<dyn BeforePlugin>>,
    after: Vec<Arc<dyn AfterPlugin>>,
}

impl HttpClientBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn balancer(mut self, balancer: Arc<dyn Balancer>) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn before_plugin(mut self, plugin: Arc<dyn BeforePlugin>) -> Self {
        self.before.push(plugin);
        self
    }

    pub fn after_plugin(mut self, plugin: Arc<dyn AfterPlugin>) -> Self {
        self.after.push(plugin);
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        // 节点地址来自服务发现，直接连接
        let client = Client::builder()
            .use_rustls_tls()
            .no_proxy()
            .timeout(self.timeout)
            .build()?;
        Ok(HttpClient {
            client,
            resolver: self.resolver,
            balancer: self.balancer,
            before: self.before,
            after: self.after,
        })
    }
}

/// 按服务名调用下游的 HTTP 客户端
pub struct HttpClient {
    client: Client,
    resolver: Arc<ServiceResolver>,
    balancer: Arc<dyn Balancer>,
    before: Vec<Arc<dyn BeforePlugin>>,
    after: Vec<Arc<dyn AfterPlugin>>,
}

impl HttpClient {
    /// 默认轮询、无插件
    pub fn builder(resolver: Arc<ServiceResolver>) -> HttpClientBuilder {
        HttpClientBuilder {
            resolver,
            timeout: Duration::from_secs(3),
            balancer: Arc::new(RoundRobin::new()),
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    pub fn balancer_name(&self) -> &'static str {
        self.balancer.name()
    }

    /// 选择节点
    ///
    /// 服务未声明时返回 [`Error::ServiceNotFound`]，没有节点时返回 [`Error::NoAvailableEndpoint`]。
    pub fn pick(&self, service_name: &str) -> Result<Node> {
        let nodes = self.resolver.get_nodes(service_name)?;
        self.balancer
            .select(service_name, &nodes)
            .ok_or_else(|| Error::NoAvailableEndpoint(service_name.to_string()))
    }

    pub async fn send(&self, mut request: Request) -> Result<Response> {
        let node = self.pick(&request.service_name)?;

        for plugin in &self.before {
            plugin.handle(&mut request).await?;
        }

        let started = Instant::now();
        let result = self.execute(&request, &node).await;
        let elapsed = started.elapsed();

        for plugin in &self.after {
            plugin
                .handle(&request, &node, result.as_ref(), elapsed)
                .await;
        }
        result
    }

    async fn execute(&self, request: &Request, node: &Node) -> Result<Response> {
        let url = format!("http://{}:{}{}", node.host, node.port, request.path);
        let mut builder = self.client.request(request.method.clone(), url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(key, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (key.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(Response {
            node: node.clone(),
            status,
            headers,
            body,
        })
    }
}
