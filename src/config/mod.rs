//! 配置模块
//!
//! 配置按环境分目录存放，每个组件一个文件：
//!
//! ```text
//! conf/{env}/
//! ├── app.toml          # 应用名、端口、超时
//! ├── log.toml          # 日志
//! ├── store.toml        # 协调存储（可选）
//! ├── registry.toml     # 自注册（可选）
//! ├── http.toml         # 出站 HTTP（可选）
//! └── services/*.toml   # 下游服务声明
//! ```
//!
//! 各组件通过 [`ConfigReader::read_config`] 按名称读取自己的配置片段。

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Error, Result};

mod manager;
pub use manager::{Environment, SUPPORTED_ENVIRONMENTS};

/// 配置读取器
#[derive(Debug, Clone)]
pub struct ConfigReader {
    dir: PathBuf,
}

impl ConfigReader {
    /// 创建读取器，目录必须存在
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(Error::config(format!(
                "configuration directory {} does not exist",
                dir.display()
            )));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, name: &str, format: &str) -> PathBuf {
        self.dir.join(format!("{name}.{format}"))
    }

    /// 读取 `{dir}/{name}.{format}` 并反序列化
    pub fn read_config<T: DeserializeOwned>(&self, name: &str, format: &str) -> Result<T> {
        let path = self.path_of(name, format);
        let content = fs::read_to_string(&path).map_err(|e| {
            Error::config(format!("unable to read config file {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "reading config");
        parse_content(&content, format)
            .map_err(|e| Error::config(format!("invalid config format {}: {e}", path.display())))
    }

    /// 文件不存在时返回 `None`，其余错误照常返回
    pub fn read_optional<T: DeserializeOwned>(&self, name: &str, format: &str) -> Result<Option<T>> {
        if !self.path_of(name, format).exists() {
            return Ok(None);
        }
        self.read_config(name, format).map(Some)
    }

    /// 列出子目录下指定扩展名的配置，返回可直接传给 `read_config` 的名称，按路径排序
    pub fn list(&self, sub_dir: &str, format: &str) -> Result<Vec<String>> {
        let dir = self.dir.join(sub_dir);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir)
            .map_err(|e| {
                Error::config(format!(
                    "unable to read config directory {}: {e}",
                    dir.display()
                ))
            })?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(OsStr::to_str)
                    .map(|ext| ext.eq_ignore_ascii_case(format))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();

        entries.sort();

        Ok(entries
            .iter()
            .filter_map(|path| path.file_stem().and_then(OsStr::to_str))
            .map(|stem| format!("{sub_dir}/{stem}"))
            .collect())
    }
}

fn parse_content<T: DeserializeOwned>(content: &str, format: &str) -> Result<T, String> {
    match format.to_lowercase().as_str() {
        "toml" => toml::from_str(content).map_err(|e| e.to_string()),
        "json" => serde_json::from_str(content).map_err(|e| e.to_string()),
        other => Err(format!("unsupported config format: {other}")),
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// 应用名，同时作为注册的服务名
    pub app_name: String,
    /// 服务端口
    pub app_port: u16,
    /// 注册使用的主机地址，未配置时自动探测本机 IP
    #[serde(default)]
    pub app_host: Option<String>,
    /// 单次存储请求超时（毫秒）
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// 停机时每个关闭钩子的宽限时间（毫秒）
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.app_name.trim().is_empty() {
            return Err(Error::config("app_name must not be empty"));
        }
        if self.app_port == 0 {
            return Err(Error::config("app_port must not be 0"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// 日志级别（`RUST_LOG` 优先）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 输出格式：`plain` 或 `json`
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_true")]
    pub with_target: bool,
    #[serde(default)]
    pub with_thread_ids: bool,
    #[serde(default)]
    pub with_file: bool,
    #[serde(default)]
    pub with_line_number: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "plain".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

/// 协调存储配置
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// 后端类型：`etcd` 或 `memory`
    #[serde(default = "default_backend")]
    pub backend: String,
    /// 端点列表，`;` 分隔
    #[serde(default)]
    pub endpoints: String,
    /// 连接超时（毫秒）
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
}

fn default_backend() -> String {
    "etcd".to_string()
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

impl StoreConfig {
    pub fn endpoint_list(&self) -> Vec<String> {
        self.endpoints
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// 自注册配置
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// 租约 TTL（秒）
    pub lease: i64,
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lease <= 0 {
            return Err(Error::config(format!(
                "registry lease must be positive, got {}",
                self.lease
            )));
        }
        Ok(())
    }
}

/// 出站 HTTP 客户端配置
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// 默认请求超时（毫秒）
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    /// 负载均衡：`round_robin` 或 `weighted`
    #[serde(default = "default_balancer")]
    pub balancer: String,
}

fn default_http_timeout_ms() -> u64 {
    3000
}

fn default_balancer() -> String {
    "round_robin".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_http_timeout_ms(),
            balancer: default_balancer(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
