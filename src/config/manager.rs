//! 运行环境选择
//!
//! 环境名来自 `APP_ENV`（默认 `dev`），配置根目录来自 `APP_CONF_ROOT`（默认 `conf`），
//! 实际读取的目录为 `{root}/{env}`。

use std::env;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// 支持的环境
pub const SUPPORTED_ENVIRONMENTS: &[&str] = &["dev", "liantiao", "qa", "online"];

const ENV_VAR: &str = "APP_ENV";
const CONF_ROOT_VAR: &str = "APP_CONF_ROOT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    name: String,
    conf_root: PathBuf,
}

impl Environment {
    /// 校验环境名
    pub fn new(name: impl Into<String>, conf_root: impl Into<PathBuf>) -> Result<Self> {
        let name = name.into();
        if !SUPPORTED_ENVIRONMENTS.contains(&name.as_str()) {
            return Err(Error::config(format!(
                "unknown environment `{name}`, expected one of {SUPPORTED_ENVIRONMENTS:?}"
            )));
        }
        Ok(Self {
            name,
            conf_root: conf_root.into(),
        })
    }

    /// 从环境变量读取
    pub fn from_env() -> Result<Self> {
        let name = env::var(ENV_VAR).unwrap_or_else(|_| "dev".to_string());
        let root = env::var(CONF_ROOT_VAR).unwrap_or_else(|_| "conf".to_string());
        Self::new(name, root)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前环境的配置目录
    pub fn conf_dir(&self) -> PathBuf {
        self.conf_root.join(&self.name)
    }
}
