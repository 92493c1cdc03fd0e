//! 日志初始化
//!
//! 优先使用环境变量 `RUST_LOG`，没有则使用配置文件中的级别。

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LogConfig;
use crate::error::{Error, Result};

/// 从配置初始化全局日志
///
/// 已经存在全局 subscriber 时返回 [`Error::Logging`]，不会 panic。
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| Error::Logging(format!("invalid log level `{}`: {e}", config.level)))?,
    };

    let builder = fmt::Subscriber::builder()
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_file(config.with_file)
        .with_line_number(config.with_line_number)
        .with_env_filter(env_filter);

    let result = match config.format.to_lowercase().as_str() {
        "json" => builder.json().try_init(),
        "plain" | "" => builder.try_init(),
        other => {
            return Err(Error::Logging(format!("unsupported log format `{other}`")));
        }
    };

    result.map_err(|e| Error::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_format() {
        let config = LogConfig {
            format: "xml".to_string(),
            ..LogConfig::default()
        };
        assert!(matches!(init_logging(&config), Err(Error::Logging(_))));
    }
}
