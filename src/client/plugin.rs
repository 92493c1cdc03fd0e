//! 请求插件
//!
//! `BeforePlugin` 在发送前按注册顺序执行，可以修改请求；
//! `AfterPlugin` 在收到响应（或失败）后按注册顺序执行，只读。

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Request, Response};
use crate::error::{Error, Result};
use crate::registry::Node;

pub const LOG_ID_HEADER: &str = "Log-Id";

#[async_trait]
pub trait BeforePlugin: Send + Sync {
    /// 返回错误时请求不会发出
    async fn handle(&self, request: &mut Request) -> Result<()>;
}

#[async_trait]
pub trait AfterPlugin: Send + Sync {
    async fn handle(
        &self,
        request: &Request,
        node: &Node,
        outcome: std::result::Result<&Response, &Error>,
        elapsed: Duration,
    );
}

/// 没有 `Log-Id` 时生成一个
pub struct LogIdPlugin;

#[async_trait]
impl BeforePlugin for LogIdPlugin {
    async fn handle(&self, request: &mut Request) -> Result<()> {
        request
            .headers
            .entry(LOG_ID_HEADER.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string());
        Ok(())
    }
}

/// 记录每次调用
pub struct LoggingPlugin;

#[async_trait]
impl AfterPlugin for LoggingPlugin {
    async fn handle(
        &self,
        request: &Request,
        node: &Node,
        outcome: std::result::Result<&Response, &Error>,
        elapsed: Duration,
    ) {
        let log_id = request
            .headers
            .get(LOG_ID_HEADER)
            .map(String::as_str)
            .unwrap_or("-");
        match outcome {
            Ok(response) => info!(
                service = %request.service_name,
                node = %node,
                method = %request.method,
                path = %request.path,
                status = response.status,
                log_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "http call finished"
            ),
            Err(err) => warn!(
                service = %request.service_name,
                node = %node,
                method = %request.method,
                path = %request.path,
                log_id,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %err,
                "http call failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_id_is_generated_once() {
        let mut request = Request::get("user", "/ping");
        LogIdPlugin.handle(&mut request).await.unwrap();
        let generated = request.headers[LOG_ID_HEADER].clone();
        assert!(Uuid::parse_str(&generated).is_ok());

        LogIdPlugin.handle(&mut request).await.unwrap();
        assert_eq!(request.headers[LOG_ID_HEADER], generated);
    }

    #[tokio::test]
    async fn log_id_keeps_caller_value() {
        let mut request = Request::get("user", "/ping").header(LOG_ID_HEADER, "abc");
        LogIdPlugin.handle(&mut request).await.unwrap();
        assert_eq!(request.headers[LOG_ID_HEADER], "abc");
    }
}
