//! 重试策略 - 业务能力层
//!
//! 只对可重试错误（外部服务错误、超时）做指数退避，其余错误立即返回。

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::infrastructure::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 含首次调用在内的最大尝试次数
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// 第 `attempt` 次失败后的等待时长（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// 按策略执行 `op`
    ///
    /// # 参数
    /// - `clock`: 退避等待经过的时钟
    /// - `label`: 日志标签
    /// - `op`: 每次尝试都会重新调用
    pub async fn run<T, F, Fut>(&self, clock: &dyn Clock, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} 第 {}/{} 次尝试失败: {}，{:?} 后重试",
                        label, attempt, self.max_attempts, e, delay
                    );
                    clock.sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
