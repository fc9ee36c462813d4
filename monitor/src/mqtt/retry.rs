use notifs_shared::RetryConfig;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// 本轮第 `attempt` 次重试，等待 `delay` 后发起
    Retry { attempt: u32, delay: Duration },
    /// 本轮重试已用尽，暂停 `pause` 后开始新一轮
    Exhausted { pause: Duration },
}

/// 单个 broker 的有限重试节奏（固定间隔，按轮计数）
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    config: RetryConfig,
    attempts: u32,
}

impl RetrySchedule {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempts: 0 }
    }

    pub fn next_step(&mut self) -> RetryStep {
        if self.attempts < self.config.max_attempts {
            self.attempts += 1;
            RetryStep::Retry {
                attempt: self.attempts,
                delay: self.config.interval(),
            }
        } else {
            self.attempts = 0;
            RetryStep::Exhausted {
                pause: self.config.pause(),
            }
        }
    }

    /// 连接成功后调用
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
