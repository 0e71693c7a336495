use std::time::Duration;

use log::LevelFilter;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// 已有同 id 的活跃会话时，再次创建该会话的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateSessionPolicy {
    /// 拒绝，原会话不受影响
    #[default]
    Reject,
    /// 返回已有的会话
    ReturnExisting,
}

/// 连接池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// 心跳周期（毫秒）
    pub heartbeat_interval_ms: u64,
    /// 单帧最大字节数
    pub max_frame_size: usize,
    pub duplicate_session_policy: DuplicateSessionPolicy,
    /// 连接池自身日志的级别，独立于全局 logger 的过滤
    #[serde(with = "level_filter")]
    pub log_level: LevelFilter,
}

/// 超出 u64 的时长按 u64::MAX 毫秒算
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: millis(DEFAULT_HEARTBEAT_INTERVAL),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            duplicate_session_policy: DuplicateSessionPolicy::default(),
            log_level: LevelFilter::Info,
        }
    }
}

impl PoolConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = millis(interval);
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_duplicate_session_policy(mut self, policy: DuplicateSessionPolicy) -> Self {
        self.duplicate_session_policy = policy;
        self
    }

    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

mod level_filter {
    use std::str::FromStr;

    use log::LevelFilter;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(level: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(level.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LevelFilter, D::Error> {
        let raw = String::deserialize(deserializer)?;
        LevelFilter::from_str(&raw).map_err(serde::de::Error::custom)
    }
}
