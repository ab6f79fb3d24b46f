//! # IOC 运行时配置
//!
//! ## 设计目的（Why）
//! - 把核心强制执行的全部上限集中到一个结构里，`IocRuntime` 构造时一次性校验，
//!   之后各通道只读取不可变副本，不存在运行期热更新带来的竞态；
//! - 支持从 TOML 文本加载，便于在测试与部署之间复用同一份限额声明。
//!
//! ## 契约说明（What）
//! - 所有字段都有默认值（`#[serde(default)]`），TOML 中只需覆盖关心的键；
//! - 时间类字段以毫秒整数表达，通过访问器转换为 [`Duration`]；
//! - [`IocConfig::validate`] 拒绝零容量与超出内嵌上限的阈值。

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::data::EMBEDDED_DATA_CAPACITY;

/// 配置加载或校验失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML 语法或字段类型错误。
    #[error("failed to parse IOC configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// 字段值不满足约束。
    #[error("invalid IOC configuration `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// IOC 核心限额。
///
/// ### 契约说明（What）
/// - `max_data_queue_size`：单条数据链路暂存区与接收队列各自的字节上限，也是单块数据的最大长度；
/// - `max_evt_queue_depth`：单条消费链路上排队事件的最大条数；
/// - `max_links` / `max_services`：进程内同时存活的链路与在线服务上限；
/// - `max_subscribers_per_link`：单条消费链路上的订阅者上限；
/// - `embedded_data_threshold`：数据以内嵌方式存放的字节阈值，不得超过 64；
/// - `auto_accept_poll_interval_ms`：自动接受守护线程检查停止标志的间隔。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IocConfig {
    pub max_data_queue_size: usize,
    pub max_evt_queue_depth: usize,
    pub max_links: usize,
    pub max_services: usize,
    pub max_subscribers_per_link: usize,
    pub embedded_data_threshold: usize,
    pub auto_accept_poll_interval_ms: u64,
}

impl Default for IocConfig {
    fn default() -> Self {
        Self {
            max_data_queue_size: 1024 * 1024,
            max_evt_queue_depth: 64,
            max_links: 1024,
            max_services: 64,
            max_subscribers_per_link: 16,
            embedded_data_threshold: EMBEDDED_DATA_CAPACITY,
            auto_accept_poll_interval_ms: 10,
        }
    }
}

impl IocConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: IocConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验字段约束。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("max_data_queue_size", self.max_data_queue_size),
            ("max_evt_queue_depth", self.max_evt_queue_depth),
            ("max_links", self.max_links),
            ("max_services", self.max_services),
            ("max_subscribers_per_link", self.max_subscribers_per_link),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero",
                });
            }
        }
        if self.embedded_data_threshold > EMBEDDED_DATA_CAPACITY {
            return Err(ConfigError::Invalid {
                field: "embedded_data_threshold",
                reason: "must not exceed 64 bytes",
            });
        }
        if self.auto_accept_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "auto_accept_poll_interval_ms",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }

    pub fn auto_accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.auto_accept_poll_interval_ms)
    }
}
