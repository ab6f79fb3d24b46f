//! 能力查询：把运行时配置中的限额以稳定结构返回给调用方。

use crate::config::IocConfig;

/// 可查询的能力类别。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CapabilityId {
    /// 面向连接的事件通道。
    ConetModeEvent,
    /// 面向连接的数据通道。
    ConetModeData,
    /// 面向连接的命令通道。
    ConetModeCommand,
    /// 全局上限。
    Common,
}

/// 能力查询结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapabilityDescription {
    ConetModeEvent {
        max_evt_queue_depth: usize,
        max_subscribers_per_link: usize,
    },
    ConetModeData {
        max_data_queue_size: usize,
        embedded_data_threshold: usize,
    },
    ConetModeCommand {
        /// 单个执行端同时执行的命令数。
        max_in_flight_per_executor: usize,
    },
    Common {
        max_services: usize,
        max_links: usize,
    },
}

impl CapabilityDescription {
    pub(crate) fn describe(id: CapabilityId, config: &IocConfig) -> Self {
        match id {
            CapabilityId::ConetModeEvent => CapabilityDescription::ConetModeEvent {
                max_evt_queue_depth: config.max_evt_queue_depth,
                max_subscribers_per_link: config.max_subscribers_per_link,
            },
            CapabilityId::ConetModeData => CapabilityDescription::ConetModeData {
                max_data_queue_size: config.max_data_queue_size,
                embedded_data_threshold: config.embedded_data_threshold,
            },
            CapabilityId::ConetModeCommand => CapabilityDescription::ConetModeCommand {
                max_in_flight_per_executor: 1,
            },
            CapabilityId::Common => CapabilityDescription::Common {
                max_services: config.max_services,
                max_links: config.max_links,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_capability_reflects_config() {
        let config = IocConfig {
            max_data_queue_size: 4096,
            ..IocConfig::default()
        };
        assert_eq!(
            CapabilityDescription::describe(CapabilityId::ConetModeData, &config),
            CapabilityDescription::ConetModeData {
                max_data_queue_size: 4096,
                embedded_data_threshold: 64,
            }
        );
    }
}
