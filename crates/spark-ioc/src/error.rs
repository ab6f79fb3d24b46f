//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为 IOC 对外暴露的全部结果码提供集中定义：每个失败分支对应一个稳定的枚举变体与
//!   `ioc.<域>.<语义>` 形式的错误码，调用方据此实现自己的重试/退避策略；
//! - 核心本身不做自动重试，只负责报告精确且稳定的结果。
//!
//! ## 设计要求（What）
//! - 所有变体派生 `thiserror::Error`，可直接交给 `anyhow` 等上层框架；
//! - [`ErrorCategory`] 把结果码归入参数、生命周期、容量、时序、并发安全与内部缺陷六类；
//! - 任何返回错误的操作都不会留下部分修改，链路与服务保持调用前的可观察状态。

use thiserror::Error;

use crate::types::{EvtId, LinkId, SrvId, Usage};

/// IOC 结果码对应的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：取代 C 风格的整型结果码，让 `?` 运算符在调用链上直接传播；
/// - **契约 (What)**：
///   - `Timeout`、`NoData`、`NoEventConsumer` 属于正常控制流，调用方不应视为异常；
///   - `Bug` 表示内部不变量被破坏，正确实现下不应出现；
/// - **风险 (Trade-offs)**：变体携带的上下文字段仅用于诊断，判定分支请使用 [`IocError::code`] 或模式匹配变体本身。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IocError {
    /// 参数非法，例如哨兵句柄、空事件列表、空能力集。
    #[error("invalid parameter: {detail}")]
    InvalidParam { detail: &'static str },

    /// 链路从未创建、已经关闭，或所属服务下线且未保留。
    #[error("link {link} does not exist")]
    NotExistLink { link: LinkId },

    /// 服务句柄未注册、已经下线，或 URI 上没有在线服务。
    #[error("service {service} does not exist")]
    NotExistService { service: SrvId },

    /// 链路对端已消失，链路进入 `Broken`。
    #[error("link {link} is broken")]
    LinkBroken { link: LinkId },

    /// 限时等待到期。
    #[error("operation timed out")]
    Timeout,

    /// 非阻塞轮询时接收队列为空。
    #[error("no data available on link {link}")]
    NoData { link: LinkId },

    /// 非阻塞拉取时没有可消费的事件，或退订时找不到对应订阅。
    #[error("no event available for consumer on link {link}")]
    NoEventConsumer { link: LinkId },

    /// 事件队列已满且调用方选择非阻塞（或在回调中无法等待）。
    #[error("too many queuing event descriptors on link {link} (depth {depth})")]
    TooManyQueuingEvtDesc { link: LinkId, depth: usize },

    /// 数据暂存区已满且调用方选择非阻塞。
    #[error("data buffer of link {link} is full ({queued} of {limit} bytes queued)")]
    BufferFull {
        link: LinkId,
        queued: usize,
        limit: usize,
    },

    /// 单块数据超过 `MaxDataQueueSize`，在任何入队尝试之前即被拒绝。
    #[error("data of {size} bytes exceeds MaxDataQueueSize {limit}")]
    DataTooLarge { size: usize, limit: usize },

    /// 零长度数据，与“无数据”严格区分的边界。
    #[error("zero-length data is not transmittable")]
    ZeroData,

    /// 在目标链路的分发回调内部发起同步投递，会导致分发线程自锁。
    #[error("synchronous operation on link {link} is forbidden inside its own callback")]
    ForbiddenInCallback { link: LinkId },

    /// 超过容量上限（链路数、服务数、订阅者数）。
    #[error("capacity exceeded: {what} (limit {limit})")]
    TooMany { what: &'static str, limit: usize },

    /// 操作对该角色或该服务模式不适用。
    #[error("operation `{operation}` is not supported here")]
    NotSupport { operation: &'static str },

    /// URI 已被另一个在线服务占用。
    #[error("service URI `{uri}` is already bound by {existing}")]
    ConflictSrvArgs { uri: String, existing: SrvId },

    /// 服务不提供连接方所需的互补用途。
    #[error("service {service} does not offer the peer of usage {usage:?}")]
    IncompatibleUsage { service: SrvId, usage: Usage },

    /// 同一回调已在该链路上订阅。
    #[error("event consumer already subscribed on link {link}")]
    ConflictEvtConsumer { link: LinkId },

    /// 命令执行方未注册执行回调。
    #[error("no command executor on link {link}")]
    NoCmdExecutor { link: LinkId },

    /// 订阅回调主动拒绝处理事件；仅用于回调返回值，不会从公共 API 直接返回。
    #[error("event {evt_id} rejected by consumer callback")]
    CallbackRejected { evt_id: EvtId },

    /// 内部不变量被破坏。
    #[error("internal invariant violated: {detail}")]
    Bug { detail: String },
}

/// 结果码分类，对应错误处理设计中的六类失败。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// 调用方传入非法参数，应修正调用。
    Parameter,
    /// 目标对象不存在或已失效，可重新创建。
    Lifecycle,
    /// 超出文档化上限，可调整参数或稍后重试。
    Capacity,
    /// 非阻塞/限时等待的预期结果。
    Timing,
    /// 为防止死锁而拒绝的调用，改用异步即可。
    Concurrency,
    /// 内部缺陷。
    Internal,
}

impl IocError {
    /// 稳定错误码，供日志与指标使用。
    pub fn code(&self) -> &'static str {
        match self {
            IocError::InvalidParam { .. } => "ioc.param.invalid",
            IocError::NotExistLink { .. } => "ioc.link.not_exist",
            IocError::NotExistService { .. } => "ioc.service.not_exist",
            IocError::LinkBroken { .. } => "ioc.link.broken",
            IocError::Timeout => "ioc.wait.timeout",
            IocError::NoData { .. } => "ioc.data.no_data",
            IocError::NoEventConsumer { .. } => "ioc.event.no_consumer",
            IocError::TooManyQueuingEvtDesc { .. } => "ioc.event.queue_full",
            IocError::BufferFull { .. } => "ioc.data.buffer_full",
            IocError::DataTooLarge { .. } => "ioc.data.too_large",
            IocError::ZeroData => "ioc.data.zero",
            IocError::ForbiddenInCallback { .. } => "ioc.callback.forbidden",
            IocError::TooMany { .. } => "ioc.capacity.too_many",
            IocError::NotSupport { .. } => "ioc.op.not_support",
            IocError::ConflictSrvArgs { .. } => "ioc.service.conflict",
            IocError::IncompatibleUsage { .. } => "ioc.link.incompatible_usage",
            IocError::ConflictEvtConsumer { .. } => "ioc.event.conflict_consumer",
            IocError::NoCmdExecutor { .. } => "ioc.cmd.no_executor",
            IocError::CallbackRejected { .. } => "ioc.callback.rejected",
            IocError::Bug { .. } => "ioc.internal.bug",
        }
    }

    /// 归类结果码。
    pub fn category(&self) -> ErrorCategory {
        match self {
            IocError::InvalidParam { .. }
            | IocError::NotSupport { .. }
            | IocError::IncompatibleUsage { .. }
            | IocError::ConflictSrvArgs { .. }
            | IocError::ConflictEvtConsumer { .. } => ErrorCategory::Parameter,
            IocError::NotExistLink { .. }
            | IocError::NotExistService { .. }
            | IocError::LinkBroken { .. }
            | IocError::NoCmdExecutor { .. } => ErrorCategory::Lifecycle,
            IocError::TooManyQueuingEvtDesc { .. }
            | IocError::BufferFull { .. }
            | IocError::DataTooLarge { .. }
            | IocError::ZeroData
            | IocError::TooMany { .. } => ErrorCategory::Capacity,
            IocError::Timeout | IocError::NoData { .. } | IocError::NoEventConsumer { .. } => {
                ErrorCategory::Timing
            }
            IocError::ForbiddenInCallback { .. } | IocError::CallbackRejected { .. } => {
                ErrorCategory::Concurrency
            }
            IocError::Bug { .. } => ErrorCategory::Internal,
        }
    }

    /// 是否值得原样重试（等待或退避之后）。
    ///
    /// `DataTooLarge` 与 `ZeroData` 虽属容量类，但原样重试必然得到同一结果，因此返回 `false`。
    pub fn is_retryable(&self) -> bool {
        match self {
            IocError::DataTooLarge { .. } | IocError::ZeroData => false,
            other => matches!(
                other.category(),
                ErrorCategory::Capacity | ErrorCategory::Timing
            ),
        }
    }

    pub(crate) fn bug(detail: impl Into<String>) -> Self {
        IocError::Bug {
            detail: detail.into(),
        }
    }
}

/// IOC 操作的统一返回别名。
pub type IocResult<T> = Result<T, IocError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_namespace_convention() {
        let samples = [
            IocError::Timeout,
            IocError::ZeroData,
            IocError::NotExistLink {
                link: LinkId::from_raw(3),
            },
            IocError::bug("x"),
        ];
        for err in samples {
            assert!(err.code().starts_with("ioc."), "{}", err.code());
        }
    }

    #[test]
    fn timing_results_are_retryable_but_size_errors_are_not() {
        assert!(IocError::Timeout.is_retryable());
        assert!(
            IocError::BufferFull {
                link: LinkId::from_raw(1),
                queued: 10,
                limit: 10
            }
            .is_retryable()
        );
        assert!(!IocError::ZeroData.is_retryable());
        assert!(!IocError::DataTooLarge { size: 2, limit: 1 }.is_retryable());
        assert!(
            !IocError::ForbiddenInCallback {
                link: LinkId::from_raw(1)
            }
            .is_retryable()
        );
    }

    #[test]
    fn display_carries_context() {
        let err = IocError::DataTooLarge {
            size: 2_000_000,
            limit: 1_048_576,
        };
        assert_eq!(
            err.to_string(),
            "data of 2000000 bytes exceeds MaxDataQueueSize 1048576"
        );
        assert_eq!(
            IocError::NotExistService {
                service: SrvId::from_raw(9)
            }
            .to_string(),
            "service srv#9 does not exist"
        );
    }
}
