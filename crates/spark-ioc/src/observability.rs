//! # 可观测性：订阅器安装
//!
//! ## 意图（Why）
//! - IOC 内部统一使用 `tracing` 宏输出结构化日志，字段名统一带 `ioc.` 前缀，例如 `ioc.link_id`、`ioc.srv_id`；
//! - [`install`] 为二进制与集成测试提供“一键式”订阅器装配，行为与工作区其他 crate 的安装入口一致。
//!
//! ## 契约（What）
//! - `install` 只允许成功一次；若外部已设置全局 Subscriber，则返回 [`InstallError::SubscriberAlreadySet`]；
//! - 日志级别默认 `info`，可通过 `RUST_LOG` 覆盖，例如 `RUST_LOG=spark_ioc=trace`。
//!
//! 安装行为的测试位于 `tests/observability_install.rs`：全局订阅器是进程级状态，
//! 独立的测试二进制才能断言首次安装必然成功。

use std::sync::OnceLock;

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// 订阅器安装失败。
#[derive(Debug, Error)]
pub enum InstallError {
    /// 本模块已经安装过。
    #[error("spark-ioc observability is already installed")]
    AlreadyInstalled,
    /// 外部提前设置了全局 `tracing` Subscriber。
    #[error("a global tracing subscriber has already been set")]
    SubscriberAlreadySet,
    /// 设置全局 Subscriber 的底层错误。
    #[error("failed to set global tracing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// 安装 `fmt + EnvFilter` 全局订阅器。
///
/// # 教案式说明
/// - **执行 (How)**：先检查重复安装与外部订阅器，再组装 registry 并调用 `try_init`；
/// - **契约 (What)**：成功后本进程内的 IOC 日志立即可见；失败不会修改任何全局状态。
pub fn install() -> Result<(), InstallError> {
    if INSTALLED.get().is_some() {
        return Err(InstallError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(InstallError::SubscriberAlreadySet);
    }
    tracing_subscriber::registry()
        .with(build_env_filter())
        .with(fmt::layer().with_target(true))
        .try_init()?;
    INSTALLED
        .set(())
        .map_err(|_| InstallError::AlreadyInstalled)
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
