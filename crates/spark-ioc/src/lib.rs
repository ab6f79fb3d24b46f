//! # spark-ioc
//!
//! ## 定位与职责（Why）
//! - 进程内 IOC（Inter-Object-Communication）核心：以“服务 + 链路”为模型，在对象之间提供事件、数据与命令三类通道；
//! - 负责链路连接状态机（`Connecting/Connected/Disconnecting/Broken`）、按用途划分的操作子状态、
//!   带背压的事件/数据队列，以及回调重入与死锁防护规则。
//!
//! ## 架构嵌入（Where）
//! - `runtime` 提供全部公开入口 [`IocRuntime`]；
//! - `service` 管理服务目录、接受队列与守护线程，`link` 承载链路对象与状态；
//! - `event`、`data`、`command` 分别实现三类通道，`transport` 定义可注入的传输抽象并内置 `fifo://localprocess` 实现；
//! - `config` 与 `observability` 提供限额配置与 `tracing` 订阅器装配。
//!
//! ## 使用提示（Trade-offs）
//! - 所有可阻塞 API 通过 [`IocOptions`] 选择 `NonBlock`/`MayBlock`/`Timeout` 语义，失败的调用没有副作用；
//! - 回调运行在分发线程或调用方线程上，回调内部的同步投递若指向正在分发的链路会立即得到
//!   [`IocError::ForbiddenInCallback`]，改用异步投递即可。

pub mod capability;
pub mod command;
pub mod config;
pub mod data;
mod dispatch;
pub mod error;
pub mod event;
pub mod link;
pub mod observability;
pub mod runtime;
pub mod service;
pub mod transport;
pub mod types;
mod wait;

pub use capability::{CapabilityDescription, CapabilityId};
pub use command::{CmdDesc, CmdExecutorFn, CmdId, CmdStatus};
pub use config::{ConfigError, IocConfig};
pub use data::{DatCallback, DatDesc, EMBEDDED_DATA_CAPACITY};
pub use error::{ErrorCategory, IocError, IocResult};
pub use event::{EvtCallback, EvtSubscription};
pub use link::UsageArgs;
pub use link::state::{ConnState, LinkState, LinkSubState};
pub use runtime::IocRuntime;
pub use service::{AcceptMode, ConnectArgs, ServiceArgs, ServiceState};
pub use transport::{DataSink, FifoTransport, SrvUri, Transport};
pub use types::{
    BlockingMode, EvtDesc, EvtId, IocOptions, LinkId, ServiceFlags, SrvId, Usage,
    UsageCapabilities,
};
