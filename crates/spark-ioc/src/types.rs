//! # 基础类型：句柄、用途标签与调用选项
//!
//! ## 定位（Why）
//! - 所有公共 API 都以不透明句柄（[`LinkId`]、[`SrvId`]）寻址对象，本模块集中定义这些句柄与
//!   用途标签，避免各子模块各自声明导致语义漂移；
//! - [`IocOptions`] 是所有可能阻塞的 API 共享的调用选项，统一表达“非阻塞 / 可阻塞 / 限时阻塞”。
//!
//! ## 契约（What）
//! - 句柄值在进程内单调递增且永不复用，因此“旧句柄指向新对象”的 ABA 问题天然不存在；
//! - `INVALID` 哨兵值属于参数错误，其余未注册的值属于生命周期错误（`NotExistLink`/`NotExistService`）。

use core::fmt;
use core::time::Duration;

use bitflags::bitflags;

/// 链路句柄。
///
/// - **契约 (What)**：`LinkId::INVALID` 为哨兵值，任何 API 收到它都会返回 `InvalidParam`；
///   其他值若未注册或已关闭，返回 `NotExistLink`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    /// 无效链路的哨兵值。
    pub const INVALID: LinkId = LinkId(u64::MAX);

    /// 由原始整数构造句柄，主要用于测试或跨边界传递。
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// 读取原始整数值。
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// 是否为哨兵值。
    pub const fn is_invalid(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            f.write_str("link#invalid")
        } else {
            write!(f, "link#{}", self.0)
        }
    }
}

/// 服务句柄。语义与 [`LinkId`] 对称。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SrvId(u64);

impl SrvId {
    /// 无效服务的哨兵值。
    pub const INVALID: SrvId = SrvId(u64::MAX);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub const fn is_invalid(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for SrvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            f.write_str("srv#invalid")
        } else {
            write!(f, "srv#{}", self.0)
        }
    }
}

/// 链路用途标签。
///
/// # 教案式说明
/// - **意图 (Why)**：链路是半双工的，一条链路在创建时即固定为六种角色之一，之后不可变更；
///   角色不匹配的调用（例如在发送端调用 `recv_dat`）由标签检查直接拒绝。
/// - **契约 (What)**：[`Usage::peer`] 给出连接另一端必须承担的互补角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Usage {
    EvtProducer,
    EvtConsumer,
    DatSender,
    DatReceiver,
    CmdInitiator,
    CmdExecutor,
}

impl Usage {
    /// 互补角色：生产者对应消费者，发送端对应接收端，发起方对应执行方。
    pub const fn peer(self) -> Usage {
        match self {
            Usage::EvtProducer => Usage::EvtConsumer,
            Usage::EvtConsumer => Usage::EvtProducer,
            Usage::DatSender => Usage::DatReceiver,
            Usage::DatReceiver => Usage::DatSender,
            Usage::CmdInitiator => Usage::CmdExecutor,
            Usage::CmdExecutor => Usage::CmdInitiator,
        }
    }

    /// 角色对应的能力位。
    pub const fn capability(self) -> UsageCapabilities {
        match self {
            Usage::EvtProducer => UsageCapabilities::EVT_PRODUCER,
            Usage::EvtConsumer => UsageCapabilities::EVT_CONSUMER,
            Usage::DatSender => UsageCapabilities::DAT_SENDER,
            Usage::DatReceiver => UsageCapabilities::DAT_RECEIVER,
            Usage::CmdInitiator => UsageCapabilities::CMD_INITIATOR,
            Usage::CmdExecutor => UsageCapabilities::CMD_EXECUTOR,
        }
    }

    /// 稳定的小写名称，用于日志字段。
    pub const fn as_str(self) -> &'static str {
        match self {
            Usage::EvtProducer => "evt_producer",
            Usage::EvtConsumer => "evt_consumer",
            Usage::DatSender => "dat_sender",
            Usage::DatReceiver => "dat_receiver",
            Usage::CmdInitiator => "cmd_initiator",
            Usage::CmdExecutor => "cmd_executor",
        }
    }
}

bitflags! {
    /// 服务支持的链路用途集合。
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct UsageCapabilities: u8 {
        const EVT_PRODUCER = 1 << 0;
        const EVT_CONSUMER = 1 << 1;
        const DAT_SENDER = 1 << 2;
        const DAT_RECEIVER = 1 << 3;
        const CMD_INITIATOR = 1 << 4;
        const CMD_EXECUTOR = 1 << 5;
    }
}

impl UsageCapabilities {
    /// 枚举集合中的全部用途，顺序与位定义一致。
    pub fn usages(self) -> impl Iterator<Item = Usage> {
        [
            Usage::EvtProducer,
            Usage::EvtConsumer,
            Usage::DatSender,
            Usage::DatReceiver,
            Usage::CmdInitiator,
            Usage::CmdExecutor,
        ]
        .into_iter()
        .filter(move |usage| self.contains(usage.capability()))
    }
}

bitflags! {
    /// 服务上线时指定的行为开关。
    ///
    /// - `AUTO_ACCEPT`：由服务自有的守护线程自动接受入站连接；
    /// - `KEEP_ACCEPTED_LINK`：服务下线时保留已接受的链路，由应用显式关闭；
    /// - `BROADCAST_EVENT`：启用广播线程，允许向全部已接受链路扇出事件。
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ServiceFlags: u8 {
        const AUTO_ACCEPT = 1 << 0;
        const KEEP_ACCEPTED_LINK = 1 << 1;
        const BROADCAST_EVENT = 1 << 2;
    }
}

/// 事件类型标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EvtId(pub u64);

impl EvtId {
    /// 保活事件，常用于连通性探测。
    pub const KEEPALIVE: EvtId = EvtId(1);
    /// 测试与演示用的通用事件。
    pub const HELLO: EvtId = EvtId(2);
    pub const GOODBYE: EvtId = EvtId(3);
}

impl fmt::Display for EvtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evt#{}", self.0)
    }
}

/// 单条事件描述。
///
/// - `seq_id` 由投递方所在链路在 `post_evt` 时分配，调用方传入的值会被覆盖；
/// - 同一生产链路上的 `seq_id` 严格递增。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvtDesc {
    pub evt_id: EvtId,
    pub evt_value: u64,
    pub seq_id: u64,
}

impl EvtDesc {
    pub const fn new(evt_id: EvtId, evt_value: u64) -> Self {
        Self {
            evt_id,
            evt_value,
            seq_id: 0,
        }
    }
}

/// 阻塞语义。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `NonBlock`：条件不满足立即返回对应的容量/空结果错误；
///   - `MayBlock`：无限等待，直到条件满足或链路断开；
///   - `Timeout(d)`：最多等待 `d`，到期返回 `Timeout` 且无副作用。`Timeout(Duration::ZERO)` 等价于 `NonBlock`。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockingMode {
    NonBlock,
    #[default]
    MayBlock,
    Timeout(Duration),
}

impl BlockingMode {
    /// 将零时长超时归一为非阻塞。
    pub fn normalized(self) -> Self {
        match self {
            BlockingMode::Timeout(d) if d.is_zero() => BlockingMode::NonBlock,
            other => other,
        }
    }
}

/// 所有可能阻塞的 API 共享的调用选项。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IocOptions {
    pub blocking: BlockingMode,
    /// 事件投递是否同步：为 `true` 时 `post_evt` 在回调执行完毕后才返回。
    pub sync: bool,
}

impl IocOptions {
    /// 默认选项：可阻塞、异步投递。
    pub const fn may_block() -> Self {
        Self {
            blocking: BlockingMode::MayBlock,
            sync: false,
        }
    }

    pub const fn non_block() -> Self {
        Self {
            blocking: BlockingMode::NonBlock,
            sync: false,
        }
    }

    pub const fn timeout(duration: Duration) -> Self {
        Self {
            blocking: BlockingMode::Timeout(duration),
            sync: false,
        }
    }

    /// 切换为同步投递。
    pub const fn sync_mode(mut self) -> Self {
        self.sync = true;
        self
    }

    /// 切换为异步投递。
    pub const fn async_mode(mut self) -> Self {
        self.sync = false;
        self
    }
}
