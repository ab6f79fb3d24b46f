//! # 链路三层状态
//!
//! ## 核心意图（Why）
//! - L1 连接状态（[`ConnState`]）描述底层连通性，与链路上运行的是事件、数据还是命令无关；
//! - L2 主操作状态（[`LinkState`]）与 L3 子状态（[`LinkSubState`]）描述“此刻是否有操作在途”，
//!   只在调用执行期间短暂处于 Busy，调用返回后必然回到 Ready。
//!
//! ## 状态机约束（What）
//! - 合法连接跃迁：`Disconnected → Connecting → Connected → {Disconnecting → Disconnected | Broken}`，
//!   另外允许 `Connecting → Disconnected`（连接请求被撤回或服务下线）与 `Broken → Disconnected`（关闭已断开的链路）；
//! - 子状态只反映链路自身角色：发送端永远不会报告接收端子状态，反之亦然。
//!
//! ## 执行（How）
//! - Busy 状态由原子计数器与 RAII 守卫 [`BusyGuard`] 维护：进入操作时递增，守卫析构（包括提前返回与 panic 展开）时递减，
//!   不存在“忘记恢复 Ready”的路径。

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::types::Usage;

/// 连接状态（L1）。
///
/// # 教案式说明
/// - **意图 (Why)**：让调用方区分“正在建立”“可用”“正在优雅关闭”与“异常断开”；
/// - **契约 (What)**：状态间跃迁受 [`ConnState::can_transition_to`] 限制；
/// - **风险 (Trade-offs)**：由于关闭采用同步释放，`Disconnecting`/`Disconnected` 只在关闭调用内部出现，
///   外部查询已关闭链路得到的是 `NotExistLink`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// 初始/终止态，没有底层传输。
    Disconnected,
    /// 握手进行中。
    Connecting,
    /// 稳定可用。
    Connected,
    /// 优雅关闭进行中。
    Disconnecting,
    /// 对端异常消失，后续操作返回 `LinkBroken`。
    Broken,
}

impl ConnState {
    /// 判断状态是否允许跃迁至 `target`。
    ///
    /// - **执行 (How)**：通过匹配元组 `(self, target)` 实现有限状态机判定；自环视为合法，便于幂等推进。
    pub fn can_transition_to(self, target: ConnState) -> bool {
        matches!(
            (self, target),
            (ConnState::Disconnected, ConnState::Disconnected)
                | (ConnState::Disconnected, ConnState::Connecting)
                | (ConnState::Connecting, ConnState::Connecting)
                | (ConnState::Connecting, ConnState::Connected)
                | (ConnState::Connecting, ConnState::Disconnected)
                | (ConnState::Connected, ConnState::Connected)
                | (ConnState::Connected, ConnState::Disconnecting)
                | (ConnState::Connected, ConnState::Broken)
                | (ConnState::Disconnecting, ConnState::Disconnecting)
                | (ConnState::Disconnecting, ConnState::Disconnected)
                | (ConnState::Broken, ConnState::Broken)
                | (ConnState::Broken, ConnState::Disconnected)
        )
    }
}

/// 主操作状态（L2）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkState {
    Ready,
    /// 事件回调正在执行。
    BusyCbProcEvt,
    /// 订阅变更进行中。
    BusySubEvt,
    /// 退订变更进行中。
    BusyUnsubEvt,
    /// 命令执行中。
    BusyExecCmd,
}

/// 角色相关的子状态（L3）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkSubState {
    /// 事件链路没有细分子状态。
    Default,
    DatSenderReady,
    DatSenderBusySendDat,
    DatReceiverReady,
    /// 轮询接收进行中。
    DatReceiverBusyRecvDat,
    /// 接收回调执行中。
    DatReceiverBusyCbRecvDat,
    CmdInitiatorReady,
    CmdInitiatorBusyExecCmd,
    CmdExecutorReady,
    CmdExecutorBusyExecCmd,
}

/// 可被观测的在途操作种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BusyKind {
    CbProcEvt,
    SubEvt,
    UnsubEvt,
    ExecCmd,
    SendDat,
    RecvDat,
    CbRecvDat,
}

impl BusyKind {
    const COUNT: usize = 7;

    const fn slot(self) -> usize {
        match self {
            BusyKind::CbProcEvt => 0,
            BusyKind::SubEvt => 1,
            BusyKind::UnsubEvt => 2,
            BusyKind::ExecCmd => 3,
            BusyKind::SendDat => 4,
            BusyKind::RecvDat => 5,
            BusyKind::CbRecvDat => 6,
        }
    }
}

/// 每条链路的在途操作计数。
#[derive(Debug, Default)]
pub(crate) struct OpCounters {
    slots: [AtomicUsize; BusyKind::COUNT],
}

impl OpCounters {
    /// 标记一次操作开始，返回的守卫析构时自动结束。
    pub(crate) fn enter(&self, kind: BusyKind) -> BusyGuard<'_> {
        self.slots[kind.slot()].fetch_add(1, Ordering::AcqRel);
        BusyGuard {
            counters: self,
            kind,
        }
    }

    fn busy(&self, kind: BusyKind) -> bool {
        self.slots[kind.slot()].load(Ordering::Acquire) > 0
    }

    /// 汇总主操作状态，回调执行优先于订阅变更，订阅变更优先于命令执行。
    pub(crate) fn link_state(&self) -> LinkState {
        if self.busy(BusyKind::CbProcEvt) {
            LinkState::BusyCbProcEvt
        } else if self.busy(BusyKind::SubEvt) {
            LinkState::BusySubEvt
        } else if self.busy(BusyKind::UnsubEvt) {
            LinkState::BusyUnsubEvt
        } else if self.busy(BusyKind::ExecCmd) {
            LinkState::BusyExecCmd
        } else {
            LinkState::Ready
        }
    }

    /// 按链路角色给出子状态。
    pub(crate) fn sub_state(&self, usage: Usage) -> LinkSubState {
        match usage {
            Usage::EvtProducer | Usage::EvtConsumer => LinkSubState::Default,
            Usage::DatSender if self.busy(BusyKind::SendDat) => LinkSubState::DatSenderBusySendDat,
            Usage::DatSender => LinkSubState::DatSenderReady,
            Usage::DatReceiver if self.busy(BusyKind::CbRecvDat) => {
                LinkSubState::DatReceiverBusyCbRecvDat
            }
            Usage::DatReceiver if self.busy(BusyKind::RecvDat) => {
                LinkSubState::DatReceiverBusyRecvDat
            }
            Usage::DatReceiver => LinkSubState::DatReceiverReady,
            Usage::CmdInitiator if self.busy(BusyKind::ExecCmd) => {
                LinkSubState::CmdInitiatorBusyExecCmd
            }
            Usage::CmdInitiator => LinkSubState::CmdInitiatorReady,
            Usage::CmdExecutor if self.busy(BusyKind::ExecCmd) => {
                LinkSubState::CmdExecutorBusyExecCmd
            }
            Usage::CmdExecutor => LinkSubState::CmdExecutorReady,
        }
    }
}

/// 在途操作守卫，析构时递减对应计数。
#[must_use = "守卫被立即丢弃会让 Busy 状态瞬间结束"]
pub(crate) struct BusyGuard<'a> {
    counters: &'a OpCounters,
    kind: BusyKind,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.counters.slots[self.kind.slot()].fetch_sub(1, Ordering::AcqRel);
    }
}
