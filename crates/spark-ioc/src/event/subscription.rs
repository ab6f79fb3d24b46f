//! 事件订阅：回调与其关心的事件类型。

use core::fmt;
use std::sync::Arc;

use crate::error::IocResult;
use crate::types::{EvtDesc, EvtId};

/// 事件回调。
///
/// 回调返回的错误只会被记录，不会传回投递方。
pub type EvtCallback = Arc<dyn Fn(&EvtDesc) -> IocResult<()> + Send + Sync>;

/// 一次订阅：回调身份加事件类型过滤。
///
/// # 教案式说明
/// - **契约 (What)**：订阅身份由回调的 `Arc` 指针决定，同一个 `EvtCallback` 在同一链路上只能订阅一次；
///   退订时传入同一个 `Arc`（或其克隆）即可；
/// - **风险 (Trade-offs)**：两个内容相同但分别创建的闭包被视为不同订阅者。
#[derive(Clone)]
pub struct EvtSubscription {
    callback: EvtCallback,
    evt_ids: Vec<EvtId>,
}

impl EvtSubscription {
    /// 由闭包创建订阅。
    pub fn new<F>(evt_ids: impl IntoIterator<Item = EvtId>, callback: F) -> Self
    where
        F: Fn(&EvtDesc) -> IocResult<()> + Send + Sync + 'static,
    {
        Self::with_callback(evt_ids, Arc::new(callback))
    }

    /// 复用已有回调创建订阅。
    pub fn with_callback(evt_ids: impl IntoIterator<Item = EvtId>, callback: EvtCallback) -> Self {
        Self {
            callback,
            evt_ids: evt_ids.into_iter().collect(),
        }
    }

    pub fn callback(&self) -> &EvtCallback {
        &self.callback
    }

    pub fn evt_ids(&self) -> &[EvtId] {
        &self.evt_ids
    }

    pub(crate) fn wants(&self, evt_id: EvtId) -> bool {
        self.evt_ids.contains(&evt_id)
    }

    pub(crate) fn is_same_consumer(&self, callback: &EvtCallback) -> bool {
        same_callback(&self.callback, callback)
    }
}

impl fmt::Debug for EvtSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvtSubscription")
            .field("evt_ids", &self.evt_ids)
            .finish_non_exhaustive()
    }
}

fn same_callback(a: &EvtCallback, b: &EvtCallback) -> bool {
    core::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_follows_the_arc() {
        let sub = EvtSubscription::new([EvtId::KEEPALIVE], |_| Ok(()));
        let clone = sub.callback().clone();
        assert!(sub.is_same_consumer(&clone));

        let other: EvtCallback = Arc::new(|_: &EvtDesc| Ok(()));
        assert!(!sub.is_same_consumer(&other));
    }

    #[test]
    fn filter_matches_listed_ids_only() {
        let sub = EvtSubscription::new([EvtId::HELLO, EvtId::GOODBYE], |_| Ok(()));
        assert!(sub.wants(EvtId::HELLO));
        assert!(!sub.wants(EvtId::KEEPALIVE));
    }
}
