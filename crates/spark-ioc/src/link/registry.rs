//! # LinkTable：链路句柄表
//!
//! ## 核心意图（Why）
//! - 以 `DashMap` 保存 `LinkId → Arc<Link>` 映射，查询、注册、注销都不需要全局锁；
//! - 句柄由单调递增计数器分配且永不复用，已关闭的句柄不会意外指向新链路。
//!
//! ## 行为契约（What）
//! - `reserve`：先占名额再分配句柄，超过 `max_links` 时返回 `TooMany`；`commit` 时句柄冲突视为内部缺陷；
//! - `remove`：原子移除，并发关闭同一链路时只有一方拿到对象；
//! - 查询结果是 `Arc` 克隆，调用方不持有分片锁。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::{DashMap, mapref::entry::Entry};

use crate::error::{IocError, IocResult};
use crate::link::Link;
use crate::types::LinkId;

#[derive(Debug)]
pub(crate) struct LinkTable {
    links: DashMap<LinkId, Arc<Link>>,
    next_id: AtomicU64,
    reserved: AtomicUsize,
    limit: usize,
}

impl LinkTable {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            links: DashMap::new(),
            next_id: AtomicU64::new(1),
            reserved: AtomicUsize::new(0),
            limit,
        }
    }

    /// 预占一个名额并分配句柄；返回的 [`Reservation`] 未被登记时析构会归还名额。
    pub(crate) fn reserve(&self) -> IocResult<Reservation<'_>> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.limit).then_some(current + 1)
            })
            .map_err(|_| IocError::TooMany {
                what: "links",
                limit: self.limit,
            })?;
        let id = LinkId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(Reservation {
            table: self,
            id,
            committed: false,
        })
    }

    pub(crate) fn get(&self, id: LinkId) -> IocResult<Arc<Link>> {
        if id.is_invalid() {
            return Err(IocError::InvalidParam {
                detail: "LinkId::INVALID",
            });
        }
        self.links
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(IocError::NotExistLink { link: id })
    }

    /// 原子移除链路并归还名额。
    pub(crate) fn remove(&self, id: LinkId) -> IocResult<Arc<Link>> {
        if id.is_invalid() {
            return Err(IocError::InvalidParam {
                detail: "LinkId::INVALID",
            });
        }
        let (_, link) = self
            .links
            .remove(&id)
            .ok_or(IocError::NotExistLink { link: id })?;
        self.reserved.fetch_sub(1, Ordering::AcqRel);
        Ok(link)
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    /// 当前全部链路的快照。
    pub(crate) fn snapshot(&self) -> Vec<Arc<Link>> {
        self.links
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

/// 已预占但尚未登记的链路名额。
pub(crate) struct Reservation<'a> {
    table: &'a LinkTable,
    id: LinkId,
    committed: bool,
}

impl Reservation<'_> {
    pub(crate) fn id(&self) -> LinkId {
        self.id
    }

    /// 登记链路，名额转为正式占用。
    pub(crate) fn commit(mut self, link: Arc<Link>) -> IocResult<()> {
        match self.table.links.entry(self.id) {
            Entry::Occupied(_) => Err(IocError::bug(format!("duplicate link id {}", self.id))),
            Entry::Vacant(vacant) => {
                vacant.insert(link);
                self.committed = true;
                Ok(())
            }
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.table.reserved.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IocConfig;
    use crate::link::{LinkSide, UsageArgs};
    use crate::types::{SrvId, Usage};

    fn make(id: LinkId) -> Arc<Link> {
        Link::new(
            id,
            Usage::EvtProducer,
            SrvId::from_raw(1),
            LinkSide::Client,
            &UsageArgs::default(),
            &IocConfig::default(),
        )
        .expect("创建链路")
    }

    #[test]
    fn ids_are_never_reused() {
        let table = LinkTable::new(4);
        let first = table.reserve().expect("名额");
        let id = first.id();
        first.commit(make(id)).expect("登记");
        table.remove(id).expect("移除");
        let second = table.reserve().expect("名额");
        assert_ne!(second.id(), id);
    }

    #[test]
    fn dropped_reservation_returns_capacity() {
        let table = LinkTable::new(1);
        {
            let _pending = table.reserve().expect("唯一名额");
            assert!(matches!(table.reserve(), Err(IocError::TooMany { limit: 1, .. })));
        }
        table.reserve().expect("名额已归还");
    }

    #[test]
    fn invalid_and_unknown_ids_are_distinguished() {
        let table = LinkTable::new(4);
        assert!(matches!(
            table.get(LinkId::INVALID),
            Err(IocError::InvalidParam { .. })
        ));
        assert!(matches!(
            table.get(LinkId::from_raw(999_999)),
            Err(IocError::NotExistLink { .. })
        ));
        assert!(matches!(
            table.remove(LinkId::from_raw(999_999)),
            Err(IocError::NotExistLink { .. })
        ));
    }
}
