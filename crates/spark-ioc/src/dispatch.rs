//! # 回调重入检测
//!
//! ## 意图（Why）
//! - 事件回调在分发线程上执行时，若再对同一消费链路发起同步投递，分发线程会等待自己释放分发锁而永久挂起；
//!   本模块记录“当前线程正在为哪些链路执行回调”，让同步路径在入口处快速失败；
//! - 数据接收回调与命令执行回调复用同一机制，用于把本会阻塞自身的调用降级为非阻塞。
//!
//! ## 执行（How）
//! - 线程局部栈保存正在执行回调的链路句柄，嵌套回调（回调中同步投递到另一条链路）会依次压栈；
//! - [`DispatchScope`] 在构造时压栈、析构时弹栈，提前返回与 panic 展开都会经过析构，栈不会残留。

use std::cell::RefCell;

use crate::types::LinkId;

thread_local! {
    static DISPATCH_STACK: RefCell<Vec<LinkId>> = const { RefCell::new(Vec::new()) };
}

/// 当前线程是否正在为 `link` 执行回调。
pub(crate) fn is_dispatching(link: LinkId) -> bool {
    DISPATCH_STACK.with(|stack| stack.borrow().contains(&link))
}

/// 当前线程是否处于任意回调之中。
pub(crate) fn in_callback() -> bool {
    DISPATCH_STACK.with(|stack| !stack.borrow().is_empty())
}

/// 回调执行期间的作用域守卫。
#[must_use = "守卫被立即丢弃会让重入检测失效"]
pub(crate) struct DispatchScope {
    link: LinkId,
}

impl DispatchScope {
    pub(crate) fn enter(link: LinkId) -> Self {
        DISPATCH_STACK.with(|stack| stack.borrow_mut().push(link));
        Self { link }
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCH_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            // 守卫严格按 LIFO 析构，栈顶必然是自己；按位置移除以容忍手动 drop 的乱序。
            if let Some(pos) = stack.iter().rposition(|link| *link == self.link) {
                stack.remove(pos);
            }
        });
    }
}
