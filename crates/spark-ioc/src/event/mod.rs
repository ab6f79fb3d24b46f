//! 事件通道：订阅、消费端队列与分发。

pub(crate) mod inbox;
mod subscription;

pub use subscription::{EvtCallback, EvtSubscription};
