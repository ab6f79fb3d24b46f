//! 数据通道：描述符与发送/接收队列。

mod desc;
pub(crate) mod pipe;

pub use desc::{DatDesc, EMBEDDED_DATA_CAPACITY};
pub use pipe::DatCallback;
