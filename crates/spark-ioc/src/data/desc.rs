//! 数据描述符：小块内嵌、大块共享。

use core::fmt;

use bytes::Bytes;

/// 内嵌负载的字节上限，等于或小于该长度的数据直接拷贝进描述符。
pub const EMBEDDED_DATA_CAPACITY: usize = 64;

/// 一块离散的数据流片段。
///
/// # 教案式说明
/// - **意图 (Why)**：短消息（心跳、控制字）走内嵌路径避免堆分配；大块数据以 [`Bytes`] 共享，
///   在发送端暂存区、传输绑定与接收队列之间移动时只增减引用计数；
/// - **契约 (What)**：
///   - 长度为零的描述符是合法值，但 `send_dat` 会以 `ZeroData` 拒绝它，与“没有数据”严格区分；
///   - [`DatDesc::as_slice`] 在两种表示下返回相同的字节视图；
/// - **风险 (Trade-offs)**：内嵌表示固定占用 64 字节栈空间，描述符整体大小约为 72 字节。
#[derive(Clone)]
pub struct DatDesc {
    repr: Repr,
}

#[derive(Clone)]
enum Repr {
    Embedded {
        len: u8,
        buf: [u8; EMBEDDED_DATA_CAPACITY],
    },
    Shared(Bytes),
}

impl DatDesc {
    /// 拷贝一段字节，长度不超过内嵌上限时使用内嵌表示。
    pub fn from_slice(data: &[u8]) -> Self {
        if data.len() <= EMBEDDED_DATA_CAPACITY {
            let mut buf = [0u8; EMBEDDED_DATA_CAPACITY];
            buf[..data.len()].copy_from_slice(data);
            Self {
                repr: Repr::Embedded {
                    len: data.len() as u8,
                    buf,
                },
            }
        } else {
            Self {
                repr: Repr::Shared(Bytes::copy_from_slice(data)),
            }
        }
    }

    /// 接管一个共享缓冲；短缓冲会被拷贝为内嵌表示。
    pub fn from_bytes(data: Bytes) -> Self {
        if data.len() <= EMBEDDED_DATA_CAPACITY {
            Self::from_slice(&data)
        } else {
            Self {
                repr: Repr::Shared(data),
            }
        }
    }

    /// 按运行时配置的内嵌阈值重新选择表示；阈值不超过 [`EMBEDDED_DATA_CAPACITY`]。
    pub(crate) fn repack(self, threshold: usize) -> Self {
        let embed = self.len() <= threshold;
        if embed == self.is_embedded() {
            return self;
        }
        if embed {
            Self::from_slice(self.as_slice())
        } else {
            Self {
                repr: Repr::Shared(Bytes::copy_from_slice(self.as_slice())),
            }
        }
    }

    /// 空描述符，用于边界测试。
    pub fn empty() -> Self {
        Self::from_slice(&[])
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Embedded { len, .. } => usize::from(*len),
            Repr::Shared(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否使用内嵌表示。
    pub fn is_embedded(&self) -> bool {
        matches!(self.repr, Repr::Embedded { .. })
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.repr {
            Repr::Embedded { len, buf } => &buf[..usize::from(*len)],
            Repr::Shared(bytes) => bytes,
        }
    }

    /// 转换为 [`Bytes`]；共享表示不发生拷贝。
    pub fn into_bytes(self) -> Bytes {
        match self.repr {
            Repr::Embedded { len, buf } => Bytes::copy_from_slice(&buf[..usize::from(len)]),
            Repr::Shared(bytes) => bytes,
        }
    }
}

impl From<&[u8]> for DatDesc {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl From<Vec<u8>> for DatDesc {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(Bytes::from(data))
    }
}

impl From<Bytes> for DatDesc {
    fn from(data: Bytes) -> Self {
        Self::from_bytes(data)
    }
}

impl PartialEq for DatDesc {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for DatDesc {}

impl fmt::Debug for DatDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatDesc")
            .field("len", &self.len())
            .field("embedded", &self.is_embedded())
            .finish()
    }
}
