//! # 传输绑定
//!
//! ## 意图（Why）
//! - IOC 核心不关心字节如何在两个端点之间移动，只要求“可靠、有序、面向连接”；
//!   本模块把这一能力抽象为 [`Transport`]，由运行时按 URI 协议名选择具体实现；
//! - 随 crate 提供进程内 FIFO 绑定 [`FifoTransport`]（`fifo://localprocess/<path>`），
//!   使核心无需外部依赖即可端到端运行与测试。
//!
//! ## 契约（What）
//! - [`Transport::transmit`] 把一块数据交给接收端的 [`DataSink`]；接收端已满时原样退回数据块，
//!   由发送端保留在暂存区并在下次推进时重试，从而保证不丢失、不乱序；
//! - [`Transport::check_uri`] 在服务上线前校验 URI 是否可被该绑定承载。

use core::fmt;
use core::str::FromStr;

use crate::data::DatDesc;
use crate::error::{IocError, IocResult};
use crate::types::LinkId;

/// 服务地址：`<protocol>://<host>[:<port>]/<path>`。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SrvUri {
    protocol: String,
    host: String,
    port: Option<u16>,
    path: String,
}

impl SrvUri {
    /// 进程内 FIFO 绑定使用的主机名。
    pub const LOCAL_PROCESS_HOST: &'static str = "localprocess";

    pub fn new(protocol: impl Into<String>, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port: None,
            path: path.into(),
        }
    }

    /// 构造 `fifo://localprocess/<path>`。
    pub fn fifo(path: impl Into<String>) -> Self {
        Self::new(FifoTransport::PROTOCOL, Self::LOCAL_PROCESS_HOST, path)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for SrvUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "/{}", self.path)
    }
}

impl FromStr for SrvUri {
    type Err = IocError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (protocol, rest) = raw.split_once("://").ok_or(IocError::InvalidParam {
            detail: "service URI must contain `://`",
        })?;
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        if protocol.is_empty() || authority.is_empty() || path.is_empty() {
            return Err(IocError::InvalidParam {
                detail: "service URI requires protocol, host and path",
            });
        }
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| IocError::InvalidParam {
                    detail: "service URI port must be a 16-bit integer",
                })?;
                (host, Some(port))
            }
            None => (authority, None),
        };
        Ok(Self {
            protocol: protocol.to_owned(),
            host: host.to_owned(),
            port,
            path: path.to_owned(),
        })
    }
}

/// 接收端在传输绑定眼中的样子。
pub trait DataSink: Send + Sync {
    /// 接收端链路句柄，用于日志。
    fn link_id(&self) -> LinkId;

    /// 交付一块数据；接收端已满时原样退回。
    fn offer(&self, chunk: DatDesc) -> Result<(), DatDesc>;
}

/// 可插拔的传输绑定。
///
/// # 教案式说明
/// - **意图 (Why)**：让运行时按协议名选择实现，核心的状态机与队列逻辑对所有绑定保持一致；
/// - **契约 (What)**：
///   - `protocol` 返回 URI 中的协议名，作为注册表键；
///   - `transmit` 必须保持调用顺序，不得拆分或合并数据块；
/// - **风险 (Trade-offs)**：接口是同步的，跨进程实现需要自行在内部缓冲，避免在发送端推进数据时长时间阻塞。
pub trait Transport: Send + Sync + 'static {
    fn protocol(&self) -> &'static str;

    /// 校验 URI 是否能由本绑定承载。
    fn check_uri(&self, uri: &SrvUri) -> IocResult<()>;

    /// 把一块数据交给接收端。
    fn transmit(&self, sink: &dyn DataSink, chunk: DatDesc) -> Result<(), DatDesc>;
}

/// 进程内 FIFO 绑定：数据块直接移交给对端接收队列。
#[derive(Clone, Copy, Debug, Default)]
pub struct FifoTransport;

impl FifoTransport {
    pub const PROTOCOL: &'static str = "fifo";
}

impl Transport for FifoTransport {
    fn protocol(&self) -> &'static str {
        Self::PROTOCOL
    }

    fn check_uri(&self, uri: &SrvUri) -> IocResult<()> {
        if uri.host() != SrvUri::LOCAL_PROCESS_HOST {
            return Err(IocError::NotSupport {
                operation: "fifo transport only serves host `localprocess`",
            });
        }
        if uri.path().is_empty() {
            return Err(IocError::InvalidParam {
                detail: "fifo service path must not be empty",
            });
        }
        Ok(())
    }

    fn transmit(&self, sink: &dyn DataSink, chunk: DatDesc) -> Result<(), DatDesc> {
        tracing::trace!(
            ioc.link_id = %sink.link_id(),
            len = chunk.len(),
            "fifo transmit"
        );
        sink.offer(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fifo_uri() {
        let uri: SrvUri = "fifo://localprocess/EvtProducer".parse().expect("合法 URI");
        assert_eq!(uri, SrvUri::fifo("EvtProducer"));
        assert_eq!(uri.to_string(), "fifo://localprocess/EvtProducer");
    }

    #[test]
    fn parses_port_and_nested_path() {
        let uri: SrvUri = "tcp://localhost:8080/a/b".parse().expect("合法 URI");
        assert_eq!(uri.protocol(), "tcp");
        assert_eq!(uri.port(), Some(8080));
        assert_eq!(uri.path(), "a/b");
    }

    #[test]
    fn rejects_malformed_uri() {
        for raw in ["localprocess/x", "fifo://localprocess", "fifo:///x", "tcp://h:99999/x"] {
            assert!(
                matches!(raw.parse::<SrvUri>(), Err(IocError::InvalidParam { .. })),
                "{raw}"
            );
        }
    }

    #[test]
    fn fifo_only_accepts_local_process_host() {
        let remote = SrvUri::new("fifo", "otherhost", "x");
        assert!(matches!(
            FifoTransport.check_uri(&remote),
            Err(IocError::NotSupport { .. })
        ));
        assert!(FifoTransport.check_uri(&SrvUri::fifo("x")).is_ok());
    }
}
