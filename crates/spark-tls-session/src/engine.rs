//! TLS 引擎协作方的抽象接缝。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 会话泵只负责搬运字节与推进状态，握手密码学与记录加解密交给外部 TLS 引擎；
//! - 把引擎及其两条内存导管（inbound / outbound）抽象成 trait，生产环境接入 `rustls`，
//!   测试环境接入可注入分段与故障的替身引擎，无需真实密码学即可覆盖边界条件。
//!
//! ## 契约（What）
//! - [`EngineContext::allocate`]：基于共享配置构造一个绑定角色的引擎；
//! - [`TlsEngine::open_conduit`]：依次打开入站、出站导管；
//! - [`TlsEngine::handshake`]：推进一步握手，返回 [`EngineSignal`] 或硬错误；
//! - `write_inbound`/`read_outbound`：导管的追加与排空，返回 0 表示“暂无可搬运数据”，与硬错误区分；
//! - `encrypt`/`decrypt`：返回消费或产出的字节数，0 的原因由 [`TlsEngine::last_signal`] 说明。
//!
//! ## 状态分类（How）
//! - [`EngineSignal::classify`] 把引擎原始信号折叠为三态 [`EngineStatus`]：
//!   `Done → Established`、`WantRead/WantWrite → WantIo`、`Closed → Fatal`；
//!   返回 `Err` 的操作一律视为 `Fatal`。

use std::{error::Error as StdError, io};

use thiserror::Error;

/// 引擎错误携带的装箱底层错误。
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// 握手方向，创建后不可更改。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Role {
    /// 主动发起握手的一方。
    Client,
    /// 等待对端首个握手报文的一方。
    Server,
}

/// 引擎内部导管的方向。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConduitSide {
    /// 承接待解密密文。
    Inbound,
    /// 承接握手与加密产生的密文。
    Outbound,
}

/// 导管尺寸约束。
///
/// - `engine_buffer_limit`：引擎内部缓存（待发送密文或待读取明文）的上限；`None` 表示不设限。
///   达到上限时 `encrypt` 会少消费甚至返回 0，会话据此产生背压信号。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConduitLimits {
    pub engine_buffer_limit: Option<usize>,
}

/// 引擎最近一次操作的原始结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EngineSignal {
    /// 操作完成；对握手而言即已建立。
    Done,
    /// 需要更多入站密文。
    WantRead,
    /// 出站导管里有待排空的密文。
    WantWrite,
    /// 对端已发送 close_notify。
    Closed,
}

/// 三态分类结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EngineStatus {
    Established,
    WantIo,
    Fatal,
}

impl EngineSignal {
    /// 把原始信号折叠为三态。
    pub fn classify(self) -> EngineStatus {
        match self {
            EngineSignal::Done => EngineStatus::Established,
            EngineSignal::WantRead | EngineSignal::WantWrite => EngineStatus::WantIo,
            EngineSignal::Closed => EngineStatus::Fatal,
        }
    }
}

/// 引擎层错误。
///
/// - **意图 (Why)**：与具体 TLS 实现解耦，同时保留底层错误以便 [`crate::error`] 做安全分类；
/// - **契约 (What)**：`Protocol` 承载握手/记录层违规（`rustls::Error` 等），`Io` 承载导管读写失败，
///   `Closed` 表示对端有序关闭，`Fault` 表示引擎违反了导管契约，`Unavailable` 表示上下文缺少所需配置。
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("tls protocol failure: {0}")]
    Protocol(#[source] BoxError),
    #[error("conduit i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed the tls session")]
    Closed,
    #[error("engine contract violated: {0}")]
    Fault(String),
    #[error("engine context unavailable: {0}")]
    Unavailable(&'static str),
}

impl EngineError {
    /// 包装任意协议层错误。
    pub fn protocol(error: impl Into<BoxError>) -> Self {
        EngineError::Protocol(error.into())
    }

    pub fn fault(detail: impl Into<String>) -> Self {
        EngineError::Fault(detail.into())
    }
}

/// TLS 引擎句柄。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 引擎独占两条导管，会话只能通过本 trait 的方法间接读写；
/// - 所有方法必须立即返回，不得阻塞；
/// - `write_inbound` 返回 0 视为违约（内存导管不应施加真实背压），由会话升级为致命错误；
/// - `read_outbound` 返回 `Ok(0)` 表示导管已空，可稍后重试；返回 `Err` 表示不可重试；
/// - `decrypt` 返回 `Ok(0)` 时，调用方通过 [`Self::last_signal`] 区分“暂无数据”与“对端关闭”。
///
/// ## 风险与权衡（Trade-offs）
/// - 引擎必须在 `allocate` 时确定角色，`rustls` 的连接类型不允许构造后切换方向；
/// - 本 trait 不要求 `Send`，单线程事件循环可直接使用非 `Send` 引擎。
pub trait TlsEngine {
    /// 创建时确定的握手方向。
    fn role(&self) -> Role;

    /// 打开（并绑定）一条导管。失败时已打开的资源随引擎一起释放。
    fn open_conduit(&mut self, side: ConduitSide, limits: &ConduitLimits)
    -> Result<(), EngineError>;

    /// 推进一步握手。
    fn handshake(&mut self) -> Result<EngineSignal, EngineError>;

    /// 握手是否已经完成。
    fn is_established(&self) -> bool;

    /// 向入站导管写入密文，返回接受的字节数。
    fn write_inbound(&mut self, ciphertext: &[u8]) -> Result<usize, EngineError>;

    /// 从出站导管取出至多 `buf.len()` 字节密文。
    fn read_outbound(&mut self, buf: &mut [u8]) -> Result<usize, EngineError>;

    /// 提交明文加密，返回消费的字节数（可能少于提交量）。
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<usize, EngineError>;

    /// 读取一段解密后的明文，返回写入 `buf` 的字节数。
    fn decrypt(&mut self, buf: &mut [u8]) -> Result<usize, EngineError>;

    /// 最近一次 `handshake`/`encrypt`/`decrypt` 的原始信号。
    fn last_signal(&self) -> EngineSignal;

    /// 排队发送 close_notify 告警。
    fn close(&mut self) -> Result<(), EngineError>;
}

/// 引擎共享配置上下文，负责按角色分配引擎。
pub trait EngineContext {
    type Engine: TlsEngine;

    fn allocate(&self, role: Role) -> Result<Self::Engine, EngineError>;
}
