use std::io;

use rustls::{AlertDescription, Error as RustlsError};
use thiserror::Error;

use crate::engine::{ConduitSide, EngineError};

/// 会话错误分类模块。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 会话泵的每个失败都必须带着分类结果返回，由宿主决定拆除会话、记录安全事件或只记一条日志；
/// - 提供稳定错误码，运维脚本与测试可以直接按码断言，无需解析 `rustls` 的错误文本。
///
/// ## 逻辑（How）
/// - [`SessionError`] 的每个变体对应一种失败阶段（构造、握手、导管、记录、传输）；
/// - [`SessionError::category`] 沿错误链向下探查：`rustls::Error` 与 TLS Alert 细分为安全类，
///   `io::Error` 按 `ErrorKind` 细分为瞬时/资源/关闭类。
///
/// ## 契约（What）
/// - 本模块的所有错误都是终止性的：调用方收到后应销毁会话；
/// - 背压不是错误，由 [`crate::EncryptOutcome::Backpressure`] 表达。
///
/// ## 风险与权衡（Trade-offs）
/// - 未穷举的 `rustls::Error` 与 Alert 归为 `Transient`，避免把未知情况误报成安全事件。
#[derive(Debug, Error)]
pub enum SessionError {
    /// 引擎分配失败；此时尚未分配任何其它资源。
    #[error("tls engine allocation failed: {source}")]
    EngineAllocation { source: EngineError },
    /// 导管打开失败；已分配的引擎与先前导管均已释放。
    #[error("{side:?} conduit allocation failed: {source}")]
    ConduitAllocation {
        side: ConduitSide,
        source: EngineError,
    },
    #[error("tls handshake failed: {source}")]
    HandshakeFailed { source: EngineError },
    /// 入站导管拒收密文。内存导管不应拒收，出现即视为内部契约被破坏。
    #[error("inbound conduit rejected ciphertext: {source}")]
    ConduitWriteFailed { source: EngineError },
    #[error("outbound conduit drain failed: {source}")]
    ConduitReadFailed { source: EngineError },
    #[error("tls record processing failed: {source}")]
    RecordFailed { source: EngineError },
    #[error("peer closed the tls session")]
    PeerClosed,
    #[error("transport failure: {source}")]
    TransportFatal { source: io::Error },
}

/// 安全类错误的细分。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecurityClass {
    Integrity,
    Authentication,
    Authorization,
    Unknown,
}

/// 错误的处置类别。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCategory {
    /// 证书、握手或记录层违规，需要进入安全审计。
    Security(SecurityClass),
    /// 资源不足（分配失败、缓冲耗尽）。
    ResourceExhausted,
    /// 连接层面的瞬时故障，宿主可以重新建连。
    Transient,
    /// 对端有序关闭或传输到达 EOF。
    Closed,
    /// 内部契约被破坏。
    Internal,
}

impl SessionError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::EngineAllocation { .. } => "spark.tls.session.engine_allocation",
            SessionError::ConduitAllocation { .. } => "spark.tls.session.conduit_allocation",
            SessionError::HandshakeFailed { .. } => "spark.tls.session.handshake_failed",
            SessionError::ConduitWriteFailed { .. } => "spark.tls.session.conduit_write_failed",
            SessionError::ConduitReadFailed { .. } => "spark.tls.session.conduit_read_failed",
            SessionError::RecordFailed { .. } => "spark.tls.session.record_failed",
            SessionError::PeerClosed => "spark.tls.session.peer_closed",
            SessionError::TransportFatal { .. } => "spark.tls.session.transport_fatal",
        }
    }

    /// 推导处置类别。
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::EngineAllocation { .. } | SessionError::ConduitAllocation { .. } => {
                ErrorCategory::ResourceExhausted
            }
            SessionError::HandshakeFailed { source } | SessionError::RecordFailed { source } => {
                categorize_engine_error(source)
            }
            SessionError::ConduitWriteFailed { .. } | SessionError::ConduitReadFailed { .. } => {
                ErrorCategory::Internal
            }
            SessionError::PeerClosed => ErrorCategory::Closed,
            SessionError::TransportFatal { source } => categorize_io_error(source),
        }
    }

    /// 底层引擎错误（若有）。
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            SessionError::EngineAllocation { source }
            | SessionError::ConduitAllocation { source, .. }
            | SessionError::HandshakeFailed { source }
            | SessionError::ConduitWriteFailed { source }
            | SessionError::ConduitReadFailed { source }
            | SessionError::RecordFailed { source } => Some(source),
            SessionError::PeerClosed | SessionError::TransportFatal { .. } => None,
        }
    }
}

fn categorize_engine_error(error: &EngineError) -> ErrorCategory {
    match error {
        EngineError::Protocol(source) => match source.downcast_ref::<RustlsError>() {
            Some(rustls_error) => categorize_rustls_error(rustls_error),
            None => ErrorCategory::Security(SecurityClass::Unknown),
        },
        EngineError::Io(source) => categorize_with_rustls(source),
        EngineError::Closed => ErrorCategory::Closed,
        EngineError::Fault(_) | EngineError::Unavailable(_) => ErrorCategory::Internal,
    }
}

fn categorize_with_rustls(error: &io::Error) -> ErrorCategory {
    if let Some(source) = error.get_ref()
        && let Some(rustls_error) = source.downcast_ref::<RustlsError>()
    {
        return categorize_rustls_error(rustls_error);
    }
    categorize_io_error(error)
}

fn categorize_rustls_error(error: &RustlsError) -> ErrorCategory {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidEncryptedClientHello(_)
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord => ErrorCategory::Security(SecurityClass::Integrity),
        NoCertificatesPresented
        | InvalidCertificate(_)
        | InvalidCertRevocationList(_)
        | UnsupportedNameType => ErrorCategory::Security(SecurityClass::Authentication),
        PeerIncompatible(_) | HandshakeNotComplete | General(_) | Other(_) => {
            ErrorCategory::Transient
        }
        FailedToGetCurrentTime | FailedToGetRandomBytes => ErrorCategory::ResourceExhausted,
        BadMaxFragmentSize | InconsistentKeys(_) => ErrorCategory::Internal,
        AlertReceived(alert) => alert_to_category(alert),
        NoApplicationProtocol => ErrorCategory::Security(SecurityClass::Unknown),
        _ => ErrorCategory::Transient,
    }
}

/// 证书类告警归入认证失败，关闭类告警归入 `Closed`，其余已知告警一律视为完整性破坏。
fn alert_to_category(alert: &AlertDescription) -> ErrorCategory {
    use AlertDescription::*;
    match alert {
        BadCertificate | UnsupportedCertificate | CertificateRevoked | CertificateExpired
        | CertificateUnknown | UnknownCA | NoCertificate | CertificateUnobtainable
        | CertificateRequired => ErrorCategory::Security(SecurityClass::Authentication),
        AccessDenied => ErrorCategory::Security(SecurityClass::Authorization),
        CloseNotify | UserCanceled | NoRenegotiation => ErrorCategory::Closed,
        DecompressionFailure => ErrorCategory::ResourceExhausted,
        Unknown(_) => ErrorCategory::Transient,
        _ => ErrorCategory::Security(SecurityClass::Integrity),
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::UnexpectedEof => ErrorCategory::Closed,
        ErrorKind::WriteZero | ErrorKind::OutOfMemory => ErrorCategory::ResourceExhausted,
        ErrorKind::InvalidData => ErrorCategory::Security(SecurityClass::Integrity),
        _ => ErrorCategory::Transient,
    }
}
