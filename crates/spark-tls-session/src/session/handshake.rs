//! 握手驱动。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 每次调用只推进一步握手，再把引擎产出的握手报文排空到 `outgoing_ciphertext`；
//! - 客户端在创建后主动调用一次以产出首个握手报文，之后由解密泵在每段入站密文后驱动。
//!
//! ## 契约（What）
//! - `WantIo` 与 `Established` 两种结果都会排空出站导管：握手的最后一个报文常与“已建立”同时产生；
//! - `Fatal` 时尽力排空（可能含告警报文），随后返回 [`SessionError::HandshakeFailed`]，
//!   排空失败不覆盖握手错误。

use tracing::{debug, trace};

use super::Session;
use crate::{
    engine::{EngineError, EngineStatus, TlsEngine},
    error::SessionError,
};

/// 握手推进结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandshakeStatus {
    /// 握手已完成，可以收发应用数据。
    Established,
    /// 需要等待更多入站密文，或出站密文待写出。
    WantIo,
}

impl<E: TlsEngine> Session<E> {
    /// 推进一步握手并排空出站导管。
    pub fn drive_handshake(&mut self) -> Result<HandshakeStatus, SessionError> {
        let was_established = self.engine.is_established();
        let status = match self.engine.handshake() {
            Ok(signal) => signal.classify(),
            Err(source) => return Err(self.abort_handshake(source)),
        };

        match status {
            EngineStatus::Fatal => Err(self.abort_handshake(EngineError::Closed)),
            EngineStatus::WantIo => {
                self.drain_outbound()?;
                trace!(
                    channel = %self.channel_label(),
                    pending_ciphertext = self.outgoing_ciphertext.len(),
                    "tls handshake wants io"
                );
                Ok(HandshakeStatus::WantIo)
            }
            EngineStatus::Established => {
                self.drain_outbound()?;
                if !was_established {
                    debug!(
                        channel = %self.channel_label(),
                        role = ?self.role,
                        "tls handshake established"
                    );
                }
                Ok(HandshakeStatus::Established)
            }
        }
    }

    fn abort_handshake(&mut self, source: EngineError) -> SessionError {
        // 告警报文尽力送出；排空错误让位于握手错误。
        if let Err(drain) = self.drain_engine() {
            debug!(
                channel = %self.channel_label(),
                error = %drain,
                "alert drain skipped after handshake failure"
            );
        }
        self.fail(SessionError::HandshakeFailed { source })
    }

    /// 把出站导管中的全部密文搬进 `outgoing_ciphertext`，返回搬运字节数。
    pub(super) fn drain_outbound(&mut self) -> Result<usize, SessionError> {
        self.drain_engine()
            .map_err(|source| self.fail(SessionError::ConduitReadFailed { source }))
    }

    fn drain_engine(&mut self) -> Result<usize, EngineError> {
        let Self {
            engine,
            outgoing_ciphertext,
            scratch,
            config,
            ..
        } = self;
        let chunk = &mut scratch[..config.drain_chunk];
        let mut drained = 0;
        loop {
            match engine.read_outbound(chunk)? {
                0 => break,
                n => {
                    let n = n.min(chunk.len());
                    outgoing_ciphertext.append(&chunk[..n]);
                    drained += n;
                }
            }
        }
        if drained > 0 {
            trace!(channel = %self.channel_label(), bytes = drained, "outbound drained");
        }
        Ok(drained)
    }
}
