//! 加密泵。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 把 `outgoing_plaintext` 中排队的明文交给引擎加密，并把产出的密文排空到 `outgoing_ciphertext`；
//! - 引擎内部缓存达到上限时少消费或不消费，泵据此返回背压结果，剩余明文留待下次调用。
//!
//! ## 契约（What）
//! - 队列为空或握手尚未完成时返回 [`EncryptOutcome::Idle`]，不与引擎交互；
//! - 明文按队列顺序被消费，每个字节恰好加密一次；
//! - 背压不是错误，会话保持可用。

use tracing::{debug, trace};

use super::Session;
use crate::{
    engine::{EngineStatus, TlsEngine},
    error::SessionError,
};

/// 一次加密泵调用的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EncryptOutcome {
    /// 无事可做：没有排队明文，或握手未完成。
    Idle,
    /// 排队明文已全部加密。
    Flushed,
    /// 引擎暂不接受更多明文，`pending` 字节仍在队列中。
    Backpressure { pending: usize },
}

impl<E: TlsEngine> Session<E> {
    /// 加密排队明文，直到队列清空或引擎施加背压。
    pub fn pump_encrypt(&mut self) -> Result<EncryptOutcome, SessionError> {
        if self.outgoing_plaintext.is_empty() || !self.engine.is_established() {
            return Ok(EncryptOutcome::Idle);
        }

        while !self.outgoing_plaintext.is_empty() {
            let consumed = match self.engine.encrypt(self.outgoing_plaintext.as_slice()) {
                Ok(n) => n.min(self.outgoing_plaintext.len()),
                Err(source) => return Err(self.fail(SessionError::RecordFailed { source })),
            };

            if consumed > 0 {
                self.outgoing_plaintext.consume(consumed);
                self.drain_outbound()?;
                trace!(channel = %self.channel_label(), bytes = consumed, "plaintext encrypted");
            }

            if self.engine.last_signal().classify() == EngineStatus::Fatal {
                return Err(self.fail(SessionError::PeerClosed));
            }

            if consumed == 0 {
                let pending = self.outgoing_plaintext.len();
                debug!(channel = %self.channel_label(), pending, "encrypt backpressure");
                return Ok(EncryptOutcome::Backpressure { pending });
            }
        }

        Ok(EncryptOutcome::Flushed)
    }
}
