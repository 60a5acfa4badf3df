//! 解密泵。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 传输每读到一段密文就调用一次 [`Session::on_ciphertext_received`]；
//!   握手未完成时它驱动握手，完成后把明文逐段交给投递回调。
//!
//! ## 执行步骤（How）
//! 1. 把剩余输入写入入站导管；接受 0 字节视为导管违约；
//! 2. 握手未完成则推进一步握手；仍需 I/O 时继续喂入剩余输入，而不是提前返回；
//! 3. 已建立时循环解密直到引擎无明文可读，每段同步投递；
//! 4. 依据引擎最近信号：需要 I/O（例如对端发起重新协商）时排空出站导管，对端关闭时返回致命错误。
//!
//! ## 契约（What）
//! - 握手完成前绝不调用投递回调；
//! - 投递内容与对端加密明文在顺序与字节上完全一致，与密文如何分段到达无关；
//! - 空输入直接返回 `Ok(())`。

use tracing::trace;

use super::{HandshakeStatus, Session};
use crate::{
    engine::{EngineError, EngineStatus, TlsEngine},
    error::SessionError,
};

impl<E: TlsEngine> Session<E> {
    /// 处理一段从传输读到的密文。
    pub fn on_ciphertext_received(&mut self, ciphertext: &[u8]) -> Result<(), SessionError> {
        let mut remaining = ciphertext;
        while !remaining.is_empty() {
            let accepted = match self.engine.write_inbound(remaining) {
                Ok(0) => {
                    let source = EngineError::fault("inbound conduit accepted zero bytes");
                    return Err(self.fail(SessionError::ConduitWriteFailed { source }));
                }
                Ok(n) => n.min(remaining.len()),
                Err(source) => return Err(self.fail(SessionError::ConduitWriteFailed { source })),
            };
            remaining = &remaining[accepted..];
            trace!(
                channel = %self.channel_label(),
                bytes = accepted,
                remaining = remaining.len(),
                "ciphertext accepted"
            );

            if !self.engine.is_established()
                && self.drive_handshake()? == HandshakeStatus::WantIo
            {
                continue;
            }

            self.deliver_plaintext()?;
            match self.engine.last_signal().classify() {
                EngineStatus::WantIo => {
                    self.drain_outbound()?;
                }
                EngineStatus::Fatal => return Err(self.fail(SessionError::PeerClosed)),
                EngineStatus::Established => {}
            }
        }
        Ok(())
    }

    /// 循环解密并投递，直到引擎没有可读明文。
    fn deliver_plaintext(&mut self) -> Result<usize, SessionError> {
        let Self {
            engine,
            deliver,
            scratch,
            config,
            ..
        } = self;
        let chunk = &mut scratch[..config.read_chunk];
        let mut delivered = 0;
        let outcome = loop {
            match engine.decrypt(chunk) {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    let n = n.min(chunk.len());
                    deliver(&chunk[..n]);
                    delivered += n;
                }
                Err(source) => break Err(source),
            }
        };

        match outcome {
            Ok(()) => {
                if delivered > 0 {
                    trace!(channel = %self.channel_label(), bytes = delivered, "plaintext delivered");
                }
                Ok(delivered)
            }
            Err(source) => Err(self.fail(SessionError::RecordFailed { source })),
        }
    }
}
