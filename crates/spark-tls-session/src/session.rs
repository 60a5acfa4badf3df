//! # 会话（Session）生命周期
//!
//! ## 核心意图（Why）
//! - 一个 `Session` 对应一条传输连接：独占一个 TLS 引擎、两条出站队列与一个明文投递回调；
//! - 会话本身不触碰套接字，事件循环把“可读到的密文”和“应用要发的明文”喂进来，
//!   再从 `outgoing_ciphertext` 取走待写出的密文。
//!
//! ## 结构（How）
//! - 本文件负责构造、销毁、明文排队与状态查询；
//! - [`handshake`] 为握手驱动，[`decrypt`] 为解密泵，[`encrypt`] 为加密泵，
//!   [`transport`] 为面向非阻塞传输的读写步骤。
//!
//! ## 契约（What）
//! - 构造只在引擎与两条导管全部就绪后才赋予 `channel`，任何中途失败都释放已分配资源并返回错误；
//! - 销毁（显式 [`Session::destroy`] 或 `Drop`）无条件释放引擎与全部缓冲，对已清空的缓冲同样安全；
//! - 所有操作都要求 `&mut self`，同一会话的访问天然被串行化。

mod decrypt;
mod encrypt;
mod handshake;
mod transport;

use std::fmt;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::{
    buffer::ByteBuffer,
    engine::{ConduitSide, EngineContext, Role, TlsEngine},
    error::SessionError,
    settings::SessionConfig,
};

pub use encrypt::EncryptOutcome;
pub use handshake::HandshakeStatus;
pub use transport::IoProgress;

/// 明文投递回调。回调只在调用期间借用数据块。
pub type DeliveryCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// 传输连接的不透明标识。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ChannelId(u64);

impl ChannelId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for ChannelId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 单条连接上的 TLS 会话。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把握手推进、记录加解密与缓冲管理收拢到一个对象里，事件循环只需在“可读”“应用写”“可写”
///   三个时机调用对应方法；
/// - 引擎以泛型参数注入：生产使用 [`crate::RustlsEngine`]，测试使用替身引擎。
///
/// ## 契约（What）
/// - `channel`：构造成功后为 `Some`，销毁时清空；`None` 是有效性哨兵；
/// - `outgoing_plaintext`：应用经 [`Session::queue_plaintext`] 写入，由加密泵消费；
/// - `outgoing_ciphertext`：握手驱动、加密泵与解密泵写入，由传输写步骤消费；
/// - `deliver`：握手建立后，每段解密明文按顺序同步回调一次。
///
/// ## 风险与权衡（Trade-offs）
/// - 两条队列不设上限；需要有界内存的宿主应在调用 `queue_plaintext` 前依据
///   [`Session::pending_plaintext`]/[`Session::pending_ciphertext`] 自行施加高水位策略。
pub struct Session<E: TlsEngine> {
    channel: Option<ChannelId>,
    role: Role,
    engine: E,
    outgoing_plaintext: ByteBuffer,
    outgoing_ciphertext: ByteBuffer,
    deliver: DeliveryCallback,
    config: SessionConfig,
    scratch: Vec<u8>,
    transport_chunk: Vec<u8>,
}

impl<E: TlsEngine> Session<E> {
    /// 以默认 [`SessionConfig`] 创建会话。
    pub fn create<C>(
        context: &C,
        channel: ChannelId,
        role: Role,
        deliver: impl FnMut(&[u8]) + Send + 'static,
    ) -> Result<Self, SessionError>
    where
        C: EngineContext<Engine = E>,
    {
        Self::create_with_config(context, channel, role, deliver, SessionConfig::default())
    }

    /// 创建会话。
    ///
    /// # 教案级注释
    ///
    /// ## 执行步骤（How）
    /// 1. 基于 `context` 为 `role` 分配引擎，失败返回 [`SessionError::EngineAllocation`]；
    /// 2. 依次打开入站、出站导管，任一失败返回 [`SessionError::ConduitAllocation`]，
    ///    引擎连同已打开的导管在返回时一并释放；
    /// 3. 全部成功后才写入 `channel`，使会话成为有效状态。
    ///
    /// ## 契约（What）
    /// - `Role::Client` 的会话需要宿主随后调用一次 [`Session::drive_handshake`] 以产出首个握手报文；
    /// - `Role::Server` 的会话等待对端首个握手报文经 [`Session::on_ciphertext_received`] 到达。
    pub fn create_with_config<C>(
        context: &C,
        channel: ChannelId,
        role: Role,
        deliver: impl FnMut(&[u8]) + Send + 'static,
        config: SessionConfig,
    ) -> Result<Self, SessionError>
    where
        C: EngineContext<Engine = E>,
    {
        let config = config.normalized();
        let mut engine = context.allocate(role).map_err(|source| {
            let error = SessionError::EngineAllocation { source };
            warn!(channel = %channel, role = ?role, code = error.code(), error = %error, "tls session rejected");
            error
        })?;

        let limits = config.conduit_limits();
        for side in [ConduitSide::Inbound, ConduitSide::Outbound] {
            if let Err(source) = engine.open_conduit(side, &limits) {
                let error = SessionError::ConduitAllocation { side, source };
                warn!(channel = %channel, role = ?role, code = error.code(), error = %error, "tls session rejected");
                return Err(error);
            }
        }

        let scratch = vec![0; config.scratch_len()];
        debug!(channel = %channel, role = ?role, "tls session created");
        Ok(Self {
            channel: Some(channel),
            role,
            engine,
            outgoing_plaintext: ByteBuffer::new(),
            outgoing_ciphertext: ByteBuffer::new(),
            deliver: Box::new(deliver),
            config,
            scratch,
            transport_chunk: Vec::new(),
        })
    }

    /// 销毁会话，释放引擎与全部缓冲。
    pub fn destroy(self) {
        drop(self);
    }

    /// 追加待加密明文。握手未完成时同样接受，不与引擎交互。
    pub fn queue_plaintext(&mut self, bytes: &[u8]) {
        self.outgoing_plaintext.append(bytes);
        trace!(
            channel = %self.channel_label(),
            bytes = bytes.len(),
            pending = self.outgoing_plaintext.len(),
            "plaintext queued"
        );
    }

    /// 请求有序关闭：引擎排队 close_notify，随即排空到 `outgoing_ciphertext`。
    pub fn close(&mut self) -> Result<(), SessionError> {
        if let Err(source) = self.engine.close() {
            return Err(self.fail(SessionError::RecordFailed { source }));
        }
        self.drain_outbound()?;
        debug!(channel = %self.channel_label(), "close_notify queued");
        Ok(())
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    /// 会话是否有效（已完整构造且未拆除）。
    pub fn is_valid(&self) -> bool {
        self.channel.is_some()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// 握手是否已经建立。
    pub fn is_established(&self) -> bool {
        self.engine.is_established()
    }

    /// 是否有密文等待写往传输。
    pub fn wants_write(&self) -> bool {
        !self.outgoing_ciphertext.is_empty()
    }

    pub fn pending_plaintext(&self) -> usize {
        self.outgoing_plaintext.len()
    }

    pub fn pending_ciphertext(&self) -> usize {
        self.outgoing_ciphertext.len()
    }

    /// 查看待写出的密文，不消费。
    pub fn outgoing_ciphertext(&self) -> &[u8] {
        self.outgoing_ciphertext.as_slice()
    }

    /// 取走全部待写出的密文，适用于自行管理写缓冲的宿主。
    pub fn take_ciphertext(&mut self) -> Bytes {
        self.outgoing_ciphertext.take()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// 记录致命错误并原样返回，供各泵在 `return Err(..)` 处使用。
    fn fail(&self, error: SessionError) -> SessionError {
        warn!(
            channel = %self.channel_label(),
            role = ?self.role,
            code = error.code(),
            category = ?error.category(),
            error = %error,
            "tls session fault"
        );
        error
    }

    fn channel_label(&self) -> ChannelLabel {
        ChannelLabel(self.channel)
    }

    fn teardown(&mut self) {
        if let Some(channel) = self.channel.take() {
            debug!(
                channel = %channel,
                pending_plaintext = self.outgoing_plaintext.len(),
                pending_ciphertext = self.outgoing_ciphertext.len(),
                "tls session destroyed"
            );
        }
        self.outgoing_plaintext.release();
        self.outgoing_ciphertext.release();
        self.scratch = Vec::new();
        self.transport_chunk = Vec::new();
    }
}

impl<E: TlsEngine> Drop for Session<E> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<E: TlsEngine> fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("channel", &self.channel)
            .field("role", &self.role)
            .field("established", &self.engine.is_established())
            .field("pending_plaintext", &self.outgoing_plaintext.len())
            .field("pending_ciphertext", &self.outgoing_ciphertext.len())
            .finish_non_exhaustive()
    }
}

struct ChannelLabel(Option<ChannelId>);

impl fmt::Display for ChannelLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(channel) => write!(f, "{channel}"),
            None => f.write_str("-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::{ChannelId, Session};
    use crate::{
        engine::{ConduitSide, Role},
        error::SessionError,
        testing::{AllocationTracker, DeliveryLog, FaultPlan, MockContext},
    };

    fn context(plan: FaultPlan) -> (MockContext, AllocationTracker) {
        let context = MockContext::new(plan);
        let tracker = context.tracker().clone();
        (context, tracker)
    }

    #[test]
    fn create_assigns_channel_only_on_success() {
        let (context, tracker) = context(FaultPlan::default());
        let session =
            Session::create(&context, ChannelId::new(7), Role::Server, |_: &[u8]| {})
                .expect("session");
        assert_eq!(session.channel(), Some(ChannelId::new(7)));
        assert!(session.is_valid());
        assert!(!session.is_established());
        assert_eq!(tracker.live_engines(), 1);
        assert_eq!(tracker.live_conduits(), 2);
        session.destroy();
        assert_eq!(tracker.live_engines(), 0);
        assert_eq!(tracker.live_conduits(), 0);
    }

    #[test]
    fn engine_allocation_failure_allocates_nothing() {
        let (context, tracker) = context(FaultPlan {
            fail_engine_allocation: true,
            ..FaultPlan::default()
        });
        let error = Session::create(&context, ChannelId::new(1), Role::Client, |_: &[u8]| {})
            .expect_err("allocation must fail");
        assert!(matches!(error, SessionError::EngineAllocation { .. }));
        assert_eq!(tracker.live_engines(), 0);
        assert_eq!(tracker.live_conduits(), 0);
    }

    #[test]
    fn conduit_failure_releases_engine_and_prior_conduit() {
        for side in [ConduitSide::Inbound, ConduitSide::Outbound] {
            let (context, tracker) = context(FaultPlan {
                fail_conduit: Some(side),
                ..FaultPlan::default()
            });
            let error =
                Session::create(&context, ChannelId::new(2), Role::Server, |_: &[u8]| {})
                    .expect_err("conduit must fail");
            match error {
                SessionError::ConduitAllocation { side: failed, .. } => assert_eq!(failed, side),
                other => panic!("unexpected error: {other}"),
            }
            assert_eq!(tracker.live_engines(), 0);
            assert_eq!(tracker.live_conduits(), 0);
        }
    }

    #[test]
    fn queued_plaintext_waits_for_handshake() {
        let (context, tracker) = context(FaultPlan::default());
        let mut client =
            Session::create(&context, ChannelId::new(3), Role::Client, |_: &[u8]| {})
                .expect("session");
        client.queue_plaintext(b"hello");
        assert_eq!(client.pending_plaintext(), 5);
        assert!(!client.wants_write());
        assert_eq!(tracker.encrypt_calls(), 0);
    }

    #[test]
    fn drop_mid_handshake_releases_everything() {
        let (context, tracker) = context(FaultPlan::default());
        let log = DeliveryLog::default();
        let mut client =
            Session::create(&context, ChannelId::new(4), Role::Client, log.callback())
                .expect("session");
        client.drive_handshake().expect("client hello");
        client.queue_plaintext(b"unsent");
        assert!(client.wants_write());
        drop(client);
        assert_eq!(tracker.live_engines(), 0);
        assert_eq!(tracker.live_conduits(), 0);
        assert!(log.chunks().is_empty());
    }

    #[traced_test]
    #[test]
    fn lifecycle_is_logged() {
        let (context, _tracker) = context(FaultPlan::default());
        let session =
            Session::create(&context, ChannelId::new(9), Role::Server, |_: &[u8]| {})
                .expect("session");
        session.destroy();
        assert!(logs_contain("tls session created"));
        assert!(logs_contain("tls session destroyed"));
    }
}
