//! 基于 `rustls` 的生产引擎与可热更的引擎上下文。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 会话泵只认 [`TlsEngine`]；本模块把 `rustls::Connection` 的非阻塞接口映射到该 trait：
//!   `read_tls` 充当入站导管、`write_tls` 充当出站导管、`reader`/`writer` 完成记录解密与加密；
//! - [`RustlsContext`] 以 `ArcSwapOption` 保存服务端/客户端配置，证书轮换时原子替换，
//!   已建立的会话继续持有旧配置快照，新会话读取最新配置。
//!
//! ## 契约（What）
//! - 引擎在 `allocate` 时确定角色；缺少对应角色的配置返回 [`EngineError::Unavailable`]；
//! - 出站导管的容量上限映射为 `set_buffer_limit`，达到上限时 `encrypt` 少消费或返回 0；
//! - 对端 close_notify 之后 `decrypt` 返回 0 且 `last_signal` 为 [`EngineSignal::Closed`]。
//!
//! ## 风险与权衡（Trade-offs）
//! - `rustls` 把入站密文缓存在内部反分帧器中，`write_inbound` 可能只接受部分字节，
//!   会话泵按实际接受量继续喂入剩余部分；
//! - `rustls` 不支持重新协商（TLS 1.3 的 KeyUpdate 与会话票据在内部处理），相关报文同样经出站导管排空。

use std::{
    fmt,
    io::{self, Read, Write},
    sync::Arc,
};

use arc_swap::ArcSwapOption;
use rustls::{
    ClientConfig, ClientConnection, Connection, ProtocolVersion, ServerConfig, ServerConnection,
    pki_types::ServerName,
};
use tracing::trace;

use crate::engine::{
    ConduitLimits, ConduitSide, EngineContext, EngineError, EngineSignal, Role, TlsEngine,
};

/// 客户端配置与对端名称，成对替换。
struct ClientEndpoint {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

struct Inner {
    server: ArcSwapOption<ServerConfig>,
    client: ArcSwapOption<ClientEndpoint>,
}

/// 可热更的 `rustls` 配置上下文。
///
/// - 克隆共享同一份存储，可在监听线程与证书管理任务之间分发；
/// - 读路径无锁：每次 `allocate` 读取一次当前快照。
#[derive(Clone)]
pub struct RustlsContext {
    inner: Arc<Inner>,
}

impl RustlsContext {
    /// 不含任何配置的上下文，随后通过 `replace_*` 装入。
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(Inner {
                server: ArcSwapOption::empty(),
                client: ArcSwapOption::empty(),
            }),
        }
    }

    pub fn server(config: Arc<ServerConfig>) -> Self {
        let context = Self::empty();
        context.replace_server_config(config);
        context
    }

    pub fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        let context = Self::empty();
        context.replace_client_config(config, server_name);
        context
    }

    /// 替换服务端配置，返回旧值。只影响此后创建的会话。
    pub fn replace_server_config(&self, next: Arc<ServerConfig>) -> Option<Arc<ServerConfig>> {
        self.inner.server.swap(Some(next))
    }

    /// 替换客户端配置与对端名称，返回旧配置。
    pub fn replace_client_config(
        &self,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Option<Arc<ClientConfig>> {
        self.inner
            .client
            .swap(Some(Arc::new(ClientEndpoint {
                config,
                server_name,
            })))
            .map(|previous| Arc::clone(&previous.config))
    }

    pub fn server_snapshot(&self) -> Option<Arc<ServerConfig>> {
        self.inner.server.load_full()
    }

    pub fn client_snapshot(&self) -> Option<Arc<ClientConfig>> {
        self.inner
            .client
            .load_full()
            .map(|endpoint| Arc::clone(&endpoint.config))
    }
}

impl fmt::Debug for RustlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsContext")
            .field("server", &self.inner.server.load().is_some())
            .field("client", &self.inner.client.load().is_some())
            .finish()
    }
}

impl EngineContext for RustlsContext {
    type Engine = RustlsEngine;

    fn allocate(&self, role: Role) -> Result<RustlsEngine, EngineError> {
        let connection: Connection = match role {
            Role::Server => {
                let config = self
                    .inner
                    .server
                    .load_full()
                    .ok_or(EngineError::Unavailable("no server configuration loaded"))?;
                ServerConnection::new(config)
                    .map_err(EngineError::protocol)?
                    .into()
            }
            Role::Client => {
                let endpoint = self
                    .inner
                    .client
                    .load_full()
                    .ok_or(EngineError::Unavailable("no client configuration loaded"))?;
                ClientConnection::new(
                    Arc::clone(&endpoint.config),
                    endpoint.server_name.clone(),
                )
                .map_err(EngineError::protocol)?
                .into()
            }
        };
        Ok(RustlsEngine::new(role, connection))
    }
}

/// 包装单条 `rustls::Connection` 的引擎。
pub struct RustlsEngine {
    role: Role,
    connection: Connection,
    /// 已经 `read_tls` 但尚未 `process_new_packets` 的入站密文。
    unprocessed: bool,
    peer_closed: bool,
    last: EngineSignal,
}

impl RustlsEngine {
    fn new(role: Role, connection: Connection) -> Self {
        Self {
            role,
            connection,
            unprocessed: false,
            peer_closed: false,
            last: EngineSignal::WantRead,
        }
    }

    /// 协商出的 ALPN 协议。
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.connection.alpn_protocol()
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.connection.protocol_version()
    }

    /// 服务端收到的 SNI。
    pub fn sni(&self) -> Option<&str> {
        match &self.connection {
            Connection::Server(server) => server.server_name(),
            Connection::Client(_) => None,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn process_pending(&mut self) -> Result<(), EngineError> {
        if !self.unprocessed {
            return Ok(());
        }
        self.unprocessed = false;
        let state = self
            .connection
            .process_new_packets()
            .map_err(EngineError::protocol)?;
        if state.peer_has_closed() {
            self.peer_closed = true;
        }
        trace!(
            plaintext = state.plaintext_bytes_to_read(),
            ciphertext = state.tls_bytes_to_write(),
            "rustls processed inbound records"
        );
        Ok(())
    }

    fn idle_signal(&self) -> EngineSignal {
        if self.connection.wants_write() {
            EngineSignal::WantWrite
        } else {
            EngineSignal::WantRead
        }
    }
}

impl fmt::Debug for RustlsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("role", &self.role)
            .field("handshaking", &self.connection.is_handshaking())
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

impl TlsEngine for RustlsEngine {
    fn role(&self) -> Role {
        self.role
    }

    fn open_conduit(
        &mut self,
        side: ConduitSide,
        limits: &ConduitLimits,
    ) -> Result<(), EngineError> {
        if side == ConduitSide::Outbound {
            self.connection.set_buffer_limit(limits.engine_buffer_limit);
        }
        Ok(())
    }

    fn handshake(&mut self) -> Result<EngineSignal, EngineError> {
        self.process_pending()?;
        let signal = if !self.connection.is_handshaking() {
            EngineSignal::Done
        } else if self.peer_closed {
            EngineSignal::Closed
        } else {
            self.idle_signal()
        };
        self.last = signal;
        Ok(signal)
    }

    fn is_established(&self) -> bool {
        !self.connection.is_handshaking()
    }

    fn write_inbound(&mut self, ciphertext: &[u8]) -> Result<usize, EngineError> {
        let mut reader = ciphertext;
        let accepted = match self.connection.read_tls(&mut reader) {
            Ok(n) => n,
            // 反分帧缓冲已满：先处理积压记录再重试一次。
            Err(_) if self.unprocessed => {
                self.process_pending()?;
                let mut reader = ciphertext;
                self.connection.read_tls(&mut reader)?
            }
            Err(error) => return Err(EngineError::Io(error)),
        };
        if accepted > 0 {
            self.unprocessed = true;
        }
        Ok(accepted)
    }

    fn read_outbound(&mut self, buf: &mut [u8]) -> Result<usize, EngineError> {
        if !self.connection.wants_write() {
            return Ok(0);
        }
        let mut writer: &mut [u8] = buf;
        Ok(self.connection.write_tls(&mut writer)?)
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<usize, EngineError> {
        let consumed = self.connection.writer().write(plaintext)?;
        self.last = if consumed < plaintext.len() {
            EngineSignal::WantWrite
        } else {
            EngineSignal::Done
        };
        Ok(consumed)
    }

    fn decrypt(&mut self, buf: &mut [u8]) -> Result<usize, EngineError> {
        loop {
            match self.connection.reader().read(buf) {
                Ok(0) => {
                    self.last = EngineSignal::Closed;
                    return Ok(0);
                }
                Ok(n) => {
                    self.last = EngineSignal::Done;
                    return Ok(n);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    if self.unprocessed {
                        self.process_pending()?;
                        continue;
                    }
                    self.last = self.idle_signal();
                    return Ok(0);
                }
                Err(error) => return Err(EngineError::Io(error)),
            }
        }
    }

    fn last_signal(&self) -> EngineSignal {
        self.last
    }

    fn close(&mut self) -> Result<(), EngineError> {
        self.connection.send_close_notify();
        Ok(())
    }
}
