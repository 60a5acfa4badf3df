#![doc = r#"
# spark-tls-session

## 设计动机（Why）
- **与套接字解耦**：事件循环持有连接与就绪通知，TLS 会话只搬运字节，不做任何阻塞 I/O；
- **可替换引擎**：握手密码学与记录加解密委托给 [`TlsEngine`]，生产使用 `rustls`，测试使用可注入故障的替身；
- **可运维性**：每个致命错误都带稳定错误码与 [`ErrorCategory`]，宿主据此拆除会话、记录安全事件或重连。

## 核心契约（What）
- [`Session`]：每条连接一个实例，提供三类入口：
  - 握手驱动 [`Session::drive_handshake`]：推进握手并把握手报文排空到待写密文队列；
  - 解密泵 [`Session::on_ciphertext_received`]：接收传输读到的密文，握手完成后按序投递明文；
  - 加密泵 [`Session::queue_plaintext`] + [`Session::pump_encrypt`]：排队明文并在握手完成后加密；
- 传输步骤 [`Session::write_to_transport`] / [`Session::read_from_transport`] 把 `WouldBlock` 与致命错误区分开；
- [`RustlsContext`]：可热更的 `rustls` 配置上下文，[`TlsSettings`] 从 TOML 装配它。

## 实现策略（How）
- 引擎的两条内存导管（入站、出站）在会话构造时打开，析构时随引擎释放；
- 待加密明文与待写出密文各用一条 [`ByteBuffer`]，头部消费 O(1)，变空即释放存储；
- 日志统一使用 `tracing`，字段包含 `channel`、`role`、`bytes` 与错误码 `code`。

## 风险与考量（Trade-offs）
- 会话不做并发保护：所有入口都要求 `&mut self`，同一会话由单个事件循环线程驱动；
- 队列不设上限，背压由 [`EncryptOutcome::Backpressure`] 与 `pending_*` 查询交给宿主决策；
- 客户端必须在创建后主动调用一次 [`Session::drive_handshake`]，否则握手不会开始。

```no_run
use spark_tls_session::{ChannelId, Role, Session, TlsSettings};

let settings = TlsSettings::from_toml_file("/etc/spark/tls.toml")?;
let context = settings.build_context()?;
let mut session = Session::create_with_config(
    &context,
    ChannelId::new(1),
    Role::Server,
    |plaintext: &[u8]| println!("received {} bytes", plaintext.len()),
    settings.session.clone(),
)?;
# let _ = &mut session;
# Ok::<(), Box<dyn std::error::Error>>(())
```
"#]

mod buffer;
mod engine;
mod error;
mod rustls_engine;
mod session;
mod settings;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use buffer::ByteBuffer;
pub use engine::{
    BoxError, ConduitLimits, ConduitSide, EngineContext, EngineError, EngineSignal, EngineStatus,
    Role, TlsEngine,
};
pub use error::{ErrorCategory, SecurityClass, SessionError};
pub use rustls_engine::{RustlsContext, RustlsEngine};
pub use session::{
    ChannelId, DeliveryCallback, EncryptOutcome, HandshakeStatus, IoProgress, Session,
};
pub use settings::{
    MIN_ENGINE_BUFFER_LIMIT, ProtocolFloor, SessionConfig, SettingsError, TlsSettings,
};
