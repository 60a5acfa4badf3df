//! 面向非阻塞传输的读写步骤。
//!
//! - `write_to_transport`：把 `outgoing_ciphertext` 头部至多 `max` 字节写往传输，只消费实际写出的部分；
//! - `read_from_transport`：读一次传输并交给解密泵；
//! - `WouldBlock`/`Interrupted` 不是错误，返回 [`IoProgress::WouldBlock`] 由事件循环等待下一次就绪；
//! - 写出 0 字节与读到 EOF 都升级为 [`SessionError::TransportFatal`]。

use std::io::{self, Read, Write};

use tracing::trace;

use super::Session;
use crate::{engine::TlsEngine, error::SessionError};

/// 一次传输读写的进展。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoProgress {
    Transferred(usize),
    WouldBlock,
}

fn is_retryable(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

impl<E: TlsEngine> Session<E> {
    /// 写出至多 `max` 字节待发送密文。队列为空时返回 `Transferred(0)`，不触碰传输。
    pub fn write_to_transport<W>(
        &mut self,
        transport: &mut W,
        max: usize,
    ) -> Result<IoProgress, SessionError>
    where
        W: Write + ?Sized,
    {
        let chunk = self.outgoing_ciphertext.front(max);
        if chunk.is_empty() {
            return Ok(IoProgress::Transferred(0));
        }

        match transport.write(chunk) {
            Ok(0) => Err(self.fail(SessionError::TransportFatal {
                source: io::Error::from(io::ErrorKind::WriteZero),
            })),
            Ok(n) => {
                let written = self.outgoing_ciphertext.consume(n);
                trace!(
                    channel = %self.channel_label(),
                    bytes = written,
                    pending = self.outgoing_ciphertext.len(),
                    "ciphertext written"
                );
                Ok(IoProgress::Transferred(written))
            }
            Err(error) if is_retryable(&error) => Ok(IoProgress::WouldBlock),
            Err(source) => Err(self.fail(SessionError::TransportFatal { source })),
        }
    }

    /// 从传输读一次（至多 `read_chunk` 字节）并送入解密泵。
    pub fn read_from_transport<R>(&mut self, transport: &mut R) -> Result<IoProgress, SessionError>
    where
        R: Read + ?Sized,
    {
        let mut chunk = std::mem::take(&mut self.transport_chunk);
        chunk.resize(self.config.read_chunk, 0);

        let progress = match transport.read(&mut chunk) {
            Ok(0) => Err(self.fail(SessionError::TransportFatal {
                source: io::Error::from(io::ErrorKind::UnexpectedEof),
            })),
            Ok(n) => {
                let n = n.min(chunk.len());
                self.on_ciphertext_received(&chunk[..n])
                    .map(|()| IoProgress::Transferred(n))
            }
            Err(error) if is_retryable(&error) => Ok(IoProgress::WouldBlock),
            Err(source) => Err(self.fail(SessionError::TransportFatal { source })),
        };

        self.transport_chunk = chunk;
        progress
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor, Write};

    use super::IoProgress;
    use crate::{
        engine::Role,
        error::SessionError,
        session::{ChannelId, Session},
        testing::{FaultPlan, MockContext, MockEngine},
    };

    struct Scripted {
        written: Vec<u8>,
        script: Vec<io::Result<usize>>,
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.script.pop() {
                Some(Ok(limit)) => {
                    let n = limit.min(buf.len());
                    self.written.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                Some(Err(error)) => Err(error),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn client_with_hello() -> Session<MockEngine> {
        let context = MockContext::new(FaultPlan::default());
        let mut client =
            Session::create(&context, ChannelId::new(30), Role::Client, |_: &[u8]| {})
                .expect("session");
        client.drive_handshake().expect("hello");
        client
    }

    #[test]
    fn partial_write_consumes_only_written_bytes() {
        let mut client = client_with_hello();
        let total = client.pending_ciphertext();
        let head = client.outgoing_ciphertext()[..5].to_vec();
        let mut transport = Scripted {
            written: Vec::new(),
            script: vec![Err(io::ErrorKind::WouldBlock.into()), Ok(5)],
        };

        assert_eq!(
            client.write_to_transport(&mut transport, 1024).expect("write"),
            IoProgress::Transferred(5)
        );
        assert_eq!(transport.written, head);
        assert_eq!(client.pending_ciphertext(), total - 5);
        assert_eq!(
            client.write_to_transport(&mut transport, 1024).expect("write"),
            IoProgress::WouldBlock
        );
        assert_eq!(client.pending_ciphertext(), total - 5);
    }

    #[test]
    fn max_bounds_a_single_write() {
        let mut client = client_with_hello();
        let mut sink = Vec::new();
        assert_eq!(
            client.write_to_transport(&mut sink, 2).expect("write"),
            IoProgress::Transferred(2)
        );
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn write_zero_is_fatal() {
        let mut client = client_with_hello();
        let mut transport = Scripted {
            written: Vec::new(),
            script: vec![Ok(0)],
        };
        let error = client
            .write_to_transport(&mut transport, 64)
            .expect_err("write zero");
        assert!(matches!(error, SessionError::TransportFatal { .. }));
    }

    #[test]
    fn eof_is_fatal() {
        let mut client = client_with_hello();
        let error = client
            .read_from_transport(&mut Cursor::new(Vec::new()))
            .expect_err("eof");
        assert_eq!(error.code(), "spark.tls.session.transport_fatal");
    }
}
