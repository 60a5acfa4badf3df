//! 会话收发队列使用的字节缓冲。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 会话在两个方向上各维护一条 FIFO 字节队列：待加密明文与待写出密文；
//! - 队列只需要尾部追加、头部消费与长度查询，头部消费必须是 O(1)，不能在每次写出后搬移剩余字节。
//!
//! ## 契约（What）
//! - 长度以 `usize` 表示，不存在负长度；消费量超过长度时按长度截断；
//! - 队列变空的那一刻释放底层存储，`capacity()` 回到 0，长连接空闲时不会占住峰值内存。
//!
//! ## 实现（How）
//! - 基于 `bytes::BytesMut`：`advance` 只移动读游标，追加时由 `BytesMut` 摊还扩容或回收头部空间；
//! - 变空时以新的空 `BytesMut` 替换旧值，旧存储随之释放。

use bytes::{Buf, Bytes, BytesMut};

/// 可增长、头部消费的字节队列。
#[derive(Debug, Default)]
pub struct ByteBuffer {
    inner: BytesMut,
}

impl ByteBuffer {
    /// 创建不持有任何存储的空队列。
    pub fn new() -> Self {
        Self::default()
    }

    /// 队列中待消费的字节数。
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// 当前持有的存储容量；空队列恒为 0。
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// 在尾部追加字节。空切片不触发分配。
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.inner.extend_from_slice(bytes);
    }

    /// 以连续切片形式查看全部待消费字节。
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// 查看头部至多 `max` 个字节，不消费。
    pub fn front(&self, max: usize) -> &[u8] {
        let end = max.min(self.inner.len());
        &self.inner[..end]
    }

    /// 从头部消费 `count` 个字节，返回实际消费量。
    ///
    /// - **契约 (What)**：`count` 大于长度时只消费现有字节；消费后若队列为空，立即释放存储。
    pub fn consume(&mut self, count: usize) -> usize {
        let consumed = count.min(self.inner.len());
        self.inner.advance(consumed);
        if self.inner.is_empty() {
            self.release();
        }
        consumed
    }

    /// 取走全部待消费字节并释放存储。
    pub fn take(&mut self) -> Bytes {
        std::mem::take(&mut self.inner).freeze()
    }

    /// 丢弃内容并释放存储；对空队列调用同样安全。
    pub fn release(&mut self) {
        self.inner = BytesMut::new();
    }
}
