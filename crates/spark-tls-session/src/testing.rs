//! 测试替身：可注入分段与故障的记录式引擎、资源追踪与投递日志。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 会话泵的边界条件（分段到达、导管拒收、背压、握手中途拆除）需要可控地复现，
//!   真实 TLS 引擎既无法注入故障，也无法精确控制记录切分；
//! - 替身引擎使用极简的记录帧格式，握手只交换一次 hello，应用数据以异或“加密”，
//!   足以让会话的搬运与状态逻辑完整运转。
//!
//! ## 帧格式（What）
//! - `[kind: u8][len: u16 大端][payload]`；`kind` 取 [`HANDSHAKE`]、[`APPLICATION`]、[`ALERT`]；
//! - 客户端首次 `handshake` 写出长度为 `hello_len` 的 hello；服务端收到完整 hello 后回写自己的 hello 并建立；
//! - 单个应用记录的载荷不超过 `max_record`，`decrypt` 每次至多返回一个记录的明文；
//! - 建立后收到的握手记录视为对端发起重新协商：服务端回写 hello 并报告 `WantWrite`。
//!
//! ## 风险与权衡（Trade-offs）
//! - 仅在 `cfg(test)` 或 `test-util` 特性下编译，不进入生产构建。

use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::engine::{
    ConduitLimits, ConduitSide, EngineContext, EngineError, EngineSignal, Role, TlsEngine,
};

pub const HANDSHAKE: u8 = 0x16;
pub const APPLICATION: u8 = 0x17;
pub const ALERT: u8 = 0x15;
pub const RECORD_HEADER_LEN: usize = 3;

const XOR_KEY: u8 = 0x5a;
const SERVER_HELLO_LEN: usize = 24;

/// 故障注入计划。
#[derive(Clone, Debug)]
pub struct FaultPlan {
    /// `allocate` 直接失败。
    pub fail_engine_allocation: bool,
    /// 打开指定方向的导管时失败。
    pub fail_conduit: Option<ConduitSide>,
    /// 客户端 hello 的载荷长度。
    pub hello_len: usize,
    /// 单个应用记录的最大载荷。
    pub max_record: usize,
    /// 每次 `write_inbound` 至多接受的字节数。
    pub inbound_accept_limit: Option<usize>,
    /// 累计接受这么多字节后，`write_inbound` 一律返回 0。
    pub reject_inbound_after: Option<usize>,
    /// 每次 `encrypt` 至多消费的字节数。
    pub encrypt_accept_limit: Option<usize>,
    /// `encrypt` 累计可消费的字节预算，耗尽后返回 0。
    pub encrypt_budget: Option<usize>,
    /// 出站导管非空时 `read_outbound` 返回错误。
    pub fail_outbound_drain: bool,
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self {
            fail_engine_allocation: false,
            fail_conduit: None,
            hello_len: 32,
            max_record: 16,
            inbound_accept_limit: None,
            reject_inbound_after: None,
            encrypt_accept_limit: None,
            encrypt_budget: None,
            fail_outbound_drain: false,
        }
    }
}

/// 存活资源与调用次数计数器，克隆后共享同一组计数。
#[derive(Clone, Debug, Default)]
pub struct AllocationTracker {
    engines: Arc<AtomicUsize>,
    conduits: Arc<AtomicUsize>,
    encrypt_calls: Arc<AtomicUsize>,
    decrypt_calls: Arc<AtomicUsize>,
}

impl AllocationTracker {
    pub fn live_engines(&self) -> usize {
        self.engines.load(Ordering::SeqCst)
    }

    pub fn live_conduits(&self) -> usize {
        self.conduits.load(Ordering::SeqCst)
    }

    pub fn encrypt_calls(&self) -> usize {
        self.encrypt_calls.load(Ordering::SeqCst)
    }

    pub fn decrypt_calls(&self) -> usize {
        self.decrypt_calls.load(Ordering::SeqCst)
    }
}

/// 存活期间计数加一，析构时减一。
#[derive(Debug)]
struct Allocation(Arc<AtomicUsize>);

impl Allocation {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Conduit {
    bytes: VecDeque<u8>,
    _allocation: Allocation,
}

/// 替身引擎的共享上下文。
#[derive(Debug, Default)]
pub struct MockContext {
    plan: FaultPlan,
    tracker: AllocationTracker,
}

impl MockContext {
    pub fn new(plan: FaultPlan) -> Self {
        Self {
            plan,
            tracker: AllocationTracker::default(),
        }
    }

    pub fn tracker(&self) -> &AllocationTracker {
        &self.tracker
    }

    pub fn plan(&self) -> &FaultPlan {
        &self.plan
    }
}

impl EngineContext for MockContext {
    type Engine = MockEngine;

    fn allocate(&self, role: Role) -> Result<MockEngine, EngineError> {
        if self.plan.fail_engine_allocation {
            return Err(EngineError::fault("injected engine allocation failure"));
        }
        Ok(MockEngine {
            role,
            plan: self.plan.clone(),
            tracker: self.tracker.clone(),
            _allocation: Allocation::new(&self.tracker.engines),
            inbound: None,
            outbound: None,
            phase: Phase::Start,
            accepted_inbound: 0,
            encrypt_budget: self.plan.encrypt_budget,
            stash: VecDeque::new(),
            renegotiations: 0,
            last: EngineSignal::WantRead,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Start,
    HelloSent,
    Established,
}

/// 记录式替身引擎。
#[derive(Debug)]
pub struct MockEngine {
    role: Role,
    plan: FaultPlan,
    tracker: AllocationTracker,
    _allocation: Allocation,
    inbound: Option<Conduit>,
    outbound: Option<Conduit>,
    phase: Phase,
    accepted_inbound: usize,
    encrypt_budget: Option<usize>,
    stash: VecDeque<u8>,
    renegotiations: usize,
    last: EngineSignal,
}

impl MockEngine {
    /// 已响应的重新协商次数。
    pub fn renegotiations(&self) -> usize {
        self.renegotiations
    }

    /// 追加加密预算，解除 `encrypt_budget` 造成的背压。
    pub fn grant_encrypt_budget(&mut self, bytes: usize) {
        if let Some(budget) = self.encrypt_budget.as_mut() {
            *budget += bytes;
        }
    }
}

impl TlsEngine for MockEngine {
    fn role(&self) -> Role {
        self.role
    }

    fn open_conduit(
        &mut self,
        side: ConduitSide,
        _limits: &ConduitLimits,
    ) -> Result<(), EngineError> {
        if self.plan.fail_conduit == Some(side) {
            return Err(EngineError::Io(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "injected conduit allocation failure",
            )));
        }
        let conduit = Conduit {
            bytes: VecDeque::new(),
            _allocation: Allocation::new(&self.tracker.conduits),
        };
        match side {
            ConduitSide::Inbound => self.inbound = Some(conduit),
            ConduitSide::Outbound => self.outbound = Some(conduit),
        }
        Ok(())
    }

    fn handshake(&mut self) -> Result<EngineSignal, EngineError> {
        let role = self.role;
        let phase = self.phase;
        let hello_len = self.plan.hello_len;
        let (inbound, outbound) = open_pair(&mut self.inbound, &mut self.outbound)?;

        let next = match phase {
            Phase::Established => Phase::Established,
            Phase::Start if role == Role::Client => {
                push_record(&mut outbound.bytes, HANDSHAKE, &hello_payload(hello_len));
                Phase::HelloSent
            }
            _ => match take_record(&mut inbound.bytes) {
                None => phase,
                Some((ALERT, _)) => {
                    self.last = EngineSignal::Closed;
                    return Ok(EngineSignal::Closed);
                }
                Some((HANDSHAKE, payload)) if role == Role::Server => {
                    if payload != hello_payload(hello_len) {
                        return Err(EngineError::protocol("malformed client hello"));
                    }
                    push_record(
                        &mut outbound.bytes,
                        HANDSHAKE,
                        &hello_payload(SERVER_HELLO_LEN),
                    );
                    Phase::Established
                }
                Some((HANDSHAKE, _)) if phase == Phase::HelloSent => Phase::Established,
                Some(_) => return Err(EngineError::protocol("unexpected record during handshake")),
            },
        };

        let signal = if next == Phase::Established {
            EngineSignal::Done
        } else {
            idle_signal(outbound)
        };
        self.phase = next;
        self.last = signal;
        Ok(signal)
    }

    fn is_established(&self) -> bool {
        self.phase == Phase::Established
    }

    fn write_inbound(&mut self, ciphertext: &[u8]) -> Result<usize, EngineError> {
        let mut accept = ciphertext.len();
        if let Some(limit) = self.plan.inbound_accept_limit {
            accept = accept.min(limit);
        }
        if let Some(limit) = self.plan.reject_inbound_after {
            accept = accept.min(limit.saturating_sub(self.accepted_inbound));
        }
        let inbound = self
            .inbound
            .as_mut()
            .ok_or_else(|| EngineError::fault("inbound conduit is not open"))?;
        inbound.bytes.extend(&ciphertext[..accept]);
        self.accepted_inbound += accept;
        Ok(accept)
    }

    fn read_outbound(&mut self, buf: &mut [u8]) -> Result<usize, EngineError> {
        let fail = self.plan.fail_outbound_drain;
        let outbound = self
            .outbound
            .as_mut()
            .ok_or_else(|| EngineError::fault("outbound conduit is not open"))?;
        if fail && !outbound.bytes.is_empty() {
            return Err(EngineError::Io(io::Error::other("injected drain failure")));
        }
        let n = buf.len().min(outbound.bytes.len());
        for (slot, byte) in buf.iter_mut().zip(outbound.bytes.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<usize, EngineError> {
        self.tracker.encrypt_calls.fetch_add(1, Ordering::SeqCst);
        if self.phase != Phase::Established {
            return Err(EngineError::fault("encrypt before handshake"));
        }
        let mut accept = plaintext.len();
        if let Some(limit) = self.plan.encrypt_accept_limit {
            accept = accept.min(limit);
        }
        if let Some(budget) = self.encrypt_budget {
            accept = accept.min(budget);
        }
        let max_record = self.plan.max_record.max(1);
        let (_, outbound) = open_pair(&mut self.inbound, &mut self.outbound)?;
        for chunk in plaintext[..accept].chunks(max_record) {
            push_record(&mut outbound.bytes, APPLICATION, &xor(chunk));
        }
        if let Some(budget) = self.encrypt_budget.as_mut() {
            *budget -= accept;
        }
        self.last = if accept == 0 {
            EngineSignal::WantWrite
        } else {
            EngineSignal::Done
        };
        Ok(accept)
    }

    fn decrypt(&mut self, buf: &mut [u8]) -> Result<usize, EngineError> {
        self.tracker.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        if !self.stash.is_empty() {
            self.last = EngineSignal::Done;
            return Ok(serve(&mut self.stash, buf));
        }

        let (inbound, outbound) = open_pair(&mut self.inbound, &mut self.outbound)?;
        loop {
            match take_record(&mut inbound.bytes) {
                None => break,
                Some((APPLICATION, payload)) => {
                    if payload.is_empty() {
                        continue;
                    }
                    self.stash.extend(xor(&payload));
                    self.last = EngineSignal::Done;
                    return Ok(serve(&mut self.stash, buf));
                }
                Some((HANDSHAKE, _)) => {
                    if self.role == Role::Server {
                        push_record(
                            &mut outbound.bytes,
                            HANDSHAKE,
                            &hello_payload(SERVER_HELLO_LEN),
                        );
                    }
                    self.renegotiations += 1;
                }
                Some((ALERT, _)) => {
                    self.last = EngineSignal::Closed;
                    return Ok(0);
                }
                Some((kind, _)) => {
                    return Err(EngineError::protocol(format!(
                        "unknown record type {kind:#04x}"
                    )));
                }
            }
        }
        self.last = idle_signal(outbound);
        Ok(0)
    }

    fn last_signal(&self) -> EngineSignal {
        self.last
    }

    fn close(&mut self) -> Result<(), EngineError> {
        let (_, outbound) = open_pair(&mut self.inbound, &mut self.outbound)?;
        push_record(&mut outbound.bytes, ALERT, &[0]);
        Ok(())
    }
}

fn open_pair<'a>(
    inbound: &'a mut Option<Conduit>,
    outbound: &'a mut Option<Conduit>,
) -> Result<(&'a mut Conduit, &'a mut Conduit), EngineError> {
    match (inbound.as_mut(), outbound.as_mut()) {
        (Some(inbound), Some(outbound)) => Ok((inbound, outbound)),
        _ => Err(EngineError::fault("conduits are not open")),
    }
}

fn idle_signal(outbound: &Conduit) -> EngineSignal {
    if outbound.bytes.is_empty() {
        EngineSignal::WantRead
    } else {
        EngineSignal::WantWrite
    }
}

fn hello_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn xor(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|byte| byte ^ XOR_KEY).collect()
}

fn push_record(out: &mut VecDeque<u8>, kind: u8, payload: &[u8]) {
    let len = u16::try_from(payload.len()).unwrap_or(u16::MAX);
    out.push_back(kind);
    out.extend(len.to_be_bytes());
    out.extend(&payload[..usize::from(len)]);
}

fn take_record(inbound: &mut VecDeque<u8>) -> Option<(u8, Vec<u8>)> {
    if inbound.len() < RECORD_HEADER_LEN {
        return None;
    }
    let len = usize::from(u16::from_be_bytes([inbound[1], inbound[2]]));
    if inbound.len() < RECORD_HEADER_LEN + len {
        return None;
    }
    let kind = inbound[0];
    inbound.drain(..RECORD_HEADER_LEN);
    Some((kind, inbound.drain(..len).collect()))
}

fn serve(stash: &mut VecDeque<u8>, buf: &mut [u8]) -> usize {
    let n = buf.len().min(stash.len());
    for (slot, byte) in buf.iter_mut().zip(stash.drain(..n)) {
        *slot = byte;
    }
    n
}

fn record(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = VecDeque::new();
    push_record(&mut out, kind, payload);
    out.into()
}

/// 按 `plan` 构造客户端 hello 记录，供直接喂给服务端会话。
pub fn client_hello(plan: &FaultPlan) -> Vec<u8> {
    record(HANDSHAKE, &hello_payload(plan.hello_len))
}

/// 构造载荷长度为 `len` 的握手记录。
pub fn handshake_record(len: usize) -> Vec<u8> {
    record(HANDSHAKE, &hello_payload(len))
}

/// 构造一条应用数据记录。
pub fn application_record(plaintext: &[u8]) -> Vec<u8> {
    record(APPLICATION, &xor(plaintext))
}

/// 构造 close_notify 告警记录。
pub fn alert_record() -> Vec<u8> {
    record(ALERT, &[0])
}

/// 收集投递回调收到的每段明文。
#[derive(Clone, Debug, Default)]
pub struct DeliveryLog {
    chunks: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl DeliveryLog {
    /// 生成写入本日志的投递回调。
    pub fn callback(&self) -> impl FnMut(&[u8]) + Send + 'static {
        let chunks = Arc::clone(&self.chunks);
        move |chunk: &[u8]| {
            chunks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(chunk.to_vec());
        }
    }

    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 全部投递内容按顺序拼接。
    pub fn concatenated(&self) -> Vec<u8> {
        self.chunks().concat()
    }
}
