//! 测试桩集合：可记录的总线、上层回调与目标事件，以及构造接收帧的辅助函数。
//!
//! # 设计定位（Why）
//! - 单元测试、集成测试、基准与 loom 模型都需要一条“假总线”；集中在此处，接口调整时只有一处需要跟进；
//! - 桩对象记录调用顺序与线程，测试据此断言 FIFO、单排空者等并发性质。
//!
//! # 使用方式（How）
//! - [`RecordingBus`] 默认同步接受所有发送；`fail_next_sends` 注入失败，`block_next_send` 让下一次发送停在闸门处；
//! - `attach` 之后可开启 `auto_complete`（发送成功即回调完成）与 `respond_to_connect`（模拟目标应答连接请求）；
//! - 帧构造函数（`ready_frame`、`credit_report_frame` 等）生成可直接喂给 `rx_completion_handler` 的字节。
//!
//! # 风险与权衡（Trade-offs）
//! - 模块对外公开，仅供测试与示例使用；生产代码不应依赖这些类型。
//! - 自动完成在总线 `send` 内同步回调传输层，掩盖了真实总线的异步时序；需要覆盖乱序完成时应关闭它并手动回调。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Weak};
use std::thread::{self, ThreadId};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::bus::{BusTransfer, BusType, Frame, HifBus, PipeMapping};
use crate::error::{BusError, HtcError};
use crate::ids::{EndpointId, PipeId, ServiceId};
use crate::packet::{HtcPacket, PacketQueue, PacketStatus};
use crate::sink::{EndpointSink, SendFullAction, TargetEvents};
use crate::transport::HtcTransport;
use crate::wire::control::{
    ConnectServiceMessage, ConnectServiceResponseMessage, ControlMessage, ReadyExtension,
    ReadyMessage, ServiceStatus,
};
use crate::wire::trailer::{CreditReport, TrailerRecord, encode_trailer};
use crate::wire::{FLAG_RECV_TRAILER, FrameHeader};

/// 总线收到的一次传输及其提交线程。
#[derive(Debug, Clone)]
pub struct RecordedTransfer {
    pub transfer: BusTransfer,
    pub thread: ThreadId,
}

impl RecordedTransfer {
    /// 传输的完整线上字节。
    pub fn bytes(&self) -> Bytes {
        self.transfer.frame.to_bytes()
    }
}

type ConnectResponder =
    Arc<dyn Fn(&ConnectServiceMessage) -> Option<ConnectServiceResponseMessage> + Send + Sync>;

#[derive(Default)]
struct BusState {
    transfers: Vec<RecordedTransfer>,
    failures: VecDeque<BusError>,
    free_slots: usize,
    pipes: Vec<(ServiceId, PipeMapping)>,
    responder: Option<ConnectResponder>,
    gate: Option<SendGate>,
}

/// 阻塞一次总线发送的闸门。
///
/// 测试线程先 [`SendGate::wait_entered`] 确认发送方已停在总线内部，再 [`SendGate::release`] 放行。
#[derive(Clone)]
pub struct SendGate {
    entered: Arc<Barrier>,
    release: Arc<Barrier>,
}

impl SendGate {
    fn new() -> Self {
        Self {
            entered: Arc::new(Barrier::new(2)),
            release: Arc::new(Barrier::new(2)),
        }
    }

    pub fn wait_entered(&self) {
        self.entered.wait();
    }

    pub fn release(&self) {
        self.release.wait();
    }

    fn pass(&self) {
        self.entered.wait();
        self.release.wait();
    }
}

/// 记录型总线。
pub struct RecordingBus {
    bus_type: BusType,
    reassembly: bool,
    state: Mutex<BusState>,
    transport: Mutex<Weak<HtcTransport>>,
    auto_complete: AtomicBool,
    pm_suspended: AtomicBool,
    pm_gets: AtomicUsize,
    pm_puts: AtomicUsize,
    complete_checks: AtomicUsize,
}

impl RecordingBus {
    pub fn new(bus_type: BusType) -> Self {
        Self {
            bus_type,
            reassembly: false,
            state: Mutex::new(BusState {
                free_slots: usize::MAX,
                ..BusState::default()
            }),
            transport: Mutex::new(Weak::new()),
            auto_complete: AtomicBool::new(false),
            pm_suspended: AtomicBool::new(false),
            pm_gets: AtomicUsize::new(0),
            pm_puts: AtomicUsize::new(0),
            complete_checks: AtomicUsize::new(0),
        }
    }

    pub fn sdio() -> Self {
        Self::new(BusType::Sdio)
    }

    pub fn usb() -> Self {
        Self::new(BusType::Usb)
    }

    pub fn pcie() -> Self {
        Self::new(BusType::Pcie)
    }

    /// 声明总线支持接收分段重组。
    pub fn with_rx_reassembly(mut self) -> Self {
        self.reassembly = true;
        self
    }

    /// 为服务指定管道映射；未指定的服务映射到默认管道 0。
    pub fn with_pipe(self, service: ServiceId, mapping: PipeMapping) -> Self {
        self.state.lock().pipes.push((service, mapping));
        self
    }

    /// 让完成回调与连接应答能找到传输实例。
    pub fn attach(&self, transport: &Arc<HtcTransport>) {
        *self.transport.lock() = Arc::downgrade(transport);
    }

    /// 发送成功后立即回调 `tx_completion_handler`。
    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::SeqCst);
    }

    /// 模拟目标对 `CONNECT_SERVICE` 的应答；闭包返回 `None` 表示目标不回应。
    pub fn respond_to_connect<F>(&self, responder: F)
    where
        F: Fn(&ConnectServiceMessage) -> Option<ConnectServiceResponseMessage> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Arc::new(responder));
    }

    /// 接下来的发送按顺序返回这些错误。
    pub fn fail_next_sends(&self, errors: impl IntoIterator<Item = BusError>) {
        self.state.lock().failures.extend(errors);
    }

    /// 上行管道剩余的发送槽位；默认不限。
    pub fn set_free_slots(&self, slots: usize) {
        self.state.lock().free_slots = slots;
    }

    /// 总线处于挂起恢复中，电源引用获取失败。
    pub fn set_pm_suspended(&self, suspended: bool) {
        self.pm_suspended.store(suspended, Ordering::SeqCst);
    }

    /// 下一次发送在总线内部阻塞，直到测试放行。
    pub fn block_next_send(&self) -> SendGate {
        let gate = SendGate::new();
        self.state.lock().gate = Some(gate.clone());
        gate
    }

    pub fn transfers(&self) -> Vec<RecordedTransfer> {
        self.state.lock().transfers.clone()
    }

    /// 某端点的传输（不含控制端点时传入对应编号即可筛掉握手消息）。
    pub fn transfers_for(&self, endpoint: EndpointId) -> Vec<RecordedTransfer> {
        self.state
            .lock()
            .transfers
            .iter()
            .filter(|record| record.transfer.endpoint == endpoint)
            .cloned()
            .collect()
    }

    pub fn pm_gets(&self) -> usize {
        self.pm_gets.load(Ordering::SeqCst)
    }

    pub fn pm_puts(&self) -> usize {
        self.pm_puts.load(Ordering::SeqCst)
    }

    pub fn complete_checks(&self) -> usize {
        self.complete_checks.load(Ordering::SeqCst)
    }

    fn answer_connect(&self, transfer: &BusTransfer) -> Option<Bytes> {
        if transfer.endpoint != EndpointId::CONTROL {
            return None;
        }
        let responder = self.state.lock().responder.clone()?;
        let Frame::Single { payload, .. } = &transfer.frame else {
            return None;
        };
        match ControlMessage::decode(payload) {
            Ok(ControlMessage::ConnectService(request)) => {
                responder(&request).map(|response| connect_response_frame(&response))
            }
            _ => None,
        }
    }
}

impl HifBus for RecordingBus {
    fn send(&self, transfer: BusTransfer) -> Result<(), BusError> {
        let gate = self.state.lock().gate.take();
        if let Some(gate) = gate {
            gate.pass();
        }
        {
            let mut state = self.state.lock();
            if let Some(error) = state.failures.pop_front() {
                return Err(error);
            }
            state.transfers.push(RecordedTransfer {
                transfer: transfer.clone(),
                thread: thread::current().id(),
            });
            // 自动完成时槽位立即归还，否则由测试通过 `set_free_slots` 归还。
            if !self.auto_complete.load(Ordering::SeqCst) && state.free_slots != usize::MAX {
                state.free_slots = state.free_slots.saturating_sub(1);
            }
        }
        let transport = self.transport.lock().upgrade();
        let Some(transport) = transport else {
            return Ok(());
        };
        if let Some(reply) = self.answer_connect(&transfer) {
            transport.rx_completion_handler(reply, transfer.pipe);
        }
        if self.auto_complete.load(Ordering::SeqCst) {
            transport.tx_completion_handler(transfer.endpoint, transfer.token);
        }
        Ok(())
    }

    fn free_transfer_slots(&self, _pipe: PipeId) -> usize {
        self.state.lock().free_slots
    }

    fn map_service_to_pipe(&self, service: ServiceId) -> Result<PipeMapping, BusError> {
        let state = self.state.lock();
        Ok(state
            .pipes
            .iter()
            .find(|(candidate, _)| *candidate == service)
            .map(|(_, mapping)| *mapping)
            .unwrap_or_default())
    }

    fn bus_type(&self) -> BusType {
        self.bus_type
    }

    fn supports_rx_reassembly(&self) -> bool {
        self.reassembly
    }

    fn send_complete_check(&self, _pipe: PipeId, _force: bool) {
        self.complete_checks.fetch_add(1, Ordering::SeqCst);
    }

    fn pm_runtime_get(&self) -> Result<(), BusError> {
        if self.pm_suspended.load(Ordering::SeqCst) {
            return Err(BusError::Failed("bus resuming".into()));
        }
        self.pm_gets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn pm_runtime_put(&self) {
        self.pm_puts.fetch_add(1, Ordering::SeqCst);
    }
}

/// 上层回调记录的事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Received {
        endpoint: EndpointId,
        payload: Bytes,
    },
    Completed {
        context: u64,
        status: PacketStatus,
    },
    QueueFull {
        context: u64,
    },
    Resumed,
}

/// 记录型上层回调。
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
    full_action: Mutex<SendFullAction>,
    batches: AtomicUsize,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            full_action: Mutex::new(SendFullAction::Keep),
            batches: AtomicUsize::new(0),
        }
    }
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_full_action(&self, action: SendFullAction) {
        *self.full_action.lock() = action;
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    /// 按完成顺序返回 `(context, status)`。
    pub fn completions(&self) -> Vec<(u64, PacketStatus)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Completed { context, status } => Some((*context, *status)),
                _ => None,
            })
            .collect()
    }

    pub fn received(&self) -> Vec<Bytes> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Received { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// 以批量形式收到的接收回调次数。
    pub fn receive_batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

impl EndpointSink for RecordingSink {
    fn on_receive(&self, packet: HtcPacket) {
        self.events.lock().push(SinkEvent::Received {
            endpoint: packet.endpoint(),
            payload: packet.into_payload(),
        });
    }

    fn on_receive_batch(&self, packets: PacketQueue) {
        self.batches.fetch_add(1, Ordering::SeqCst);
        for packet in packets {
            self.on_receive(packet);
        }
    }

    fn on_send_complete(&self, packet: HtcPacket) {
        self.events.lock().push(SinkEvent::Completed {
            context: packet.context(),
            status: packet.status(),
        });
    }

    fn on_send_queue_full(&self, packet: &HtcPacket) -> SendFullAction {
        self.events.lock().push(SinkEvent::QueueFull {
            context: packet.context(),
        });
        *self.full_action.lock()
    }

    fn on_resume_tx_queue(&self) {
        self.events.lock().push(SinkEvent::Resumed);
    }
}

/// 记录型目标事件。
#[derive(Default)]
pub struct RecordingEvents {
    pub suspend_acks: AtomicUsize,
    pub suspend_nacks: AtomicUsize,
    pub wakeups: AtomicUsize,
    failures: Mutex<Vec<String>>,
}

impl RecordingEvents {
    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().clone()
    }
}

impl TargetEvents for RecordingEvents {
    fn on_suspend_complete(&self, nack: bool) {
        let counter = if nack {
            &self.suspend_nacks
        } else {
            &self.suspend_acks
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn on_initial_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::SeqCst);
    }

    fn on_target_failure(&self, error: &HtcError) {
        self.failures.lock().push(error.to_string());
    }
}

/// 在帧头后拼上负载与可选尾部，组成一条接收帧。
pub fn receive_frame(endpoint: EndpointId, payload: &[u8], trailer: &[TrailerRecord]) -> Bytes {
    let mut tail = BytesMut::new();
    encode_trailer(trailer, &mut tail);
    let mut header = FrameHeader::new(endpoint, 0, (payload.len() + tail.len()) as u16);
    if !tail.is_empty() {
        header.flags |= FLAG_RECV_TRAILER;
        header.control[0] = tail.len() as u8;
    }
    let mut out = BytesMut::with_capacity(header.frame_len());
    header.write_to(&mut out);
    out.put_slice(payload);
    out.put_slice(&tail);
    out.freeze()
}

/// 普通数据帧。
pub fn data_frame(endpoint: EndpointId, payload: &[u8]) -> Bytes {
    receive_frame(endpoint, payload, &[])
}

/// 只携带信用回报尾部、负载为空的帧。
pub fn credit_report_frame(from: EndpointId, reports: &[(EndpointId, u8)]) -> Bytes {
    let entries = reports
        .iter()
        .map(|(endpoint, credits)| CreditReport {
            endpoint: *endpoint,
            credits: *credits,
        })
        .collect();
    receive_frame(from, &[], &[TrailerRecord::CreditReport(entries)])
}

/// 控制端点上的一条控制消息帧。
pub fn control_frame(message: &ControlMessage) -> Bytes {
    let mut body = BytesMut::new();
    // 桩只用于构造合法消息，编码失败说明测试本身写错。
    if message.encode(&mut body).is_err() {
        body.clear();
    }
    data_frame(EndpointId::CONTROL, &body)
}

/// 就绪消息帧；`max_bundle` 非空时使用扩展形式。
pub fn ready_frame(
    credit_count: u16,
    credit_size: u16,
    max_endpoints: u8,
    max_bundle: Option<u8>,
) -> Bytes {
    control_frame(&ControlMessage::Ready(ReadyMessage {
        credit_count,
        credit_size,
        max_endpoints,
        extended: max_bundle.map(|max_msgs_per_bundle| ReadyExtension {
            htc_version: 1,
            max_msgs_per_bundle,
        }),
    }))
}

pub fn connect_response_frame(response: &ConnectServiceResponseMessage) -> Bytes {
    control_frame(&ControlMessage::ConnectServiceResponse(response.clone()))
}

/// 接受连接请求、分配给定端点的应答。
pub fn accept(
    request: &ConnectServiceMessage,
    endpoint: EndpointId,
    max_msg_size: u16,
) -> ConnectServiceResponseMessage {
    ConnectServiceResponseMessage {
        service_id: request.service_id,
        status: ServiceStatus::Success,
        endpoint,
        max_msg_size,
        metadata: Bytes::new(),
    }
}
