//! 传输实例本体与跨路径共享的辅助逻辑。

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use htc_buffer::{ContainerPool, Handle, PoolStats};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::{BusType, HifBus};
use crate::config::{HtcConfig, RxReassembly};
use crate::diagnostics::TransportDiagnostics;
use crate::endpoint::{Endpoint, EndpointStats, StatsAction};
use crate::error::HtcError;
use crate::ids::{EndpointId, ServiceId, TransferToken};
use crate::observability::{TARGET_SEND, TARGET_SERVICE};
use crate::packet::{HtcPacket, PacketQueue, PacketStatus, TxTag};
use crate::recv::reassembly::Reassembly;
use crate::service::ControlChannel;
use crate::sink::{EndpointSink, NoopTargetEvents, TargetEvents};
use crate::wire::HTC_MAX_CONTROL_MESSAGE_LENGTH;

/// 目标在就绪消息中报告的能力，以及由此推导出的信用分配表。
#[derive(Debug, Clone, Default)]
pub(crate) struct TargetInfo {
    pub(crate) ready: bool,
    pub(crate) credit_size: u32,
    /// 0 表示目标不接受聚合帧。
    pub(crate) max_msgs_per_bundle: usize,
    pub(crate) allocation: Vec<(ServiceId, u32)>,
}

impl TargetInfo {
    pub(crate) fn credits_for(&self, service: ServiceId) -> u32 {
        self.allocation
            .iter()
            .find(|(candidate, _)| *candidate == service)
            .map(|(_, credits)| *credits)
            .unwrap_or(0)
    }
}

/// TX 锁保护的全部状态。
pub(crate) struct TxState {
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) stopping: bool,
    pub(crate) target: TargetInfo,
}

impl TxState {
    /// 取得一个已占用的端点。
    pub(crate) fn active_mut(&mut self, endpoint: EndpointId) -> Result<&mut Endpoint, HtcError> {
        match self.endpoints.get_mut(endpoint.index()) {
            Some(ep) if ep.in_use() => Ok(ep),
            _ => Err(HtcError::InvalidEndpoint {
                endpoint: endpoint.0,
            }),
        }
    }

    pub(crate) fn active(&self, endpoint: EndpointId) -> Result<&Endpoint, HtcError> {
        match self.endpoints.get(endpoint.index()) {
            Some(ep) if ep.in_use() => Ok(ep),
            _ => Err(HtcError::InvalidEndpoint {
                endpoint: endpoint.0,
            }),
        }
    }
}

/// HTC 传输实例。
///
/// # 模块角色（Why）
/// - 把若干逻辑服务复用到少量物理管道上，用信用经济约束发送速率，并在多线程并发收发下保证不丢包、不漏信用；
/// - 一个实例对应一个目标设备，所有状态（端点表、诊断、池）都归实例所有，不依赖全局变量。
///
/// # 并发模型（How）
/// - `tx`：覆盖全部端点队列与信用的粗粒度锁；回调上层与调用总线 `send` 时一律不持有；
/// - `rx`：仅保护接收重组累加器；
/// - `control`：握手等待用的响应槽与条件变量，`connect_lock` 串行化并发的连接请求；
/// - 排空循环以端点的 `tx_process_count` 保证同一端点同一时刻至多一个排空者。
///
/// # 契约说明（What）
/// - 实例需要以 `Arc` 共享给总线完成回调与上层线程，本身满足 `Send + Sync`；
/// - 只有 [`HtcTransport::wait_target`] 与 [`HtcTransport::connect_service`] 会阻塞，其余接口均立即返回。
pub struct HtcTransport {
    pub(crate) config: HtcConfig,
    pub(crate) bus: Arc<dyn HifBus>,
    pub(crate) events: Arc<dyn TargetEvents>,
    pub(crate) tx: Mutex<TxState>,
    pub(crate) rx: Mutex<Reassembly>,
    pub(crate) control: ControlChannel,
    pub(crate) connect_lock: Mutex<()>,
    pub(crate) bundle_pool: ContainerPool<BytesMut>,
    pub(crate) control_pool: ContainerPool<BytesMut>,
    pub(crate) diagnostics: TransportDiagnostics,
    pub(crate) rx_reassembly: bool,
    next_token: AtomicU64,
}

impl HtcTransport {
    /// 创建传输实例并激活控制端点。
    pub fn new(config: HtcConfig, bus: Arc<dyn HifBus>) -> Result<Self, HtcError> {
        Self::with_events(config, bus, Arc::new(NoopTargetEvents))
    }

    pub fn with_events(
        config: HtcConfig,
        bus: Arc<dyn HifBus>,
        events: Arc<dyn TargetEvents>,
    ) -> Result<Self, HtcError> {
        config.validate()?;
        let mut endpoints: Vec<Endpoint> = (0..config.max_endpoints)
            .map(|index| Endpoint::inert(EndpointId(index as u8)))
            .collect();
        let pipes = bus.map_service_to_pipe(ServiceId::CONTROL_RSVD)?;
        let control = &mut endpoints[EndpointId::CONTROL.index()];
        control.service = ServiceId::CONTROL_RSVD;
        control.pipes = pipes;
        control.max_msg_len = HTC_MAX_CONTROL_MESSAGE_LENGTH;
        control.max_queue_depth = config.default_max_queue_depth;

        let rx_reassembly = match config.rx_reassembly {
            RxReassembly::Auto => bus.supports_rx_reassembly(),
            RxReassembly::Enabled => true,
            RxReassembly::Disabled => false,
        };
        let bundle_pool = ContainerPool::with_capacity(config.bundle_pool_size, BytesMut::new);
        let control_pool = ContainerPool::with_capacity(config.control_pool_size, || {
            BytesMut::with_capacity(HTC_MAX_CONTROL_MESSAGE_LENGTH)
        });
        let diagnostics = TransportDiagnostics::new(config.credit_history_capacity);
        info!(
            target: TARGET_SERVICE,
            endpoints = config.max_endpoints,
            bus = ?bus.bus_type(),
            rx_reassembly,
            "htc transport created"
        );
        Ok(Self {
            config,
            bus,
            events,
            tx: Mutex::new(TxState {
                endpoints,
                stopping: false,
                target: TargetInfo::default(),
            }),
            rx: Mutex::new(Reassembly::default()),
            control: ControlChannel::default(),
            connect_lock: Mutex::new(()),
            bundle_pool,
            control_pool,
            diagnostics,
            rx_reassembly,
            next_token: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &HtcConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &TransportDiagnostics {
        &self.diagnostics
    }

    pub fn bus_type(&self) -> BusType {
        self.bus.bus_type()
    }

    pub fn endpoint_stats(
        &self,
        endpoint: EndpointId,
        action: StatsAction,
    ) -> Result<EndpointStats, HtcError> {
        let mut state = self.tx.lock();
        let ep = state
            .endpoints
            .get_mut(endpoint.index())
            .ok_or(HtcError::InvalidEndpoint {
                endpoint: endpoint.0,
            })?;
        let sample = ep.stats;
        if matches!(action, StatsAction::SampleAndClear | StatsAction::Clear) {
            ep.reset_stats();
        }
        Ok(sample)
    }

    /// 当前信用余额。
    pub fn tx_credits(&self, endpoint: EndpointId) -> Result<u32, HtcError> {
        Ok(self.tx.lock().active(endpoint)?.tx_credits)
    }

    pub fn tx_queue_depth(&self, endpoint: EndpointId) -> Result<usize, HtcError> {
        Ok(self.tx.lock().active(endpoint)?.tx_queue.len())
    }

    /// 已交给总线、尚未完成的包数量。
    pub fn in_flight(&self, endpoint: EndpointId) -> Result<usize, HtcError> {
        Ok(self.tx.lock().active(endpoint)?.in_flight_packets())
    }

    /// WMI 控制服务端点当前的信用；未连接时为 0。
    pub fn control_endpoint_tx_credits(&self) -> u32 {
        let state = self.tx.lock();
        state
            .endpoints
            .iter()
            .find(|ep| ep.service == ServiceId::WMI_CONTROL)
            .map(|ep| ep.tx_credits)
            .unwrap_or(0)
    }

    pub fn service_to_endpoint(&self, service: ServiceId) -> Option<EndpointId> {
        let state = self.tx.lock();
        state
            .endpoints
            .iter()
            .find(|ep| ep.service == service)
            .map(|ep| ep.id)
    }

    pub fn bundle_pool_stats(&self) -> PoolStats {
        self.bundle_pool.stats()
    }

    pub fn control_pool_stats(&self) -> PoolStats {
        self.control_pool.stats()
    }

    pub fn is_stopping(&self) -> bool {
        self.tx.lock().stopping
    }

    /// 停止传输：取消所有排队包并清空接收重组与控制响应。
    ///
    /// 已交给总线的包不受影响，其完成回调仍会按正常路径上报。
    pub fn stop(&self) {
        let canceled: Vec<(Option<Arc<dyn EndpointSink>>, PacketQueue)> = {
            let mut state = self.tx.lock();
            state.stopping = true;
            state
                .endpoints
                .iter_mut()
                .filter(|ep| !ep.tx_queue.is_empty())
                .map(|ep| (ep.sink.clone(), mem::take(&mut ep.tx_queue)))
                .collect()
        };
        for (sink, packets) in canceled {
            self.complete_tx(sink, packets, PacketStatus::Canceled);
        }
        self.rx.lock().reset();
        self.control.clear();
        info!(target: TARGET_SERVICE, "htc transport stopped");
    }

    pub(crate) fn next_token(&self) -> TransferToken {
        TransferToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// 把一批发送包以给定状态交还上层；控制消息的池容器在此归还。
    pub(crate) fn complete_tx(
        &self,
        sink: Option<Arc<dyn EndpointSink>>,
        packets: PacketQueue,
        status: PacketStatus,
    ) {
        let mut external = PacketQueue::with_capacity(packets.len());
        for mut packet in packets {
            packet.set_status(status);
            match packet.lease.take() {
                Some(lease) => self.recycle_control(lease, packet.into_payload()),
                None => external.push_back(packet),
            }
        }
        if external.is_empty() {
            return;
        }
        match sink {
            Some(sink) if external.len() == 1 => {
                if let Some(packet) = external.pop_front() {
                    sink.on_send_complete(packet);
                }
            }
            Some(sink) => sink.on_send_complete_batch(external),
            None => debug!(
                target: TARGET_SEND,
                count = external.len(),
                "completed packets have no sink"
            ),
        }
    }

    /// 完成时释放调度阶段获取的电源保持。
    pub(crate) fn release_pm_hold(&self, packet: &HtcPacket) {
        if packet.tag() != TxTag::AutoPm {
            self.bus.pm_runtime_put();
        }
    }

    pub(crate) fn recycle_control(&self, lease: Handle, payload: Bytes) {
        recycle_into(&self.control_pool, lease, payload);
    }

    pub(crate) fn recycle_bundle(&self, container: Handle, frame: Bytes) {
        recycle_into(&self.bundle_pool, container, frame);
    }
}

/// 尽量取回冻结缓冲的底层内存放回池槽位，然后归还句柄。
fn recycle_into(pool: &ContainerPool<BytesMut>, handle: Handle, frame: Bytes) {
    if let Ok(buffer) = frame.try_into_mut()
        && let Err(error) = pool.with(handle, |slot| *slot = buffer)
    {
        warn!(target: TARGET_SEND, %error, "pool slot vanished before recycle");
    }
    if let Err(error) = pool.release(handle) {
        warn!(target: TARGET_SEND, %error, "pool container released twice");
    }
}
