//! 控制通道握手：等待目标就绪、连接服务、下发初始化完成。
//!
//! # 设计概要（How）
//! - 目标的应答经接收路径写入 [`ControlChannel`] 的单槽位并唤醒等待者；
//! - `connect_lock` 串行化连接请求，保证同一时刻槽位只对应一个在等待的请求；
//! - 等待有上限，超时后端点保持未分配状态。

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::credit_history::CreditEvent;
use crate::error::HtcError;
use crate::ids::{EndpointId, ServiceId};
use crate::observability::TARGET_SERVICE;
use crate::packet::HtcPacket;
use crate::sink::EndpointSink;
use crate::transport::HtcTransport;
use crate::wire::control::{
    ConnectServiceMessage, ConnectionFlags, ControlMessage, ReadyMessage, SETUP_FLAG_ENABLE_BUNDLE_RECV,
    ServiceStatus, SetupCompleteExMessage,
};
use crate::wire::{HTC_MAX_CONTROL_MESSAGE_LENGTH, HTC_SERVICE_META_DATA_MAX_LENGTH};

/// 控制响应槽。
#[derive(Default)]
pub(crate) struct ControlChannel {
    slot: Mutex<Option<ControlMessage>>,
    signal: Condvar,
}

impl ControlChannel {
    pub(crate) fn deliver(&self, message: ControlMessage) {
        let mut slot = self.slot.lock();
        if let Some(stale) = slot.replace(message) {
            warn!(target: TARGET_SERVICE, message = ?stale, "unconsumed control response overwritten");
        }
        self.signal.notify_all();
    }

    pub(crate) fn wait(&self, timeout: Duration) -> Option<ControlMessage> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.is_none() {
            if self.signal.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.take()
    }

    pub(crate) fn clear(&self) {
        self.slot.lock().take();
    }
}

/// 连接服务请求。
#[derive(Clone)]
pub struct ConnectRequest {
    pub service: ServiceId,
    pub flags: ConnectionFlags,
    pub metadata: Bytes,
    pub sink: Arc<dyn EndpointSink>,
    /// 为空时使用配置中的默认队列深度。
    pub max_queue_depth: Option<usize>,
}

impl ConnectRequest {
    pub fn new(service: ServiceId, sink: Arc<dyn EndpointSink>) -> Self {
        Self {
            service,
            flags: ConnectionFlags::default(),
            metadata: Bytes::new(),
            sink,
            max_queue_depth: None,
        }
    }

    pub fn with_flags(mut self, flags: ConnectionFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_metadata(mut self, metadata: Bytes) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }
}

/// 连接成功后的端点信息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub endpoint: EndpointId,
    pub max_msg_size: u16,
    pub status: ServiceStatus,
    pub metadata: Bytes,
}

/// 就绪握手后目标的能力摘要。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetCapabilities {
    pub credit_count: u16,
    pub credit_size: u16,
    pub max_endpoints: u8,
    pub max_msgs_per_bundle: usize,
}

impl HtcTransport {
    /// 阻塞等待目标的就绪消息，记录缓冲能力并建立信用分配表。
    pub fn wait_target(&self) -> Result<TargetCapabilities, HtcError> {
        let timeout = self.config.ready_timeout();
        let message = self.control.wait(timeout).ok_or(HtcError::Timeout {
            what: "target ready message",
            waited: timeout,
        })?;
        let ControlMessage::Ready(ready) = message else {
            return Err(HtcError::protocol(format!(
                "expected ready message, got {message:?}"
            )));
        };
        if ready.credit_size == 0 || ready.credit_count == 0 {
            return Err(HtcError::protocol("target reported no credits"));
        }
        let capabilities = self.apply_ready(&ready);
        info!(
            target: TARGET_SERVICE,
            credits = ready.credit_count,
            credit_size = ready.credit_size,
            max_endpoints = ready.max_endpoints,
            max_bundle = capabilities.max_msgs_per_bundle,
            "target ready"
        );
        Ok(capabilities)
    }

    fn apply_ready(&self, ready: &ReadyMessage) -> TargetCapabilities {
        let max_msgs_per_bundle = ready
            .extended
            .map(|ext| usize::from(ext.max_msgs_per_bundle))
            .unwrap_or(0);
        let total = u32::from(ready.credit_count);
        let mut allocation: Vec<(ServiceId, u32)> = if self.config.credit_allocation.is_empty() {
            vec![(ServiceId::WMI_CONTROL, total)]
        } else {
            self.config
                .credit_allocation
                .iter()
                .map(|entry| (entry.service(), entry.credits))
                .collect()
        };
        let requested: u32 = allocation.iter().map(|(_, credits)| *credits).sum();
        if requested > total {
            warn!(
                target: TARGET_SERVICE,
                requested,
                total,
                "credit allocation exceeds target credits, clamping"
            );
            let mut left = total;
            for (_, credits) in allocation.iter_mut() {
                *credits = (*credits).min(left);
                left -= *credits;
            }
        }

        let mut state = self.tx.lock();
        let target = &mut state.target;
        target.ready = true;
        target.credit_size = u32::from(ready.credit_size);
        target.max_msgs_per_bundle = max_msgs_per_bundle;
        target.allocation = allocation;
        state.endpoints[EndpointId::CONTROL.index()].credit_size = u32::from(ready.credit_size);
        TargetCapabilities {
            credit_count: ready.credit_count,
            credit_size: ready.credit_size,
            max_endpoints: ready.max_endpoints,
            max_msgs_per_bundle: max_msgs_per_bundle.min(self.config.max_msgs_per_bundle),
        }
    }

    /// 与目标协商一个服务并激活分配到的端点。
    ///
    /// # 契约说明（What）
    /// - 服务已连接时返回 [`HtcError::AlreadyInUse`]，不发送任何消息；
    /// - 目标在超时内未应答返回 [`HtcError::Timeout`]，端点保持未分配；
    /// - 应答状态非成功返回 [`HtcError::ServiceRejected`]；应答格式、服务号或端点号异常返回
    ///   [`HtcError::ProtocolError`]；
    /// - 成功时端点的信用、管道与上层回调在标记“占用”之前全部就位。
    pub fn connect_service(&self, request: ConnectRequest) -> Result<ConnectResponse, HtcError> {
        if request.service == ServiceId::CONTROL_RSVD || request.service.is_unused() {
            return Err(HtcError::InvalidArgument {
                reason: "reserved service id",
            });
        }
        if request.metadata.len() > HTC_SERVICE_META_DATA_MAX_LENGTH {
            return Err(HtcError::InvalidArgument {
                reason: "service metadata too long",
            });
        }
        let _serial = self.connect_lock.lock();
        {
            let state = self.tx.lock();
            if state.stopping {
                return Err(HtcError::Stopped);
            }
            if !state.target.ready {
                return Err(HtcError::NotReady);
            }
            if state.endpoints.iter().any(|ep| ep.service == request.service) {
                return Err(HtcError::AlreadyInUse {
                    service: request.service,
                });
            }
        }

        self.control.clear();
        let message = ControlMessage::ConnectService(ConnectServiceMessage {
            service_id: request.service,
            flags: request.flags,
            metadata: request.metadata.clone(),
        });
        self.send_control_message(&message)?;

        let timeout = self.config.connect_timeout();
        let reply = self.control.wait(timeout).ok_or(HtcError::Timeout {
            what: "connect service response",
            waited: timeout,
        })?;
        let ControlMessage::ConnectServiceResponse(response) = reply else {
            return Err(HtcError::protocol(format!(
                "expected connect response, got {reply:?}"
            )));
        };
        if response.service_id != request.service {
            return Err(HtcError::protocol(format!(
                "connect response for service {} while connecting {}",
                response.service_id, request.service
            )));
        }
        if response.status != ServiceStatus::Success {
            warn!(
                target: TARGET_SERVICE,
                service = %request.service,
                status = %response.status,
                "target rejected service"
            );
            return Err(HtcError::ServiceRejected {
                service: request.service,
                status: response.status,
            });
        }
        let endpoint = response.endpoint;
        if endpoint.is_control() || endpoint.index() >= self.config.max_endpoints {
            return Err(HtcError::protocol(format!(
                "target assigned invalid endpoint {}",
                endpoint.0
            )));
        }
        let pipes = self.bus.map_service_to_pipe(request.service)?;

        {
            let mut state = self.tx.lock();
            let credit_size = state.target.credit_size;
            let credits = state.target.credits_for(request.service);
            let ep = &mut state.endpoints[endpoint.index()];
            if ep.in_use() {
                return Err(HtcError::AlreadyInUse {
                    service: ep.service,
                });
            }
            ep.pipes = pipes;
            ep.max_msg_len = usize::from(response.max_msg_size);
            ep.max_queue_depth = request
                .max_queue_depth
                .unwrap_or(self.config.default_max_queue_depth);
            ep.credit_flow = !request.flags.credit_flow_disabled();
            ep.credit_size = credit_size;
            ep.credits_per_max_msg = usize::from(response.max_msg_size)
                .div_ceil(credit_size.max(1) as usize) as u32;
            ep.tx_credits = credits;
            ep.sink = Some(Arc::clone(&request.sink));
            ep.service = request.service;
            self.diagnostics
                .record(CreditEvent::InitialCredit, endpoint, credits, 0);
        }
        info!(
            target: TARGET_SERVICE,
            service = %request.service,
            %endpoint,
            max_msg = response.max_msg_size,
            "service connected"
        );
        Ok(ConnectResponse {
            endpoint,
            max_msg_size: response.max_msg_size,
            status: response.status,
            metadata: response.metadata,
        })
    }

    /// 通知目标主机侧初始化完成。
    pub fn start(&self) -> Result<(), HtcError> {
        if !self.tx.lock().target.ready {
            return Err(HtcError::NotReady);
        }
        let (flags, max_recv) = if self.config.rx_bundle_enabled {
            (
                SETUP_FLAG_ENABLE_BUNDLE_RECV,
                self.config.max_msgs_per_bundle as u8,
            )
        } else {
            (0, 0)
        };
        self.send_control_message(&ControlMessage::SetupCompleteEx(SetupCompleteExMessage {
            flags,
            max_msgs_per_bundled_recv: max_recv,
        }))?;
        debug!(target: TARGET_SERVICE, flags, "setup complete sent");
        Ok(())
    }

    /// 借一个池容器编码控制消息并经控制端点发出。
    fn send_control_message(&self, message: &ControlMessage) -> Result<(), HtcError> {
        let lease = self.control_pool.acquire();
        let mut buffer = self
            .control_pool
            .with(lease, std::mem::take)
            .unwrap_or_default();
        buffer.clear();
        buffer.reserve(HTC_MAX_CONTROL_MESSAGE_LENGTH);
        if let Err(error) = message.encode(&mut buffer) {
            self.recycle_control(lease, buffer.freeze());
            return Err(error.into());
        }
        let mut packet = HtcPacket::new(EndpointId::CONTROL, buffer.freeze());
        packet.lease = Some(lease);
        self.send_pkt(packet)
    }
}
