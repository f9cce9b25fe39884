//! 集成测试共用的装配代码：记录型总线 + 传输实例 + 就绪握手 + 服务连接。
//!
//! 各测试文件通过 `mod common;` 引入，只使用其中一部分函数，因此关闭未使用告警。
#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use htc_transport::test_stubs::{RecordingBus, RecordingEvents, RecordingSink, accept, ready_frame};
use htc_transport::{
    ConnectRequest, ConnectionFlags, CreditAllocation, EndpointId, HtcConfig, HtcPacket,
    HtcTransport, PipeId, ServiceId,
};

pub struct Harness {
    pub bus: Arc<RecordingBus>,
    pub events: Arc<RecordingEvents>,
    pub transport: Arc<HtcTransport>,
}

/// 给定服务分配初始信用的配置。
pub fn config_with_credits(allocation: &[(ServiceId, u32)]) -> HtcConfig {
    HtcConfig {
        credit_allocation: allocation
            .iter()
            .map(|(service, credits)| CreditAllocation {
                service_id: service.0,
                credits: *credits,
            })
            .collect(),
        ..HtcConfig::default()
    }
}

impl Harness {
    /// 创建实例并接通总线回调；发送默认同步完成。
    pub fn new(bus: RecordingBus, config: HtcConfig) -> Self {
        let bus = Arc::new(bus);
        let events = Arc::new(RecordingEvents::default());
        let transport = Arc::new(
            HtcTransport::with_events(config, bus.clone(), events.clone())
                .expect("测试配置应当合法"),
        );
        bus.attach(&transport);
        bus.set_auto_complete(true);
        Self {
            bus,
            events,
            transport,
        }
    }

    /// 注入就绪消息并完成 `wait_target`。
    pub fn ready(&self, credits: u16, credit_size: u16, max_bundle: Option<u8>) {
        self.transport
            .rx_completion_handler(ready_frame(credits, credit_size, 8, max_bundle), PipeId(0));
        self.transport.wait_target().expect("就绪消息已在槽位中");
    }

    /// 让目标把 `service` 分配到 `endpoint` 并完成连接。
    pub fn connect(&self, service: ServiceId, endpoint: EndpointId) -> Arc<RecordingSink> {
        self.connect_with(service, endpoint, 1024, ConnectionFlags::default(), None)
    }

    pub fn connect_with(
        &self,
        service: ServiceId,
        endpoint: EndpointId,
        max_msg_size: u16,
        flags: ConnectionFlags,
        max_queue_depth: Option<usize>,
    ) -> Arc<RecordingSink> {
        self.bus
            .respond_to_connect(move |request| Some(accept(request, endpoint, max_msg_size)));
        let sink = RecordingSink::new();
        let mut request = ConnectRequest::new(service, sink.clone()).with_flags(flags);
        if let Some(depth) = max_queue_depth {
            request = request.with_max_queue_depth(depth);
        }
        let response = self
            .transport
            .connect_service(request)
            .expect("模拟目标接受连接");
        assert_eq!(response.endpoint, endpoint);
        sink
    }

    /// 某端点在总线上出现过的包上下文（从负载首 8 字节解析），按上线顺序。
    pub fn wire_contexts(&self, endpoint: EndpointId) -> Vec<u64> {
        let mut contexts = Vec::new();
        for record in self.bus.transfers_for(endpoint) {
            let bytes = record.bytes();
            if record.transfer.frame.is_bundle() {
                let members = htc_transport::wire::split_bundle(&bytes).expect("聚合包可拆分");
                contexts.extend(members.iter().map(|member| context_of(&member.payload)));
            } else {
                contexts.push(context_of(&bytes.slice(htc_transport::wire::HTC_HDR_LENGTH..)));
            }
        }
        contexts
    }
}

/// 负载前 8 字节写入上下文编号，其余填充到 `len`。
pub fn packet(endpoint: EndpointId, context: u64, len: usize) -> HtcPacket {
    let mut payload = vec![0xA5u8; len.max(8)];
    payload[..8].copy_from_slice(&context.to_le_bytes());
    HtcPacket::new(endpoint, Bytes::from(payload)).with_context(context)
}

pub fn context_of(payload: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&payload[..8]);
    u64::from_le_bytes(raw)
}
