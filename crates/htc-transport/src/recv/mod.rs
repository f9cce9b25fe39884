//! 接收路径：重组、帧头校验、尾部记录处理与分发。
//!
//! # 状态流转（How）
//! `HEADER_CHECK → (AWAITING_MORE) → TRAILER_CHECK → TRAILER_PARSE → DISPATCH`
//! - 帧头声明长度大于实际收到的字节：总线支持重组时进入等待，否则按协议错误丢弃；
//! - 尾部长度（控制字节 0）必须不小于记录头长度且不大于负载长度；
//! - 去掉尾部后负载为空的帧（纯信用回报）在处理完记录后静默丢弃；
//! - 控制端点的帧作为控制消息消费，其余端点交给上层。
//!
//! 所有逐帧错误只影响当前帧：记录日志、计数后返回，接收路径继续工作。

pub(crate) mod reassembly;

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::diagnostics::bump;
use crate::ids::{EndpointId, PipeId};
use crate::observability::TARGET_RECV;
use crate::packet::{HtcPacket, PacketQueue};
use crate::sink::EndpointSink;
use crate::transport::HtcTransport;
use crate::wire::control::ControlMessage;
use crate::wire::trailer::{RECORD_HEADER_LEN, TrailerRecord, parse_trailer};
use crate::wire::{FLAG_RECV_TRAILER, FrameHeader, HTC_HDR_LENGTH};

use self::reassembly::Step;

type Delivery = (HtcPacket, Arc<dyn EndpointSink>);

impl HtcTransport {
    /// 总线接收完成回调：一个缓冲可能是完整帧，也可能是一帧的某个分段。
    pub fn rx_completion_handler(&self, buffer: Bytes, pipe: PipeId) {
        if let Some((packet, sink)) = self.receive_segment(buffer, pipe) {
            sink.on_receive(packet);
        }
    }

    /// 批量接收：同一端点连续到达的包合并为一次 `on_receive_batch`。
    pub fn rx_completion_batch(&self, buffers: Vec<Bytes>, pipe: PipeId) {
        let mut run: Option<(EndpointId, Arc<dyn EndpointSink>, PacketQueue)> = None;
        for buffer in buffers {
            let Some((packet, sink)) = self.receive_segment(buffer, pipe) else {
                continue;
            };
            match run.as_mut() {
                Some((endpoint, _, queue)) if *endpoint == packet.endpoint() => {
                    queue.push_back(packet);
                }
                _ => {
                    if let Some((_, previous, queue)) = run.take() {
                        previous.on_receive_batch(queue);
                    }
                    run = Some((packet.endpoint(), sink, PacketQueue::from([packet])));
                }
            }
        }
        if let Some((_, sink, queue)) = run {
            sink.on_receive_batch(queue);
        }
    }

    fn receive_segment(&self, buffer: Bytes, pipe: PipeId) -> Option<Delivery> {
        let (step, resumed) = {
            let mut rx = self.rx.lock();
            let resumed = rx.in_progress();
            (rx.push(buffer, self.rx_reassembly), resumed)
        };
        match step {
            Step::Complete(frame) => {
                if resumed {
                    bump(&self.diagnostics.counters.rx_reassembled);
                }
                self.process_frame(frame, pipe)
            }
            Step::Pending => {
                trace!(target: TARGET_RECV, %pipe, "awaiting more segments");
                None
            }
            Step::Dropped(error) => {
                warn!(target: TARGET_RECV, %pipe, %error, "dropping malformed frame");
                bump(&self.diagnostics.counters.rx_dropped);
                None
            }
        }
    }

    fn process_frame(&self, frame: Bytes, pipe: PipeId) -> Option<Delivery> {
        bump(&self.diagnostics.counters.rx_frames);
        let header = match FrameHeader::decode(&frame) {
            Ok(header) => header,
            Err(error) => return self.drop_frame(pipe, &error.to_string()),
        };
        let endpoint = header.endpoint;
        if endpoint.index() >= self.config.max_endpoints {
            return self.drop_frame(pipe, "endpoint id out of range");
        }
        let payload_len = header.payload_len as usize;
        let mut payload = frame.slice(HTC_HDR_LENGTH..HTC_HDR_LENGTH + payload_len);

        if header.flags & FLAG_RECV_TRAILER != 0 {
            let trailer_len = header.trailer_len();
            if trailer_len < RECORD_HEADER_LEN || trailer_len > payload_len {
                return self.drop_frame(pipe, "invalid trailer length");
            }
            let body_len = payload_len - trailer_len;
            match parse_trailer(&payload.slice(body_len..)) {
                Ok(records) => self.apply_trailer(records, endpoint),
                Err(error) => return self.drop_frame(pipe, &error.to_string()),
            }
            payload.truncate(body_len);
        }

        if payload.is_empty() {
            bump(&self.diagnostics.counters.rx_empty);
            trace!(target: TARGET_RECV, %endpoint, "frame carried only a trailer");
            return None;
        }
        if endpoint.is_control() {
            self.handle_control_message(payload);
            return None;
        }

        let sink = self.tx.lock().active_mut(endpoint).map(|ep| {
            ep.stats.rx_received += 1;
            ep.sink.clone()
        });
        let Ok(sink) = sink else {
            return self.drop_frame(pipe, "frame for unconnected endpoint");
        };
        match sink {
            Some(sink) => Some((HtcPacket::received(endpoint, payload, header.seq()), sink)),
            None => {
                debug!(target: TARGET_RECV, %endpoint, "no sink registered, dropping");
                None
            }
        }
    }

    fn drop_frame(&self, pipe: PipeId, reason: &str) -> Option<Delivery> {
        warn!(target: TARGET_RECV, %pipe, reason, "dropping received frame");
        bump(&self.diagnostics.counters.rx_dropped);
        None
    }

    fn apply_trailer(&self, records: Vec<TrailerRecord>, from: EndpointId) {
        for record in records {
            match record {
                TrailerRecord::CreditReport(entries) => self.process_credit_report(&entries, from),
                TrailerRecord::Lookahead { valid, .. } => {
                    if valid {
                        bump(&self.diagnostics.counters.lookaheads);
                    }
                }
                TrailerRecord::LookaheadBundle(entries) => {
                    for _ in entries {
                        bump(&self.diagnostics.counters.lookaheads);
                    }
                }
                TrailerRecord::Unknown { id, data } => {
                    debug!(target: TARGET_RECV, id, len = data.len(), "skipping unknown trailer record");
                    bump(&self.diagnostics.counters.unknown_records);
                }
            }
        }
    }

    fn handle_control_message(&self, payload: Bytes) {
        let message = match ControlMessage::decode(&payload) {
            Ok(message) => message,
            Err(error) => {
                warn!(target: TARGET_RECV, %error, "malformed control message");
                bump(&self.diagnostics.counters.rx_dropped);
                return;
            }
        };
        match message {
            ControlMessage::SendSuspendComplete => self.events.on_suspend_complete(false),
            ControlMessage::NackSuspend => self.events.on_suspend_complete(true),
            ControlMessage::Wakeup => self.events.on_initial_wakeup(),
            ControlMessage::Ready(_) | ControlMessage::ConnectServiceResponse(_) => {
                self.control.deliver(message);
            }
            other => warn!(target: TARGET_RECV, message = ?other, "unexpected control message"),
        }
    }
}
