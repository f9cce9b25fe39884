//! 发送路径：入队、排空、提交总线、回滚与信用回报处理。
//!
//! # 流程概览（How）
//! 1. [`HtcTransport::send_pkts_multiple`] 校验端点并按队列深度处理溢出，把包追加到端点发送队列；
//! 2. `drain` 以 `tx_process_count` 守卫进入排空循环：持锁做准入（信用或总线槽位），放锁后提交总线；
//! 3. 总线拒绝时，把未提交的包连同信用一起退回发送队列头部，等待下一次资源可用或信用回报；
//! 4. 完成回调见 [`completion`]，聚合发送见 [`bundle`]。

pub(crate) mod admission;
pub(crate) mod bundle;
pub(crate) mod completion;

use std::mem;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::bus::{BusTransfer, BusType, Frame, PipeMapping};
use crate::credit_history::CreditEvent;
use crate::diagnostics::bump;
use crate::endpoint::{Endpoint, InFlight};
use crate::error::{BusError, HtcError};
use crate::ids::{EndpointId, PipeId};
use crate::observability::{TARGET_CREDIT, TARGET_SEND};
use crate::packet::{HtcPacket, PacketQueue, PacketStatus, TxTag};
use crate::sink::{EndpointSink, SendFullAction};
use crate::transport::{HtcTransport, TxState};
use crate::wire::FrameHeader;
use crate::wire::trailer::CreditReport;

use self::bundle::BundleParams;

/// `flush` 的标签通配值：取消全部排队包。
pub const FLUSH_ALL_TAGS: u32 = 0;

/// 一次排空调用内不变的端点参数。
#[derive(Debug, Clone, Copy)]
pub(crate) struct DrainParams {
    pub(crate) credit_flow: bool,
    pub(crate) pipes: PipeMapping,
    pub(crate) bundle: Option<BundleParams>,
}

impl HtcTransport {
    /// 发送单个包。
    pub fn send_pkt(&self, packet: HtcPacket) -> Result<(), HtcError> {
        self.send_pkts_multiple(PacketQueue::from([packet]))
    }

    /// 发送同一端点的一批包。
    ///
    /// # 契约说明（What）
    /// - 所有包必须属于同一个已连接端点，否则返回 [`HtcError::InvalidEndpoint`] /
    ///   [`HtcError::InvalidArgument`] 且不产生任何完成回调；
    /// - 返回 `Ok` 后每个包恰好收到一次完成：成功发送、队列满被丢弃（`NoResource`）或被取消（`Canceled`）。
    pub fn send_pkts_multiple(&self, packets: PacketQueue) -> Result<(), HtcError> {
        let endpoint = batch_endpoint(&packets)?;
        self.enqueue(endpoint, packets)?;
        self.drain(endpoint);
        Ok(())
    }

    /// 数据服务快速路径。
    ///
    /// `more_data` 为真且该端点启用聚合时只入队不排空，让后续包凑成聚合帧；
    /// 调用方必须以一次 `more_data = false` 的调用收尾。
    pub fn send_data(&self, packet: HtcPacket, more_data: bool) -> Result<(), HtcError> {
        let endpoint = packet.endpoint();
        self.enqueue(endpoint, PacketQueue::from([packet]))?;
        let defer = more_data && {
            let state = self.tx.lock();
            state
                .active(endpoint)
                .map(|ep| self.bundle_params(&state, ep).is_some())
                .unwrap_or(false)
        };
        if !defer {
            self.drain(endpoint);
        }
        Ok(())
    }

    /// 取消端点发送队列中的包（已提交总线的不受影响），返回被取消的数量。
    ///
    /// `tag` 为 [`FLUSH_ALL_TAGS`] 时取消全部，否则只取消 `user_tag` 相同的包。
    pub fn flush(&self, endpoint: EndpointId, tag: u32) -> Result<usize, HtcError> {
        let (sink, flushed) = {
            let mut state = self.tx.lock();
            let ep = state.active_mut(endpoint)?;
            let flushed = if tag == FLUSH_ALL_TAGS {
                mem::take(&mut ep.tx_queue)
            } else {
                let (matching, rest): (PacketQueue, PacketQueue) = mem::take(&mut ep.tx_queue)
                    .into_iter()
                    .partition(|packet| packet.user_tag() == tag);
                ep.tx_queue = rest;
                matching
            };
            (ep.sink.clone(), flushed)
        };
        let count = flushed.len();
        debug!(target: TARGET_SEND, %endpoint, count, tag, "flushed send queue");
        self.complete_tx(sink, flushed, PacketStatus::Canceled);
        Ok(count)
    }

    /// 总线报告某上行管道有空闲槽位，重新排空映射到该管道的端点。
    pub fn tx_resource_available(&self, pipe: PipeId) {
        let endpoints: Vec<EndpointId> = {
            let state = self.tx.lock();
            state
                .endpoints
                .iter()
                .filter(|ep| ep.in_use() && ep.ul_pipe() == pipe)
                .map(|ep| ep.id)
                .collect()
        };
        if endpoints.is_empty() {
            debug!(target: TARGET_SEND, %pipe, "resource available on unmapped pipe");
        }
        for endpoint in endpoints {
            self.drain(endpoint);
        }
    }

    /// 通知所有上层恢复投递并重新排空每个端点。
    pub fn kick_queues(&self) {
        let active: Vec<(EndpointId, Option<Arc<dyn EndpointSink>>)> = {
            let state = self.tx.lock();
            state
                .endpoints
                .iter()
                .filter(|ep| ep.in_use())
                .map(|ep| (ep.id, ep.sink.clone()))
                .collect()
        };
        for (endpoint, sink) in active {
            if let Some(sink) = sink {
                sink.on_resume_tx_queue();
            }
            self.drain(endpoint);
        }
    }

    /// 处理目标回送的信用，并立即为有积压的端点重新排空。
    ///
    /// 遇到越界端点编号时停止处理本条记录的剩余条目。
    pub(crate) fn process_credit_report(&self, entries: &[CreditReport], from: EndpointId) {
        let mut kick = Vec::new();
        {
            let mut state = self.tx.lock();
            let max = state.endpoints.len();
            for entry in entries {
                let Some(ep) = state.endpoints.get_mut(entry.endpoint.index()) else {
                    warn!(
                        target: TARGET_CREDIT,
                        endpoint = entry.endpoint.0,
                        max,
                        "credit report for out-of-range endpoint"
                    );
                    break;
                };
                let credits = u32::from(entry.credits);
                if !admission::return_credits(ep, credits) {
                    warn!(
                        target: TARGET_CREDIT,
                        endpoint = %ep.id,
                        credits,
                        "credit balance saturated"
                    );
                }
                ep.stats.tx_credit_rpts += 1;
                ep.stats.tx_credits_returned += u64::from(credits);
                if from == entry.endpoint {
                    ep.stats.tx_credits_from_rx += u64::from(credits);
                } else if from.is_control() {
                    ep.stats.tx_credits_from_ep0 += u64::from(credits);
                } else {
                    ep.stats.tx_credits_from_other += u64::from(credits);
                }
                self.diagnostics.record(
                    CreditEvent::ProcessCreditReport,
                    ep.id,
                    ep.tx_credits,
                    ep.tx_queue.len(),
                );
                trace!(
                    target: TARGET_CREDIT,
                    endpoint = %ep.id,
                    credits,
                    balance = ep.tx_credits,
                    "credit report"
                );
                if ep.tx_credits > 0 && !ep.tx_queue.is_empty() && !kick.contains(&ep.id) {
                    kick.push(ep.id);
                }
            }
        }
        for endpoint in kick {
            self.drain(endpoint);
        }
    }

    /// 校验端点并把包追加到发送队列，超出深度的部分交由上层决定去留。
    fn enqueue(&self, endpoint: EndpointId, mut packets: PacketQueue) -> Result<(), HtcError> {
        if packets.iter().any(|p| p.len() > usize::from(u16::MAX)) {
            return Err(HtcError::InvalidArgument {
                reason: "payload exceeds 65535 bytes",
            });
        }
        let (sink, overflow) = {
            let mut state = self.tx.lock();
            let stopping = state.stopping;
            let ep = state.active_mut(endpoint)?;
            if packets.iter().any(|p| p.len() > ep.max_msg_len) {
                return Err(HtcError::InvalidArgument {
                    reason: "payload exceeds endpoint max message size",
                });
            }
            let sink = ep.sink.clone();
            if stopping {
                drop(state);
                debug!(target: TARGET_SEND, %endpoint, "send while stopping, canceling");
                self.complete_tx(sink, packets, PacketStatus::Canceled);
                return Ok(());
            }
            let room = ep.max_queue_depth.saturating_sub(ep.tx_queue.len());
            let overflow = packets.len().saturating_sub(room);
            if overflow == 0 || sink.is_none() {
                append_to_queue(ep, packets);
                return Ok(());
            }
            (sink, packets.split_off(packets.len() - overflow))
        };

        let mut dropped = PacketQueue::new();
        if let Some(sink) = sink.as_ref() {
            for packet in overflow {
                match sink.on_send_queue_full(&packet) {
                    SendFullAction::Keep => packets.push_back(packet),
                    SendFullAction::Drop => dropped.push_back(packet),
                }
            }
        }

        let status = {
            let mut state = self.tx.lock();
            let stopping = state.stopping;
            let ep = state.active_mut(endpoint)?;
            ep.stats.tx_dropped += dropped.len() as u64;
            if stopping {
                dropped.append(&mut packets);
                PacketStatus::Canceled
            } else {
                append_to_queue(ep, packets);
                PacketStatus::NoResource
            }
        };
        if !dropped.is_empty() {
            debug!(target: TARGET_SEND, %endpoint, dropped = dropped.len(), "send queue full");
            self.complete_tx(sink, dropped, status);
        }
        Ok(())
    }

    /// 排空端点发送队列，直到信用或总线资源耗尽。
    pub(crate) fn drain(&self, endpoint: EndpointId) {
        let mut state = self.tx.lock();
        let params = {
            let Ok(ep) = state.active(endpoint) else {
                return;
            };
            DrainParams {
                credit_flow: ep.credit_flow,
                pipes: ep.pipes,
                bundle: self.bundle_params(&state, ep),
            }
        };
        let index = endpoint.index();
        {
            let ep = &mut state.endpoints[index];
            ep.tx_process_count += 1;
            if ep.tx_process_count > 1 {
                ep.tx_process_count -= 1;
                trace!(target: TARGET_SEND, %endpoint, "drain already in progress");
                return;
            }
        }
        let mut canceled = None;
        loop {
            if state.stopping {
                break;
            }
            let ep = &mut state.endpoints[index];
            if ep.tx_queue.is_empty() {
                break;
            }
            let batch = if params.credit_flow {
                admission::admit_credit_based(ep, &self.diagnostics, self.bus.as_ref())
            } else {
                let budget = self.resource_budget(&params);
                admission::admit_by_resources(ep, budget, self.bus.as_ref())
            };
            if batch.is_empty() {
                break;
            }
            drop(state);
            if params.pipes.ul_polled {
                self.bus.send_complete_check(params.pipes.ul_pipe, false);
            }
            let outcome = self.issue(endpoint, &params, batch);
            state = self.tx.lock();
            if let Err(stalled) = outcome {
                let ep = &mut state.endpoints[index];
                requeue_front(ep, stalled, self);
                // stop() 可能在总线调用期间清空过队列，退回的包只能在这里取消。
                if state.stopping {
                    let ep = &mut state.endpoints[index];
                    canceled = Some((ep.sink.clone(), mem::take(&mut ep.tx_queue)));
                }
                break;
            }
        }
        state.endpoints[index].tx_process_count -= 1;
        drop(state);
        if let Some((sink, packets)) = canceled {
            debug!(
                target: TARGET_SEND,
                %endpoint,
                count = packets.len(),
                "requeued after stop, canceling"
            );
            self.complete_tx(sink, packets, PacketStatus::Canceled);
        }
    }

    /// 逐个（或按聚合）把已准入的包交给总线；失败时返回尚未提交的包。
    fn issue(
        &self,
        endpoint: EndpointId,
        params: &DrainParams,
        mut batch: PacketQueue,
    ) -> Result<(), PacketQueue> {
        if let Some(bundle) = params.bundle
            && batch.len() >= bundle.min_msgs
        {
            self.issue_bundles(endpoint, params.pipes.ul_pipe, &mut batch, bundle)?;
        }
        while let Some(packet) = batch.pop_front() {
            let header = FrameHeader::new(endpoint, packet.tx.send_flags, packet.len() as u16)
                .with_seq(packet.tx.seq_no)
                .encode();
            let payload = packet.payload().clone();
            let tag = packet.tag();
            let token = self.next_token();
            {
                let mut state = self.tx.lock();
                let ep = &mut state.endpoints[endpoint.index()];
                ep.stats.tx_issued += 1;
                ep.lookup.push_back(InFlight::Single { token, packet });
            }
            let transfer = BusTransfer {
                pipe: params.pipes.ul_pipe,
                endpoint,
                token,
                frame: Frame::Single { header, payload },
            };
            match self.bus.send(transfer) {
                Ok(()) => {
                    bump(&self.diagnostics.counters.bus_sends);
                    if tag == TxTag::RuntimePut {
                        self.bus.pm_runtime_put();
                    }
                }
                Err(error) => {
                    self.note_send_failure(endpoint, &error);
                    let mut state = self.tx.lock();
                    let ep = &mut state.endpoints[endpoint.index()];
                    ep.stats.tx_issued = ep.stats.tx_issued.saturating_sub(1);
                    if let Some((InFlight::Single { packet, .. }, _)) = ep.take_in_flight(token) {
                        batch.push_front(packet);
                    }
                    return Err(batch);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn note_send_failure(&self, endpoint: EndpointId, error: &BusError) {
        bump(&self.diagnostics.counters.bus_send_failures);
        match error {
            BusError::NoResource => {
                debug!(target: TARGET_SEND, %endpoint, "bus out of resources, requeue")
            }
            other => {
                warn!(target: TARGET_SEND, %endpoint, error = %other, "bus send failed, requeue");
                self.events.on_target_failure(&HtcError::Bus(other.clone()));
            }
        }
    }

    /// 聚合发送是否适用于该端点。
    pub(crate) fn bundle_params(&self, state: &TxState, ep: &Endpoint) -> Option<BundleParams> {
        if !self.config.tx_bundle_enabled || ep.id.is_control() || ep.credit_size == 0 {
            return None;
        }
        let max_msgs = self
            .config
            .max_msgs_per_bundle
            .min(state.target.max_msgs_per_bundle);
        if max_msgs < self.config.min_msgs_per_bundle {
            return None;
        }
        let eligible = match self.bus.bus_type() {
            BusType::Usb => true,
            BusType::Sdio => ep.credit_flow,
            BusType::Pcie => false,
        };
        eligible.then_some(BundleParams {
            credit_size: ep.credit_size as usize,
            max_msgs,
            min_msgs: self.config.min_msgs_per_bundle,
        })
    }

    /// 非信用流控端点本轮可准入的包数。
    fn resource_budget(&self, params: &DrainParams) -> usize {
        let free = self.bus.free_transfer_slots(params.pipes.ul_pipe);
        match params.bundle {
            Some(bundle) if self.bus.bus_type() == BusType::Usb && free > 0 => 2 * bundle.max_msgs,
            _ => free,
        }
    }
}

fn batch_endpoint(packets: &PacketQueue) -> Result<EndpointId, HtcError> {
    let first = packets.front().ok_or(HtcError::InvalidArgument {
        reason: "empty packet batch",
    })?;
    let endpoint = first.endpoint();
    if packets.iter().any(|p| p.endpoint() != endpoint) {
        return Err(HtcError::InvalidArgument {
            reason: "packet batch spans several endpoints",
        });
    }
    Ok(endpoint)
}

fn append_to_queue(ep: &mut Endpoint, packets: PacketQueue) {
    ep.stats.tx_posted += packets.len() as u64;
    for mut packet in packets {
        packet.tx.seq_no = ep.next_seq();
        ep.tx_queue.push_back(packet);
    }
}

/// 把未提交的包按原顺序放回队列头部，并退回它们占用的信用与电源保持。
fn requeue_front(ep: &mut Endpoint, stalled: PacketQueue, transport: &HtcTransport) {
    let mut restored = 0;
    for mut packet in stalled.into_iter().rev() {
        restored += packet.reset_admission();
        transport.release_pm_hold(&packet);
        ep.tx_queue.push_front(packet);
    }
    if restored > 0 {
        ep.tx_credits = ep.tx_credits.saturating_add(restored);
        ep.stats.tx_credits_consumed = ep
            .stats
            .tx_credits_consumed
            .saturating_sub(u64::from(restored));
        transport.diagnostics.record(
            CreditEvent::RestoreCredit,
            ep.id,
            ep.tx_credits,
            ep.tx_queue.len(),
        );
    }
}
