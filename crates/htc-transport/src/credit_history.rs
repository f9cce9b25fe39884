//! 信用事件环形记录。
//!
//! # 设计动机（Why）
//! - 信用泄漏类问题往往在长时间运行后才暴露，需要事后能回看最近一段信用变化；
//! - 记录器由传输实例持有，不使用全局状态，多实例互不干扰。
//!
//! # 核心机制（How）
//! - 固定容量的 `Vec` 加写指针，满后覆盖最旧条目；
//! - 追加与导出走同一把锁（由 [`crate::diagnostics::TransportDiagnostics`] 提供），导出得到的序列无缺口、无重复。

use std::fmt;
use std::time::Duration;

use crate::ids::EndpointId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditEvent {
    /// 连接成功时写入初始信用。
    InitialCredit,
    ConsumeCredit,
    /// 余额降到单条最大消息所需信用以下，已向目标请求补充。
    RequestCredit,
    ProcessCreditReport,
    /// 总线发送失败，信用退回。
    RestoreCredit,
}

impl CreditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            CreditEvent::InitialCredit => "INITIAL_CREDIT",
            CreditEvent::ConsumeCredit => "CONSUME_CREDIT",
            CreditEvent::RequestCredit => "REQUEST_CREDIT",
            CreditEvent::ProcessCreditReport => "PROCESS_CREDIT_REPORT",
            CreditEvent::RestoreCredit => "RESTORE_CREDIT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditRecord {
    pub event: CreditEvent,
    pub endpoint: EndpointId,
    /// 相对传输实例创建时刻。
    pub timestamp: Duration,
    pub balance: u32,
    pub queue_depth: usize,
}

impl fmt::Display for CreditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.6} {} credits={} depth={} ep={}",
            self.timestamp.as_secs_f64(),
            self.event.as_str(),
            self.balance,
            self.queue_depth,
            self.endpoint.0
        )
    }
}

pub struct CreditHistory {
    records: Vec<CreditRecord>,
    capacity: usize,
    next: usize,
}

impl CreditHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            next: 0,
        }
    }

    pub fn push(&mut self, record: CreditRecord) {
        if self.records.len() < self.capacity {
            self.records.push(record);
        } else {
            self.records[self.next] = record;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 从最旧到最新的快照。
    pub fn snapshot(&self) -> Vec<CreditRecord> {
        if self.records.len() < self.capacity {
            return self.records.clone();
        }
        let (newer, older) = self.records.split_at(self.next);
        older.iter().chain(newer).copied().collect()
    }
}
