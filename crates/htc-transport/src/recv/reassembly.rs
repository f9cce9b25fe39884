//! 接收分段重组。
//!
//! 某些总线会把一帧拆成多段上报。首段帧头声明的长度决定期望总长，
//! 后续分段依次追加，累计恰好等于期望值时产出完整帧；超出即视为协议错误并丢弃整帧。

use bytes::{Bytes, BytesMut};

use crate::wire::{FrameHeader, HTC_HDR_LENGTH, WireError};

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Complete(Bytes),
    Pending,
    Dropped(WireError),
}

#[derive(Debug, Default)]
pub(crate) struct Reassembly {
    buffer: BytesMut,
    expected: usize,
    in_progress: bool,
}

impl Reassembly {
    /// 推入一个接收分段。`enabled` 为假时短帧直接判为截断。
    ///
    /// 首段不足一个帧头时先缓存，凑满帧头后才能读出期望总长；`expected == 0` 表示帧头尚未凑齐。
    pub(crate) fn push(&mut self, segment: Bytes, enabled: bool) -> Step {
        if !self.in_progress {
            if enabled && segment.len() < HTC_HDR_LENGTH {
                self.begin(&segment, 0);
                return Step::Pending;
            }
            let header = match FrameHeader::decode(&segment) {
                Ok(header) => header,
                Err(error) => return Step::Dropped(error),
            };
            let expected = header.frame_len();
            if segment.len() >= expected {
                return Step::Complete(segment);
            }
            if !enabled {
                return Step::Dropped(WireError::Truncated {
                    needed: expected,
                    available: segment.len(),
                });
            }
            self.begin(&segment, expected);
            return Step::Pending;
        }

        self.buffer.extend_from_slice(&segment);
        if self.expected == 0 {
            if self.buffer.len() < HTC_HDR_LENGTH {
                return Step::Pending;
            }
            match FrameHeader::decode(&self.buffer) {
                Ok(header) => self.expected = header.frame_len(),
                Err(error) => {
                    self.reset();
                    return Step::Dropped(error);
                }
            }
        }
        let received = self.buffer.len();
        if received == self.expected {
            self.in_progress = false;
            self.expected = 0;
            return Step::Complete(self.buffer.split().freeze());
        }
        if received > self.expected {
            let expected = self.expected;
            self.reset();
            return Step::Dropped(WireError::Truncated {
                needed: expected,
                available: received,
            });
        }
        Step::Pending
    }

    fn begin(&mut self, segment: &[u8], expected: usize) {
        self.buffer.clear();
        self.buffer.reserve(expected.max(HTC_HDR_LENGTH));
        self.buffer.extend_from_slice(segment);
        self.expected = expected;
        self.in_progress = true;
    }

    pub(crate) fn reset(&mut self) {
        self.buffer.clear();
        self.expected = 0;
        self.in_progress = false;
    }

    pub(crate) fn in_progress(&self) -> bool {
        self.in_progress
    }
}
