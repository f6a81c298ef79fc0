//! Bounded, non-blocking output queue toward the host transport.
//!
//! Mode loops push fixed-size records and never wait: when the queue is
//! full the record is dropped and the overflow status bit is carried into
//! the next record that does fit. Draining is the embedding's job.

use heapless::Deque;

use crate::capture::BUF_LEN;

/// Queue depth in records.
pub const QUEUE_DEPTH: usize = 8;

// Status bits carried per record.
pub const STATUS_DMA_OVERFLOW: u8 = 0x01;
pub const STATUS_DMA_ERROR: u8 = 0x02;
pub const STATUS_FIFO_OVERFLOW: u8 = 0x04;
pub const STATUS_CS_TRIGGER: u8 = 0x08;
pub const STATUS_RSSI_TRIGGER: u8 = 0x10;
pub const STATUS_DISCARD: u8 = 0x20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecordKind {
    BrPacket,
    LePacket,
    LePromisc,
    Specan,
    Ego,
}

/// One capture record. Same shape for every kind; `data` holds raw symbol
/// bytes for packet kinds and (frequency, rssi) triples for spectrum kinds.
/// `channel` is the offset from 2402 MHz.
#[derive(Clone, Copy, Debug)]
pub struct OutputRecord {
    pub kind: RecordKind,
    pub status: u8,
    pub channel: u8,
    pub clkn_high: u8,
    pub clk100ns: u32,
    pub rssi_max: i8,
    pub rssi_min: i8,
    pub rssi_avg: i8,
    pub rssi_count: u8,
    pub data: [u8; BUF_LEN],
}

impl OutputRecord {
    pub fn empty(kind: RecordKind) -> OutputRecord {
        OutputRecord {
            kind,
            status: 0,
            channel: 0,
            clkn_high: 0,
            clk100ns: 0,
            rssi_max: 0,
            rssi_min: 0,
            rssi_avg: 0,
            rssi_count: 0,
            data: [0; BUF_LEN],
        }
    }
}

pub struct OutputQueue {
    records: Deque<OutputRecord, QUEUE_DEPTH>,
}

impl OutputQueue {
    pub fn new() -> OutputQueue {
        OutputQueue {
            records: Deque::new(),
        }
    }

    /// Push a record, folding the accumulated `status` bits into it. On a
    /// full queue the record is dropped and `status` keeps its bits plus
    /// the overflow flag, to be reported by whichever record next fits.
    pub fn push(&mut self, mut record: OutputRecord, status: &mut u8) -> bool {
        if self.records.is_full() {
            *status |= STATUS_FIFO_OVERFLOW;
            return false;
        }
        record.status = *status;
        *status = 0;
        // Cannot fail, fullness checked above.
        let _ = self.records.push_back(record);
        true
    }

    pub fn pop(&mut self) -> Option<OutputRecord> {
        self.records.pop_front()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_sets_bit_and_bounds_length() {
        let mut q = OutputQueue::new();
        let mut status = 0u8;
        for _ in 0..QUEUE_DEPTH {
            assert!(q.push(OutputRecord::empty(RecordKind::LePacket), &mut status));
        }
        assert_eq!(q.len(), QUEUE_DEPTH);
        assert_eq!(status, 0);

        // The next two are dropped, length stays bounded.
        assert!(!q.push(OutputRecord::empty(RecordKind::LePacket), &mut status));
        assert!(!q.push(OutputRecord::empty(RecordKind::LePacket), &mut status));
        assert_eq!(q.len(), QUEUE_DEPTH);
        assert_eq!(status, STATUS_FIFO_OVERFLOW);

        // Drain one, and the overflow bit rides on the next accepted record.
        q.pop();
        assert!(q.push(OutputRecord::empty(RecordKind::LePacket), &mut status));
        assert_eq!(status, 0);
        let mut last = None;
        while let Some(r) = q.pop() {
            last = Some(r);
        }
        assert_eq!(
            last.map(|r| r.status),
            Some(STATUS_FIFO_OVERFLOW)
        );
    }

    #[test]
    fn status_is_consumed_by_first_record() {
        let mut q = OutputQueue::new();
        let mut status = STATUS_CS_TRIGGER | STATUS_DISCARD;
        q.push(OutputRecord::empty(RecordKind::BrPacket), &mut status);
        q.push(OutputRecord::empty(RecordKind::BrPacket), &mut status);
        let first = q.pop().map(|r| r.status);
        let second = q.pop().map(|r| r.status);
        assert_eq!(first, Some(STATUS_CS_TRIGGER | STATUS_DISCARD));
        assert_eq!(second, Some(0));
    }
}
