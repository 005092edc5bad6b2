//! Fixed-capacity entry blocks

use bytes::Bytes;

use crate::Sequence;

/// One contiguous run of stored frames plus the window boundaries that fall
/// inside it. Blocks are released whole once every cursor has passed their
/// end, and never split.
#[derive(Debug)]
pub(crate) struct Block {
    /// Sequence of the first entry in this block
    base_seq: Sequence,
    /// Stored frames, in append order
    entries: Vec<Bytes>,
    /// Bytes accumulated across entries
    bytes: usize,
    /// Window boundaries recorded in this block: (window id, sequence)
    windows: Vec<(u64, Sequence)>,
}

impl Block {
    pub(crate) fn new(base_seq: Sequence) -> Self {
        Self {
            base_seq,
            entries: Vec::new(),
            bytes: 0,
            windows: Vec::new(),
        }
    }

    pub(crate) fn base_seq(&self) -> Sequence {
        self.base_seq
    }

    /// Sequence one past the last entry
    pub(crate) fn end_seq(&self) -> Sequence {
        self.base_seq + self.entries.len() as u64
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// A block is full once its byte budget is spent. It always accepts at
    /// least one entry, so an oversized frame occupies a block of its own.
    pub(crate) fn is_full(&self, capacity: usize) -> bool {
        !self.entries.is_empty() && self.bytes >= capacity
    }

    pub(crate) fn push(&mut self, frame: Bytes) -> Sequence {
        let seq = self.end_seq();
        self.bytes += frame.len();
        self.entries.push(frame);
        seq
    }

    pub(crate) fn record_window(&mut self, window_id: u64, seq: Sequence) {
        self.windows.push((window_id, seq));
    }

    pub(crate) fn windows(&self) -> &[(u64, Sequence)] {
        &self.windows
    }

    pub(crate) fn get(&self, seq: Sequence) -> Option<&Bytes> {
        if seq < self.base_seq {
            return None;
        }
        self.entries.get((seq - self.base_seq) as usize)
    }

    /// Drop every entry at or after `seq`, returning the bytes released.
    pub(crate) fn truncate_from(&mut self, seq: Sequence) -> usize {
        if seq >= self.end_seq() {
            return 0;
        }
        let keep = seq.saturating_sub(self.base_seq) as usize;
        let released: usize = self.entries[keep..].iter().map(Bytes::len).sum();
        self.entries.truncate(keep);
        self.bytes -= released;
        self.windows.retain(|&(_, s)| s < seq);
        released
    }
}
