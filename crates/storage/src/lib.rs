//! Windowed append-only stream storage
//!
//! One [`StreamLog`] per stream identifier: an append-only sequence of
//! fixed-capacity blocks holding serialized tuple frames, addressable by a
//! strictly increasing sequence number and tagged with window boundaries.
//! Storage is trimmed from the front once every subscriber has passed a
//! block's end, and can be rewound from a window boundary when a publisher
//! replays after failure.
//!
//! The log is frame-agnostic: entries are opaque [`Bytes`]. Window ids are
//! supplied by the caller alongside boundary entries and kept in a sparse
//! `window id -> sequence` index, monotonic in both dimensions.

mod block;
pub mod error;

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error};

use block::Block;
pub use error::StorageError;

/// Position of an entry within a stream, strictly increasing and contiguous.
pub type Sequence = u64;

/// Sizing knobs for a stream's block log.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Byte budget of one block; the log rolls over to a new block once the
    /// current block's budget is spent
    pub block_capacity: usize,
    /// Maximum retained blocks before appends fail with
    /// [`StorageError::CapacityExceeded`]
    pub max_blocks: usize,
    /// Maximum blocks released by one trim call; the remainder carries over
    pub trim_batch: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            block_capacity: 64 * 1024,
            max_blocks: 1024,
            trim_batch: 8,
        }
    }
}

/// Point-in-time counters for one stream's log.
#[derive(Debug, Clone, Serialize)]
pub struct LogStats {
    /// Oldest sequence still retained
    pub first_retained: Sequence,
    /// Next sequence to be assigned
    pub next_seq: Sequence,
    /// Retained entry count
    pub entries: u64,
    /// Retained bytes
    pub bytes: u64,
    /// Retained block count
    pub blocks: usize,
    /// First window the stream ever recorded
    pub first_window: Option<u64>,
    /// Last window recorded (rewound by reset)
    pub last_window: Option<u64>,
}

/// Append-only block log for one stream.
#[derive(Debug)]
pub struct StreamLog {
    config: StorageConfig,
    blocks: VecDeque<Block>,
    /// Next sequence to assign
    next_seq: Sequence,
    /// Sequence of the oldest retained entry; equals `next_seq` when empty
    first_retained: Sequence,
    /// Sparse window id -> boundary sequence, monotonic in both dimensions
    window_index: BTreeMap<u64, Sequence>,
    /// First window ever recorded; survives trimming, cleared by a reset
    /// that discards the whole history
    first_window: Option<u64>,
    /// Last window recorded; rewound by reset
    last_window: Option<u64>,
    /// Carry-over watermark for amortized trims
    pending_trim: Sequence,
    total_bytes: usize,
}

impl StreamLog {
    /// Create an empty log.
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            blocks: VecDeque::new(),
            next_seq: 0,
            first_retained: 0,
            window_index: BTreeMap::new(),
            first_window: None,
            last_window: None,
            pending_trim: 0,
            total_bytes: 0,
        }
    }

    /// Next sequence to be assigned.
    pub fn next_seq(&self) -> Sequence {
        self.next_seq
    }

    /// Oldest sequence still retained.
    pub fn first_retained(&self) -> Sequence {
        self.first_retained
    }

    /// Append one frame, returning its sequence.
    pub fn append(&mut self, frame: Bytes) -> Result<Sequence, StorageError> {
        self.ensure_block()?;
        let len = frame.len();
        let block = self.blocks.back_mut().expect("ensure_block leaves a block");
        let seq = block.push(frame);
        debug_assert_eq!(seq, self.next_seq);
        self.next_seq = seq + 1;
        self.total_bytes += len;
        Ok(seq)
    }

    /// Append a window boundary frame and index it under `window_id`.
    ///
    /// Window ids must be strictly increasing; a violation is rejected
    /// without appending.
    pub fn append_boundary(
        &mut self,
        window_id: u64,
        frame: Bytes,
    ) -> Result<Sequence, StorageError> {
        if let Some(last) = self.last_window {
            if window_id <= last {
                return Err(StorageError::NonMonotonicWindow { window_id, last });
            }
        }
        let seq = self.append(frame)?;
        self.window_index.insert(window_id, seq);
        self.blocks
            .back_mut()
            .expect("append leaves a block")
            .record_window(window_id, seq);
        self.first_window.get_or_insert(window_id);
        self.last_window = Some(window_id);
        Ok(seq)
    }

    /// Read up to `max` entries at or after `from`.
    ///
    /// The result is a snapshot; the caller re-polls after being notified of
    /// new appends. Entry clones are refcounted views, never byte copies.
    pub fn read_batch(&self, from: Sequence, max: usize) -> Vec<(Sequence, Bytes)> {
        let mut out = Vec::new();
        if max == 0 {
            return out;
        }
        let from = from.max(self.first_retained);
        let start = self.blocks.partition_point(|block| block.end_seq() <= from);
        for block in self.blocks.iter().skip(start) {
            let mut seq = from.max(block.base_seq());
            while let Some(entry) = block.get(seq) {
                out.push((seq, entry.clone()));
                if out.len() == max {
                    return out;
                }
                seq += 1;
            }
        }
        out
    }

    /// Resolve a starting window id to a sequence.
    ///
    /// Resolution is to the nearest indexed boundary at or after the
    /// requested window. A window older than the stream's history joins from
    /// the earliest retained boundary; a window not yet published waits at
    /// the append position; a window whose backlog is gone (trimmed or reset
    /// away) is stale and the caller must re-register.
    pub fn resolve_window(&self, window_id: u64) -> Result<Sequence, StorageError> {
        let Some(first_window) = self.first_window else {
            return Ok(self.first_retained);
        };
        if window_id < first_window {
            return match self.window_index.values().next() {
                Some(&seq) => Ok(seq),
                None => Err(StorageError::StaleWindow {
                    requested: window_id,
                }),
            };
        }
        let Some(last_window) = self.last_window else {
            return Ok(self.next_seq);
        };
        if window_id > last_window {
            return Ok(self.next_seq);
        }
        match self.window_index.range(window_id..).next() {
            Some((_, &seq)) => {
                let oldest = *self
                    .window_index
                    .keys()
                    .next()
                    .expect("range matched, index is non-empty");
                if window_id < oldest {
                    Err(StorageError::StaleWindow {
                        requested: window_id,
                    })
                } else {
                    Ok(seq)
                }
            }
            None => Err(StorageError::StaleWindow {
                requested: window_id,
            }),
        }
    }

    /// Sequence below which everything belongs to windows at or before
    /// `through_window`; used to honor explicit purge requests.
    pub fn purge_boundary(&self, through_window: u64) -> Sequence {
        match self
            .window_index
            .range((Bound::Excluded(through_window), Bound::Unbounded))
            .next()
        {
            Some((_, &seq)) => seq,
            None => {
                if self.last_window.is_some_and(|last| last <= through_window) {
                    self.next_seq
                } else {
                    self.first_retained
                }
            }
        }
    }

    /// Release whole blocks strictly below `watermark`, at most `trim_batch`
    /// per call; the rest is carried to the next call. Never releases a
    /// partially covered block. Returns the number of blocks released.
    pub fn trim_below(&mut self, watermark: Sequence) -> usize {
        if watermark > self.next_seq {
            // registry invariant violation; clamp and complain
            error!(
                watermark,
                next_seq = self.next_seq,
                "trim watermark beyond append position"
            );
            self.pending_trim = self.pending_trim.max(self.next_seq);
        } else {
            self.pending_trim = self.pending_trim.max(watermark);
        }

        let mut released = 0;
        while released < self.config.trim_batch {
            let Some(front) = self.blocks.front() else {
                break;
            };
            if front.entry_count() == 0 || front.end_seq() > self.pending_trim {
                break;
            }
            let block = self.blocks.pop_front().expect("front checked above");
            for &(window_id, _) in block.windows() {
                self.window_index.remove(&window_id);
            }
            self.total_bytes -= block.bytes();
            released += 1;
        }
        self.first_retained = self
            .blocks
            .front()
            .map_or(self.next_seq, |block| block.base_seq());
        if released > 0 {
            debug!(
                released,
                first_retained = self.first_retained,
                "trimmed blocks below watermark"
            );
        }
        released
    }

    /// Discard everything at or after the first boundary of `from_window`
    /// and rewind the append cursor to that point. Returns the new end
    /// sequence. Subscriber cursors past the new end must be invalidated by
    /// the caller.
    pub fn reset(&mut self, from_window: u64) -> Result<Sequence, StorageError> {
        let boundary = self
            .window_index
            .range(from_window..)
            .next()
            .map(|(_, &seq)| seq);
        if let Some(cut) = boundary {
            while self
                .blocks
                .back()
                .is_some_and(|block| block.base_seq() >= cut)
            {
                let block = self.blocks.pop_back().expect("back checked above");
                for &(window_id, _) in block.windows() {
                    self.window_index.remove(&window_id);
                }
                self.total_bytes -= block.bytes();
            }
            if let Some(back) = self.blocks.back_mut() {
                self.total_bytes -= back.truncate_from(cut);
            }
            self.window_index.retain(|_, &mut seq| seq < cut);
            self.next_seq = cut;
            self.first_retained = self
                .blocks
                .front()
                .map_or(self.next_seq, |block| block.base_seq());
            self.pending_trim = self.pending_trim.min(self.next_seq);
            debug!(from_window, end = self.next_seq, "log rewound");
        }
        self.rewind_history(from_window);
        Ok(self.next_seq)
    }

    /// Rewind window bookkeeping so the publisher can re-record windows from
    /// `from_window` onward.
    fn rewind_history(&mut self, from_window: u64) {
        let Some(last) = self.last_window else {
            return;
        };
        if from_window > last {
            return;
        }
        self.last_window = self.window_index.keys().next_back().copied();
        if self.last_window.is_none() {
            match self.first_window {
                Some(first) if from_window > first => self.last_window = Some(from_window - 1),
                _ => {
                    self.first_window = None;
                    self.last_window = None;
                }
            }
        }
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> LogStats {
        LogStats {
            first_retained: self.first_retained,
            next_seq: self.next_seq,
            entries: self
                .blocks
                .iter()
                .map(|block| block.entry_count() as u64)
                .sum(),
            bytes: self.total_bytes as u64,
            blocks: self.blocks.len(),
            first_window: self.first_window,
            last_window: self.last_window,
        }
    }

    fn ensure_block(&mut self) -> Result<(), StorageError> {
        let needs_new = match self.blocks.back() {
            Some(block) => block.is_full(self.config.block_capacity),
            None => true,
        };
        if needs_new {
            if self.blocks.len() >= self.config.max_blocks {
                return Err(StorageError::CapacityExceeded {
                    blocks: self.blocks.len(),
                });
            }
            self.blocks.push_back(Block::new(self.next_seq));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_log() -> StreamLog {
        StreamLog::new(StorageConfig {
            block_capacity: 8,
            max_blocks: 4,
            trim_batch: 2,
        })
    }

    fn frame(tag: u8, len: usize) -> Bytes {
        Bytes::from(vec![tag; len])
    }

    #[test]
    fn test_append_assigns_contiguous_sequences() {
        let mut log = small_log();
        for expected in 0..10u64 {
            assert_eq!(log.append(frame(1, 3)).unwrap(), expected);
        }
        assert_eq!(log.next_seq(), 10);
        assert_eq!(log.first_retained(), 0);
    }

    #[test]
    fn test_read_batch_preserves_append_order_across_blocks() {
        let mut log = small_log();
        for tag in 0..7u8 {
            log.append(frame(tag, 4)).unwrap();
        }
        // capacity 8 with 4-byte frames: two entries per block
        assert!(log.stats().blocks > 1);
        let all = log.read_batch(0, usize::MAX);
        assert_eq!(all.len(), 7);
        for (i, (seq, entry)) in all.iter().enumerate() {
            assert_eq!(*seq, i as u64);
            assert_eq!(entry[0], i as u8);
        }
        let tail = log.read_batch(5, 2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].0, 5);
        assert_eq!(tail[1].0, 6);
    }

    #[test]
    fn test_capacity_exceeded_preserves_data() {
        let mut log = small_log();
        let mut appended = 0;
        let err = loop {
            match log.append(frame(9, 8)) {
                Ok(_) => appended += 1,
                Err(err) => break err,
            }
        };
        assert!(matches!(err, StorageError::CapacityExceeded { blocks: 4 }));
        assert_eq!(log.read_batch(0, usize::MAX).len(), appended);
    }

    #[test]
    fn test_trim_is_amortized_and_respects_partial_blocks() {
        let mut log = StreamLog::new(StorageConfig {
            block_capacity: 8,
            max_blocks: 16,
            trim_batch: 2,
        });
        for _ in 0..7 {
            log.append(frame(0, 8)).unwrap(); // one entry per block at capacity 8
        }
        // watermark 6 covers six whole blocks; trim_batch is 2
        assert_eq!(log.trim_below(6), 2);
        assert_eq!(log.first_retained(), 2);
        // the carry-over finishes without restating the watermark
        assert_eq!(log.trim_below(0), 2);
        assert_eq!(log.trim_below(0), 2);
        assert_eq!(log.first_retained(), 6);
        // entry 6 is at the watermark, never below it
        assert_eq!(log.trim_below(6), 0);
        assert_eq!(log.read_batch(0, usize::MAX).len(), 1);
    }

    #[test]
    fn test_trim_clamps_watermark_beyond_append_position() {
        let mut log = small_log();
        log.append(frame(0, 8)).unwrap();
        log.append(frame(0, 8)).unwrap();
        log.trim_below(u64::MAX);
        assert_eq!(log.first_retained(), 2);
        assert_eq!(log.next_seq(), 2);
        // appends continue normally afterwards
        assert_eq!(log.append(frame(0, 1)).unwrap(), 2);
    }

    #[test]
    fn test_window_resolution_nearest_at_or_after() {
        let mut log = StreamLog::new(StorageConfig::default());
        log.append_boundary(2, frame(2, 4)).unwrap();
        log.append(frame(0, 4)).unwrap();
        log.append_boundary(4, frame(4, 4)).unwrap();
        log.append(frame(0, 4)).unwrap();

        assert_eq!(log.resolve_window(2).unwrap(), 0);
        // window 3 was never recorded; the nearest boundary after it serves
        assert_eq!(log.resolve_window(3).unwrap(), 2);
        assert_eq!(log.resolve_window(4).unwrap(), 2);
        // window 1 predates the stream; join from the earliest boundary
        assert_eq!(log.resolve_window(1).unwrap(), 0);
        // window 9 has not been published; wait at the tail
        assert_eq!(log.resolve_window(9).unwrap(), log.next_seq());
    }

    #[test]
    fn test_window_resolution_empty_log() {
        let log = StreamLog::new(StorageConfig::default());
        assert_eq!(log.resolve_window(1).unwrap(), 0);
    }

    #[test]
    fn test_trimmed_window_is_stale() {
        let mut log = small_log();
        for window in 1..=4u64 {
            log.append_boundary(window, frame(window as u8, 8)).unwrap();
        }
        log.trim_below(2);
        assert!(matches!(
            log.resolve_window(1),
            Err(StorageError::StaleWindow { requested: 1 })
        ));
        assert_eq!(log.resolve_window(3).unwrap(), 2);
    }

    #[test]
    fn test_non_monotonic_window_rejected() {
        let mut log = StreamLog::new(StorageConfig::default());
        log.append_boundary(5, frame(5, 2)).unwrap();
        let err = log.append_boundary(5, frame(5, 2)).unwrap_err();
        assert!(matches!(
            err,
            StorageError::NonMonotonicWindow {
                window_id: 5,
                last: 5
            }
        ));
        assert!(log.append_boundary(4, frame(4, 2)).is_err());
        // the rejected boundary was not appended
        assert_eq!(log.next_seq(), 1);
    }

    #[test]
    fn test_reset_discards_from_boundary_and_rewinds() {
        let mut log = StreamLog::new(StorageConfig::default());
        log.append_boundary(1, frame(1, 2)).unwrap();
        log.append(frame(0x10, 2)).unwrap();
        log.append_boundary(2, frame(2, 2)).unwrap();
        log.append(frame(0x20, 2)).unwrap();
        log.append_boundary(3, frame(3, 2)).unwrap();
        log.append(frame(0x30, 2)).unwrap();

        let end = log.reset(2).unwrap();
        assert_eq!(end, 2);
        assert_eq!(log.next_seq(), 2);
        let remaining = log.read_batch(0, usize::MAX);
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[1].1[0], 0x10);

        // windows 2 and 3 can be recorded again, with fresh bytes
        log.append_boundary(2, frame(0x22, 2)).unwrap();
        let replayed = log.read_batch(2, usize::MAX);
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].0, 2);
        assert_eq!(replayed[0].1[0], 0x22);
    }

    #[test]
    fn test_reset_after_full_trim_keeps_history_stale() {
        let mut log = small_log();
        for window in 1..=3u64 {
            log.append_boundary(window, frame(window as u8, 8)).unwrap();
        }
        log.trim_below(log.next_seq());
        log.trim_below(log.next_seq());
        assert_eq!(log.first_retained(), log.next_seq());

        let end = log.reset(2).unwrap();
        assert_eq!(end, 3);
        // window 2 may be republished after the reset
        log.append_boundary(2, frame(0x22, 8)).unwrap();
        // window 1 predates the reset point and its data is gone
        assert!(matches!(
            log.resolve_window(1),
            Err(StorageError::StaleWindow { requested: 1 })
        ));
        assert_eq!(log.resolve_window(2).unwrap(), 3);
    }

    #[test]
    fn test_reset_to_future_window_is_noop() {
        let mut log = StreamLog::new(StorageConfig::default());
        log.append_boundary(1, frame(1, 2)).unwrap();
        log.append(frame(0, 2)).unwrap();
        let end = log.reset(9).unwrap();
        assert_eq!(end, 2);
        assert_eq!(log.read_batch(0, usize::MAX).len(), 2);
        // history is untouched: window 2 is still the next legal boundary
        log.append_boundary(2, frame(2, 2)).unwrap();
    }

    #[test]
    fn test_reset_to_first_window_clears_history() {
        let mut log = StreamLog::new(StorageConfig::default());
        log.append_boundary(3, frame(3, 2)).unwrap();
        log.append(frame(0, 2)).unwrap();
        log.reset(3).unwrap();
        assert_eq!(log.next_seq(), 0);
        let stats = log.stats();
        assert_eq!(stats.first_window, None);
        assert_eq!(stats.last_window, None);
        // any window may start the stream again
        log.append_boundary(1, frame(1, 2)).unwrap();
    }

    #[test]
    fn test_purge_boundary() {
        let mut log = StreamLog::new(StorageConfig::default());
        log.append_boundary(1, frame(1, 2)).unwrap();
        log.append(frame(0, 2)).unwrap();
        log.append_boundary(2, frame(2, 2)).unwrap();
        log.append(frame(0, 2)).unwrap();

        // everything before window 2's boundary belongs to window 1
        assert_eq!(log.purge_boundary(1), 2);
        // the stream ends inside window 2, so purging through it covers all
        assert_eq!(log.purge_boundary(2), log.next_seq());
        assert_eq!(log.purge_boundary(0), log.first_retained());
    }

    #[test]
    fn test_stats_track_retained_bytes() {
        let mut log = small_log();
        log.append(frame(0, 8)).unwrap();
        log.append(frame(0, 8)).unwrap();
        assert_eq!(log.stats().bytes, 16);
        log.trim_below(1);
        let stats = log.stats();
        assert_eq!(stats.bytes, 8);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.first_retained, 1);
    }
}
