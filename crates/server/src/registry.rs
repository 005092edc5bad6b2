//! Session registry and purge coordination
//!
//! Process-wide map from stream identifier to its storage, active publisher
//! and subscriber cursors. Each stream's state sits behind its own lock so
//! sessions on different streams never contend; the lock is never held
//! across an await point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use relay_storage::{LogStats, Sequence, StorageConfig, StorageError, StreamLog};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ServerError;

/// Live publisher slot for a stream. A newer registration cancels the token
/// and bumps the epoch; appends carry the epoch and are rejected once it is
/// stale, so two publishers can never interleave.
#[derive(Debug)]
struct PublisherSlot {
    epoch: u64,
    cancel: CancellationToken,
}

/// Per-subscriber read position.
#[derive(Debug)]
struct Cursor {
    sequence: Sequence,
    /// Set when a reset discarded data this cursor had already passed; the
    /// session reports it and the subscriber must re-register
    stale: bool,
}

struct EntryInner {
    log: StreamLog,
    publisher: Option<PublisherSlot>,
    next_epoch: u64,
    cursors: HashMap<Uuid, Cursor>,
    /// Whether any subscriber ever registered; drives the retention policy
    /// for streams with no remaining cursors
    had_subscriber: bool,
    last_activity: Instant,
}

impl EntryInner {
    /// Minimum acknowledged position across live cursors, or the append
    /// position once every subscriber has come and gone. `None` while no
    /// subscriber has ever registered: such backlog is retained in full so a
    /// late subscriber can still start at an older window.
    fn watermark(&self) -> Option<Sequence> {
        let live = self
            .cursors
            .values()
            .filter(|cursor| !cursor.stale)
            .map(|cursor| cursor.sequence)
            .min();
        match live {
            Some(seq) => Some(seq),
            None if self.had_subscriber => Some(self.log.next_seq()),
            None => None,
        }
    }

    fn check_epoch(&self, epoch: u64, identifier: &str) -> Result<(), ServerError> {
        match &self.publisher {
            Some(slot) if slot.epoch == epoch => Ok(()),
            _ => Err(ServerError::FencedOut {
                identifier: identifier.to_string(),
            }),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// One registered stream: storage, publisher slot and subscriber cursors
/// behind a single lock, plus the edge-triggered wake for subscribers.
pub struct StreamEntry {
    identifier: String,
    inner: Mutex<EntryInner>,
    /// Woken on every append and on reset; subscribers arm a waiter before
    /// checking for data, so wakes are never missed
    data_available: Notify,
}

impl StreamEntry {
    fn new(identifier: String, storage: StorageConfig) -> Self {
        Self {
            identifier,
            inner: Mutex::new(EntryInner {
                log: StreamLog::new(storage),
                publisher: None,
                next_epoch: 0,
                cursors: HashMap::new(),
                had_subscriber: false,
                last_activity: Instant::now(),
            }),
            data_available: Notify::new(),
        }
    }

    /// Stream identifier this entry serves.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Arm a waiter for the next append. Must be created before checking
    /// for data to avoid missing the wake.
    pub fn data_available(&self) -> &Notify {
        &self.data_available
    }

    /// Append an opaque frame on behalf of the publisher holding `epoch`.
    pub fn append(&self, epoch: u64, frame: Bytes) -> Result<Sequence, ServerError> {
        let seq = {
            let mut inner = self.inner.lock();
            inner.check_epoch(epoch, &self.identifier)?;
            let seq = inner.log.append(frame)?;
            inner.touch();
            seq
        };
        self.data_available.notify_waiters();
        Ok(seq)
    }

    /// Append a begin-window boundary frame and index it.
    pub fn append_boundary(
        &self,
        epoch: u64,
        window_id: u64,
        frame: Bytes,
    ) -> Result<Sequence, ServerError> {
        let seq = {
            let mut inner = self.inner.lock();
            inner.check_epoch(epoch, &self.identifier)?;
            let seq = inner.log.append_boundary(window_id, frame)?;
            inner.touch();
            seq
        };
        self.data_available.notify_waiters();
        Ok(seq)
    }

    /// Snapshot up to `max` entries at/after `from` for a cursor, or its
    /// stale flag if a reset invalidated it.
    pub fn read_for(
        &self,
        cursor_id: Uuid,
        from: Sequence,
        max: usize,
    ) -> Result<Vec<(Sequence, Bytes)>, ServerError> {
        let inner = self.inner.lock();
        match inner.cursors.get(&cursor_id) {
            Some(cursor) if cursor.stale => Err(ServerError::StaleCursor {
                identifier: self.identifier.clone(),
                detail: "position invalidated by a stream reset".to_string(),
            }),
            Some(_) => Ok(inner.log.read_batch(from, max)),
            None => Err(ServerError::OutboundClosed),
        }
    }

    /// Record a cursor's progress and trim below the new watermark.
    pub fn advance_cursor(&self, cursor_id: Uuid, sequence: Sequence) {
        let mut inner = self.inner.lock();
        if let Some(cursor) = inner.cursors.get_mut(&cursor_id) {
            cursor.sequence = sequence;
        }
        inner.touch();
        if let Some(watermark) = inner.watermark() {
            inner.log.trim_below(watermark);
        }
    }

    /// Current log counters plus session counts.
    pub fn stats(&self) -> StreamStatsSnapshot {
        let inner = self.inner.lock();
        StreamStatsSnapshot {
            identifier: self.identifier.clone(),
            log: inner.log.stats(),
            subscribers: inner.cursors.len(),
            has_publisher: inner.publisher.is_some(),
        }
    }
}

/// Point-in-time view of one stream, for operators and tests.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamStatsSnapshot {
    /// Stream identifier
    pub identifier: String,
    /// Storage counters
    pub log: LogStats,
    /// Live subscriber cursors
    pub subscribers: usize,
    /// Whether a publisher is currently registered
    pub has_publisher: bool,
}

/// Outcome of a publisher registration: the entry, the fencing epoch and the
/// token cancelled if a newer publisher supersedes this one.
pub struct PublisherRegistration {
    /// Stream entry the publisher appends to
    pub entry: Arc<StreamEntry>,
    /// Epoch carried by this publisher's appends
    pub epoch: u64,
    /// Cancelled when a newer registration fences this one out
    pub fenced: CancellationToken,
}

/// Outcome of a subscriber registration.
pub struct SubscriberRegistration {
    /// Stream entry the subscriber drains
    pub entry: Arc<StreamEntry>,
    /// Cursor handle
    pub cursor_id: Uuid,
    /// Resolved starting sequence
    pub start: Sequence,
}

/// Process-wide stream registry and purge coordinator.
pub struct StreamRegistry {
    entries: DashMap<String, Arc<StreamEntry>>,
    storage: StorageConfig,
}

impl StreamRegistry {
    /// Create an empty registry.
    pub fn new(storage: StorageConfig) -> Self {
        Self {
            entries: DashMap::new(),
            storage,
        }
    }

    fn entry(&self, identifier: &str) -> Arc<StreamEntry> {
        self.entries
            .entry(identifier.to_string())
            .or_insert_with(|| {
                debug!(identifier, "creating stream entry");
                Arc::new(StreamEntry::new(
                    identifier.to_string(),
                    self.storage.clone(),
                ))
            })
            .value()
            .clone()
    }

    /// Look up an existing stream.
    pub fn get(&self, identifier: &str) -> Option<Arc<StreamEntry>> {
        self.entries.get(identifier).map(|entry| entry.value().clone())
    }

    /// Register a publisher, fencing out any prior one for the identifier.
    ///
    /// The old session's token is cancelled and the epoch bumped under the
    /// entry lock, so the old publisher cannot append once this returns.
    pub fn register_publisher(&self, identifier: &str) -> PublisherRegistration {
        let entry = self.entry(identifier);
        let (epoch, fenced) = {
            let mut inner = entry.inner.lock();
            if let Some(old) = inner.publisher.take() {
                // expected during failover when a restarted container
                // re-registers before the old transport dies
                info!(identifier, old_epoch = old.epoch, "fencing out stale publisher");
                old.cancel.cancel();
            }
            let epoch = inner.next_epoch;
            inner.next_epoch += 1;
            let fenced = CancellationToken::new();
            inner.publisher = Some(PublisherSlot {
                epoch,
                cancel: fenced.clone(),
            });
            inner.touch();
            (epoch, fenced)
        };
        debug!(identifier, epoch, "publisher registered");
        PublisherRegistration {
            entry,
            epoch,
            fenced,
        }
    }

    /// Release a publisher slot if it is still the registered one.
    pub fn unregister_publisher(&self, identifier: &str, epoch: u64) {
        if let Some(entry) = self.get(identifier) {
            let mut inner = entry.inner.lock();
            if inner
                .publisher
                .as_ref()
                .is_some_and(|slot| slot.epoch == epoch)
            {
                inner.publisher = None;
                inner.touch();
                debug!(identifier, epoch, "publisher unregistered");
            }
        }
    }

    /// Register a subscriber starting at `starting_window_id`.
    pub fn register_subscriber(
        &self,
        identifier: &str,
        starting_window_id: u64,
    ) -> Result<SubscriberRegistration, ServerError> {
        let entry = self.entry(identifier);
        let (cursor_id, start) = {
            let mut inner = entry.inner.lock();
            let start = inner.log.resolve_window(starting_window_id).map_err(
                |err| match err {
                    StorageError::StaleWindow { requested } => ServerError::StaleCursor {
                        identifier: identifier.to_string(),
                        detail: format!("window {requested} is no longer replayable"),
                    },
                    other => ServerError::Storage(other),
                },
            )?;
            let cursor_id = Uuid::new_v4();
            inner.cursors.insert(
                cursor_id,
                Cursor {
                    sequence: start,
                    stale: false,
                },
            );
            inner.had_subscriber = true;
            inner.touch();
            (cursor_id, start)
        };
        debug!(identifier, %cursor_id, start, "subscriber registered");
        Ok(SubscriberRegistration {
            entry,
            cursor_id,
            start,
        })
    }

    /// Drop a cursor and trim below the recomputed watermark.
    pub fn unregister_subscriber(&self, identifier: &str, cursor_id: Uuid) {
        if let Some(entry) = self.get(identifier) {
            let mut inner = entry.inner.lock();
            inner.cursors.remove(&cursor_id);
            inner.touch();
            if let Some(watermark) = inner.watermark() {
                inner.log.trim_below(watermark);
            }
            debug!(identifier, %cursor_id, "subscriber unregistered");
        }
    }

    /// Honor an explicit purge request: trim everything belonging to
    /// windows at or before `through_window`, clamped so no live cursor is
    /// ever trimmed under.
    pub fn purge(&self, identifier: &str, through_window: u64) {
        let Some(entry) = self.get(identifier) else {
            warn!(identifier, "purge request for unknown stream");
            return;
        };
        let mut inner = entry.inner.lock();
        let mut target = inner.log.purge_boundary(through_window);
        if let Some(live) = inner
            .cursors
            .values()
            .filter(|cursor| !cursor.stale)
            .map(|cursor| cursor.sequence)
            .min()
        {
            target = target.min(live);
        }
        inner.log.trim_below(target);
        inner.touch();
        info!(identifier, through_window, target, "purged stream backlog");
    }

    /// Honor a reset request: rewind storage from `from_window` and mark
    /// every cursor past the new end stale. Stale cursors are woken so their
    /// sessions can report the invalidation.
    pub fn reset(&self, identifier: &str, from_window: u64) -> Result<Sequence, ServerError> {
        let Some(entry) = self.get(identifier) else {
            // a launcher may replay its reset before the publisher
            // reconnects; there is nothing to discard yet
            warn!(identifier, "reset request for unknown stream");
            return Ok(0);
        };
        let end = {
            let mut inner = entry.inner.lock();
            let end = inner.log.reset(from_window)?;
            for (cursor_id, cursor) in inner.cursors.iter_mut() {
                if cursor.sequence > end {
                    warn!(identifier, %cursor_id, at = cursor.sequence, end, "cursor invalidated by reset");
                    cursor.stale = true;
                }
            }
            inner.touch();
            end
        };
        entry.data_available.notify_waiters();
        info!(identifier, from_window, end, "stream reset");
        Ok(end)
    }

    /// Remove streams with no publisher, no cursors and no recent activity.
    /// Returns the number of reaped streams.
    pub fn reap_idle(&self, idle_timeout: Duration) -> usize {
        let mut reaped = 0;
        self.entries.retain(|identifier, entry| {
            let inner = entry.inner.lock();
            let idle = inner.publisher.is_none()
                && inner.cursors.is_empty()
                && inner.last_activity.elapsed() >= idle_timeout;
            if idle {
                info!(identifier, "reaping idle stream");
                reaped += 1;
            }
            !idle
        });
        reaped
    }

    /// Identifiers of all registered streams.
    pub fn identifiers(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}
