//! Message store engine for the granary streaming core
//!
//! A [`Store`] is an append-only log of subject-tagged messages with
//! per-subject indexing, tombstoning, bulk purge and limit based
//! retention. Two backings are provided: an in-memory one and a file
//! backed one that splits the log into fixed-size blocks. Both share
//! the same in-memory [`index`](crate::index) so every query answers
//! identically regardless of the backing.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use granary_proto::{api::DiscardPolicy, headers::HeaderMap, StoredMessage, Subject};

pub use self::file::FileStore;
pub use self::memory::MemoryStore;
pub use self::snapshot::Snapshot;
pub use self::state::StoreState;

mod file;
mod index;
mod memory;
mod record;
mod snapshot;
mod state;

/// The retention limits a store enforces on append
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreConfig {
    pub max_messages: Option<u64>,
    pub max_bytes: Option<u64>,
    pub max_age: Option<Duration>,
    pub max_message_size: Option<u32>,
    pub max_messages_per_subject: Option<u64>,
    pub discard: DiscardPolicy,
}

/// A request to bulk-remove messages
///
/// `keep` and `sequence` are mutually exclusive.
#[derive(Debug, Clone, Default)]
pub struct PurgeOptions {
    /// Only purge messages matching this subject
    pub filter: Option<Subject>,
    /// Purge messages with a sequence strictly below this one
    pub sequence: Option<u64>,
    /// Retain the `keep` most recent matching messages
    pub keep: Option<u64>,
}

/// An error encountered while operating a [`Store`]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("maximum messages exceeded")]
    MaximumMessages,
    #[error("maximum bytes exceeded")]
    MaximumBytes,
    #[error("maximum messages per subject exceeded")]
    MaximumMessagesPerSubject,
    #[error("message size exceeds maximum allowed")]
    MessageSize,
    #[error("no message found")]
    NotFound,
    #[error("keep and sequence are mutually exclusive")]
    BadPurge,
    #[error("io failure")]
    Io(#[from] std::io::Error),
    #[error("block {block} is corrupt")]
    Corrupt { block: u64 },
    #[error("snapshot is malformed")]
    BadSnapshot,
}

/// An append-only message log with limit based retention
///
/// All mutating operations take `&mut self`; a store is owned by a
/// single stream actor and is never shared across tasks.
#[derive(Debug)]
pub enum Store {
    Memory(MemoryStore),
    File(FileStore),
}

impl Store {
    /// Create an empty in-memory store
    #[must_use]
    pub fn memory(config: StoreConfig) -> Self {
        Self::Memory(MemoryStore::new(config))
    }

    /// Open or create a file backed store rooted at `dir`
    ///
    /// Existing blocks under `dir/msgs` are scanned and re-indexed.
    /// A block that fails checksum validation is skipped with a
    /// warning; the remaining blocks stay readable.
    ///
    /// # Errors
    ///
    /// It returns an error if the directory cannot be created or read.
    pub fn file(dir: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        let block_target = file::target_block_size(&config);
        Ok(Self::File(FileStore::open(dir, block_target, config)?))
    }

    fn config(&self) -> &StoreConfig {
        match self {
            Self::Memory(memory) => memory.config(),
            Self::File(file) => file.config(),
        }
    }

    fn index(&self) -> &index::MsgIndex {
        match self {
            Self::Memory(memory) => memory.index(),
            Self::File(file) => file.index(),
        }
    }

    /// Append a message, enforcing the configured limits
    ///
    /// Returns the assigned sequence and timestamp. The timestamp is
    /// monotonically non-decreasing even if the wall clock regresses.
    ///
    /// # Errors
    ///
    /// With `discard = new` an append at the message, byte or
    /// per-subject cap is rejected. Oversized messages are always
    /// rejected. IO failures of the file backing surface here.
    pub fn append(
        &mut self,
        subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<(u64, DateTime<Utc>), StoreError> {
        let config = self.config().clone();

        if let Some(max_message_size) = config.max_message_size {
            if payload.len() > max_message_size as usize {
                return Err(StoreError::MessageSize);
            }
        }

        let subject_at_cap = config
            .max_messages_per_subject
            .map_or(false, |cap| self.index().subject_count(&subject) >= cap);
        let messages_at_cap = config
            .max_messages
            .map_or(false, |cap| self.index().messages() >= cap);

        let message = {
            let index = self.index();
            let sequence = index.last_sequence() + 1;
            let timestamp = index.next_timestamp(Utc::now());
            StoredMessage {
                sequence,
                timestamp,
                subject,
                headers,
                payload,
            }
        };
        let size = message.size() as u64;
        let bytes_at_cap = config
            .max_bytes
            .map_or(false, |cap| self.index().bytes() + size > cap);

        if matches!(config.discard, DiscardPolicy::New) {
            if messages_at_cap {
                return Err(StoreError::MaximumMessages);
            }
            if bytes_at_cap {
                return Err(StoreError::MaximumBytes);
            }
            if subject_at_cap {
                return Err(StoreError::MaximumMessagesPerSubject);
            }
        } else {
            // Evict the oldest message for the subject before assigning
            // a new sequence, then fall through to the global limits
            if subject_at_cap {
                if let Some(oldest) = self.index().oldest_for_subject(&message.subject) {
                    self.remove(oldest)?;
                }
            }
        }

        let sequence = message.sequence;
        let timestamp = message.timestamp;
        match self {
            Self::Memory(memory) => memory.append_message(message),
            Self::File(file) => file.append_message(&message)?,
        }

        if matches!(config.discard, DiscardPolicy::Old) {
            self.evict_to_limits(&config)?;
        }

        Ok((sequence, timestamp))
    }

    fn evict_to_limits(&mut self, config: &StoreConfig) -> Result<(), StoreError> {
        loop {
            let over_messages = config
                .max_messages
                .map_or(false, |cap| self.index().messages() > cap);
            let over_bytes = config
                .max_bytes
                .map_or(false, |cap| self.index().bytes() > cap);
            if !over_messages && !over_bytes {
                return Ok(());
            }

            let first = self.index().first_sequence();
            if self.index().messages() == 0 || !self.remove(first)? {
                return Ok(());
            }
        }
    }

    /// Load the message stored under `sequence`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown or tombstoned
    /// sequences and [`StoreError::Corrupt`] if the backing block
    /// fails checksum validation.
    pub fn load(&self, sequence: u64) -> Result<StoredMessage, StoreError> {
        match self {
            Self::Memory(memory) => memory.read(sequence),
            Self::File(file) => file.read(sequence),
        }
    }

    /// Load the most recent message whose subject matches `pattern`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no live message matches.
    pub fn load_last_by_subject(&self, pattern: &Subject) -> Result<StoredMessage, StoreError> {
        let sequence = self
            .index()
            .last_by_subject(pattern)
            .ok_or(StoreError::NotFound)?;
        self.load(sequence)
    }

    /// Tombstone a single sequence
    ///
    /// Returns `false` if the sequence is unknown or already removed.
    /// The sequence is never reused.
    ///
    /// # Errors
    ///
    /// IO failures of the file backing surface here.
    pub fn remove(&mut self, sequence: u64) -> Result<bool, StoreError> {
        match self {
            Self::Memory(memory) => Ok(memory.remove_message(sequence)),
            Self::File(file) => file.remove_message(sequence),
        }
    }

    /// Bulk-remove messages, returning how many were removed
    ///
    /// A purge with no filter and no `keep` resets the store so the
    /// next sequence follows the current last one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BadPurge`] when both `keep` and
    /// `sequence` are set. IO failures of the file backing surface
    /// here.
    pub fn purge(&mut self, options: &PurgeOptions) -> Result<u64, StoreError> {
        if options.filter.is_none() && options.keep.is_none() && options.sequence.is_none() {
            let purged = self.index().messages();
            match self {
                Self::Memory(memory) => memory.clear_all(),
                Self::File(file) => file.clear_all()?,
            }
            return Ok(purged);
        }

        let candidates = self.index().purge_candidates(options)?;
        let mut purged = 0;
        for sequence in candidates {
            if self.remove(sequence)? {
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Remove messages that outlived the configured `max_age`
    ///
    /// Returns the number of removed messages and the timestamp of the
    /// next message due to expire, to key the owner's eviction timer.
    ///
    /// # Errors
    ///
    /// IO failures of the file backing surface here.
    pub fn expire(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<(u64, Option<DateTime<Utc>>), StoreError> {
        let Some(max_age) = self.config().max_age else {
            return Ok((0, None));
        };
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Ok((0, None));
        };
        let Some(cutoff) = now.checked_sub_signed(max_age) else {
            return Ok((0, None));
        };

        let mut removed = 0;
        for sequence in self.index().expired_before(cutoff) {
            if self.remove(sequence)? {
                removed += 1;
            }
        }

        let next = self
            .index()
            .oldest_timestamp()
            .and_then(|oldest| oldest.checked_add_signed(max_age));
        Ok((removed, next))
    }

    /// Replace the retention limits, applying them immediately
    ///
    /// Returns the number of messages evicted by the shrunk limits.
    ///
    /// # Errors
    ///
    /// IO failures of the file backing surface here.
    pub fn update_config(&mut self, config: StoreConfig) -> Result<u64, StoreError> {
        match self {
            Self::Memory(memory) => memory.set_config(config.clone()),
            Self::File(file) => file.set_config(config.clone()),
        }

        let before = self.index().messages();
        self.evict_to_limits(&config)?;
        self.expire(Utc::now())?;
        Ok(before - self.index().messages())
    }

    #[must_use]
    pub fn state(&self) -> StoreState {
        self.index().state()
    }

    #[must_use]
    pub fn first_sequence(&self) -> u64 {
        self.index().first_sequence()
    }

    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.index().last_sequence()
    }

    /// The first live sequence at or above `from` matching `filter`
    #[must_use]
    pub fn next_matching(&self, from: u64, filter: Option<&Subject>) -> Option<u64> {
        self.index().next_matching(from, filter)
    }

    /// The number of live messages at or above `from` matching `filter`
    #[must_use]
    pub fn count_from(&self, from: u64, filter: Option<&Subject>) -> u64 {
        self.index().count_from(from, filter)
    }

    /// The first live sequence whose timestamp is at or after `from`
    #[must_use]
    pub fn first_for_time(&self, from: DateTime<Utc>) -> Option<u64> {
        self.index().first_for_time(from)
    }

    /// The last sequence of every distinct subject matching `filter`,
    /// in stream sequence order
    #[must_use]
    pub fn last_per_subject(&self, filter: &Subject) -> Vec<u64> {
        self.index().last_per_subject(filter)
    }

    /// Serialize the full store content into a restartable snapshot
    ///
    /// Snapshots are emitted in cleartext so a restore can target
    /// either backing.
    ///
    /// # Errors
    ///
    /// IO failures of the file backing surface here.
    pub fn snapshot(&self) -> Result<Snapshot, StoreError> {
        snapshot::take(self)
    }

    /// Rebuild an in-memory store from a snapshot
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BadSnapshot`] if `bytes` is malformed.
    pub fn restore_memory(config: StoreConfig, bytes: &[u8]) -> Result<Self, StoreError> {
        let mut store = Self::memory(config);
        snapshot::install(&mut store, bytes)?;
        Ok(store)
    }

    /// Rebuild a file backed store from a snapshot
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BadSnapshot`] if `bytes` is malformed and
    /// surfaces IO failures of the backing.
    pub fn restore_file(
        dir: &Path,
        config: StoreConfig,
        bytes: &[u8],
    ) -> Result<Self, StoreError> {
        let mut store = Self::file(dir, config)?;
        snapshot::install(&mut store, bytes)?;
        Ok(store)
    }

    pub(crate) fn insert_restored(&mut self, message: StoredMessage) -> Result<(), StoreError> {
        match self {
            Self::Memory(memory) => memory.append_message(message),
            Self::File(file) => file.append_message(&message)?,
        }
        Ok(())
    }

    pub(crate) fn finish_restore(&mut self, state: &StoreState) {
        let index = match self {
            Self::Memory(memory) => memory.index_mut(),
            Self::File(file) => file.index_mut(),
        };
        index.bump_sequence(state.last_sequence);
        index.mark_deleted(&state.deleted);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use claims::{assert_matches, assert_ok};
    use granary_proto::{api::DiscardPolicy, headers::HeaderMap, Subject};

    use super::{PurgeOptions, Store, StoreConfig, StoreError};

    fn append_n(store: &mut Store, subject: &str, n: usize) {
        for i in 0..n {
            assert_ok!(store.append(
                Subject::try_from(subject).unwrap(),
                HeaderMap::new(),
                Bytes::from(format!("payload-{i}")),
            ));
        }
    }

    #[test]
    fn sequences_are_dense() {
        let mut store = Store::memory(StoreConfig::default());
        for expected in 1..=100 {
            let (seq, _) = store
                .append(
                    Subject::from_static("orders.new"),
                    HeaderMap::new(),
                    Bytes::from_static(b"data"),
                )
                .unwrap();
            assert_eq!(expected, seq);
        }
        assert_eq!(100, store.state().messages);
    }

    #[test]
    fn discard_new_rejects_at_cap() {
        let mut store = Store::memory(StoreConfig {
            max_messages: Some(3),
            discard: DiscardPolicy::New,
            ..StoreConfig::default()
        });
        append_n(&mut store, "orders.new", 3);

        let err = store
            .append(
                Subject::from_static("orders.new"),
                HeaderMap::new(),
                Bytes::from_static(b"overflow"),
            )
            .unwrap_err();
        assert_matches!(err, StoreError::MaximumMessages);
        assert_eq!(3, store.state().messages);
    }

    #[test]
    fn discard_old_evicts_at_cap() {
        let mut store = Store::memory(StoreConfig {
            max_messages: Some(3),
            discard: DiscardPolicy::Old,
            ..StoreConfig::default()
        });
        append_n(&mut store, "orders.new", 5);

        let state = store.state();
        assert_eq!(3, state.messages);
        assert_eq!(3, state.first_sequence);
        assert_eq!(5, state.last_sequence);
    }

    #[test]
    fn message_size_cap() {
        let mut store = Store::memory(StoreConfig {
            max_message_size: Some(22),
            ..StoreConfig::default()
        });

        let err = store
            .append(
                Subject::from_static("orders.new"),
                HeaderMap::new(),
                Bytes::from_static(&[0; 36]),
            )
            .unwrap_err();
        assert_matches!(err, StoreError::MessageSize);

        assert_ok!(store.append(
            Subject::from_static("orders.new"),
            HeaderMap::new(),
            Bytes::from_static(&[0; 22]),
        ));
    }

    #[test]
    fn per_subject_cap_evicts_oldest() {
        let mut store = Store::memory(StoreConfig {
            max_messages_per_subject: Some(2),
            ..StoreConfig::default()
        });
        append_n(&mut store, "orders.eu", 4);
        append_n(&mut store, "orders.us", 1);

        assert_eq!(3, store.state().messages);
        // The two newest eu messages survive
        assert_matches!(store.load(3), Ok(_));
        assert_matches!(store.load(4), Ok(_));
        assert_matches!(store.load(1), Err(StoreError::NotFound));
    }

    #[test]
    fn full_purge_resets() {
        let mut store = Store::memory(StoreConfig::default());
        append_n(&mut store, "orders.new", 10);

        let purged = store.purge(&PurgeOptions::default()).unwrap();
        assert_eq!(10, purged);

        let state = store.state();
        assert_eq!(0, state.messages);
        assert_eq!(11, state.first_sequence);
        assert_eq!(10, state.last_sequence);

        let (seq, _) = store
            .append(
                Subject::from_static("orders.new"),
                HeaderMap::new(),
                Bytes::from_static(b"data"),
            )
            .unwrap();
        assert_eq!(11, seq);
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut store = Store::memory(StoreConfig::default());
        append_n(&mut store, "orders.eu", 6);
        store.remove(3).unwrap();
        store.remove(6).unwrap();

        let snapshot = store.snapshot().unwrap();
        let restored =
            Store::restore_memory(StoreConfig::default(), &snapshot.into_bytes()).unwrap();

        assert_eq!(store.state(), restored.state());
        assert_eq!(
            store.load(2).unwrap().payload,
            restored.load(2).unwrap().payload
        );
        assert_matches!(restored.load(3), Err(StoreError::NotFound));
    }
}
