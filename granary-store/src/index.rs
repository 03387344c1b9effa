use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use granary_proto::Subject;

use crate::{PurgeOptions, StoreError, StoreState};

/// An in-memory index over every live message of a store
///
/// Both backings share this structure: the memory backing pairs it
/// with the message bodies, the file backing with on-disk locations.
/// All sequence arithmetic, subject filtering and purge selection is
/// answered from here without touching message bodies.
#[derive(Debug, Default)]
pub(crate) struct MsgIndex {
    entries: BTreeMap<u64, IndexEntry>,
    by_subject: HashMap<Subject, BTreeSet<u64>>,
    /// Tombstoned sequences strictly between the first and last live ones
    deleted: BTreeSet<u64>,
    /// Highest sequence ever assigned, never decreases
    last_sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
    /// First sequence, kept ahead of `entries` when the store is empty
    first_sequence: u64,
    bytes: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub(crate) subject: Subject,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) size: u64,
}

impl MsgIndex {
    pub(crate) fn new() -> Self {
        Self {
            first_sequence: 1,
            ..Self::default()
        }
    }

    pub(crate) fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub(crate) fn first_sequence(&self) -> u64 {
        match self.entries.first_key_value() {
            Some((&seq, _)) => seq,
            None => self.first_sequence.max(self.last_sequence + 1),
        }
    }

    pub(crate) fn messages(&self) -> u64 {
        self.entries.len() as u64
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(crate) fn entry(&self, sequence: u64) -> Option<&IndexEntry> {
        self.entries.get(&sequence)
    }

    /// The timestamp to assign to the next appended message
    ///
    /// Monotonically non-decreasing even if the wall clock regresses.
    pub(crate) fn next_timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        }
    }

    /// Record a freshly appended message under `sequence`
    ///
    /// `sequence` must be `last_sequence + 1` for appends; recovery and
    /// restore may insert any sequence above the current last.
    pub(crate) fn insert(
        &mut self,
        sequence: u64,
        subject: Subject,
        timestamp: DateTime<Utc>,
        size: u64,
    ) {
        debug_assert!(sequence > self.last_sequence || self.entries.is_empty());

        if sequence > self.last_sequence + 1 && !self.entries.is_empty() {
            // Restoring over a gap: the skipped sequences are tombstones
            for seq in self.last_sequence + 1..sequence {
                self.deleted.insert(seq);
            }
        }

        self.by_subject
            .entry(subject.clone())
            .or_default()
            .insert(sequence);
        self.entries.insert(
            sequence,
            IndexEntry {
                subject,
                timestamp,
                size,
            },
        );
        self.bytes += size;
        self.last_sequence = self.last_sequence.max(sequence);
        self.last_timestamp = Some(timestamp);
    }

    /// Tombstone `sequence`, returning its entry
    pub(crate) fn remove(&mut self, sequence: u64) -> Option<IndexEntry> {
        let entry = self.entries.remove(&sequence)?;

        if let Some(seqs) = self.by_subject.get_mut(&entry.subject) {
            seqs.remove(&sequence);
            if seqs.is_empty() {
                self.by_subject.remove(&entry.subject);
            }
        }
        self.bytes -= entry.size;

        self.deleted.insert(sequence);
        // Tombstones below the first live message are forgotten
        let first = self.first_sequence();
        self.deleted.retain(|&seq| seq >= first);

        Some(entry)
    }

    /// Reapply tombstones recorded in a snapshot's state
    pub(crate) fn mark_deleted(&mut self, sequences: &[u64]) {
        let first = self.first_sequence();
        for &sequence in sequences {
            if sequence >= first && sequence <= self.last_sequence {
                self.deleted.insert(sequence);
            }
        }
    }

    /// Select the sequences a purge request covers, oldest first
    pub(crate) fn purge_candidates(&self, options: &PurgeOptions) -> Result<Vec<u64>, StoreError> {
        if options.keep.is_some() && options.sequence.is_some() {
            return Err(StoreError::BadPurge);
        }

        let mut matching = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                options
                    .filter
                    .as_ref()
                    .map_or(true, |filter| filter.matches(&entry.subject))
            })
            .map(|(&seq, _)| seq)
            .collect::<Vec<_>>();

        if let Some(sequence) = options.sequence {
            matching.retain(|&seq| seq < sequence);
        }
        if let Some(keep) = options.keep {
            let keep = usize::try_from(keep).unwrap_or(usize::MAX);
            if keep >= matching.len() {
                matching.clear();
            } else {
                matching.truncate(matching.len() - keep);
            }
        }

        Ok(matching)
    }

    /// The most recent sequence whose subject matches `pattern`
    pub(crate) fn last_by_subject(&self, pattern: &Subject) -> Option<u64> {
        if pattern.is_literal() {
            return self
                .by_subject
                .get(pattern)
                .and_then(|seqs| seqs.last().copied());
        }

        self.by_subject
            .iter()
            .filter(|(subject, _)| pattern.matches(subject))
            .filter_map(|(_, seqs)| seqs.last().copied())
            .max()
    }

    /// The first live sequence at or above `from` matching `filter`
    pub(crate) fn next_matching(&self, from: u64, filter: Option<&Subject>) -> Option<u64> {
        match filter {
            None => self.entries.range(from..).next().map(|(&seq, _)| seq),
            Some(filter) if filter.is_literal() => self
                .by_subject
                .get(filter)
                .and_then(|seqs| seqs.range(from..).next().copied()),
            Some(filter) => self
                .by_subject
                .iter()
                .filter(|(subject, _)| filter.matches(subject))
                .filter_map(|(_, seqs)| seqs.range(from..).next().copied())
                .min(),
        }
    }

    /// The number of live messages at or above `from` matching `filter`
    pub(crate) fn count_from(&self, from: u64, filter: Option<&Subject>) -> u64 {
        match filter {
            None => self.entries.range(from..).count() as u64,
            Some(filter) if filter.is_literal() => self
                .by_subject
                .get(filter)
                .map_or(0, |seqs| seqs.range(from..).count() as u64),
            Some(filter) => self
                .by_subject
                .iter()
                .filter(|(subject, _)| filter.matches(subject))
                .map(|(_, seqs)| seqs.range(from..).count() as u64)
                .sum(),
        }
    }

    /// The first live sequence whose timestamp is at or after `from`
    pub(crate) fn first_for_time(&self, from: DateTime<Utc>) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.timestamp >= from)
            .map(|(&seq, _)| seq)
    }

    /// The last sequence of every distinct subject matching `filter`,
    /// in stream sequence order
    pub(crate) fn last_per_subject(&self, filter: &Subject) -> Vec<u64> {
        let mut seqs = self
            .by_subject
            .iter()
            .filter(|(subject, _)| filter.matches(subject))
            .filter_map(|(_, seqs)| seqs.last().copied())
            .collect::<Vec<_>>();
        seqs.sort_unstable();
        seqs
    }

    /// The number of live messages on the literal `subject`
    pub(crate) fn subject_count(&self, subject: &Subject) -> u64 {
        self.by_subject
            .get(subject)
            .map_or(0, |seqs| seqs.len() as u64)
    }

    /// The oldest live sequence on the literal `subject`
    pub(crate) fn oldest_for_subject(&self, subject: &Subject) -> Option<u64> {
        self.by_subject
            .get(subject)
            .and_then(|seqs| seqs.first().copied())
    }

    /// Sequences whose age exceeds `cutoff`, oldest first
    pub(crate) fn expired_before(&self, cutoff: DateTime<Utc>) -> Vec<u64> {
        self.entries
            .iter()
            .take_while(|(_, entry)| entry.timestamp < cutoff)
            .map(|(&seq, _)| seq)
            .collect()
    }

    /// The timestamp of the oldest live message
    pub(crate) fn oldest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries
            .first_key_value()
            .map(|(_, entry)| entry.timestamp)
    }

    /// Forget everything, placing the next sequence after the last one
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.by_subject.clear();
        self.deleted.clear();
        self.bytes = 0;
        self.first_sequence = self.last_sequence + 1;
    }

    pub(crate) fn state(&self) -> StoreState {
        let first_timestamp = self
            .entries
            .first_key_value()
            .map(|(_, entry)| entry.timestamp);
        StoreState {
            messages: self.messages(),
            bytes: self.bytes,
            first_sequence: self.first_sequence(),
            first_timestamp,
            last_sequence: self.last_sequence,
            last_timestamp: self.last_timestamp,
            num_deleted: self.deleted.len() as u64,
            deleted: self.deleted.iter().copied().collect(),
        }
    }

    /// Force the sequence counter past `sequence`, used by restore
    pub(crate) fn bump_sequence(&mut self, sequence: u64) {
        if self.entries.is_empty() && sequence >= self.first_sequence {
            self.first_sequence = sequence + 1;
        }
        self.last_sequence = self.last_sequence.max(sequence);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use granary_proto::Subject;

    use crate::PurgeOptions;

    use super::MsgIndex;

    fn index_with(n: u64) -> MsgIndex {
        let mut index = MsgIndex::new();
        for seq in 1..=n {
            let subject = if seq % 2 == 0 {
                Subject::from_static("orders.even")
            } else {
                Subject::from_static("orders.odd")
            };
            index.insert(seq, subject, Utc.timestamp_opt(seq as i64, 0).unwrap(), 10);
        }
        index
    }

    #[test]
    fn sequences_and_state() {
        let index = index_with(10);
        assert_eq!(1, index.first_sequence());
        assert_eq!(10, index.last_sequence());
        let state = index.state();
        assert_eq!(10, state.messages);
        assert_eq!(100, state.bytes);
        assert_eq!(0, state.num_deleted);
    }

    #[test]
    fn remove_creates_tombstones() {
        let mut index = index_with(10);
        index.remove(5);
        index.remove(6);

        let state = index.state();
        assert_eq!(8, state.messages);
        assert_eq!(2, state.num_deleted);
        assert_eq!(vec![5, 6], state.deleted);
        // messages == (last - first + 1) - deleted
        assert_eq!(
            state.messages,
            (state.last_sequence - state.first_sequence + 1) - state.num_deleted
        );
    }

    #[test]
    fn head_tombstones_are_forgotten() {
        let mut index = index_with(4);
        index.remove(2);
        index.remove(1);

        let state = index.state();
        assert_eq!(3, state.first_sequence);
        assert_eq!(0, state.num_deleted);
    }

    #[test]
    fn purge_selection() {
        let index = index_with(10);

        let all = index.purge_candidates(&PurgeOptions::default()).unwrap();
        assert_eq!(10, all.len());

        let below = index
            .purge_candidates(&PurgeOptions {
                sequence: Some(4),
                ..PurgeOptions::default()
            })
            .unwrap();
        assert_eq!(vec![1, 2, 3], below);

        let keep = index
            .purge_candidates(&PurgeOptions {
                keep: Some(2),
                ..PurgeOptions::default()
            })
            .unwrap();
        assert_eq!((1..=8).collect::<Vec<_>>(), keep);

        let filtered = index
            .purge_candidates(&PurgeOptions {
                filter: Some(Subject::from_static("orders.even")),
                keep: Some(1),
                ..PurgeOptions::default()
            })
            .unwrap();
        assert_eq!(vec![2, 4, 6, 8], filtered);

        index
            .purge_candidates(&PurgeOptions {
                keep: Some(1),
                sequence: Some(2),
                ..PurgeOptions::default()
            })
            .unwrap_err();
    }

    #[test]
    fn subject_queries() {
        let index = index_with(10);
        assert_eq!(
            Some(10),
            index.last_by_subject(&Subject::from_static("orders.even"))
        );
        assert_eq!(
            Some(10),
            index.last_by_subject(&Subject::from_static("orders.*"))
        );
        assert_eq!(
            Some(4),
            index.next_matching(3, Some(&Subject::from_static("orders.even")))
        );
        assert_eq!(5, index.count_from(2, Some(&Subject::from_static("orders.odd"))));
        assert_eq!(5, index.subject_count(&Subject::from_static("orders.even")));
        assert_eq!(
            vec![9, 10],
            index.last_per_subject(&Subject::from_static("orders.*"))
        );
    }
}
