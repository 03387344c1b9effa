use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use chrono::{TimeZone, Utc};
use granary_proto::{StoredMessage, Subject};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    index::MsgIndex,
    record::{self, Record},
    StoreConfig, StoreError,
};

const MIN_BLOCK_SIZE: u64 = 64 * 1024;
const MAX_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
const DEFAULT_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

/// Pick a target block size from the configured limits
///
/// Streams with small caps get small blocks so retention can reclaim
/// space promptly; unbounded streams get the default.
pub(crate) fn target_block_size(config: &StoreConfig) -> u64 {
    let derived = match (config.max_bytes, config.max_messages) {
        (Some(bytes), _) => bytes / 16,
        (None, Some(messages)) => messages.saturating_mul(256) / 16,
        (None, None) => DEFAULT_BLOCK_SIZE,
    };
    derived.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
}

/// The file backed store backing
///
/// The log is split into numbered block files under `msgs/`. Only the
/// highest numbered block is written to; earlier blocks are immutable
/// except through tombstone records appended to the active block.
/// Sealed blocks get a `.idx` sidecar so reopening doesn't need to
/// re-scan their full content.
#[derive(Debug)]
pub struct FileStore {
    msgs_dir: PathBuf,
    config: StoreConfig,
    block_target: u64,
    index: MsgIndex,
    locs: BTreeMap<u64, MsgLoc>,
    active: Option<ActiveBlock>,
    next_block_id: u64,
}

#[derive(Debug, Clone, Copy)]
struct MsgLoc {
    block: u64,
    offset: u64,
    len: u64,
}

#[derive(Debug)]
struct ActiveBlock {
    id: u64,
    file: File,
    len: u64,
    entries: Vec<IdxEntry>,
}

/// A sealed block's sidecar entry
#[derive(Debug, Serialize, Deserialize)]
enum IdxEntry {
    Msg {
        seq: u64,
        offset: u64,
        len: u64,
        subject: Subject,
        timestamp_ns: i64,
        size: u64,
    },
    Del {
        seq: u64,
    },
}

impl FileStore {
    pub(crate) fn open(
        dir: &Path,
        block_target: u64,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        let msgs_dir = dir.join("msgs");
        fs::create_dir_all(&msgs_dir)?;

        let mut this = Self {
            msgs_dir,
            config,
            block_target,
            index: MsgIndex::new(),
            locs: BTreeMap::new(),
            active: None,
            next_block_id: 1,
        };
        this.recover()?;
        Ok(this)
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn set_config(&mut self, config: StoreConfig) {
        self.config = config;
    }

    pub(crate) fn index(&self) -> &MsgIndex {
        &self.index
    }

    pub(crate) fn index_mut(&mut self) -> &mut MsgIndex {
        &mut self.index
    }

    fn recover(&mut self) -> Result<(), StoreError> {
        let mut block_ids = Vec::new();
        for entry in fs::read_dir(&self.msgs_dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "blk") {
                if let Some(id) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<u64>().ok())
                {
                    block_ids.push(id);
                }
            }
        }
        block_ids.sort_unstable();

        for id in block_ids {
            if let Err(err) = self.recover_block(id) {
                warn!(block = id, error = %err, "skipping unreadable block");
            }
            self.next_block_id = self.next_block_id.max(id + 1);
        }

        Ok(())
    }

    fn recover_block(&mut self, id: u64) -> Result<(), StoreError> {
        let idx_path = self.idx_path(id);
        if let Ok(bytes) = fs::read(&idx_path) {
            if let Ok(entries) = serde_json::from_slice::<Vec<IdxEntry>>(&bytes) {
                for entry in entries {
                    self.apply_idx_entry(id, entry);
                }
                return Ok(());
            }
            warn!(block = id, "discarding malformed block index, re-scanning");
        }

        let bytes = fs::read(self.blk_path(id))?;
        let mut offset = 0;
        loop {
            match record::decode(&bytes[offset..]) {
                Ok(None) => break,
                Ok(Some((record, used))) => {
                    match record {
                        Record::Message(message) => {
                            let size = message.size() as u64;
                            self.apply_idx_entry(
                                id,
                                IdxEntry::Msg {
                                    seq: message.sequence,
                                    offset: offset as u64,
                                    len: used as u64,
                                    subject: message.subject,
                                    timestamp_ns: message
                                        .timestamp
                                        .timestamp_nanos_opt()
                                        .unwrap_or_default(),
                                    size,
                                },
                            )
                        }
                        Record::Tombstone { sequence } => {
                            self.apply_idx_entry(id, IdxEntry::Del { seq: sequence });
                        }
                    }
                    offset += used;
                }
                Err(_) => {
                    // Stop at the first corrupt record but keep what
                    // was already recovered from this block
                    return Err(StoreError::Corrupt { block: id });
                }
            }
        }

        Ok(())
    }

    fn apply_idx_entry(&mut self, block: u64, entry: IdxEntry) {
        match entry {
            IdxEntry::Msg {
                seq,
                offset,
                len,
                subject,
                timestamp_ns,
                size,
            } => {
                self.index
                    .insert(seq, subject, Utc.timestamp_nanos(timestamp_ns), size);
                self.locs.insert(seq, MsgLoc { block, offset, len });
            }
            IdxEntry::Del { seq } => {
                if self.locs.remove(&seq).is_some() {
                    self.index.remove(seq);
                } else {
                    // A bare tombstone records sequence progression,
                    // e.g. across a full purge
                    self.index.bump_sequence(seq);
                }
            }
        }
    }

    fn blk_path(&self, id: u64) -> PathBuf {
        self.msgs_dir.join(format!("{id:08}.blk"))
    }

    fn idx_path(&self, id: u64) -> PathBuf {
        self.msgs_dir.join(format!("{id:08}.idx"))
    }

    fn ensure_active(&mut self) -> Result<&mut ActiveBlock, StoreError> {
        let needs_roll = match &self.active {
            Some(active) => active.len >= self.block_target,
            None => true,
        };

        if needs_roll {
            if let Some(active) = self.active.take() {
                self.seal(active)?;
            }

            let id = self.next_block_id;
            self.next_block_id += 1;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.blk_path(id))?;
            self.active = Some(ActiveBlock {
                id,
                file,
                len: 0,
                entries: Vec::new(),
            });
        }

        Ok(self.active.as_mut().expect("active block was just ensured"))
    }

    fn seal(&self, mut active: ActiveBlock) -> Result<(), StoreError> {
        active.file.flush()?;
        let encoded =
            serde_json::to_vec(&active.entries).map_err(|_| StoreError::BadSnapshot)?;
        fs::write(self.idx_path(active.id), encoded)?;
        Ok(())
    }

    pub(crate) fn append_message(&mut self, message: &StoredMessage) -> Result<(), StoreError> {
        let mut buf = Vec::new();
        record::encode(&mut buf, &Record::Message(message.clone()));

        let active = self.ensure_active()?;
        active.file.write_all(&buf)?;
        let offset = active.len;
        active.len += buf.len() as u64;
        active.entries.push(IdxEntry::Msg {
            seq: message.sequence,
            offset,
            len: buf.len() as u64,
            subject: message.subject.clone(),
            timestamp_ns: message.timestamp.timestamp_nanos_opt().unwrap_or_default(),
            size: message.size() as u64,
        });

        let block = active.id;
        let len = buf.len() as u64;
        self.locs.insert(message.sequence, MsgLoc { block, offset, len });
        self.index.insert(
            message.sequence,
            message.subject.clone(),
            message.timestamp,
            message.size() as u64,
        );
        Ok(())
    }

    pub(crate) fn remove_message(&mut self, sequence: u64) -> Result<bool, StoreError> {
        if !self.locs.contains_key(&sequence) {
            return Ok(false);
        }

        let mut buf = Vec::new();
        record::encode(&mut buf, &Record::Tombstone { sequence });
        let active = self.ensure_active()?;
        active.file.write_all(&buf)?;
        active.len += buf.len() as u64;
        active.entries.push(IdxEntry::Del { seq: sequence });

        self.locs.remove(&sequence);
        self.index.remove(sequence);
        Ok(true)
    }

    pub(crate) fn read(&self, sequence: u64) -> Result<StoredMessage, StoreError> {
        let loc = self.locs.get(&sequence).ok_or(StoreError::NotFound)?;

        let mut file = File::open(self.blk_path(loc.block))?;
        file.seek(SeekFrom::Start(loc.offset))?;
        let mut buf = vec![0; usize::try_from(loc.len).map_err(|_| StoreError::NotFound)?];
        file.read_exact(&mut buf)?;

        match record::decode(&buf) {
            Ok(Some((Record::Message(message), _))) if message.sequence == sequence => Ok(message),
            _ => Err(StoreError::Corrupt { block: loc.block }),
        }
    }

    pub(crate) fn clear_all(&mut self) -> Result<(), StoreError> {
        self.active = None;
        for entry in fs::read_dir(&self.msgs_dir)? {
            let path = entry?.path();
            if path
                .extension()
                .map_or(false, |ext| ext == "blk" || ext == "idx")
            {
                fs::remove_file(path)?;
            }
        }
        self.locs.clear();

        // A bare tombstone in a fresh block preserves the sequence
        // counter across a restart
        let last = self.index.last_sequence();
        self.index.clear();
        if last > 0 {
            let mut buf = Vec::new();
            record::encode(&mut buf, &Record::Tombstone { sequence: last });
            let active = self.ensure_active()?;
            active.file.write_all(&buf)?;
            active.len += buf.len() as u64;
            active.entries.push(IdxEntry::Del { seq: last });
        }
        Ok(())
    }

    pub(crate) fn sequences(&self) -> impl Iterator<Item = u64> + '_ {
        self.locs.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use claims::assert_matches;
    use granary_proto::{headers::HeaderMap, Subject};

    use crate::{PurgeOptions, Store, StoreConfig, StoreError};

    fn file_store(dir: &std::path::Path) -> Store {
        Store::file(dir, StoreConfig::default()).unwrap()
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut store = file_store(dir.path());
            for i in 0..50 {
                store
                    .append(
                        Subject::from_static("orders.eu"),
                        HeaderMap::new(),
                        Bytes::from(format!("payload-{i}")),
                    )
                    .unwrap();
            }
            store.remove(7).unwrap();
        }

        let store = file_store(dir.path());
        let state = store.state();
        assert_eq!(49, state.messages);
        assert_eq!(vec![7], state.deleted);
        assert_eq!(50, state.last_sequence);
        assert_eq!(b"payload-0".as_slice(), &store.load(1).unwrap().payload[..]);
        assert_matches!(store.load(7), Err(StoreError::NotFound));
    }

    #[test]
    fn purge_clears_disk() {
        let dir = tempfile::tempdir().unwrap();

        let mut store = file_store(dir.path());
        for _ in 0..10 {
            store
                .append(
                    Subject::from_static("orders.eu"),
                    HeaderMap::new(),
                    Bytes::from_static(b"payload"),
                )
                .unwrap();
        }
        assert_eq!(10, store.purge(&PurgeOptions::default()).unwrap());

        let (seq, _) = store
            .append(
                Subject::from_static("orders.eu"),
                HeaderMap::new(),
                Bytes::from_static(b"payload"),
            )
            .unwrap();
        assert_eq!(11, seq);

        drop(store);
        let store = file_store(dir.path());
        assert_eq!(1, store.state().messages);
        assert_eq!(11, store.state().last_sequence);
    }
}
