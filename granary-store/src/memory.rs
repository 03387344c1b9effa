use std::collections::BTreeMap;

use granary_proto::StoredMessage;

use crate::{
    index::MsgIndex,
    StoreConfig, StoreError,
};

/// The in-memory store backing
///
/// Message bodies live in a sequence keyed map next to the shared
/// index. Everything is lost on restart; durability comes from
/// replication or from snapshots taken by the owning stream.
#[derive(Debug)]
pub struct MemoryStore {
    config: StoreConfig,
    index: MsgIndex,
    messages: BTreeMap<u64, StoredMessage>,
}

impl MemoryStore {
    pub(crate) fn new(config: StoreConfig) -> Self {
        Self {
            config,
            index: MsgIndex::new(),
            messages: BTreeMap::new(),
        }
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

    pub(crate) fn append_message(&mut self, message: StoredMessage) {
        self.index.insert(
            message.sequence,
            message.subject.clone(),
            message.timestamp,
            message.size() as u64,
        );
        self.messages.insert(message.sequence, message);
    }

    pub(crate) fn read(&self, sequence: u64) -> Result<StoredMessage, StoreError> {
        self.messages
            .get(&sequence)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    pub(crate) fn remove_message(&mut self, sequence: u64) -> bool {
        if self.messages.remove(&sequence).is_none() {
            return false;
        }
        self.index.remove(sequence);
        true
    }

    pub(crate) fn clear_all(&mut self) {
        self.messages.clear();
        self.index.clear();
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &'_ StoredMessage> {
        self.messages.values()
    }
}
