use bytes::Bytes;

use crate::{
    record::{self, Record},
    Store, StoreError, StoreState,
};

const MAGIC: &[u8; 8] = b"GRNSNAP1";

/// A restartable, self-describing copy of a store's full content
///
/// The body is the serialized [`StoreState`] followed by one record
/// per live message. Tombstones are implied by sequence gaps and the
/// state's deleted set. Snapshots are always cleartext.
#[derive(Debug)]
pub struct Snapshot {
    state: StoreState,
    bytes: Bytes,
}

impl Snapshot {
    #[must_use]
    pub fn state(&self) -> &StoreState {
        &self.state
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Split the snapshot into chunks of at most `chunk_size` bytes
    pub fn chunks(&self, chunk_size: usize) -> impl Iterator<Item = Bytes> + '_ {
        let chunk_size = chunk_size.max(1);
        (0..self.bytes.len())
            .step_by(chunk_size)
            .map(move |start| {
                let end = (start + chunk_size).min(self.bytes.len());
                self.bytes.slice(start..end)
            })
    }
}

pub(crate) fn take(store: &Store) -> Result<Snapshot, StoreError> {
    let state = store.state();

    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    let state_json = serde_json::to_vec(&state).map_err(|_| StoreError::BadSnapshot)?;
    buf.extend_from_slice(&u32::try_from(state_json.len()).unwrap_or(u32::MAX).to_le_bytes());
    buf.extend_from_slice(&state_json);

    match store {
        Store::Memory(memory) => {
            for message in memory.iter() {
                record::encode(&mut buf, &Record::Message(message.clone()));
            }
        }
        Store::File(file) => {
            for sequence in file.sequences().collect::<Vec<_>>() {
                let message = file.read(sequence)?;
                record::encode(&mut buf, &Record::Message(message));
            }
        }
    }

    Ok(Snapshot {
        state,
        bytes: Bytes::from(buf),
    })
}

pub(crate) fn install(store: &mut Store, bytes: &[u8]) -> Result<(), StoreError> {
    let rest = bytes.strip_prefix(MAGIC).ok_or(StoreError::BadSnapshot)?;
    if rest.len() < 4 {
        return Err(StoreError::BadSnapshot);
    }
    let state_len = u32::from_le_bytes(rest[..4].try_into().unwrap()) as usize;
    if rest.len() < 4 + state_len {
        return Err(StoreError::BadSnapshot);
    }
    let state = serde_json::from_slice::<StoreState>(&rest[4..4 + state_len])
        .map_err(|_| StoreError::BadSnapshot)?;

    let mut offset = 4 + state_len;
    while let Some((record, used)) =
        record::decode(&rest[offset..]).map_err(|_| StoreError::BadSnapshot)?
    {
        match record {
            Record::Message(message) => store.insert_restored(message)?,
            Record::Tombstone { .. } => return Err(StoreError::BadSnapshot),
        }
        offset += used;
    }

    store.finish_restore(&state);

    let restored = store.state();
    if restored.messages != state.messages || restored.last_sequence != state.last_sequence {
        return Err(StoreError::BadSnapshot);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use claims::assert_matches;
    use granary_proto::{headers::HeaderMap, Subject};

    use crate::{Store, StoreConfig, StoreError};

    fn populated() -> Store {
        let mut store = Store::memory(StoreConfig::default());
        for i in 0..20 {
            store
                .append(
                    Subject::from_static("orders.eu"),
                    HeaderMap::new(),
                    Bytes::from(format!("payload-{i}")),
                )
                .unwrap();
        }
        store.remove(4).unwrap();
        store.remove(20).unwrap();
        store
    }

    #[test]
    fn chunked_transfer_restores() {
        let store = populated();
        let snapshot = store.snapshot().unwrap();

        let mut collected = Vec::new();
        for chunk in snapshot.chunks(64) {
            collected.extend_from_slice(&chunk);
        }

        let restored = Store::restore_memory(StoreConfig::default(), &collected).unwrap();
        assert_eq!(store.state(), restored.state());
    }

    #[test]
    fn cross_backing_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = populated();
        let snapshot = store.snapshot().unwrap();

        let restored =
            Store::restore_file(dir.path(), StoreConfig::default(), &snapshot.into_bytes())
                .unwrap();
        assert_eq!(store.state(), restored.state());
        assert_eq!(
            store.load(5).unwrap().payload,
            restored.load(5).unwrap().payload
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert_matches!(
            Store::restore_memory(StoreConfig::default(), b"not a snapshot"),
            Err(StoreError::BadSnapshot)
        );
    }
}
