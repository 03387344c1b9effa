use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The observable state of a message store
///
/// `messages` always equals `(last_sequence - first_sequence + 1) -
/// num_deleted` while the store is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_sequence: u64,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub num_deleted: u64,
    /// Tombstoned sequences between first and last, ascending
    pub deleted: Vec<u64>,
}

impl StoreState {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages == 0
    }
}
