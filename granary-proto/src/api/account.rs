use serde::{Deserialize, Serialize};

use super::nullable_number;

/// The resource usage and limits of an account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Bytes used by memory backed streams
    pub memory: u64,
    /// Bytes used by file backed streams
    pub storage: u64,
    pub streams: usize,
    pub consumers: usize,
    pub limits: AccountLimits,
    pub api: ApiStats,
}

/// The configured resource limits of an account
///
/// A missing limit means unlimited.
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize)]
pub struct AccountLimits {
    #[serde(default, with = "nullable_number")]
    pub max_memory: Option<u64>,
    #[serde(default, with = "nullable_number")]
    pub max_storage: Option<u64>,
    #[serde(default, with = "nullable_number")]
    pub max_streams: Option<u32>,
    #[serde(default, with = "nullable_number")]
    pub max_consumers: Option<u32>,
}

/// Counters over the account's control API usage
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize)]
pub struct ApiStats {
    pub total: u64,
    pub errors: u64,
}
