use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use granary_proto::{
    api::{AccountInfo, AccountLimits, ApiStats, Storage},
    error::ApiError,
};

/// Live resource usage of an account, shared across its stream actors
///
/// Counters are plain atomics: usage is reconciled continuously as
/// stream actors report their state, and transient lag between a
/// check and the matching update is tolerated.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    inner: Arc<UsageInner>,
}

#[derive(Debug, Default)]
struct UsageInner {
    memory: AtomicU64,
    storage: AtomicU64,
    streams: AtomicU64,
    consumers: AtomicU64,
    api_total: AtomicU64,
    api_errors: AtomicU64,
}

impl Usage {
    /// Reconcile a stream's stored bytes from `old` to `new`
    pub fn update_stored(&self, storage: Storage, old: u64, new: u64) {
        let counter = match storage {
            Storage::Memory => &self.inner.memory,
            Storage::File => &self.inner.storage,
        };
        if new >= old {
            counter.fetch_add(new - old, Ordering::Relaxed);
        } else {
            counter.fetch_sub(old - new, Ordering::Relaxed);
        }
    }

    pub fn count_api(&self, errored: bool) {
        self.inner.api_total.fetch_add(1, Ordering::Relaxed);
        if errored {
            self.inner.api_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn stored(&self, storage: Storage) -> u64 {
        match storage {
            Storage::Memory => self.inner.memory.load(Ordering::Relaxed),
            Storage::File => self.inner.storage.load(Ordering::Relaxed),
        }
    }
}

/// An isolated namespace owning streams, with configured resource caps
#[derive(Debug, Clone)]
pub struct Account {
    name: String,
    limits: AccountLimits,
    usage: Usage,
}

impl Account {
    #[must_use]
    pub fn new(name: impl Into<String>, limits: AccountLimits) -> Self {
        Self {
            name: name.into(),
            limits,
            usage: Usage::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn limits(&self) -> &AccountLimits {
        &self.limits
    }

    #[must_use]
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Claim a stream slot
    ///
    /// # Errors
    ///
    /// Fails once the account's `max_streams` is reached.
    pub fn reserve_stream(&self) -> Result<(), ApiError> {
        let streams = &self.usage.inner.streams;
        let claimed = streams.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(max) = self.limits.max_streams {
            if claimed > u64::from(max) {
                streams.fetch_sub(1, Ordering::Relaxed);
                return Err(ApiError::maximum_streams_reached());
            }
        }
        Ok(())
    }

    pub fn release_stream(&self) {
        self.usage.inner.streams.fetch_sub(1, Ordering::Relaxed);
    }

    /// Claim a consumer slot
    ///
    /// # Errors
    ///
    /// Fails once the account's `max_consumers` is reached.
    pub fn reserve_consumer(&self) -> Result<(), ApiError> {
        let consumers = &self.usage.inner.consumers;
        let claimed = consumers.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(max) = self.limits.max_consumers {
            if claimed > u64::from(max) {
                consumers.fetch_sub(1, Ordering::Relaxed);
                return Err(ApiError::maximum_consumers_reached());
            }
        }
        Ok(())
    }

    pub fn release_consumer(&self) {
        self.usage.inner.consumers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Check that `additional` bytes of `storage` fit under the limits
    ///
    /// # Errors
    ///
    /// Fails with "insufficient storage resources" when they don't.
    pub fn check_capacity(&self, storage: Storage, additional: u64) -> Result<(), ApiError> {
        let limit = match storage {
            Storage::Memory => self.limits.max_memory,
            Storage::File => self.limits.max_storage,
        };
        if let Some(limit) = limit {
            if self.usage.stored(storage) + additional > limit {
                return Err(ApiError::insufficient_resources());
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn info(&self) -> AccountInfo {
        let inner = &self.usage.inner;
        AccountInfo {
            memory: inner.memory.load(Ordering::Relaxed),
            storage: inner.storage.load(Ordering::Relaxed),
            streams: usize::try_from(inner.streams.load(Ordering::Relaxed)).unwrap_or(usize::MAX),
            consumers: usize::try_from(inner.consumers.load(Ordering::Relaxed))
                .unwrap_or(usize::MAX),
            limits: self.limits,
            api: ApiStats {
                total: inner.api_total.load(Ordering::Relaxed),
                errors: inner.api_errors.load(Ordering::Relaxed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use claims::{assert_ok, assert_matches};
    use granary_proto::{api::AccountLimits, api::Storage, error::ErrorCode};

    use super::Account;

    #[test]
    fn stream_limit() {
        let account = Account::new(
            "TEAM",
            AccountLimits {
                max_streams: Some(2),
                ..AccountLimits::default()
            },
        );

        assert_ok!(account.reserve_stream());
        assert_ok!(account.reserve_stream());
        let err = account.reserve_stream().unwrap_err();
        assert_matches!(err.code, ErrorCode::MAXIMUM_STREAMS);

        account.release_stream();
        assert_ok!(account.reserve_stream());
    }

    #[test]
    fn capacity_tracks_usage() {
        let account = Account::new(
            "TEAM",
            AccountLimits {
                max_memory: Some(1000),
                ..AccountLimits::default()
            },
        );

        assert_ok!(account.check_capacity(Storage::Memory, 900));
        account.usage().update_stored(Storage::Memory, 0, 800);
        let err = account.check_capacity(Storage::Memory, 300).unwrap_err();
        assert_matches!(err.code, ErrorCode::INSUFFICIENT_RESOURCES);
        assert_ok!(account.check_capacity(Storage::File, u64::MAX));

        assert_eq!(800, account.info().memory);
    }
}
