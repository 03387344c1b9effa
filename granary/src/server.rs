use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use granary_proto::{
    api::{AccountLimits, Storage, StreamConfig, StreamInfo},
    error::ApiError,
    Name,
};
use granary_store::Store;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    account::Account,
    advisory::Advisories,
    api,
    consumer::ConsumerState,
    meta::{self, MetaHandle},
    raft::Replica,
    router::Router,
    stream::{self, store_config, StreamContext, StreamHandle},
};

/// The account requests are served under when no account layer sits
/// in front of the core
pub const DEFAULT_ACCOUNT: &str = "$G";

/// The `meta` file of a stream directory
#[derive(Debug, Serialize, Deserialize)]
struct StreamMeta {
    config: StreamConfig,
    #[serde(rename = "created")]
    created_at: DateTime<Utc>,
}

/// A single streaming core instance
///
/// Owns the router, the accounts and every stream actor. Lifecycle is
/// explicit: [`ServerBuilder::start`] brings the instance up,
/// [`Server::shutdown`] takes it down.
#[derive(Debug, Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

#[derive(Debug)]
struct ServerInner {
    node: String,
    domain: Option<String>,
    storage_dir: Option<PathBuf>,
    router: Router,
    advisories: Advisories,
    meta: MetaHandle,
    account: Account,
    streams: Mutex<HashMap<Name, StreamHandle>>,
}

/// Constructor for [`Server`]
#[derive(Debug, Default)]
pub struct ServerBuilder {
    node: Option<String>,
    domain: Option<String>,
    storage_dir: Option<PathBuf>,
    account_limits: AccountLimits,
}

impl ServerBuilder {
    #[must_use]
    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Serve the control API under `$API.<domain>.…` as well
    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Enable file backed streams rooted at `dir`
    #[must_use]
    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn account_limits(mut self, limits: AccountLimits) -> Self {
        self.account_limits = limits;
        self
    }

    /// Start the instance, recovering file backed streams from disk
    ///
    /// # Errors
    ///
    /// Fails if the storage directory cannot be prepared.
    pub async fn start(self) -> Result<Server, ApiError> {
        let node = self.node.unwrap_or_else(|| "n1".to_owned());
        let router = Router::new();
        let advisories = Advisories::new(router.clone());

        let (replica, applied) = Replica::solo();
        let meta = meta::spawn(node.clone(), replica, applied, advisories.clone());
        meta.register_node(node.clone(), None, Vec::new()).await?;

        let server = Server {
            inner: Arc::new(ServerInner {
                node,
                domain: self.domain,
                storage_dir: self.storage_dir,
                router,
                advisories,
                meta,
                account: Account::new(DEFAULT_ACCOUNT, self.account_limits),
                streams: Mutex::new(HashMap::new()),
            }),
        };

        server.recover().await?;
        api::spawn(server.clone());
        info!(node = %server.inner.node, "server started");
        Ok(server)
    }
}

impl Server {
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    #[must_use]
    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    #[must_use]
    pub fn node(&self) -> &str {
        &self.inner.node
    }

    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.inner.domain.as_deref()
    }

    #[must_use]
    pub fn account(&self) -> &Account {
        &self.inner.account
    }

    #[must_use]
    pub fn meta(&self) -> &MetaHandle {
        &self.inner.meta
    }

    pub(crate) fn advisories(&self) -> &Advisories {
        &self.inner.advisories
    }

    fn stream_dir(&self, name: &Name) -> Option<PathBuf> {
        self.inner
            .storage_dir
            .as_ref()
            .map(|dir| dir.join(DEFAULT_ACCOUNT).join(name.as_str()))
    }

    /// Create a stream and spawn its actor
    ///
    /// # Errors
    ///
    /// Propagates catalog validation, placement and capacity errors.
    pub async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo, ApiError> {
        if self
            .inner
            .streams
            .lock()
            .expect("streams lock")
            .contains_key(&config.name)
        {
            return Err(ApiError::stream_name_in_use());
        }

        let assignment = self
            .inner
            .meta
            .assign_stream(DEFAULT_ACCOUNT, config.clone())
            .await?;
        if let Err(err) = self.inner.account.reserve_stream() {
            let _ = self
                .inner
                .meta
                .unassign_stream(DEFAULT_ACCOUNT, config.name.clone())
                .await;
            return Err(err);
        }

        match self
            .spawn_stream(config.clone(), assignment.created_at, None)
            .await
        {
            Ok(info) => {
                self.inner.advisories.stream_created(&config.name);
                Ok(info)
            }
            Err(err) => {
                self.inner.account.release_stream();
                let _ = self
                    .inner
                    .meta
                    .unassign_stream(DEFAULT_ACCOUNT, config.name.clone())
                    .await;
                Err(err)
            }
        }
    }

    async fn spawn_stream(
        &self,
        config: StreamConfig,
        created_at: DateTime<Utc>,
        restored_consumers: Option<Vec<ConsumerState>>,
    ) -> Result<StreamInfo, ApiError> {
        let (store, store_dir) = match config.storage {
            Storage::Memory => (Store::memory(store_config(&config)), None),
            Storage::File => {
                let dir = self.stream_dir(&config.name).ok_or_else(|| {
                    ApiError::bad_request("server has no storage directory configured")
                })?;
                std::fs::create_dir_all(&dir)
                    .map_err(|_| ApiError::insufficient_resources())?;

                let meta = serde_json::to_vec(&StreamMeta {
                    config: config.clone(),
                    created_at,
                })
                .map_err(|_| ApiError::bad_request("config serialization failed"))?;
                std::fs::write(dir.join("meta"), meta)
                    .map_err(|_| ApiError::insufficient_resources())?;

                let store = Store::file(&dir, store_config(&config))
                    .map_err(|_| ApiError::insufficient_resources())?;
                (store, Some(dir))
            }
        };

        let (replica, applied) = Replica::solo();
        let handle = stream::spawn(StreamContext {
            account: self.inner.account.clone(),
            config: config.clone(),
            store,
            router: self.inner.router.clone(),
            advisories: self.inner.advisories.clone(),
            replica,
            applied,
            node: self.inner.node.clone(),
            domain: self.inner.domain.clone(),
            created_at,
            store_dir,
        });

        for state in restored_consumers.unwrap_or_default() {
            if let Err(err) = handle.restore_consumer(state).await {
                warn!(stream = %config.name, error = %err, "consumer recovery failed");
            }
        }

        let info = handle.info().await?;
        self.inner
            .streams
            .lock()
            .expect("streams lock")
            .insert(config.name.clone(), handle);
        Ok(info)
    }

    /// Look up a live stream actor
    ///
    /// # Errors
    ///
    /// Returns `stream not found` for unknown names.
    pub fn stream(&self, name: &Name) -> Result<StreamHandle, ApiError> {
        self.inner
            .streams
            .lock()
            .expect("streams lock")
            .get(name)
            .cloned()
            .ok_or_else(ApiError::stream_not_found)
    }

    #[must_use]
    pub fn stream_handles(&self) -> Vec<StreamHandle> {
        self.inner
            .streams
            .lock()
            .expect("streams lock")
            .values()
            .cloned()
            .collect()
    }

    /// Delete a stream, cascading to all its consumers
    ///
    /// # Errors
    ///
    /// Returns `stream not found` for unknown names.
    pub async fn delete_stream(&self, name: &Name) -> Result<(), ApiError> {
        let handle = {
            self.inner
                .streams
                .lock()
                .expect("streams lock")
                .remove(name)
                .ok_or_else(ApiError::stream_not_found)?
        };
        handle.stop(true).await;
        self.inner
            .meta
            .unassign_stream(DEFAULT_ACCOUNT, name.clone())
            .await
    }

    /// Update a stream's configuration
    ///
    /// # Errors
    ///
    /// Propagates immutability violations.
    pub async fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo, ApiError> {
        let handle = self.stream(&config.name)?;
        let info = handle.update_config(config.clone()).await?;
        self.inner
            .meta
            .update_stream(DEFAULT_ACCOUNT, config)
            .await?;
        Ok(info)
    }

    /// Recreate stream actors from the persisted state layout
    async fn recover(&self) -> Result<(), ApiError> {
        let Some(storage_dir) = &self.inner.storage_dir else {
            return Ok(());
        };
        let account_dir = storage_dir.join(DEFAULT_ACCOUNT);
        let Ok(entries) = std::fs::read_dir(&account_dir) else {
            return Ok(());
        };

        for entry in entries.flatten() {
            let dir = entry.path();
            let meta_path = dir.join("meta");
            let Ok(bytes) = std::fs::read(&meta_path) else {
                continue;
            };
            let meta = match serde_json::from_slice::<StreamMeta>(&bytes) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(path = %meta_path.display(), error = %err, "skipping unreadable stream meta");
                    continue;
                }
            };

            let consumers = recover_consumers(&dir.join("obs"));

            if let Err(err) = self
                .inner
                .meta
                .assign_stream(DEFAULT_ACCOUNT, meta.config.clone())
                .await
            {
                warn!(stream = %meta.config.name, error = %err, "stream re-catalog failed");
                continue;
            }
            self.inner.account.reserve_stream()?;
            match self
                .spawn_stream(meta.config.clone(), meta.created_at, Some(consumers))
                .await
            {
                Ok(_) => info!(stream = %meta.config.name, "stream recovered"),
                Err(err) => {
                    self.inner.account.release_stream();
                    warn!(stream = %meta.config.name, error = %err, "stream recovery failed");
                }
            }
        }

        Ok(())
    }

    /// Stop every stream actor without deleting on-disk state
    pub async fn shutdown(&self) {
        let handles = {
            let mut streams = self.inner.streams.lock().expect("streams lock");
            streams.drain().collect::<Vec<_>>()
        };
        for (_, handle) in handles {
            handle.stop(false).await;
        }
        self.inner.meta.stop().await;
        info!(node = %self.inner.node, "server stopped");
    }
}

fn recover_consumers(obs_dir: &std::path::Path) -> Vec<ConsumerState> {
    let mut consumers = Vec::new();
    let Ok(entries) = std::fs::read_dir(obs_dir) else {
        return consumers;
    };
    for entry in entries.flatten() {
        let state_path = entry.path().join("state");
        let Ok(bytes) = std::fs::read(&state_path) else {
            continue;
        };
        match serde_json::from_slice::<ConsumerState>(&bytes) {
            Ok(state) => consumers.push(state),
            Err(err) => {
                warn!(path = %state_path.display(), error = %err, "skipping unreadable consumer state");
            }
        }
    }
    consumers
}
