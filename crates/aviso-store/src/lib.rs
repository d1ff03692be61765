// ABOUTME: Store layer for aviso: adapter contract, etcd gateway and in-memory backends, status chains.
// ABOUTME: Also hosts the revision resolver, the per-endpoint cursor file and the polling scheduler.

pub mod adapter;
pub mod auth;
pub mod cursor;
pub mod etcd;
pub mod memory;
pub mod poller;
pub mod resolver;
pub mod status;

use std::sync::Arc;

use aviso_core::{AvisoConfig, EngineKind};

pub use adapter::{
    Endpoint, KeyValue, Member, Pull, StoreAdapter, StoreError, StoreResult, prefix_range_end,
};
pub use auth::Authenticator;
pub use cursor::{CursorError, CursorFile, CursorState};
pub use etcd::EtcdRestAdapter;
pub use memory::MemoryStore;
pub use poller::{PollState, PollerConfig, PollingScheduler, WatchCallback, WatchKey};
pub use resolver::{Resolution, RevisionWindow, resolve};
pub use status::{StatusPush, current_status, push_with_status};

/// Build the store adapter selected by `config.engine`.
pub fn connect(config: &AvisoConfig) -> StoreResult<Arc<dyn StoreAdapter>> {
    match config.engine {
        EngineKind::EtcdRest => {
            tracing::info!("using etcd gateway at {}", config.base_url());
            Ok(Arc::new(EtcdRestAdapter::from_config(config)?))
        }
        EngineKind::InMemory => {
            tracing::info!("using in-memory store");
            Ok(Arc::new(MemoryStore::with_endpoint(
                config.host.clone(),
                config.port,
            )))
        }
    }
}

/// The cursor file for `store` under the configured state directory.
pub fn cursor_for(config: &AvisoConfig, store: &dyn StoreAdapter) -> CursorFile {
    CursorFile::for_endpoint(&config.state_dir(), &store.endpoint())
}
