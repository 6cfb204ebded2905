use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::auth::TokenResolver;
use crate::flow::FlowMonitor;
use crate::models::{RuntimeConfig, StoreDocument};
use crate::pool::AccountPool;
use crate::store::CredentialStore;
use crate::upstream::client::UpstreamClient;

/// Root of the application. Constructed once at startup and handed to every
/// handler; there is no ambient state.
pub struct App {
    pub config: RwLock<RuntimeConfig>,
    pub pool: Mutex<AccountPool>,
    pub resolver: TokenResolver,
    pub upstream: UpstreamClient,
    pub flows: FlowMonitor,
    data_dir: PathBuf,
    /// Once-or-wait latch: the pool loads on the first request; concurrent
    /// first requests share the single in-flight load, and a failure leaves
    /// the latch clear so a later request retries.
    init_done: Mutex<bool>,
}

impl App {
    pub fn new(data_dir: PathBuf, config: RuntimeConfig) -> Arc<Self> {
        let flows = FlowMonitor::new(&data_dir, config.max_flow_entries);
        let store = CredentialStore::new(data_dir.clone());
        // The pool starts empty; `ensure_initialized` hydrates it.
        let pool = AccountPool::from_document(store, StoreDocument::default());

        Arc::new(Self {
            config: RwLock::new(config),
            pool: Mutex::new(pool),
            resolver: TokenResolver::new(),
            upstream: UpstreamClient::new(),
            flows,
            data_dir,
            init_done: Mutex::new(false),
        })
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Idempotent pool initialization. The latch mutex is held across the
    /// load, so concurrent callers suspend until the one in-flight load
    /// finishes.
    pub async fn ensure_initialized(&self) -> Result<(), String> {
        let mut done = self.init_done.lock().await;
        if *done {
            return Ok(());
        }

        let store = CredentialStore::new(self.data_dir.clone());
        let doc = store.load();
        let loaded = AccountPool::from_document(store, doc);
        info!("Pool initialized with {} account(s)", loaded.len());
        *self.pool.lock().await = loaded;

        *done = true;
        Ok(())
    }

    /// Drop token/project caches and re-run initialization on the next
    /// request. Admin surface for `/refresh-token`.
    pub async fn reset_credentials(&self) {
        self.resolver.clear_token_cache(None);
        self.resolver.clear_project_cache(None);
        let mut done = self.init_done.lock().await;
        *done = false;
    }
}
