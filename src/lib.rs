pub mod classifier;
pub mod config;
pub mod correlator;
pub mod errors;
pub mod events;
pub mod git;
pub mod security;
pub mod storage;
pub mod supervisor;
pub mod watcher;
pub mod worker;

use std::sync::Arc;

use config::EngineConfig;
use correlator::Correlator;
use events::EventBus;
use storage::Storage;

/// Shared state handed to the supervisor, the reconciler task, and every
/// CLI subcommand that needs to see live engine state.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<EngineConfig>,
    pub storage: Arc<Storage>,
    pub correlator: Arc<Correlator>,
    pub events: Arc<EventBus>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    pub async fn bootstrap(config: EngineConfig) -> Result<Self, errors::ErrorKind> {
        let storage = Storage::new(&config.store_path).await?;
        let correlator = Correlator::new(
            config::DEFAULT_CORRELATION_WINDOW_SECS,
            config::DEFAULT_CORRELATION_SLACK_SECS,
            config::DEFAULT_RING_CAPACITY,
            config::DEFAULT_MAX_TAILED_FILES,
        );

        Ok(Self {
            config: Arc::new(config),
            storage: Arc::new(storage),
            correlator: Arc::new(correlator),
            events: Arc::new(EventBus::new()),
            started_at: std::time::Instant::now(),
        })
    }
}
