use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{AppConfig, DbSettings, Environment, ServerConfig};
use crate::db::{ConnectionManager, MongoConnector, ReadyState};
use crate::users::{MongoUserStore, UserStore};

pub type Db = ConnectionManager<MongoConnector>;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// Build the state around a not-yet-started connection manager.
    pub fn init(config: AppConfig) -> Self {
        let connector = MongoConnector::new(&config.db);
        let db = ConnectionManager::new(config.db.clone(), connector);
        Self {
            db,
            config: Arc::new(config),
        }
    }

    pub fn from_parts(db: Db, config: Arc<AppConfig>) -> Self {
        Self { db, config }
    }

    /// State with no connection URL; the manager never connects.
    pub fn fake() -> Self {
        Self::init(AppConfig {
            db: DbSettings::new(None),
            server: ServerConfig::new(Environment::Development),
        })
    }

    /// Ensure the `users` indexes every time the database (re)connects.
    pub fn spawn_index_sync(&self) {
        let db = self.db.clone();
        let mut state = db.watch_state();
        tokio::spawn(async move {
            loop {
                let current = *state.borrow_and_update();
                if current == ReadyState::Connected {
                    if let Ok(handle) = db.database() {
                        match MongoUserStore::new(&handle).ensure_indexes().await {
                            Ok(()) => info!("user indexes in place"),
                            Err(e) => warn!(error = %e, "failed to ensure user indexes"),
                        }
                    }
                }
                if state.changed().await.is_err() {
                    break;
                }
            }
        });
    }
}
