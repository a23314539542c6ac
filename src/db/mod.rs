pub mod connection;
pub mod mongo;

pub use connection::{ConnectionManager, ConnectionStatus, Connector, Endpoint, ReadyState};
pub use mongo::{MongoConnector, MongoHandle};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("MONGO_URL is not set")]
    MissingUrl,
    #[error("invalid connection string: {0}")]
    InvalidUrl(String),
    #[error("failed to connect to database: {0}")]
    Connect(String),
    #[error("database ping failed: {0}")]
    Ping(String),
    #[error("failed to close database connection: {0}")]
    Close(String),
    #[error("database is not connected")]
    NotConnected,
    #[error("database operation failed: {0}")]
    Operation(#[from] mongodb::error::Error),
}
