//! MongoDB implementation of the [`Connector`] seam.

use std::time::Duration;

use async_trait::async_trait;
use bson::doc;
use mongodb::{
    event::{command::CommandEvent, EventHandler},
    options::{ClientOptions, ServerAddress},
    Client, Collection, Database,
};
use tracing::{debug, info};

use super::{Connector, DbError, Endpoint};
use crate::config::DbSettings;

/// A live client plus the database it was opened for.
#[derive(Clone, Debug)]
pub struct MongoHandle {
    client: Client,
    db: Database,
    endpoint: Endpoint,
}

impl MongoHandle {
    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn collection<T: Send + Sync>(&self, name: &str) -> Collection<T> {
        self.db.collection::<T>(name)
    }
}

#[derive(Debug, Clone)]
pub struct MongoConnector {
    socket_timeout: Duration,
}

impl MongoConnector {
    pub fn new(settings: &DbSettings) -> Self {
        Self {
            socket_timeout: settings.socket_timeout,
        }
    }
}

/// The driver has no address-family switch; pin the usual dual-stack name to
/// its IPv4 loopback instead.
fn prefer_ipv4(hosts: &mut [ServerAddress]) {
    for address in hosts.iter_mut() {
        if let ServerAddress::Tcp { host, .. } = address {
            if host.eq_ignore_ascii_case("localhost") {
                *host = "127.0.0.1".to_string();
            }
        }
    }
}

fn endpoint_of(options: &ClientOptions, db_name: &str) -> Endpoint {
    let (host, port) = match options.hosts.first() {
        Some(ServerAddress::Tcp { host, port }) => {
            (Some(host.clone()), Some(port.unwrap_or(27017)))
        }
        _ => (None, None),
    };
    Endpoint {
        host,
        port,
        name: Some(db_name.to_string()),
    }
}

#[async_trait]
impl Connector for MongoConnector {
    type Handle = MongoHandle;

    async fn open(&self, url: &str, settings: &DbSettings) -> Result<MongoHandle, DbError> {
        let mut options = ClientOptions::parse(url)
            .await
            .map_err(|e| DbError::InvalidUrl(e.to_string()))?;

        options.app_name = Some("coursehub".to_string());
        options.max_pool_size = Some(settings.max_pool_size);
        options.server_selection_timeout = Some(settings.server_selection_timeout);
        if settings.ipv4_only {
            prefer_ipv4(&mut options.hosts);
        }
        if settings.debug {
            options.command_event_handler = Some(EventHandler::callback(|event: CommandEvent| {
                if let CommandEvent::Started(started) = event {
                    debug!(
                        command = %started.command_name,
                        db = %started.db,
                        "mongodb command"
                    );
                }
            }));
        }

        let db_name = options
            .default_database
            .clone()
            .unwrap_or_else(|| settings.default_db.clone());
        let endpoint = endpoint_of(&options, &db_name);

        info!(
            host = endpoint.host.as_deref().unwrap_or("-"),
            db = %db_name,
            "connecting to MongoDB"
        );
        let client =
            Client::with_options(options).map_err(|e| DbError::Connect(e.to_string()))?;
        let handle = MongoHandle {
            db: client.database(&db_name),
            client,
            endpoint,
        };

        // The driver connects lazily; a ping forces server selection.
        self.ping(&handle)
            .await
            .map_err(|e| DbError::Connect(e.to_string()))?;
        Ok(handle)
    }

    async fn ping(&self, handle: &MongoHandle) -> Result<(), DbError> {
        let ping = handle.db.run_command(doc! { "ping": 1 });
        match tokio::time::timeout(self.socket_timeout, ping).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(DbError::Ping(e.to_string())),
            Err(_) => Err(DbError::Ping(format!(
                "no reply within {:?}",
                self.socket_timeout
            ))),
        }
    }

    async fn close(&self, handle: MongoHandle) -> Result<(), DbError> {
        tokio::time::timeout(self.socket_timeout, handle.client.shutdown())
            .await
            .map_err(|_| DbError::Close("shutdown timed out".into()))
    }

    fn describe(&self, handle: &MongoHandle) -> Endpoint {
        handle.endpoint.clone()
    }
}
