//! Database connection lifecycle.
//!
//! One [`ConnectionManager`] owns the process' database handle. It is built by
//! `main`, shared through `AppState`, and is the only thing that opens or
//! closes the connection. Failed attempts are retried on a fixed interval by a
//! single supervised timer; after `max_retries` consecutive failures the
//! manager fires its exhaustion signal and the process exits.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::DbError;
use crate::config::DbSettings;

/// Driver seam: how a handle is opened, probed and closed.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;

    /// Open a connection and verify it is usable.
    async fn open(&self, url: &str, settings: &DbSettings) -> Result<Self::Handle, DbError>;
    async fn ping(&self, handle: &Self::Handle) -> Result<(), DbError>;
    async fn close(&self, handle: Self::Handle) -> Result<(), DbError>;
    fn describe(&self, handle: &Self::Handle) -> Endpoint;
}

/// Where a live handle points.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Disconnected,
    Connected,
    Connecting,
    Disconnecting,
}

/// Snapshot returned by [`ConnectionManager::get_connection_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub ready_state: ReadyState,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
}

struct State<H> {
    handle: Option<H>,
    endpoint: Endpoint,
    ready_state: ReadyState,
    retry_count: u32,
    retry_timer: Option<CancellationToken>,
    /// Set by a deliberate disconnect while an attempt is in flight.
    abandon_attempt: bool,
    stopping: bool,
}

struct Inner<C: Connector> {
    settings: DbSettings,
    connector: C,
    state: Mutex<State<C::Handle>>,
    state_tx: watch::Sender<ReadyState>,
    exhausted: CancellationToken,
    shutdown: CancellationToken,
}

pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(settings: DbSettings, connector: C) -> Self {
        let (state_tx, _) = watch::channel(ReadyState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                settings,
                connector,
                state: Mutex::new(State {
                    handle: None,
                    endpoint: Endpoint::default(),
                    ready_state: ReadyState::Disconnected,
                    retry_count: 0,
                    retry_timer: None,
                    abandon_attempt: false,
                    stopping: false,
                }),
                state_tx,
                exhausted: CancellationToken::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<C::Handle>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, state: &mut State<C::Handle>, next: ReadyState) {
        state.ready_state = next;
        self.inner.state_tx.send_replace(next);
    }

    /// First connection attempt plus the heartbeat monitor.
    ///
    /// Only a missing connection URL is an error here; a failed attempt is
    /// already queued for retry.
    pub async fn start(&self) -> Result<(), DbError> {
        match self.connect().await {
            Ok(()) => {}
            Err(DbError::MissingUrl) => return Err(DbError::MissingUrl),
            Err(e) => warn!(error = %e, "initial database connection failed; retry scheduled"),
        }
        self.spawn_heartbeat();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), DbError> {
        self.lock().stopping = true;
        self.inner.shutdown.cancel();
        self.disconnect().await
    }

    pub async fn connect(&self) -> Result<(), DbError> {
        let url = {
            let mut state = self.lock();
            match state.ready_state {
                ReadyState::Connected => {
                    info!("database already connected");
                    return Ok(());
                }
                ReadyState::Connecting => {
                    debug!("database connection attempt already in flight");
                    return Ok(());
                }
                ReadyState::Disconnected | ReadyState::Disconnecting => {}
            }
            if state.stopping {
                return Err(DbError::NotConnected);
            }
            let Some(url) = self.inner.settings.url.clone() else {
                error!("MONGO_URL is not set");
                return Err(DbError::MissingUrl);
            };
            state.abandon_attempt = false;
            self.transition(&mut state, ReadyState::Connecting);
            url
        };

        match self.inner.connector.open(&url, &self.inner.settings).await {
            Ok(handle) => {
                let endpoint = self.inner.connector.describe(&handle);
                let late = {
                    let mut state = self.lock();
                    if state.stopping || state.abandon_attempt {
                        state.abandon_attempt = false;
                        self.transition(&mut state, ReadyState::Disconnected);
                        Some(handle)
                    } else {
                        state.handle = Some(handle);
                        state.endpoint = endpoint.clone();
                        state.retry_count = 0;
                        if let Some(timer) = state.retry_timer.take() {
                            timer.cancel();
                        }
                        self.transition(&mut state, ReadyState::Connected);
                        None
                    }
                };
                if let Some(handle) = late {
                    debug!("connection opened after a disconnect request; closing it");
                    let _ = self.inner.connector.close(handle).await;
                    return Err(DbError::NotConnected);
                }
                info!(
                    host = endpoint.host.as_deref().unwrap_or("-"),
                    port = endpoint.port.unwrap_or_default(),
                    name = endpoint.name.as_deref().unwrap_or("-"),
                    "database connected"
                );
                Ok(())
            }
            Err(e) => {
                let abandoned = {
                    let mut state = self.lock();
                    self.transition(&mut state, ReadyState::Disconnected);
                    std::mem::take(&mut state.abandon_attempt)
                };
                error!(error = %e, "error connecting to database");
                if !abandoned {
                    self.handle_errors();
                }
                Err(e)
            }
        }
    }

    /// Count a failed attempt and either schedule the next one or give up.
    ///
    /// At most one retry timer exists: a pending one is cancelled before a
    /// replacement is armed.
    fn handle_errors(&self) {
        let mut state = self.lock();
        if state.stopping {
            return;
        }
        if let Some(timer) = state.retry_timer.take() {
            timer.cancel();
        }
        state.retry_count += 1;
        let max = self.inner.settings.max_retries;
        if state.retry_count >= max {
            error!(attempts = state.retry_count, "database connection retries exhausted");
            self.inner.exhausted.cancel();
            return;
        }

        let timer = CancellationToken::new();
        state.retry_timer = Some(timer.clone());
        let interval = self.inner.settings.retry_interval;
        warn!(
            retry = state.retry_count,
            max,
            "retrying database connection in {:?}",
            interval
        );
        drop(state);

        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = timer.cancelled() => {
                    debug!("pending database retry cancelled");
                }
                _ = tokio::time::sleep(interval) => {
                    {
                        let mut state = manager.lock();
                        if timer.is_cancelled() {
                            return;
                        }
                        state.retry_timer = None;
                    }
                    let _ = manager.connect().await;
                }
            }
        });
    }

    /// React to a lost link: drop the dead handle and reconnect.
    ///
    /// When a retry is already pending the timer owns recovery and nothing
    /// else is started; otherwise the immediate attempt shares the same retry
    /// budget through [`Self::connect`].
    pub async fn handle_disconnect(&self) {
        let recovering = {
            let mut state = self.lock();
            if state.stopping {
                return;
            }
            state.handle = None;
            if state.ready_state == ReadyState::Connected {
                self.transition(&mut state, ReadyState::Disconnected);
            }
            state.retry_timer.is_some() || state.ready_state == ReadyState::Connecting
        };
        warn!("database disconnected");
        if recovering {
            debug!("database recovery already in progress");
            return;
        }
        let _ = self.connect().await;
    }

    /// Deliberate close. Cancels any pending retry and does not trigger
    /// recovery. An attempt already in flight stays `Connecting` and closes
    /// its handle when it completes.
    pub async fn disconnect(&self) -> Result<(), DbError> {
        let handle = {
            let mut state = self.lock();
            if let Some(timer) = state.retry_timer.take() {
                timer.cancel();
            }
            if state.ready_state == ReadyState::Connecting {
                state.abandon_attempt = true;
                debug!("connection attempt in flight; it will be closed on completion");
                return Ok(());
            }
            let handle = state.handle.take();
            if handle.is_some() {
                self.transition(&mut state, ReadyState::Disconnecting);
            }
            handle
        };

        let result = match handle {
            Some(handle) => self.inner.connector.close(handle).await,
            None => Ok(()),
        };

        {
            let mut state = self.lock();
            self.transition(&mut state, ReadyState::Disconnected);
        }
        match &result {
            Ok(()) => info!("database disconnected"),
            Err(e) => error!(error = %e, "error disconnecting from database"),
        }
        result
    }

    /// Close the connection on process termination; the returned value is
    /// the exit status (0 clean, 1 failure).
    pub async fn handle_app_termination(&self) -> u8 {
        match self.stop().await {
            Ok(()) => {
                info!("database connection closed");
                0
            }
            Err(e) => {
                error!(error = %e, "error closing database connection on termination");
                1
            }
        }
    }

    pub fn get_connection_status(&self) -> ConnectionStatus {
        let state = self.lock();
        let connected = state.ready_state == ReadyState::Connected;
        ConnectionStatus {
            is_connected: connected,
            ready_state: state.ready_state,
            host: state.endpoint.host.clone(),
            port: state.endpoint.port,
            name: state.endpoint.name.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().ready_state == ReadyState::Connected
    }

    pub fn retry_count(&self) -> u32 {
        self.lock().retry_count
    }

    /// The live handle, if connected.
    pub fn database(&self) -> Result<C::Handle, DbError> {
        let state = self.lock();
        match (&state.handle, state.ready_state) {
            (Some(handle), ReadyState::Connected) => Ok(handle.clone()),
            _ => Err(DbError::NotConnected),
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<ReadyState> {
        self.inner.state_tx.subscribe()
    }

    /// Resolves once the retry budget is spent.
    pub async fn exhausted(&self) {
        self.inner.exhausted.cancelled().await
    }

    fn spawn_heartbeat(&self) {
        let manager = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let interval = self.inner.settings.heartbeat_interval;
        tokio::spawn(async move {
            debug!("database heartbeat started (interval={interval:?})");
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        debug!("database heartbeat stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
                let Ok(handle) = manager.database() else {
                    continue;
                };
                if let Err(e) = manager.inner.connector.ping(&handle).await {
                    warn!(error = %e, "database heartbeat failed");
                    manager.handle_disconnect().await;
                }
            }
        });
    }
}
