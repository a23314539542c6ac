use std::future::IntoFuture;
use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::Context;
use tracing::{error, info};

use coursehub::app::build_app;
use coursehub::config::{AppConfig, Environment};
use coursehub::state::AppState;

fn init_tracing(environment: Environment) {
    let default_filter = if environment.is_development() {
        "coursehub=debug,tower_http=info"
    } else {
        "coursehub=info"
    };
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

async fn run(config: AppConfig) -> anyhow::Result<u8> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid HOST/PORT")?;

    let state = AppState::init(config);
    state.spawn_index_sync();
    state.db.start().await?;

    let app = build_app(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        %addr,
        environment = ?state.config.server.environment,
        "server listening"
    );

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    tokio::select! {
        res = server.into_future() => {
            res.context("server error")?;
            info!("server stopped");
        }
        _ = state.db.exhausted() => {
            error!("database unreachable after all retries; shutting down");
            return Ok(1);
        }
    }

    Ok(state.db.handle_app_termination().await)
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing(Environment::from_env_value(
        std::env::var("NODE_ENV").ok().as_deref(),
    ));

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = ?e, "fatal error");
            ExitCode::FAILURE
        }
    }
}
