//! API server entry point.

use std::error::Error;
use std::sync::Arc;

use api::AppState;
use api::config::Config;
use saga::{Backends, SagaRuntime};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use transport::{InMemoryBroker, PostgresBroker, Transport};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Stores and broker for the saga. With `DATABASE_URL` both live in
/// PostgreSQL so committed events survive a restart.
async fn connect(config: &Config) -> Result<(Backends, Arc<dyn Transport>), Box<dyn Error>> {
    let exchange = config.saga.exchange.clone();
    let Some(url) = &config.database_url else {
        tracing::info!("DATABASE_URL not set, using in-memory stores and broker");
        let broker: Arc<dyn Transport> = Arc::new(InMemoryBroker::new(exchange));
        return Ok((Backends::in_memory(config.saga.lock_timeout), broker));
    };

    let pool = sqlx::PgPool::connect(url).await?;
    saga::run_migrations(&pool).await?;
    tracing::info!("connected to PostgreSQL, migrations applied");
    let broker: Arc<dyn Transport> = Arc::new(PostgresBroker::new(pool.clone(), exchange));
    Ok((Backends::postgres(pool, config.saga.lock_timeout), broker))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = Config::from_env();
    init_tracing(&config);

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let (backends, transport) = connect(&config).await?;
    let runtime = SagaRuntime::builder(config.saga.clone())
        .backends(backends)
        .start(Arc::clone(&transport))
        .await?;

    let state = AppState::new(runtime);
    let app = api::create_app(Arc::clone(&state), metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router and its clones of the state are gone once serve returns.
    match Arc::try_unwrap(state) {
        Ok(state) => state.runtime.shutdown().await?,
        Err(_) => tracing::warn!("application state still shared, skipping saga shutdown"),
    }
    transport.close();

    tracing::info!("server shut down gracefully");
    Ok(())
}
