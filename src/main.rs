use std::process::ExitCode;
use std::sync::Arc;

use scvmm_gateway::api::{create_router, ApiState};
use scvmm_gateway::telemetry::{init_tracing, shutdown_tracing};
use scvmm_gateway::{Config, Dispatcher, PwshConnector, SessionPool, TemplateStore};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

const SERVICE_NAME: &str = "scvmm-gateway";

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{SERVICE_NAME}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log = &config.settings.log;
    if let Err(e) = init_tracing(SERVICE_NAME, log.otlp_endpoint.as_deref(), log.json) {
        eprintln!("{SERVICE_NAME}: failed to initialize tracing: {e}");
        return ExitCode::FAILURE;
    }
    for warning in &config.warnings {
        tracing::warn!("{}", warning);
    }

    let code = match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Gateway stopped");
            ExitCode::FAILURE
        }
    };

    shutdown_tracing();
    code
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let templates = TemplateStore::load(config.settings.scripts.entries());

    let connector = Arc::new(PwshConnector::new(config.pwsh_options()));
    let pool = SessionPool::start(connector, config.pool_config()).await?;
    let supervisor = SessionPool::start_supervisor(Arc::clone(&pool), config.supervise_interval());

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&pool),
        templates,
        config.dispatcher_config(),
    ));
    let app = create_router(ApiState { dispatcher });

    let bind = config.settings.server.bind.as_str();
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, host = %config.host, "Gateway listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    supervisor.abort();
    // commands already running get the same budget they would have had
    pool.shutdown(config.dispatcher_config().operation_timeout).await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM, falling back to Ctrl-C only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Cannot listen for Ctrl-C");
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C"),
    }
}
