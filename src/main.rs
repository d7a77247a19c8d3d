use anyhow::{Context, Result};
use ledgerlink::api::{cors_layer, create_accounting_router, AccountingAppState, FrontendRedirect};
use ledgerlink::auth::{CallerIdentity, CallerRegistry};
use ledgerlink::config::{load_config, IntegrationConfig};
use ledgerlink::connection::ConnectionService;
use ledgerlink::credentials::ConnectionStore;
use ledgerlink::egress::EgressGateway;
use ledgerlink::oauth::run_nonce_cleanup;
use ledgerlink::tenant::CompanyDirectory;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const CONFIG_PATH_VAR: &str = "LEDGERLINK_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "ledgerlink.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledgerlink=info".into()),
        )
        .init();

    info!("ledgerlink starting...");

    let config = load_layered_config()?;

    let store = Arc::new(
        ConnectionStore::new(&config.storage.database_path)
            .context("Failed to open connection store")?,
    );
    let directory = Arc::new(
        CompanyDirectory::new(&config.storage.database_path)
            .context("Failed to open company directory")?,
    );
    let gateway = Arc::new(
        EgressGateway::for_platform(
            config.oauth.environment,
            Duration::from_secs(config.egress.timeout_seconds),
        )
        .context("Failed to build egress gateway")?,
    );

    let connections = ConnectionService::from_config(&config, store, directory, gateway)
        .context("Credential encryption is not configured (set LEDGERLINK_ENCRYPTION_KEY)")?;

    let callers = CallerRegistry::new();
    for (token, key) in &config.auth.api_keys {
        callers.insert(
            token.clone(),
            CallerIdentity {
                company_id: Some(key.company_id),
                admin: key.admin,
            },
        );
    }
    if config.auth.enabled {
        info!(api_keys = callers.count(), "Caller authentication enabled");
        if callers.count() == 0 {
            warn!("Authentication enabled but no API keys configured, all requests will be rejected");
        }
    } else {
        warn!("Caller authentication disabled, company taken from X-Company-Id header");
    }

    tokio::spawn(run_nonce_cleanup(
        connections.nonces(),
        config.server.nonce_cleanup_interval(),
    ));

    let state = AccountingAppState {
        connections,
        callers,
        auth_enabled: config.auth.enabled,
        frontend: FrontendRedirect::new(&config.frontend.base_url, &config.frontend.allowed_origins),
    };
    let app = create_accounting_router(state).layer(cors_layer(&config.frontend.allowed_origins));

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, environment = ?config.oauth.environment, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("ledgerlink stopped");
    Ok(())
}

/// TOML file (optional) overlaid with `LEDGERLINK_*` variables.
fn load_layered_config() -> Result<IntegrationConfig> {
    let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let mut config = if std::path::Path::new(&path).exists() {
        info!(path = %path, "Loading configuration");
        load_config(&path)?
    } else {
        info!(path = %path, "No configuration file, using defaults and environment");
        IntegrationConfig::default()
    };
    config.apply_env();
    Ok(config)
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
