use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;

use videobridge::{
    AppState, api,
    auth::{TokenVerifier, WebhookVerifier},
    config::Config,
    dispatch::{Dispatcher, HttpChatBackend},
    lifecycle::MeetingService,
    provider::DailyClient,
    reconcile::Reconciler,
    store::{self, MeetingStore, SqliteMeetingStore},
    telemetry,
};

const JANITOR_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    telemetry::init_logging(config.log_format);

    let store: Arc<dyn MeetingStore> = Arc::new(
        SqliteMeetingStore::connect(&config.database_url)
            .await
            .context("unable to open the in-progress store")?,
    );
    let provider = Arc::new(DailyClient::new(&config.daily_api_key, &config.daily_api_url, config.call_timeout)?);
    let backend = Arc::new(HttpChatBackend::new(&config.oc_backend_url, config.call_timeout)?);

    let meetings = Arc::new(MeetingService::new(
        store.clone(),
        provider.clone(),
        Dispatcher::new(backend, config.call_timeout),
        config.meeting_expiry,
    ));
    let app_state = AppState {
        meetings: meetings.clone(),
        tokens: Arc::new(TokenVerifier::from_pem(&config.oc_public_key)?),
        webhooks: Arc::new(WebhookVerifier::new(&config.daily_hook_hmac)?),
    };

    let janitor = store::spawn_janitor(store.clone(), JANITOR_PERIOD);
    let reconciler = Arc::new(Reconciler::new(store, provider, meetings)).spawn(config.reconcile_interval);

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "video bridge running");
    axum::serve(listener, api::app(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reconciler.abort();
    janitor.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => tracing::warn!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    #[cfg(not(unix))]
    ctrl_c.await;

    tracing::info!("shutting down");
}
