use std::sync::Arc;

use agentflow::config::Config;
use agentflow::credentials::EnvCredentials;
use agentflow::llm::HttpClientFactory;
use agentflow::orchestrator::{Backends, Orchestrator};
use agentflow::store::SupabaseClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentflow=info".into()),
        )
        .with_target(false)
        .init();

    let config = Config::from_env()?;
    let (url, key) = config.supabase()?;

    let http = reqwest::Client::builder()
        .timeout(config.provider_timeout * 2)
        .build()?;
    let store = Arc::new(SupabaseClient::new(http.clone(), url, key));

    let orchestrator = Orchestrator::new(
        Backends {
            queue_store: store.clone(),
            task_store: store.clone(),
            event_sink: store,
            credentials: Arc::new(EnvCredentials::from_env()),
            client_factory: Arc::new(HttpClientFactory::new(http)),
        },
        config.queue_config(),
        config.failover_config(),
    );

    tracing::info!(
        poll_interval = ?config.queue_poll_interval,
        batch_size = config.queue_batch_size,
        providers = ?config.provider_order,
        "Starting agentflow worker"
    );
    orchestrator.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    orchestrator.shutdown().await;
    Ok(())
}
