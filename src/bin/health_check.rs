//! One-shot CRM health check.
//!
//! Runs the composite health check once, prints the report as JSON and exits
//! with status 2 when the integration is critical. Meant for cron jobs and
//! serverless schedulers; with `STATE_STORE_URL` set it shares rate limits,
//! analytics and history with every other invocation.

use rust_crm_resilience::config::Config;
use rust_crm_resilience::gateway_client::CrmClient;
use rust_crm_resilience::models::HealthStatus;
use rust_crm_resilience::state_store;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_crm_resilience=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    let store = state_store::from_config(&config).await?;
    let client = CrmClient::new(&config, store)?;

    let report = client.health_check().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.status == HealthStatus::Critical {
        std::process::exit(2);
    }

    Ok(())
}
