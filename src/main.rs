//! Gateway entry point: load config, open the database, purge expired
//! metrics, serve until ctrl-c.

use std::sync::Arc;

use tracing::{info, warn};

use promptgate::config::{self, MIN_RETENTION_DAYS};
use promptgate::error::GatewayError;
use promptgate::gateway::{self, GatewayState};
use promptgate::vault::Vault;
use promptgate::{logger, metrics, store};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), GatewayError> {
    // .env is optional; real env wins over it
    let _ = dotenvy::dotenv();

    let config = config::load()?;
    logger::parse_level(&config.log_level)?;
    logger::init(&config.log_level)?;

    let vault_key = config.vault_key.clone().ok_or_else(|| {
        GatewayError::Config("PROMPTGATE_VAULT_KEY must be set (credentials are encrypted at rest)".into())
    })?;
    let vault = Arc::new(Vault::new(&vault_key));

    let pool = store::open_pool(&config.database_path)?;
    store::init_schema(&*pool.get()?)?;

    let retention = config.retention_days.max(MIN_RETENTION_DAYS);
    if retention != config.retention_days {
        warn!(
            configured = config.retention_days,
            effective = retention,
            "metric retention clamped up to the minimum"
        );
    }
    let purged = metrics::purge_older_than(&*pool.get()?, retention)?;
    if purged > 0 {
        info!(purged, retention_days = retention, "expired metric rows removed");
    }

    let state = GatewayState::new(pool, vault);
    gateway::run(&config.bind, state).await
}
