use crate::{
    api::{self, limiter::LimiterConfig, ServerConfig},
    cli::actions::Action,
};
use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use url::Url;

/// Handle the server action
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the server fails to
/// start or drain cleanly
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Server {
            port,
            dsn,
            limiter_rps,
            limiter_burst,
            limiter_enabled,
            drain_timeout_seconds,
            task_drain_timeout_seconds,
            cors_trusted_origins,
        } => {
            let parsed = Url::parse(&dsn).context("Invalid database DSN")?;
            if parsed.scheme() != "postgres" && parsed.scheme() != "postgresql" {
                return Err(anyhow!("Database DSN must use the postgres:// scheme"));
            }

            // Bad limiter values are rejected here, before the pipeline starts
            let limiter = LimiterConfig::new(limiter_rps, limiter_burst, limiter_enabled)
                .context("Invalid rate limiter configuration")?;

            let config = ServerConfig {
                port,
                dsn,
                limiter,
                drain_timeout: Duration::from_secs(drain_timeout_seconds),
                task_drain_timeout: task_drain_timeout_seconds.map(Duration::from_secs),
                cors_trusted_origins,
            };

            api::serve(config).await?;
        }
    }

    Ok(())
}
