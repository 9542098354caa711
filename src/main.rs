//! Identity directory synchronizer: standalone binary entry point.
use std::{path::Path, process::ExitCode, str::FromStr};

use anyhow::Context;
use identity_ldap_sync::AppConfig;
use tracing::level_filters::LevelFilter;

#[tokio::main]
async fn main() -> ExitCode {
	match read_the_config_and_run().await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!("{}", e);
			ExitCode::FAILURE
		}
	}
}

/// Loads configuration, sets up logging, and runs the scheduler until
/// shutdown.
async fn read_the_config_and_run() -> anyhow::Result<()> {
	let config = AppConfig::from_file(Path::new(
		std::env::var("IDENTITY_LDAP_SYNC_CONFIG").unwrap_or_else(|_| "config.yaml".into()).as_str(),
	))
	.await?;

	let subscriber = tracing_subscriber::FmtSubscriber::builder()
		.with_max_level(
			config.log_level.as_ref().map_or(Ok(LevelFilter::INFO), |s| LevelFilter::from_str(s))?,
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)
		.context("setting default tracing subscriber failed")?;

	identity_ldap_sync::run(config).await
}
