//! Identity directory synchronizer.
//!
//! Periodically pulls the department/user tree from an upstream identity
//! provider (WeCom, Feishu, or DingTalk) and reconciles it into a
//! downstream LDAP directory, preserving object identity across renames and
//! reparenting, with a per-run audit trail.
//!
//! The entry points are [`Scheduler`] (periodic + on-demand triggers) and
//! [`Reconciler`] (the fetch-diff-apply algorithm a single run executes).
//! Everything the engine needs from the surrounding application --
//! configuration storage, audit log persistence -- comes in through
//! [`ConfigRepository`]; this crate ships only a non-persistent default
//! implementation of that trait, [`InMemoryConfigRepository`].

pub mod audit;
pub mod config;
pub mod error;
pub mod identity_index;
pub mod ldap_client;
pub mod models;
pub mod providers;
pub mod reconciler;
pub mod repository;
pub mod scheduler;
/// In-memory fakes for [`crate::ldap_client::LdapClient`] and
/// [`crate::providers::ProviderClient`].
///
/// Exercised by this crate's own unit tests and re-used by its `tests/`
/// integration suite; not a stable public API.
#[doc(hidden)]
pub mod test_support;

pub use config::AppConfig;
pub use reconciler::Reconciler;
pub use repository::{ConfigRepository, InMemoryConfigRepository};
pub use scheduler::{DefaultLdapClientFactory, DefaultProviderClientFactory, LdapClientFactory, Scheduler};

use std::sync::Arc;

/// Builds a [`Scheduler`] from a loaded [`AppConfig`], starts its background
/// timer, and runs until the process receives a shutdown signal.
///
/// This is the standalone-binary entry point; an application embedding this
/// crate is expected to construct its own [`ConfigRepository`] and
/// [`scheduler::ProviderClientFactory`] instead of calling this directly.
///
/// # Errors
///
/// Returns an error if the initial schedule refresh fails in a way that
/// isn't recoverable by the startup-delay retry (e.g. malformed
/// configuration).
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
	let repo: Arc<dyn ConfigRepository> =
		Arc::new(InMemoryConfigRepository::new(config.ldap_configs, config.sync_configs));
	let providers: Arc<dyn scheduler::ProviderClientFactory> = Arc::new(DefaultProviderClientFactory {
		wecom: config.wecom,
		feishu: config.feishu,
		dingtalk: config.dingtalk,
	});
	let scheduler = Arc::new(Scheduler::new(repo, providers));
	scheduler.start();

	tracing::info!("scheduler running, waiting for shutdown signal");
	tokio::signal::ctrl_c().await?;
	tracing::info!("shutdown signal received, exiting");
	Ok(())
}
