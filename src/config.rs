//! Process-level configuration loading.
//!
//! Follows the teacher crate's own `Config::from_file` / environment-override
//! pattern (`src/config.rs`, `src/main.rs`): a single file is the base
//! source, environment variables layered on top via the `config` crate, with
//! `serde::Deserialize` doing the actual structuring.

use std::{collections::HashMap, path::Path};

use serde::Deserialize;

use crate::{
	models::{LdapConfig, SyncConfig, SyncConfigId},
	providers::{dingtalk::DingTalkConfig, feishu::FeiShuConfig, wecom::WeComConfig},
};

/// Environment variable prefix for configuration overrides, e.g.
/// `IDENTITY_LDAP_SYNC__LOG_LEVEL=debug`.
const ENV_PREFIX: &str = "IDENTITY_LDAP_SYNC";

/// Top-level process configuration: everything the standalone binary needs
/// to build an [`crate::repository::InMemoryConfigRepository`] and a
/// [`crate::scheduler::DefaultProviderClientFactory`].
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	/// Log level passed to the `tracing` subscriber, e.g. `"info"`.
	pub log_level: Option<String>,
	/// Every LDAP connection profile this process may write into.
	pub ldap_configs: Vec<LdapConfig>,
	/// Every sync pairing this process knows about.
	pub sync_configs: Vec<SyncConfig>,
	/// WeCom credentials, keyed by the `SyncConfig` they belong to.
	#[serde(default)]
	pub wecom: HashMap<SyncConfigId, WeComConfig>,
	/// Feishu credentials, keyed by the `SyncConfig` they belong to.
	#[serde(default)]
	pub feishu: HashMap<SyncConfigId, FeiShuConfig>,
	/// DingTalk credentials, keyed by the `SyncConfig` they belong to.
	#[serde(default)]
	pub dingtalk: HashMap<SyncConfigId, DingTalkConfig>,
}

impl AppConfig {
	/// Loads configuration from `path`, with environment variables prefixed
	/// `IDENTITY_LDAP_SYNC__` layered on top (double underscore as the
	/// section separator, e.g. `IDENTITY_LDAP_SYNC__LOG_LEVEL`).
	///
	/// # Errors
	///
	/// Returns an error if the file can't be read/parsed or the merged
	/// configuration doesn't match [`AppConfig`]'s shape.
	pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
		let path = path.to_owned();
		let raw = tokio::task::spawn_blocking(move || {
			config::Config::builder()
				.add_source(config::File::from(path))
				.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
				.build()
		})
		.await??;
		Ok(raw.try_deserialize()?)
	}
}
